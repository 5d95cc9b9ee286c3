//! Connection-state reconciliation for a single paired messaging session.
//!
//! The [`ReconciliationStore`] is the only owner of the committed
//! [`ConnectionState`](pairlink_core::state::ConnectionState) and of the
//! polling handles. The [`StatusFetcher`], the polling loops, the commands
//! and the push channel only ever *propose* states to it.

pub mod commands;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod inflight;
pub mod poller;
pub mod store;

pub use commands::{CommandOutcome, SessionCommands};
pub use engine::SessionEngine;
pub use error::FetchError;
pub use fetcher::{ResponseCache, StatusFetcher};
pub use inflight::InflightRequests;
pub use poller::{PollController, PollSchedule};
pub use store::{LoadingGuard, PollLauncher, PollSlot, ReconciliationStore, StoreSnapshot};
