//! The push channel: a long-lived WebSocket that delivers connection-state
//! updates for the authenticated user.
//!
//! While the channel is open it is authoritative and the status fetcher
//! stops hitting the network. [`ChannelManager`] owns the reconnect
//! sequence so callers can tell a channel that is reconnecting from one
//! that has given up.

pub mod error;
pub mod frame;
pub mod manager;
pub mod transport;

pub use error::PushError;
pub use frame::{Frame, PushEvent};
pub use manager::{ChannelManager, ReconnectPolicy};
pub use transport::{Inbound, PushEndpoint, PushTransport, WebSocketTransport};
