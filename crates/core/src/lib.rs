pub mod config;
pub mod credential;
pub mod error;
pub mod event;
pub mod state;

pub use credential::{Credential, CredentialHandle};
pub use error::{EventBusError, PairlinkError, Result};
pub use event::{
    BroadcastEventBus, Channel, Event, EventBus, EventPayload, EventSource, EventSubscription,
    NoticeLevel,
};
pub use state::{ConnectionState, PairingCode, Phase, PollKind, PollStopReason};
