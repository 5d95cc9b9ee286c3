use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::state::{ConnectionState, PollKind, PollStopReason};

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase a-z, 0-9, dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system" | "session" | "push" | "ui")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "session.state.changed")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core system component
    System(String),
    /// Reconciliation store, fetcher, pollers, commands
    Session,
    /// Push channel manager
    Push,
    /// Notification layer
    Notifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    StartupComplete,
    ShutdownRequested {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Session events ─────────────────────────────────────────────
    StateChanged {
        from: Option<ConnectionState>,
        to: ConnectionState,
    },
    PollerStarted {
        kind: PollKind,
    },
    PollerStopped {
        kind: PollKind,
        reason: PollStopReason,
    },
    AuthExpired,
    CampaignProgress {
        id: String,
        sent: u64,
        failed: u64,
        total: u64,
    },
    CampaignFinished {
        id: String,
        completed: bool,
    },

    // ── Push channel events ────────────────────────────────────────
    ChannelOpened {
        user_id: String,
    },
    ChannelReconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    ChannelClosed {
        server_initiated: bool,
        reason: String,
    },
    ChannelAuthFailed {
        message: String,
    },
    ChannelExhausted {
        attempts: u32,
    },

    // ── UI events ──────────────────────────────────────────────────
    NoticeRaised {
        id: String,
        level: NoticeLevel,
        message: String,
    },
}

/// Channel names the components publish on.
pub mod channels {
    pub const STARTUP_COMPLETE: &str = "system.startup.complete";
    pub const SHUTDOWN_REQUESTED: &str = "system.shutdown.requested";
    pub const ERROR_OCCURRED: &str = "system.error.occurred";

    pub const STATE_CHANGED: &str = "session.state.changed";
    pub const POLLER_STARTED: &str = "session.poller.started";
    pub const POLLER_STOPPED: &str = "session.poller.stopped";
    pub const AUTH_EXPIRED: &str = "session.auth.expired";
    pub const CAMPAIGN_PROGRESS: &str = "session.campaign.progress";
    pub const CAMPAIGN_FINISHED: &str = "session.campaign.finished";

    pub const CHANNEL_OPENED: &str = "push.channel.opened";
    pub const CHANNEL_RECONNECTING: &str = "push.channel.reconnecting";
    pub const CHANNEL_CLOSED: &str = "push.channel.closed";
    pub const CHANNEL_REJECTED: &str = "push.channel.rejected";
    pub const CHANNEL_EXHAUSTED: &str = "push.channel.exhausted";

    pub const NOTICE_RAISED: &str = "ui.notice.raised";

    pub const ALL: &[&str] = &[
        STARTUP_COMPLETE,
        SHUTDOWN_REQUESTED,
        ERROR_OCCURRED,
        STATE_CHANGED,
        POLLER_STARTED,
        POLLER_STOPPED,
        AUTH_EXPIRED,
        CAMPAIGN_PROGRESS,
        CAMPAIGN_FINISHED,
        CHANNEL_OPENED,
        CHANNEL_RECONNECTING,
        CHANNEL_CLOSED,
        CHANNEL_REJECTED,
        CHANNEL_EXHAUSTED,
        NOTICE_RAISED,
    ];
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

/// Publish a payload on a named channel, discarding routing failures.
///
/// Used by components for which a missing or broken bus must never affect
/// the operation that produced the event.
pub fn emit(bus: &dyn EventBus, channel_name: &str, source: EventSource, payload: EventPayload) {
    let Ok(channel) = Channel::new(channel_name) else {
        tracing::warn!(channel = channel_name, "refusing to emit on invalid channel");
        return;
    };

    if let Err(error) = bus.publish(Event::new(channel, source, payload)) {
        tracing::warn!(channel = channel_name, %error, "event publish failed");
    }
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    session_sender: broadcast::Sender<Event>,
    push_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (session_sender, _) = broadcast::channel(capacity);
        let (push_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            session_sender,
            push_sender,
            ui_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "session" => Some(&self.session_sender),
            "push" => Some(&self.push_sender),
            "ui" => Some(&self.ui_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                session: Some(self.session_sender.subscribe()),
                push: Some(self.push_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
            });
        }

        let sender = self.sender_for_domain(first_segment).ok_or_else(|| {
            crate::error::EventBusError::InvalidPattern(pattern.to_string())
        })?;

        let mut receivers = DomainReceivers::default();
        let slot = match first_segment {
            "system" => &mut receivers.system,
            "session" => &mut receivers.session,
            "push" => &mut receivers.push,
            _ => &mut receivers.ui,
        };
        *slot = Some(sender.subscribe());
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| {
                crate::error::EventBusError::InvalidChannel(event.channel.to_string())
            })?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    session: Option<broadcast::Receiver<Event>>,
    push: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let session_receiver = self.receivers.session.as_mut();
            let push_receiver = self.receivers.push.as_mut();
            let ui_receiver = self.receivers.ui.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(session_receiver) => result,
                result = recv_from_domain(push_receiver) => result,
                result = recv_from_domain(ui_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        let Self { matcher, receivers } = self;
        for receiver in [
            receivers.system.as_mut(),
            receivers.session.as_mut(),
            receivers.push.as_mut(),
            receivers.ui.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            while let Ok(event) = receiver.try_recv() {
                if matcher.is_match(event.channel.as_str()) {
                    return Some(event);
                }
            }
        }
        None
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}
