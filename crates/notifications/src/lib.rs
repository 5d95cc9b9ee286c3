use std::collections::HashMap;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

#[cfg(feature = "native")]
use notify_rust::Notification;
use pairlink_core::config::NotificationsConfig;
use pairlink_core::error::EventBusError;
use pairlink_core::event::{
    Event, EventBus, EventPayload, EventSource, NoticeLevel, channels, emit,
};
use tracing::{debug, error, info, warn};

#[cfg(feature = "native")]
const APP_NAME: &str = "Pairlink";

pub const SOCKET_CONNECTED: &str = "socket-connected";
pub const SOCKET_SERVER_DISCONNECT: &str = "socket-server-disconnect";
pub const SOCKET_CONNECTION_LOST: &str = "socket-connection-lost";
pub const SOCKET_AUTH_FAILED: &str = "socket-auth-failed";
pub const SESSION_AUTH_EXPIRED: &str = "session-auth-expired";

/// Notices that describe a dead push channel. Cleared once it opens again.
const CHANNEL_FAILURE_NOTICES: [&str; 3] = [
    SOCKET_SERVER_DISCONNECT,
    SOCKET_CONNECTION_LOST,
    SOCKET_AUTH_FAILED,
];

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

/// One user-facing notice. `id` is stable per kind of notice so repeats
/// can be recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: String,
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    fn new(id: &str, level: NoticeLevel, message: &str) -> Self {
        Self {
            id: id.to_string(),
            level,
            message: message.to_string(),
        }
    }
}

/// Map an event to the notice it should raise, if any.
pub fn notice_for(payload: &EventPayload) -> Option<Notice> {
    let notice = match payload {
        EventPayload::ChannelOpened { .. } => Notice::new(
            SOCKET_CONNECTED,
            NoticeLevel::Success,
            "Connected to real-time updates",
        ),
        EventPayload::ChannelClosed {
            server_initiated: true,
            ..
        } => Notice::new(
            SOCKET_SERVER_DISCONNECT,
            NoticeLevel::Error,
            "Server disconnected. Please refresh the page.",
        ),
        EventPayload::ChannelExhausted { .. } => Notice::new(
            SOCKET_CONNECTION_LOST,
            NoticeLevel::Error,
            "Connection lost. Please refresh the page.",
        ),
        EventPayload::ChannelAuthFailed { .. } => Notice::new(
            SOCKET_AUTH_FAILED,
            NoticeLevel::Error,
            "Authentication failed. Please login again.",
        ),
        EventPayload::AuthExpired => Notice::new(
            SESSION_AUTH_EXPIRED,
            NoticeLevel::Error,
            "Session expired. Please login again.",
        ),
        _ => return None,
    };
    Some(notice)
}

pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notice: &Notice) -> Result<(), NotificationError>;
}

#[cfg(feature = "native")]
#[derive(Debug, Default)]
pub struct NativeNotificationDispatcher;

#[cfg(feature = "native")]
impl NotificationDispatcher for NativeNotificationDispatcher {
    fn dispatch(&self, notice: &Notice) -> Result<(), NotificationError> {
        Notification::new()
            .appname(APP_NAME)
            .summary(APP_NAME)
            .body(&notice.message)
            .show()
            .map_err(|error| NotificationError::DispatchFailed(error.to_string()))?;
        Ok(())
    }
}

/// Last time each notice id was raised.
#[derive(Debug)]
struct DedupState {
    window: Duration,
    raised: HashMap<String, Instant>,
}

impl DedupState {
    fn admit(&mut self, id: &str, now: Instant) -> bool {
        if let Some(last) = self.raised.get(id)
            && now.duration_since(*last) < self.window
        {
            return false;
        }
        self.raised.insert(id.to_string(), now);
        true
    }

    fn forget(&mut self, ids: &[&str]) {
        for id in ids {
            self.raised.remove(*id);
        }
    }
}

/// Turns session and push events into user-facing notices.
pub struct NotificationManager {
    notifications_enabled: AtomicBool,
    dedup: Mutex<DedupState>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    event_bus: Arc<dyn EventBus>,
}

impl NotificationManager {
    #[cfg(feature = "native")]
    pub fn new(event_bus: Arc<dyn EventBus>, config: &NotificationsConfig) -> Self {
        Self::with_dispatcher(event_bus, config, Arc::new(NativeNotificationDispatcher))
    }

    pub fn with_dispatcher(
        event_bus: Arc<dyn EventBus>,
        config: &NotificationsConfig,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            notifications_enabled: AtomicBool::new(config.enabled),
            dedup: Mutex::new(DedupState {
                window: config.dedup_window(),
                raised: HashMap::new(),
            }),
            dispatcher,
            event_bus,
        }
    }

    /// Subscribe and handle events until the bus closes.
    pub async fn run(self: Arc<Self>) -> Result<(), NotificationError> {
        let mut subscription = self.event_bus.subscribe("{session,push}.**")?;

        loop {
            match subscription.recv().await {
                Ok(event) => {
                    self.handle_event(&event);
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, notification manager stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "notification manager lagged, some events dropped");
                }
                Err(error) => {
                    return Err(error.into());
                }
            }
        }
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn handle_event(&self, event: &Event) -> Option<Notice> {
        self.handle_payload_at(&event.payload, Instant::now())
    }

    fn handle_payload_at(&self, payload: &EventPayload, now: Instant) -> Option<Notice> {
        let notice = notice_for(payload)?;

        {
            let mut dedup = self.dedup.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(payload, EventPayload::ChannelOpened { .. }) {
                dedup.forget(&CHANNEL_FAILURE_NOTICES);
            }
            if !dedup.admit(&notice.id, now) {
                debug!(id = %notice.id, "duplicate notice suppressed");
                return None;
            }
        }

        info!(id = %notice.id, level = ?notice.level, message = %notice.message, "notice raised");
        emit(
            self.event_bus.as_ref(),
            channels::NOTICE_RAISED,
            EventSource::Notifications,
            EventPayload::NoticeRaised {
                id: notice.id.clone(),
                level: notice.level,
                message: notice.message.clone(),
            },
        );

        if self.notifications_enabled.load(Ordering::Relaxed)
            && let Err(error) = self.dispatcher.dispatch(&notice)
        {
            error!(error = %error, "failed to dispatch notification");
        }

        Some(notice)
    }
}
