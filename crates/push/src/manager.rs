use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use pairlink_core::Credential;
use pairlink_core::config::Config;
use pairlink_core::event::{EventBus, EventPayload, EventSource, channels, emit};
use pairlink_core::state::PollStopReason;
use pairlink_session::ReconciliationStore;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PushError;
use crate::frame::{Frame, PushEvent, decode};
use crate::transport::{Inbound, PushEndpoint, PushTransport};

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

/// What the run loop does after an event has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Retry(Duration),
    Stop,
}

struct ChannelContext {
    endpoint: PushEndpoint,
    policy: ReconnectPolicy,
    store: Arc<ReconciliationStore>,
    bus: Arc<dyn EventBus>,
}

impl ChannelContext {
    fn emit(&self, channel_name: &str, payload: EventPayload) {
        emit(self.bus.as_ref(), channel_name, EventSource::Push, payload);
    }

    /// Every channel event goes through here.
    fn handle(&self, event: PushEvent, attempts: &mut u32) -> Flow {
        match event {
            PushEvent::Opened { user_id } => {
                *attempts = 0;
                self.store.set_push_live(true);
                info!(%user_id, "push channel open");
                self.emit(channels::CHANNEL_OPENED, EventPayload::ChannelOpened { user_id });
                Flow::Continue
            }
            PushEvent::StatusUpdate(state) => {
                debug!(phase = %state.phase, "push status update");
                self.store.propose(state);
                // Runs whether or not the proposal committed. A live push
                // channel replaces polling, including the restoration
                // poller a `Restoring` commit has just started.
                self.store.stop_session_pollers(PollStopReason::Settled);
                Flow::Continue
            }
            PushEvent::AuthFailed { message } => {
                self.store.set_push_live(false);
                warn!(%message, "push channel rejected the credential");
                self.emit(
                    channels::CHANNEL_REJECTED,
                    EventPayload::ChannelAuthFailed { message },
                );
                Flow::Stop
            }
            PushEvent::Closed {
                server_initiated,
                reason,
            } => {
                self.store.set_push_live(false);
                self.emit(
                    channels::CHANNEL_CLOSED,
                    EventPayload::ChannelClosed {
                        server_initiated,
                        reason: reason.clone(),
                    },
                );

                if server_initiated {
                    warn!(%reason, "push channel closed by server; not reconnecting");
                    return Flow::Stop;
                }

                if *attempts >= self.policy.max_attempts {
                    warn!(attempts = *attempts, "push channel reconnect attempts exhausted");
                    self.emit(
                        channels::CHANNEL_EXHAUSTED,
                        EventPayload::ChannelExhausted {
                            attempts: *attempts,
                        },
                    );
                    return Flow::Stop;
                }

                *attempts += 1;
                let delay = self.policy.delay(*attempts);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(%reason, attempt = *attempts, delay_ms, "push channel lost; reconnecting");
                self.emit(
                    channels::CHANNEL_RECONNECTING,
                    EventPayload::ChannelReconnecting {
                        attempt: *attempts,
                        delay_ms,
                    },
                );
                Flow::Retry(delay)
            }
        }
    }

    fn connect_failed(&self, error: PushError, attempts: &mut u32) -> Flow {
        match error {
            PushError::AuthenticationFailed(message) => {
                self.handle(PushEvent::AuthFailed { message }, attempts)
            }
            error if !error.is_retryable() => {
                error!(%error, "push channel cannot connect");
                self.store.set_push_live(false);
                self.emit(
                    channels::ERROR_OCCURRED,
                    EventPayload::ErrorOccurred {
                        component: "push".to_string(),
                        message: error.to_string(),
                        recoverable: false,
                    },
                );
                Flow::Stop
            }
            error => {
                debug!(%error, "push connect failed");
                self.handle(
                    PushEvent::Closed {
                        server_initiated: false,
                        reason: error.to_string(),
                    },
                    attempts,
                )
            }
        }
    }

    /// Pump one open transport until it closes or the channel is stopped.
    async fn drive<T: PushTransport>(
        &self,
        transport: &mut T,
        credential: &Credential,
        attempts: &mut u32,
        token: &CancellationToken,
    ) -> Flow {
        self.handle(
            PushEvent::Opened {
                user_id: credential.user_id.clone(),
            },
            attempts,
        );
        if let Err(error) = transport.send(&Frame::join_room(&credential.user_id)).await {
            return self.handle(
                PushEvent::Closed {
                    server_initiated: false,
                    reason: error.to_string(),
                },
                attempts,
            );
        }

        loop {
            let inbound = tokio::select! {
                biased;
                _ = token.cancelled() => return Flow::Stop,
                inbound = transport.recv() => inbound,
            };

            let event = match inbound {
                Ok(Inbound::Text(text)) => match decode(&text) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(error) => {
                        debug!(%error, "dropping malformed push frame");
                        continue;
                    }
                },
                Ok(Inbound::Closed { reason }) => PushEvent::closed(reason),
                Err(error) => PushEvent::Closed {
                    server_initiated: false,
                    reason: error.to_string(),
                },
            };

            match self.handle(event, attempts) {
                Flow::Continue => {}
                flow => return flow,
            }
        }
    }
}

async fn run<T: PushTransport>(
    context: Arc<ChannelContext>,
    credential: Credential,
    token: CancellationToken,
) {
    let mut attempts = 0_u32;

    loop {
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            connected = T::connect(&context.endpoint, &credential) => connected,
        };

        let flow = match connected {
            Ok(mut transport) => {
                let flow = context
                    .drive(&mut transport, &credential, &mut attempts, &token)
                    .await;
                if let Err(error) = transport.close().await {
                    debug!(%error, "push transport close failed");
                }
                flow
            }
            Err(error) => context.connect_failed(error, &mut attempts),
        };

        match flow {
            Flow::Retry(delay) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Flow::Continue | Flow::Stop => break,
        }
    }

    context.store.set_push_live(false);
    debug!(user_id = %credential.user_id, "push channel task finished");
}

struct ActiveChannel {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns at most one push channel and its reconnect sequence.
pub struct ChannelManager<T: PushTransport> {
    context: Arc<ChannelContext>,
    active: Mutex<Option<ActiveChannel>>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: PushTransport> ChannelManager<T> {
    pub fn new(
        endpoint: PushEndpoint,
        policy: ReconnectPolicy,
        store: Arc<ReconciliationStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            context: Arc::new(ChannelContext {
                endpoint,
                policy,
                store,
                bus,
            }),
            active: Mutex::new(None),
            _transport: PhantomData,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<ReconciliationStore>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self, PushError> {
        let endpoint = PushEndpoint::new(&config.backend.push_url, config.push.handshake_timeout())?;
        let policy = ReconnectPolicy {
            max_attempts: config.push.max_reconnect_attempts,
            initial_backoff: config.push.initial_backoff(),
            max_backoff: config.push.max_backoff(),
        };
        Ok(Self::new(endpoint, policy, store, bus))
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.context.policy
    }

    /// Open a channel for `credential`, tearing down any existing one first.
    pub async fn start(&self, credential: Credential) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("replacing existing push channel");
            shutdown(previous).await;
        }

        info!(user_id = %credential.user_id, url = %self.context.endpoint.url, "starting push channel");
        let token = CancellationToken::new();
        let task = tokio::spawn(run::<T>(
            Arc::clone(&self.context),
            credential,
            token.clone(),
        ));
        *active = Some(ActiveChannel { token, task });
    }

    /// Cancel any pending reconnect and close the transport. Safe to call
    /// repeatedly.
    pub async fn stop(&self) {
        let previous = self.active.lock().await.take();
        match previous {
            Some(channel) => {
                info!("stopping push channel");
                shutdown(channel).await;
            }
            None => debug!("push channel already stopped"),
        }
    }

    /// Whether a channel task is connecting, open, or waiting to reconnect.
    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|channel| !channel.task.is_finished())
    }

    /// Restart the channel whenever the credential changes and stop it when
    /// the credential is cleared, until `shutdown` fires.
    pub fn follow_credentials(
        self: &Arc<Self>,
        mut credentials: watch::Receiver<Option<Credential>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let credential = credentials.borrow_and_update().clone();
                match credential {
                    Some(credential) => manager.start(credential).await,
                    None => manager.stop().await,
                }

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    changed = credentials.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            manager.stop().await;
        })
    }
}

async fn shutdown(channel: ActiveChannel) {
    channel.token.cancel();
    if let Err(error) = channel.task.await {
        warn!(%error, "push channel task ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_and_caps_at_ten_seconds() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        assert_eq!(policy.delay(99), Duration::from_millis(10_000));
    }

    #[test]
    fn reconnect_delay_never_exceeds_configured_ceiling() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(3_000),
        };
        for attempt in 1..=40 {
            let delay = policy.delay(attempt);
            assert!(delay >= policy.initial_backoff);
            assert!(delay <= policy.max_backoff);
        }
    }
}

#[cfg(test)]
mod channel_tests {
    use std::collections::VecDeque;
    use std::sync::{Mutex as StdMutex, OnceLock};

    use assert_matches::assert_matches;
    use pairlink_core::CredentialHandle;
    use pairlink_core::event::{BroadcastEventBus, Event, EventSubscription};
    use pairlink_core::state::{ConnectionState, Phase};
    use pairlink_session::PollSlot;
    use pairlink_test_support::fixtures;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    #[derive(Default)]
    struct TestTransportState {
        connect_outcomes: VecDeque<Result<Vec<Inbound>, PushError>>,
        inbound: VecDeque<Inbound>,
        connect_calls: u32,
        close_calls: u32,
        sent: Vec<Frame>,
        credentials: Vec<Credential>,
    }

    fn transport_state() -> &'static StdMutex<TestTransportState> {
        static STATE: OnceLock<StdMutex<TestTransportState>> = OnceLock::new();
        STATE.get_or_init(|| StdMutex::new(TestTransportState::default()))
    }

    fn test_lock() -> &'static AsyncMutex<()> {
        static LOCK: OnceLock<AsyncMutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| AsyncMutex::new(()))
    }

    /// Each `Ok` outcome is one successful connection and the frames it
    /// will deliver; once they run out the connection stays idle.
    fn configure_transport(outcomes: Vec<Result<Vec<Inbound>, PushError>>) {
        let mut state = transport_state()
            .lock()
            .expect("failed to lock transport state");
        *state = TestTransportState::default();
        state.connect_outcomes = outcomes.into_iter().collect();
    }

    fn with_state<R>(f: impl FnOnce(&TestTransportState) -> R) -> R {
        let state = transport_state()
            .lock()
            .expect("failed to lock transport state");
        f(&state)
    }

    fn connect_calls() -> u32 {
        with_state(|state| state.connect_calls)
    }

    fn close_calls() -> u32 {
        with_state(|state| state.close_calls)
    }

    fn sent_frames() -> Vec<Frame> {
        with_state(|state| state.sent.clone())
    }

    struct TestTransport;

    impl PushTransport for TestTransport {
        async fn connect(
            _endpoint: &PushEndpoint,
            credential: &Credential,
        ) -> Result<Self, PushError> {
            let mut state = transport_state()
                .lock()
                .expect("failed to lock transport state");
            state.connect_calls += 1;
            state.credentials.push(credential.clone());
            match state.connect_outcomes.pop_front().unwrap_or(Ok(Vec::new())) {
                Ok(frames) => {
                    state.inbound = frames.into_iter().collect();
                    Ok(Self)
                }
                Err(error) => Err(error),
            }
        }

        async fn send(&mut self, frame: &Frame) -> Result<(), PushError> {
            transport_state()
                .lock()
                .expect("failed to lock transport state")
                .sent
                .push(frame.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Inbound, PushError> {
            let next = transport_state()
                .lock()
                .expect("failed to lock transport state")
                .inbound
                .pop_front();
            match next {
                Some(inbound) => Ok(inbound),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), PushError> {
            transport_state()
                .lock()
                .expect("failed to lock transport state")
                .close_calls += 1;
            Ok(())
        }
    }

    struct Harness {
        bus: Arc<dyn EventBus>,
        store: Arc<ReconciliationStore>,
        manager: Arc<ChannelManager<TestTransport>>,
    }

    fn harness() -> Harness {
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(64));
        let store = Arc::new(ReconciliationStore::new(Arc::clone(&bus)));
        let endpoint = PushEndpoint::new("ws://push.test/socket", Duration::from_secs(10))
            .expect("endpoint");
        let manager = Arc::new(ChannelManager::new(
            endpoint,
            ReconnectPolicy::default(),
            Arc::clone(&store),
            Arc::clone(&bus),
        ));
        Harness {
            bus,
            store,
            manager,
        }
    }

    fn credential() -> Credential {
        Credential::new("token-1", "user-1")
    }

    fn drain(subscription: &mut EventSubscription) -> Vec<Event> {
        std::iter::from_fn(|| subscription.try_recv()).collect()
    }

    fn text(frame: String) -> Inbound {
        Inbound::Text(frame)
    }

    fn transport_close() -> Inbound {
        Inbound::Closed {
            reason: "transport close".to_string(),
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn open_joins_identity_room_and_marks_push_live() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(Vec::new())]);
        let h = harness();
        let mut events = h.bus.subscribe("push.**").expect("subscribe");

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.store.is_push_live());
        assert!(h.manager.is_running().await);
        assert_eq!(sent_frames(), vec![Frame::join_room("user-1")]);
        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert_matches!(
            &events[0].payload,
            EventPayload::ChannelOpened { user_id } if user_id == "user-1"
        );

        h.manager.stop().await;
        assert!(!h.store.is_push_live());
        assert_eq!(close_calls(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn status_update_commits_and_stops_session_pollers() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(vec![text(fixtures::push_frame(
            "status-update-open.json",
        ))])]);
        let h = harness();
        h.store.propose(ConnectionState::connecting(None));
        h.store.start_poller(PollSlot::Connection);

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = h.store.current().expect("committed state");
        assert_eq!(state.phase, Phase::Open);
        assert!(state.is_connected);
        assert!(!h.store.is_polling(&PollSlot::Connection));
        h.manager.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn restoring_update_does_not_leave_restoration_poller_running() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(vec![text(fixtures::push_frame(
            "status-update-restoring.json",
        ))])]);
        let h = harness();

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.store.current().map(|s| s.phase), Some(Phase::Restoring));
        assert!(h.store.active_pollers().is_empty());
        h.manager.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reconnects_with_bounded_backoff_then_gives_up() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![
            Ok(vec![transport_close()]),
            Err(PushError::Transport("refused".into())),
            Err(PushError::Transport("refused".into())),
            Err(PushError::Transport("refused".into())),
            Err(PushError::Transport("refused".into())),
            Err(PushError::Transport("refused".into())),
        ]);
        let h = harness();
        let mut events = h.bus.subscribe("push.**").expect("subscribe");

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        let events = drain(&mut events);
        let delays: Vec<u64> = events
            .iter()
            .filter_map(|event| match event.payload {
                EventPayload::ChannelReconnecting { delay_ms, .. } => Some(delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000]);
        assert_matches!(
            events.last().map(|event| &event.payload),
            Some(EventPayload::ChannelExhausted { attempts: 5 })
        );
        assert_eq!(connect_calls(), 6);
        assert!(!h.store.is_push_live());
        assert!(!h.manager.is_running().await);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reopening_resets_the_attempt_counter() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![
            Ok(vec![transport_close()]),
            Err(PushError::Timeout),
            Ok(vec![transport_close()]),
        ]);
        let h = harness();
        let mut events = h.bus.subscribe("push.channel.reconnecting").expect("subscribe");

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let attempts: Vec<u32> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::ChannelReconnecting { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 1]);
        h.manager.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn server_initiated_close_is_terminal() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(vec![text(fixtures::push_frame(
            "server-disconnect.json",
        ))])]);
        let h = harness();
        let mut events = h.bus.subscribe("push.**").expect("subscribe");

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let events = drain(&mut events);
        assert!(events.iter().any(|event| matches!(
            event.payload,
            EventPayload::ChannelClosed {
                server_initiated: true,
                ..
            }
        )));
        assert!(
            !events
                .iter()
                .any(|event| matches!(event.payload, EventPayload::ChannelReconnecting { .. }))
        );
        assert_eq!(connect_calls(), 1);
        assert_eq!(close_calls(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn auth_failure_does_not_retry() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Err(PushError::AuthenticationFailed(
            "Authentication error".into(),
        ))]);
        let h = harness();
        let mut events = h.bus.subscribe("push.**").expect("subscribe");

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert_matches!(events[0].payload, EventPayload::ChannelAuthFailed { .. });
        assert_eq!(connect_calls(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn auth_error_frame_ends_an_open_channel() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(vec![text(fixtures::push_frame(
            "connect-error-auth.json",
        ))])]);
        let h = harness();
        let mut events = h.bus.subscribe("push.channel.rejected").expect("subscribe");

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(drain(&mut events).len(), 1);
        assert_eq!(connect_calls(), 1);
        assert!(!h.store.is_push_live());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_cancels_pending_reconnect_and_is_idempotent() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(vec![transport_close()])]);
        let h = harness();

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.manager.stop().await;
        h.manager.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connect_calls(), 1);
        assert_eq!(close_calls(), 1);
        assert!(!h.manager.is_running().await);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_replaces_the_existing_channel() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(Vec::new()), Ok(Vec::new())]);
        let h = harness();

        h.manager.start(credential()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.manager
            .start(Credential::new("token-2", "user-2"))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connect_calls(), 2);
        assert_eq!(close_calls(), 1);
        assert_eq!(
            sent_frames(),
            vec![Frame::join_room("user-1"), Frame::join_room("user-2")]
        );
        h.manager.stop().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn follows_credential_changes() {
        let _guard = test_lock().lock().await;
        configure_transport(vec![Ok(Vec::new())]);
        let h = harness();
        let handle = CredentialHandle::empty();
        let shutdown = CancellationToken::new();

        let follower = h
            .manager
            .follow_credentials(handle.subscribe(), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connect_calls(), 0);

        handle.set(credential());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connect_calls(), 1);
        assert!(h.store.is_push_live());
        assert_eq!(
            with_state(|state| state.credentials.clone()),
            vec![credential()]
        );

        handle.clear();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(close_calls(), 1);
        assert!(!h.store.is_push_live());
        assert!(!h.manager.is_running().await);

        shutdown.cancel();
        follower.await.expect("follower task");
    }
}
