use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use pairlink_core::event::{EventBus, EventPayload, EventSource, channels, emit};
use pairlink_core::state::{ConnectionState, Phase, PollKind, PollStopReason};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identity of a polling loop owned by the store. At most one handle per
/// slot is live at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PollSlot {
    Connection,
    Restoration,
    Campaign(String),
}

impl PollSlot {
    pub fn kind(&self) -> PollKind {
        match self {
            Self::Connection => PollKind::Connection,
            Self::Restoration => PollKind::Restoration,
            Self::Campaign(_) => PollKind::Campaign,
        }
    }
}

impl fmt::Display for PollSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Campaign(id) => write!(f, "campaign:{id}"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// Spawns the loop behind a freshly registered poll handle.
///
/// Called with the store's lock held: implementations must only schedule
/// work (e.g. `tokio::spawn`) and never call back into the store inline.
pub trait PollLauncher: Send + Sync {
    fn launch(&self, slot: PollSlot, token: CancellationToken, generation: u64);
}

#[derive(Debug)]
struct PollHandle {
    token: CancellationToken,
    generation: u64,
}

/// Reactive view of the store for UI layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// `None` until the first commit.
    pub state: Option<ConnectionState>,
    pub is_loading: bool,
    pub push_live: bool,
}

impl StoreSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_connected)
    }
}

#[derive(Default)]
struct Inner {
    committed: Option<ConnectionState>,
    push_live: bool,
    loading: usize,
    polls: HashMap<PollSlot, PollHandle>,
    next_generation: u64,
}

/// Authoritative holder of the committed [`ConnectionState`] and of every
/// live poll handle.
///
/// Proposals are applied one at a time under a single lock, in arrival
/// order. Side effects (poller start/stop, events, snapshot updates) run
/// under the same lock so that no later proposal can observe a
/// half-applied commit.
pub struct ReconciliationStore {
    inner: Mutex<Inner>,
    snapshot: watch::Sender<StoreSnapshot>,
    bus: Arc<dyn EventBus>,
    launcher: OnceLock<Weak<dyn PollLauncher>>,
}

impl ReconciliationStore {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        let (snapshot, _) = watch::channel(StoreSnapshot::default());
        Self {
            inner: Mutex::new(Inner::default()),
            snapshot,
            bus,
            launcher: OnceLock::new(),
        }
    }

    /// Install the component that runs poll loops. Only the first call
    /// takes effect.
    pub fn set_launcher(&self, launcher: Weak<dyn PollLauncher>) {
        if self.launcher.set(launcher).is_err() {
            debug!("poll launcher already installed");
        }
    }

    /// Offer a candidate state. Returns whether it was committed.
    pub fn propose(&self, candidate: ConnectionState) -> bool {
        let candidate = candidate.normalized();
        let mut inner = self.lock();

        if inner.committed.as_ref() == Some(&candidate) {
            return false;
        }

        let previous = inner.committed.replace(candidate.clone());
        let was_restoring = previous
            .as_ref()
            .is_some_and(|state| state.phase == Phase::Restoring);
        info!(
            from = previous.as_ref().map_or("none", |s| s.phase.as_str()),
            to = %candidate,
            "connection state committed"
        );

        if candidate.phase == Phase::Restoring && !was_restoring {
            self.start_locked(&mut inner, PollSlot::Restoration);
        }
        if candidate.is_connected {
            for slot in [PollSlot::Connection, PollSlot::Restoration] {
                self.stop_locked(&mut inner, &slot, PollStopReason::Settled);
            }
        }

        self.publish_snapshot(&inner);
        self.emit(
            channels::STATE_CHANGED,
            EventPayload::StateChanged {
                from: previous,
                to: candidate,
            },
        );
        true
    }

    pub fn current(&self) -> Option<ConnectionState> {
        self.lock().committed.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn is_push_live(&self) -> bool {
        self.lock().push_live
    }

    pub fn set_push_live(&self, live: bool) {
        let mut inner = self.lock();
        if inner.push_live != live {
            debug!(live, "push channel authority changed");
            inner.push_live = live;
            self.publish_snapshot(&inner);
        }
    }

    /// Register a new handle for `slot`, cancelling any previous one, and
    /// launch its loop. Returns the handle's generation.
    pub fn start_poller(&self, slot: PollSlot) -> u64 {
        let mut inner = self.lock();
        self.start_locked(&mut inner, slot)
    }

    /// Cancel the handle for `slot`. Safe to call when nothing is running.
    pub fn stop_poller(&self, slot: &PollSlot) -> bool {
        let mut inner = self.lock();
        self.stop_locked(&mut inner, slot, PollStopReason::Cancelled)
    }

    /// Cancel the connection and restoration pollers.
    pub fn stop_session_pollers(&self, reason: PollStopReason) {
        let mut inner = self.lock();
        for slot in [PollSlot::Connection, PollSlot::Restoration] {
            self.stop_locked(&mut inner, &slot, reason);
        }
    }

    pub fn stop_all_pollers(&self, reason: PollStopReason) {
        let mut inner = self.lock();
        let slots: Vec<PollSlot> = inner.polls.keys().cloned().collect();
        for slot in slots {
            self.stop_locked(&mut inner, &slot, reason);
        }
    }

    /// Called by a poll loop that ended on its own. Ignored if the handle
    /// has since been superseded or cancelled.
    pub fn release_poller(&self, slot: &PollSlot, generation: u64, reason: PollStopReason) {
        let mut inner = self.lock();
        let current = inner.polls.get(slot).map(|handle| handle.generation);
        if current == Some(generation) {
            inner.polls.remove(slot);
            debug!(%slot, ?reason, "poller finished");
            self.emit(
                channels::POLLER_STOPPED,
                EventPayload::PollerStopped {
                    kind: slot.kind(),
                    reason,
                },
            );
        }
    }

    pub fn is_polling(&self, slot: &PollSlot) -> bool {
        self.lock().polls.contains_key(slot)
    }

    pub fn active_pollers(&self) -> Vec<PollSlot> {
        self.lock().polls.keys().cloned().collect()
    }

    /// Mark an operation as in progress until the guard is dropped.
    pub fn begin_loading(&self) -> LoadingGuard<'_> {
        let mut inner = self.lock();
        inner.loading += 1;
        self.publish_snapshot(&inner);
        LoadingGuard { store: self }
    }

    fn end_loading(&self) {
        let mut inner = self.lock();
        inner.loading = inner.loading.saturating_sub(1);
        self.publish_snapshot(&inner);
    }

    fn start_locked(&self, inner: &mut Inner, slot: PollSlot) -> u64 {
        if let Some(previous) = inner.polls.remove(&slot) {
            debug!(%slot, "superseding running poller");
            previous.token.cancel();
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let token = CancellationToken::new();
        inner.polls.insert(
            slot.clone(),
            PollHandle {
                token: token.clone(),
                generation,
            },
        );

        info!(%slot, generation, "poller started");
        self.emit(
            channels::POLLER_STARTED,
            EventPayload::PollerStarted { kind: slot.kind() },
        );

        match self.launcher.get().and_then(Weak::upgrade) {
            Some(launcher) => launcher.launch(slot, token, generation),
            None => debug!(%slot, "no poll launcher installed; handle registered only"),
        }
        generation
    }

    fn stop_locked(&self, inner: &mut Inner, slot: &PollSlot, reason: PollStopReason) -> bool {
        let Some(handle) = inner.polls.remove(slot) else {
            return false;
        };
        handle.token.cancel();
        info!(%slot, ?reason, "poller stopped");
        self.emit(
            channels::POLLER_STOPPED,
            EventPayload::PollerStopped {
                kind: slot.kind(),
                reason,
            },
        );
        true
    }

    fn publish_snapshot(&self, inner: &Inner) {
        let next = StoreSnapshot {
            state: inner.committed.clone(),
            is_loading: inner.loading > 0,
            push_live: inner.push_live,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn emit(&self, channel: &str, payload: EventPayload) {
        emit(self.bus.as_ref(), channel, EventSource::Session, payload);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ReconciliationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ReconciliationStore")
            .field("committed", &inner.committed)
            .field("push_live", &inner.push_live)
            .field("polls", &inner.polls.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct LoadingGuard<'a> {
    store: &'a ReconciliationStore,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.store.end_loading();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_core::event::BroadcastEventBus;
    use pairlink_core::state::PairingCode;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(PollSlot, CancellationToken, u64)>>,
    }

    impl PollLauncher for RecordingLauncher {
        fn launch(&self, slot: PollSlot, token: CancellationToken, generation: u64) {
            self.launched
                .lock()
                .unwrap()
                .push((slot, token, generation));
        }
    }

    impl RecordingLauncher {
        fn tokens(&self, slot: &PollSlot) -> Vec<CancellationToken> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _, _)| s == slot)
                .map(|(_, token, _)| token.clone())
                .collect()
        }
    }

    fn store_with_launcher() -> (ReconciliationStore, Arc<RecordingLauncher>, BroadcastEventBus) {
        let bus = BroadcastEventBus::default();
        let store = ReconciliationStore::new(Arc::new(bus.clone()));
        let launcher = Arc::new(RecordingLauncher::default());
        let weak: Weak<dyn PollLauncher> = Arc::downgrade(&launcher) as Weak<dyn PollLauncher>;
        store.set_launcher(weak);
        (store, launcher, bus)
    }

    fn restoring() -> ConnectionState {
        ConnectionState::new(Phase::Restoring, None)
    }

    #[test]
    fn identical_proposal_commits_once() {
        let (store, _launcher, bus) = store_with_launcher();
        let mut events = bus.subscribe("session.state.changed").unwrap();

        let code = PairingCode::new("2@abc");
        assert!(store.propose(ConnectionState::connecting(code.clone())));
        assert!(!store.propose(ConnectionState::connecting(code)));

        assert!(events.try_recv().is_some());
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn malformed_proposal_is_normalized() {
        let (store, _launcher, _bus) = store_with_launcher();
        store.propose(ConnectionState::reported(true, Phase::NotConnected, None));

        let committed = store.current().unwrap();
        assert!(!committed.is_connected);
        assert_eq!(committed.phase, Phase::NotConnected);
    }

    #[test]
    fn equivalent_after_normalization_is_a_no_op() {
        let (store, _launcher, _bus) = store_with_launcher();
        assert!(store.propose(ConnectionState::not_connected()));
        assert!(!store.propose(ConnectionState::reported(true, Phase::NotConnected, None)));
    }

    #[test]
    fn entering_restoring_starts_restoration_poller_once() {
        let (store, launcher, _bus) = store_with_launcher();

        store.propose(restoring());
        assert!(store.is_polling(&PollSlot::Restoration));

        // Still restoring, new pairing code: commits but does not restart.
        store.propose(ConnectionState::new(Phase::Restoring, PairingCode::new("2@x")));
        assert_eq!(launcher.tokens(&PollSlot::Restoration).len(), 1);
    }

    #[test]
    fn connected_commit_stops_session_pollers() {
        let (store, launcher, _bus) = store_with_launcher();
        store.start_poller(PollSlot::Connection);
        store.propose(restoring());

        store.propose(ConnectionState::open());

        assert!(store.active_pollers().is_empty());
        for slot in [PollSlot::Connection, PollSlot::Restoration] {
            assert!(launcher.tokens(&slot).iter().all(|t| t.is_cancelled()));
        }
    }

    #[test]
    fn connected_commit_leaves_campaign_poller_running() {
        let (store, _launcher, _bus) = store_with_launcher();
        let campaign = PollSlot::Campaign("c-1".into());
        store.start_poller(campaign.clone());

        store.propose(ConnectionState::open());
        assert!(store.is_polling(&campaign));
    }

    #[test]
    fn restarting_a_poller_supersedes_the_previous_handle() {
        let (store, launcher, _bus) = store_with_launcher();

        let first = store.start_poller(PollSlot::Connection);
        let second = store.start_poller(PollSlot::Connection);
        assert_ne!(first, second);

        let tokens = launcher.tokens(&PollSlot::Connection);
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].is_cancelled());
        assert!(!tokens[1].is_cancelled());
        assert_eq!(store.active_pollers(), vec![PollSlot::Connection]);
    }

    #[test]
    fn stale_release_is_ignored() {
        let (store, _launcher, _bus) = store_with_launcher();
        let first = store.start_poller(PollSlot::Connection);
        store.start_poller(PollSlot::Connection);

        store.release_poller(&PollSlot::Connection, first, PollStopReason::Exhausted);
        assert!(store.is_polling(&PollSlot::Connection));
    }

    #[test]
    fn stop_is_idempotent() {
        let (store, _launcher, _bus) = store_with_launcher();
        store.start_poller(PollSlot::Restoration);
        assert!(store.stop_poller(&PollSlot::Restoration));
        assert!(!store.stop_poller(&PollSlot::Restoration));
    }

    #[test]
    fn rejected_proposal_has_no_side_effects() {
        let (store, launcher, bus) = store_with_launcher();
        store.propose(restoring());
        let mut events = bus.subscribe("session.**").unwrap();

        assert!(!store.propose(restoring()));
        assert!(events.try_recv().is_none());
        assert_eq!(launcher.tokens(&PollSlot::Restoration).len(), 1);
    }

    #[test]
    fn snapshot_tracks_loading_and_push_authority() {
        let (store, _launcher, _bus) = store_with_launcher();
        let rx = store.subscribe();

        {
            let _outer = store.begin_loading();
            let _inner = store.begin_loading();
            assert!(rx.borrow().is_loading);
        }
        assert!(!rx.borrow().is_loading);

        store.set_push_live(true);
        store.propose(ConnectionState::open());
        let snapshot = store.snapshot();
        assert!(snapshot.push_live);
        assert!(snapshot.is_connected());
    }

    #[test]
    fn works_without_launcher() {
        let store = ReconciliationStore::new(Arc::new(BroadcastEventBus::default()));
        store.propose(restoring());
        assert!(store.is_polling(&PollSlot::Restoration));
    }
}
