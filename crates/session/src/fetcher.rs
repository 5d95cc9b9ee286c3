use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pairlink_api::{ApiEnvelope, ApiError, SessionApi, StatusData};
use pairlink_core::config::FetchConfig;
use pairlink_core::credential::CredentialHandle;
use pairlink_core::event::{EventBus, EventPayload, EventSource, channels, emit};
use pairlink_core::state::{ConnectionState, PollStopReason};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::inflight::InflightRequests;
use crate::store::ReconciliationStore;

/// Cache key for the status endpoint.
pub const STATUS_PATH: &str = "/whatsapp/status";
const STATUS_KEY: &str = "status";

type StatusOutcome = Result<ApiEnvelope<StatusData>, ApiError>;

/// Time-bounded cache of successful responses keyed by endpoint path.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<&'static str, (ConnectionState, Instant)>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, path: &'static str) -> Option<ConnectionState> {
        let mut entries = self.lock();
        match entries.get(path) {
            Some((state, stored)) if stored.elapsed() < self.ttl => Some(state.clone()),
            Some(_) => {
                entries.remove(path);
                None
            }
            None => None,
        }
    }

    /// Last stored value regardless of age.
    pub fn peek(&self, path: &'static str) -> Option<ConnectionState> {
        self.lock().get(path).map(|(state, _)| state.clone())
    }

    pub fn put(&self, path: &'static str, state: ConnectionState) {
        self.lock().insert(path, (state, Instant::now()));
    }

    pub fn invalidate(&self, path: &'static str) {
        self.lock().remove(path);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<&'static str, (ConnectionState, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deduplicated, cached, rate-limited wrapper around the status endpoint.
///
/// Every successful result is proposed to the [`ReconciliationStore`];
/// a rejected credential is cleared here and nowhere else.
pub struct StatusFetcher<A: SessionApi> {
    api: Arc<A>,
    store: Arc<ReconciliationStore>,
    credential: CredentialHandle,
    bus: Arc<dyn EventBus>,
    inflight: InflightRequests<StatusOutcome>,
    cache: ResponseCache,
    min_spacing: Duration,
    last_attempt: Mutex<Option<Instant>>,
}

impl<A: SessionApi> StatusFetcher<A> {
    pub fn new(
        api: Arc<A>,
        store: Arc<ReconciliationStore>,
        credential: CredentialHandle,
        bus: Arc<dyn EventBus>,
        config: &FetchConfig,
    ) -> Self {
        Self {
            api,
            store,
            credential,
            bus,
            inflight: InflightRequests::new(),
            cache: ResponseCache::new(config.cache_ttl()),
            min_spacing: config.min_spacing(),
            last_attempt: Mutex::new(None),
        }
    }

    /// Reconcile with the backend, honouring the push channel's authority,
    /// the minimum spacing between attempts and the response cache.
    pub async fn fetch_status(&self) -> Result<ConnectionState, FetchError> {
        if !self.credential.is_authenticated() {
            debug!("no credential; skipping status fetch");
            return Ok(ConnectionState::not_connected());
        }

        if self.store.is_push_live() {
            if let Some(current) = self.store.current() {
                debug!("push channel is authoritative; skipping status fetch");
                return Ok(current);
            }
        }

        if !self.claim_attempt() {
            debug!("status fetch within minimum spacing; returning last known state");
            return Ok(self.last_known());
        }

        // A cached response never outranks a later commit from another source.
        if let Some(cached) = self.cache.get(STATUS_PATH) {
            debug!("status served from cache");
            return Ok(self.store.current().unwrap_or(cached));
        }

        self.fetch_from_backend().await
    }

    /// Fetch used by poll ticks and post-command confirmation. Skips the
    /// spacing gate, the push gate and the cache read; still joins any
    /// in-flight status request and refreshes the cache.
    pub async fn fetch_fresh(&self) -> Result<ConnectionState, FetchError> {
        if !self.credential.is_authenticated() {
            debug!("no credential; skipping status fetch");
            return Ok(ConnectionState::not_connected());
        }
        self.fetch_from_backend().await
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate(STATUS_PATH);
    }

    /// Handle a rejected credential seen by any session component: clear
    /// it, commit `NotConnected`, and stop every poller.
    pub fn expire_credential(&self) {
        let cleared = self.credential.clear();
        self.cache.invalidate(STATUS_PATH);
        self.store.propose(ConnectionState::not_connected());
        self.store.stop_all_pollers(PollStopReason::Unauthorized);
        if cleared {
            warn!("credential rejected by backend");
            emit(
                self.bus.as_ref(),
                channels::AUTH_EXPIRED,
                EventSource::Session,
                EventPayload::AuthExpired,
            );
        }
    }

    async fn fetch_from_backend(&self) -> Result<ConnectionState, FetchError> {
        let api = Arc::clone(&self.api);
        let outcome = self
            .inflight
            .run(STATUS_KEY, move || async move { api.status().await })
            .await;

        match outcome {
            Ok(envelope) => {
                let proposal = match envelope.data {
                    Some(data) if envelope.success => data.to_proposal().normalized(),
                    _ => {
                        debug!(message = ?envelope.message, "status reported no session");
                        ConnectionState::not_connected()
                    }
                };
                self.cache.put(STATUS_PATH, proposal.clone());
                self.store.propose(proposal.clone());
                Ok(proposal)
            }
            Err(ApiError::Unauthorized) => {
                self.expire_credential();
                Err(FetchError::Unauthorized)
            }
            Err(error) => {
                if error.is_transient() {
                    debug!(%error, "status fetch failed; keeping committed state");
                } else {
                    info!(%error, "status fetch rejected; keeping committed state");
                }
                Err(FetchError::Api(error))
            }
        }
    }

    /// Returns false if the previous attempt was too recent.
    fn claim_attempt(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
        let too_soon = last.is_some_and(|previous| now.duration_since(previous) < self.min_spacing);
        if !too_soon {
            *last = Some(now);
        }
        !too_soon
    }

    fn last_known(&self) -> ConnectionState {
        self.store
            .current()
            .or_else(|| self.cache.peek(STATUS_PATH))
            .unwrap_or_default()
    }
}
