use std::sync::{Arc, Weak};

use pairlink_api::SessionApi;
use pairlink_core::config::Config;
use pairlink_core::credential::CredentialHandle;
use pairlink_core::event::EventBus;
use pairlink_core::state::{ConnectionState, PollStopReason};
use tokio::sync::watch;
use tracing::info;

use crate::commands::{CommandOutcome, SessionCommands};
use crate::error::FetchError;
use crate::fetcher::StatusFetcher;
use crate::poller::PollController;
use crate::store::{PollLauncher, PollSlot, ReconciliationStore, StoreSnapshot};

/// Owns one store and everything that feeds it.
///
/// Construct once per process (or per test) and hand out the store to the
/// push channel. Dropping the engine without [`SessionEngine::shutdown`]
/// leaves running pollers to notice the dropped controller and finish on
/// their own ceilings.
pub struct SessionEngine<A: SessionApi> {
    store: Arc<ReconciliationStore>,
    fetcher: Arc<StatusFetcher<A>>,
    pollers: Arc<PollController<A>>,
    commands: SessionCommands<A>,
    credential: CredentialHandle,
}

impl<A: SessionApi> SessionEngine<A> {
    pub fn new(
        api: A,
        credential: CredentialHandle,
        bus: Arc<dyn EventBus>,
        config: &Config,
    ) -> Self {
        let api = Arc::new(api);
        let store = Arc::new(ReconciliationStore::new(Arc::clone(&bus)));
        let fetcher = Arc::new(StatusFetcher::new(
            Arc::clone(&api),
            Arc::clone(&store),
            credential.clone(),
            Arc::clone(&bus),
            &config.fetch,
        ));
        let pollers = Arc::new(PollController::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            Arc::clone(&api),
            bus,
            &config.polling,
        ));
        let launcher: Weak<dyn PollLauncher> = Arc::downgrade(&pollers) as Weak<dyn PollLauncher>;
        store.set_launcher(launcher);

        let commands = SessionCommands::new(api, Arc::clone(&store), Arc::clone(&fetcher));

        Self {
            store,
            fetcher,
            pollers,
            commands,
            credential,
        }
    }

    pub fn store(&self) -> &Arc<ReconciliationStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<StatusFetcher<A>> {
        &self.fetcher
    }

    pub fn pollers(&self) -> &Arc<PollController<A>> {
        &self.pollers
    }

    pub fn credential(&self) -> &CredentialHandle {
        &self.credential
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.store.subscribe()
    }

    pub async fn fetch_status(&self) -> Result<ConnectionState, FetchError> {
        self.fetcher.fetch_status().await
    }

    pub async fn connect(&self) -> CommandOutcome {
        self.commands.connect().await
    }

    pub async fn disconnect(&self) -> CommandOutcome {
        self.commands.disconnect().await
    }

    pub async fn refresh_qr(&self) -> CommandOutcome {
        self.commands.refresh_qr().await
    }

    pub async fn send_test_message(&self, phone_number: &str, message: &str) -> CommandOutcome {
        self.commands.send_test_message(phone_number, message).await
    }

    /// Follow a bulk campaign until it drains. Restarting for the same id
    /// supersedes the previous watcher.
    pub fn watch_campaign(&self, campaign_id: impl Into<String>) -> u64 {
        self.store.start_poller(PollSlot::Campaign(campaign_id.into()))
    }

    pub fn stop_campaign(&self, campaign_id: &str) -> bool {
        self.store
            .stop_poller(&PollSlot::Campaign(campaign_id.to_string()))
    }

    /// Cancel every timer the engine owns.
    pub fn shutdown(&self) {
        info!("shutting down session engine");
        self.store.stop_all_pollers(PollStopReason::Cancelled);
    }
}
