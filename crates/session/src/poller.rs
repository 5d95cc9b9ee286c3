use std::sync::Arc;
use std::time::Duration;

use pairlink_api::{ApiError, Campaign, SessionApi};
use pairlink_core::config::PollingConfig;
use pairlink_core::event::{EventBus, EventPayload, EventSource, channels, emit};
use pairlink_core::state::{ConnectionState, Phase, PollStopReason};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::fetcher::StatusFetcher;
use crate::store::{PollLauncher, PollSlot, ReconciliationStore};

/// Cadence and ceiling of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Stop condition of the connection-establishment poller.
pub fn establishment_settled(state: &ConnectionState) -> bool {
    state.is_connected || state.phase == Phase::Error
}

/// Stop condition of the restoration poller.
pub fn restoration_settled(state: &ConnectionState) -> bool {
    state.is_connected || !matches!(state.phase, Phase::Restoring | Phase::Connecting)
}

/// Stop condition of the campaign poller.
pub fn campaign_settled(campaign: &Campaign) -> bool {
    campaign.progress.is_drained() || campaign.status.is_terminal()
}

/// Runs the loops behind the handles the store registers.
pub struct PollController<A: SessionApi> {
    store: Arc<ReconciliationStore>,
    fetcher: Arc<StatusFetcher<A>>,
    api: Arc<A>,
    bus: Arc<dyn EventBus>,
    connection: PollSchedule,
    restoration: PollSchedule,
    campaign: PollSchedule,
}

impl<A: SessionApi> PollController<A> {
    pub fn new(
        store: Arc<ReconciliationStore>,
        fetcher: Arc<StatusFetcher<A>>,
        api: Arc<A>,
        bus: Arc<dyn EventBus>,
        config: &PollingConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            api,
            bus,
            connection: PollSchedule {
                interval: config.interval(),
                max_attempts: config.connection_max_attempts,
            },
            restoration: PollSchedule {
                interval: config.interval(),
                max_attempts: config.restoration_max_attempts,
            },
            campaign: PollSchedule {
                interval: config.campaign_interval(),
                max_attempts: config.campaign_max_attempts,
            },
        }
    }

    pub fn schedule(&self, slot: &PollSlot) -> PollSchedule {
        match slot {
            PollSlot::Connection => self.connection,
            PollSlot::Restoration => self.restoration,
            PollSlot::Campaign(_) => self.campaign,
        }
    }
}

impl<A: SessionApi> PollLauncher for PollController<A> {
    fn launch(&self, slot: PollSlot, token: CancellationToken, generation: u64) {
        let schedule = self.schedule(&slot);
        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);

        match slot {
            PollSlot::Connection => {
                tokio::spawn(async move {
                    let reason = poll_status(&fetcher, &token, schedule, establishment_settled).await;
                    finish(&store, &PollSlot::Connection, generation, reason);
                });
            }
            PollSlot::Restoration => {
                tokio::spawn(async move {
                    let reason = poll_status(&fetcher, &token, schedule, restoration_settled).await;
                    finish(&store, &PollSlot::Restoration, generation, reason);
                });
            }
            PollSlot::Campaign(id) => {
                let api = Arc::clone(&self.api);
                let bus = Arc::clone(&self.bus);
                tokio::spawn(async move {
                    let outcome =
                        poll_campaign(api.as_ref(), bus.as_ref(), &fetcher, &id, &token, schedule)
                            .await;
                    if let Some(reason) = outcome {
                        emit(
                            bus.as_ref(),
                            channels::CAMPAIGN_FINISHED,
                            EventSource::Session,
                            EventPayload::CampaignFinished {
                                id: id.clone(),
                                completed: reason == PollStopReason::Settled,
                            },
                        );
                    }
                    finish(&store, &PollSlot::Campaign(id), generation, outcome);
                });
            }
        }
    }
}

fn finish(
    store: &ReconciliationStore,
    slot: &PollSlot,
    generation: u64,
    reason: Option<PollStopReason>,
) {
    match reason {
        Some(reason) => store.release_poller(slot, generation, reason),
        None => debug!(%slot, generation, "poller cancelled"),
    }
}

/// Waits for the next tick. Returns false if cancelled first.
async fn next_tick(interval: &mut tokio::time::Interval, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = interval.tick() => true,
    }
}

fn ticker(schedule: PollSchedule) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + schedule.interval, schedule.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Drive one status poller. `None` means it was cancelled by its owner.
async fn poll_status<A: SessionApi>(
    fetcher: &StatusFetcher<A>,
    token: &CancellationToken,
    schedule: PollSchedule,
    settled: fn(&ConnectionState) -> bool,
) -> Option<PollStopReason> {
    let mut interval = ticker(schedule);

    for attempt in 1..=schedule.max_attempts {
        if !next_tick(&mut interval, token).await {
            return None;
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            result = fetcher.fetch_fresh() => result,
        };

        match result {
            Ok(state) if settled(&state) => {
                info!(attempt, phase = %state.phase, "poller settled");
                return Some(PollStopReason::Settled);
            }
            Ok(state) => debug!(attempt, phase = %state.phase, "poll tick"),
            Err(FetchError::Unauthorized) => return Some(PollStopReason::Unauthorized),
            Err(error) => debug!(attempt, %error, "poll tick failed"),
        }
    }

    info!(max_attempts = schedule.max_attempts, "poller exhausted");
    Some(PollStopReason::Exhausted)
}

async fn poll_campaign<A: SessionApi>(
    api: &A,
    bus: &dyn EventBus,
    fetcher: &StatusFetcher<A>,
    id: &str,
    token: &CancellationToken,
    schedule: PollSchedule,
) -> Option<PollStopReason> {
    let mut interval = ticker(schedule);

    for attempt in 1..=schedule.max_attempts {
        if !next_tick(&mut interval, token).await {
            return None;
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            result = api.campaign_status(id) => result,
        };

        match result {
            Ok(envelope) => {
                let Some(data) = envelope.data else {
                    debug!(campaign = id, attempt, "campaign status without data");
                    continue;
                };
                let campaign = data.bulk_message;
                emit(
                    bus,
                    channels::CAMPAIGN_PROGRESS,
                    EventSource::Session,
                    EventPayload::CampaignProgress {
                        id: id.to_string(),
                        sent: campaign.progress.sent,
                        failed: campaign.progress.failed,
                        total: campaign.progress.total,
                    },
                );
                if campaign_settled(&campaign) {
                    info!(campaign = id, status = ?campaign.status, "campaign settled");
                    return Some(PollStopReason::Settled);
                }
            }
            Err(ApiError::Unauthorized) => {
                fetcher.expire_credential();
                return Some(PollStopReason::Unauthorized);
            }
            Err(error) => debug!(campaign = id, attempt, %error, "campaign tick failed"),
        }
    }

    Some(PollStopReason::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_api::{CampaignProgress, CampaignStatus};

    fn state(phase: Phase) -> ConnectionState {
        ConnectionState::new(phase, None)
    }

    #[test]
    fn establishment_stop_predicate() {
        assert!(establishment_settled(&state(Phase::Open)));
        assert!(establishment_settled(&state(Phase::Error)));
        assert!(!establishment_settled(&state(Phase::Connecting)));
        assert!(!establishment_settled(&state(Phase::NotConnected)));
        assert!(!establishment_settled(&state(Phase::Timeout)));
    }

    #[test]
    fn restoration_stop_predicate() {
        assert!(restoration_settled(&state(Phase::Open)));
        assert!(restoration_settled(&state(Phase::NotConnected)));
        assert!(restoration_settled(&state(Phase::AuthError)));
        assert!(!restoration_settled(&state(Phase::Restoring)));
        assert!(!restoration_settled(&state(Phase::Connecting)));
    }

    #[test]
    fn campaign_stop_predicate() {
        let mut campaign = Campaign {
            id: "c-1".into(),
            status: CampaignStatus::Processing,
            progress: CampaignProgress {
                total: 3,
                sent: 1,
                failed: 1,
                pending: 1,
            },
            error_message: None,
        };
        assert!(!campaign_settled(&campaign));

        campaign.progress.failed = 2;
        assert!(campaign_settled(&campaign));

        campaign.progress = CampaignProgress::default();
        campaign.status = CampaignStatus::Failed;
        assert!(campaign_settled(&campaign));
    }
}
