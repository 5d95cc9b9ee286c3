use std::path::PathBuf;
use std::sync::Arc;

use pairlink_api::HttpSessionApi;
use pairlink_core::config::Config;
use pairlink_core::credential::{self, Credential, CredentialHandle};
use pairlink_core::error::EventBusError;
use pairlink_core::event::{
    BroadcastEventBus, Event, EventBus, EventPayload, EventSource, EventSubscription, channels,
    emit,
};
use pairlink_notifications::NotificationManager;
use pairlink_push::{ChannelManager, WebSocketTransport};
use pairlink_session::SessionEngine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CliError;
use crate::render;

const SYSTEM_COMPONENT: &str = "cli";

/// Where the credential lives, honouring the `[credential] path` override.
pub fn credential_file(config: &Config) -> PathBuf {
    config
        .credential
        .path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(credential::credential_path)
}

/// A loaded engine plus the background tasks that feed it.
pub struct Runtime {
    config: Config,
    bus: Arc<dyn EventBus>,
    credential: CredentialHandle,
    engine: SessionEngine<HttpSessionApi>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn open(config: Config) -> Result<Self, CliError> {
        let path = credential_file(&config);
        let stored = credential::load_credential(&path)?.ok_or(CliError::NotLoggedIn)?;
        let credential = CredentialHandle::new(Some(stored));

        let bus: Arc<dyn EventBus> =
            Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
        let api = HttpSessionApi::new(&config.backend, credential.clone())?;
        let engine = SessionEngine::new(api, credential.clone(), Arc::clone(&bus), &config);

        let shutdown = CancellationToken::new();
        let tasks = vec![tokio::spawn(forget_cleared_credential(
            credential.subscribe(),
            path,
            shutdown.clone(),
        ))];

        Ok(Self {
            config,
            bus,
            credential,
            engine,
            shutdown,
            tasks,
        })
    }

    pub fn engine(&self) -> &SessionEngine<HttpSessionApi> {
        &self.engine
    }

    /// Start the push channel and desktop notices.
    pub fn start_background(&mut self) -> Result<(), CliError> {
        let channel = Arc::new(ChannelManager::<WebSocketTransport>::from_config(
            &self.config,
            Arc::clone(self.engine.store()),
            Arc::clone(&self.bus),
        )?);
        self.tasks.push(
            channel.follow_credentials(self.credential.subscribe(), self.shutdown.clone()),
        );

        let notifications = Arc::new(NotificationManager::new(
            Arc::clone(&self.bus),
            &self.config.notifications,
        ));
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = notifications.run() => {
                    if let Err(error) = result {
                        warn!(%error, "notification manager stopped");
                    }
                }
            }
        }));

        emit(
            self.bus.as_ref(),
            channels::STARTUP_COMPLETE,
            EventSource::System(SYSTEM_COMPONENT.to_string()),
            EventPayload::StartupComplete,
        );
        Ok(())
    }

    pub fn subscribe(&self) -> Result<EventSubscription, CliError> {
        Ok(self.bus.subscribe("{session,push,ui}.**")?)
    }

    /// Print state changes and user-facing events until `done` matches an
    /// event, the bus closes, or the user presses Ctrl-C.
    pub async fn follow<F>(&self, mut events: EventSubscription, mut done: F) -> Result<(), CliError>
    where
        F: FnMut(&Event) -> bool,
    {
        let mut snapshots = self.engine.subscribe();
        let mut last_line = render::snapshot_line(&snapshots.borrow_and_update());
        if let Some(line) = &last_line {
            println!("{line}");
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("interrupted");
                    return Ok(());
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let line = render::snapshot_line(&snapshots.borrow_and_update());
                    if line != last_line {
                        if let Some(text) = &line {
                            println!("{text}");
                        }
                        last_line = line;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(line) = render::event_line(&event) {
                            println!("{line}");
                        }
                        if done(&event) {
                            return Ok(());
                        }
                    }
                    Err(EventBusError::Lagged(count)) => {
                        warn!(count, "event subscription lagged, some events dropped");
                    }
                    Err(EventBusError::ChannelClosed) => return Ok(()),
                    Err(error) => return Err(error.into()),
                }
            }
        }
    }

    /// Cancel every timer and background task.
    pub async fn shutdown(self, reason: &str) {
        emit(
            self.bus.as_ref(),
            channels::SHUTDOWN_REQUESTED,
            EventSource::System(SYSTEM_COMPONENT.to_string()),
            EventPayload::ShutdownRequested {
                reason: reason.to_string(),
            },
        );
        self.shutdown.cancel();
        self.engine.shutdown();
        for task in self.tasks {
            if let Err(error) = task.await {
                warn!(%error, "background task ended abnormally");
            }
        }
    }
}

/// Delete the stored credential once the engine clears it after a 401.
async fn forget_cleared_credential(
    mut credentials: watch::Receiver<Option<Credential>>,
    path: PathBuf,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            changed = credentials.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        if credentials.borrow_and_update().is_some() {
            continue;
        }
        match credential::remove_credential(&path) {
            Ok(()) => info!(path = %path.display(), "removed expired credential"),
            Err(error) => warn!(%error, "failed to remove expired credential"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_core::config::load_config_from_str;

    fn config_with_credential_path(path: &std::path::Path) -> Config {
        load_config_from_str(&format!(
            r#"
            [backend]
            api_url = "http://localhost:5000/api"
            push_url = "ws://localhost:5000/socket"

            [credential]
            path = "{}"
            "#,
            path.display()
        ))
        .unwrap()
    }

    #[test]
    fn credential_path_override_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let config = config_with_credential_path(&path);
        assert_eq!(credential_file(&config), path);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn opening_without_credential_reports_not_logged_in() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_credential_path(&dir.path().join("missing.json"));
        assert!(matches!(Runtime::open(config), Err(CliError::NotLoggedIn)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cleared_credential_is_removed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        credential::save_credential(&path, &Credential::new("tok", "user-1")).unwrap();

        let handle = CredentialHandle::new(Some(Credential::new("tok", "user-1")));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(forget_cleared_credential(
            handle.subscribe(),
            path.clone(),
            shutdown.clone(),
        ));
        tokio::task::yield_now().await;

        handle.clear();
        for _ in 0..10 {
            if !path.exists() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!path.exists());

        shutdown.cancel();
        task.await.unwrap();
    }
}
