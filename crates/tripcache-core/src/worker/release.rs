//! Worker bridge for native shells, driven by the server's release feed.
//!
//! The running build plays the active worker. `update()` asks
//! `GET /api/app/version` for the newest release; a version different from
//! the running one becomes the waiting worker until `SkipWaiting` promotes
//! it. Reloads are recorded and logged; the host decides how to restart.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::api::{ApiClient, AppRelease};

use super::{
    BridgeError, RegistrationSnapshot, ReloadMode, ServiceWorkerBridge, WorkerEvent, WorkerId,
    WorkerMessage, WorkerState,
};

/// Capacity of the worker event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

struct ReleaseState {
    running_version: String,
    active: WorkerId,
    waiting: Option<(WorkerId, AppRelease)>,
    next_id: u64,
    reloads: Vec<ReloadMode>,
}

pub struct ReleaseFeedBridge {
    api: ApiClient,
    state: Mutex<ReleaseState>,
    events: broadcast::Sender<WorkerEvent>,
}

impl ReleaseFeedBridge {
    pub fn new(api: ApiClient, running_version: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            state: Mutex::new(ReleaseState {
                running_version: running_version.to_string(),
                active: WorkerId(1),
                waiting: None,
                next_id: 2,
                reloads: Vec::new(),
            }),
            events,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ReleaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn running_version(&self) -> String {
        self.lock_state().running_version.clone()
    }

    pub fn waiting_release(&self) -> Option<AppRelease> {
        self.lock_state().waiting.as_ref().map(|(_, r)| r.clone())
    }

    /// Reloads requested so far, oldest first
    pub fn reload_requests(&self) -> Vec<ReloadMode> {
        self.lock_state().reloads.clone()
    }

    /// Install `release` as the waiting worker when it differs from what is
    /// running or already waiting. Returns true when a worker was installed.
    fn stage(&self, release: AppRelease) -> bool {
        let worker = {
            let mut state = self.lock_state();
            let already_waiting = state
                .waiting
                .as_ref()
                .is_some_and(|(_, w)| w.version == release.version);
            if release.version == state.running_version || already_waiting {
                return false;
            }

            let worker = WorkerId(state.next_id);
            state.next_id += 1;
            if let Some((replaced, _)) = state.waiting.take() {
                let _ = self.events.send(WorkerEvent::StateChange {
                    worker: replaced,
                    state: WorkerState::Redundant,
                });
            }
            info!(version = %release.version, %worker, "New app release installed, waiting to activate");
            state.waiting = Some((worker, release));
            worker
        };

        let _ = self.events.send(WorkerEvent::UpdateFound { worker });
        let _ = self.events.send(WorkerEvent::StateChange {
            worker,
            state: WorkerState::Installing,
        });
        let _ = self.events.send(WorkerEvent::StateChange {
            worker,
            state: WorkerState::Installed,
        });
        true
    }

    fn activate(&self, worker: WorkerId) -> Result<(), BridgeError> {
        let previous = {
            let mut state = self.lock_state();
            match state.waiting.take() {
                Some((waiting, release)) if waiting == worker => {
                    let previous = state.active;
                    info!(version = %release.version, %worker, "Activating app release");
                    state.running_version = release.version;
                    state.active = worker;
                    previous
                }
                other => {
                    state.waiting = other;
                    return Err(BridgeError::NoWaitingWorker);
                }
            }
        };

        for (w, s) in [
            (worker, WorkerState::Activating),
            (worker, WorkerState::Activated),
            (previous, WorkerState::Redundant),
        ] {
            let _ = self.events.send(WorkerEvent::StateChange { worker: w, state: s });
        }
        let _ = self.events.send(WorkerEvent::ControllerChange);
        Ok(())
    }
}

#[async_trait]
impl ServiceWorkerBridge for ReleaseFeedBridge {
    async fn registration(&self) -> Result<Option<RegistrationSnapshot>, BridgeError> {
        let state = self.lock_state();
        Ok(Some(RegistrationSnapshot {
            installing: None,
            waiting: state.waiting.as_ref().map(|(w, _)| *w),
            active: Some(state.active),
            has_controller: true,
        }))
    }

    async fn update(&self) -> Result<(), BridgeError> {
        let release = self
            .api
            .fetch_app_release()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;
        debug!(version = %release.version, "Release feed checked");
        self.stage(release);
        Ok(())
    }

    async fn post_message(&self, worker: WorkerId, message: WorkerMessage) -> Result<(), BridgeError> {
        match message {
            WorkerMessage::SkipWaiting => self.activate(worker),
        }
    }

    async fn clear_app_caches(&self) -> Result<(), BridgeError> {
        debug!("No app-shell caches to clear");
        Ok(())
    }

    async fn reload(&self, mode: ReloadMode) -> Result<(), BridgeError> {
        let mut state = self.lock_state();
        info!(?mode, version = %state.running_version, "Reload requested, restart to pick up the new version");
        state.reloads.push(mode);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> ReleaseFeedBridge {
        ReleaseFeedBridge::new(ApiClient::new("http://127.0.0.1:9").unwrap(), "1.4.0")
    }

    fn release(version: &str) -> AppRelease {
        AppRelease {
            version: version.to_string(),
            released_at: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_same_version_is_not_staged() {
        let bridge = bridge();
        assert!(!bridge.stage(release("1.4.0")));
        let snapshot = bridge.registration().await.unwrap().unwrap();
        assert!(!snapshot.has_pending_update());
    }

    #[tokio::test]
    async fn test_new_release_waits_then_activates() {
        let bridge = bridge();
        let mut events = bridge.subscribe();

        assert!(bridge.stage(release("1.5.0")));
        assert!(!bridge.stage(release("1.5.0")));

        let snapshot = bridge.registration().await.unwrap().unwrap();
        let waiting = snapshot.waiting.unwrap();
        assert!(snapshot.has_pending_update());
        assert_eq!(events.recv().await.unwrap(), WorkerEvent::UpdateFound { worker: waiting });

        bridge.post_message(waiting, WorkerMessage::SkipWaiting).await.unwrap();
        assert_eq!(bridge.running_version(), "1.5.0");
        assert!(bridge.waiting_release().is_none());

        let rest: Vec<WorkerEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(rest.last(), Some(&WorkerEvent::ControllerChange));
    }

    #[tokio::test]
    async fn test_skip_waiting_without_waiting_worker() {
        let bridge = bridge();
        let err = bridge
            .post_message(WorkerId(9), WorkerMessage::SkipWaiting)
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::NoWaitingWorker);
    }

    #[tokio::test]
    async fn test_update_fails_softly_when_feed_unreachable() {
        let bridge = bridge();
        assert!(matches!(bridge.update().await, Err(BridgeError::Network(_))));
        assert_eq!(bridge.running_version(), "1.4.0");
    }

    #[tokio::test]
    async fn test_reloads_are_recorded() {
        let bridge = bridge();
        bridge.reload(ReloadMode::BypassCache).await.unwrap();
        assert_eq!(bridge.reload_requests(), vec![ReloadMode::BypassCache]);
    }

    #[tokio::test]
    async fn test_update_stages_release_from_feed() {
        let mut server = mockito::Server::new_async().await;
        let feed = server
            .mock("GET", "/api/app/version")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"version":"1.5.0","notes":"Offline maps for every port"}"#)
            .expect(2)
            .create_async()
            .await;
        let bridge = ReleaseFeedBridge::new(ApiClient::new(&server.url()).unwrap(), "1.4.0");
        let mut events = bridge.subscribe();

        bridge.update().await.unwrap();
        let waiting = bridge.waiting_release().unwrap();
        assert_eq!(waiting.version, "1.5.0");
        assert_eq!(waiting.notes.as_deref(), Some("Offline maps for every port"));
        assert!(bridge.registration().await.unwrap().unwrap().has_pending_update());

        let installed: Vec<WorkerEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(matches!(
            installed.last(),
            Some(WorkerEvent::StateChange { state: WorkerState::Installed, .. })
        ));

        // Same release again installs nothing new
        bridge.update().await.unwrap();
        assert!(events.try_recv().is_err());
        feed.assert_async().await;
    }
}
