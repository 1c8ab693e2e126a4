use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::models::UpdateState;
use crate::worker::{ReloadMode, ServiceWorkerBridge, WorkerEvent, WorkerMessage, WorkerState};

use super::UpdateError;

/// Timeouts and polling for the update lifecycle.
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Upper bound on one `check_for_updates` round trip
    pub check_timeout: Duration,
    /// How long to wait for the new version to take control after skip-waiting
    pub activation_timeout: Duration,
    /// Background check interval; `None` only checks on demand
    pub poll_interval: Option<Duration>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(15),
            activation_timeout: Duration::from_secs(10),
            poll_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The waiting version took control and a reload was issued
    Applied,
    NothingToApply,
}

struct MonitorInner {
    bridge: Arc<dyn ServiceWorkerBridge>,
    settings: UpdateSettings,
    state: watch::Sender<UpdateState>,
}

/// Clears `is_checking` and stamps `last_checked` however the check ends,
/// including when the caller drops the future.
struct CheckGuard<'a> {
    state: &'a watch::Sender<UpdateState>,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| {
            s.is_checking = false;
            s.last_checked = Some(Utc::now());
        });
    }
}

impl MonitorInner {
    fn set_available(&self, available: bool) {
        self.state.send_if_modified(|s| {
            if s.update_available == available {
                return false;
            }
            s.update_available = available;
            true
        });
    }

    /// Re-derive `update_available` from the live registration.
    async fn rehydrate(&self) {
        match self.bridge.registration().await {
            Ok(registration) => {
                let pending = registration.is_some_and(|r| r.has_pending_update());
                self.set_available(pending);
            }
            Err(e) => warn!(error = %e, "Could not read worker registration"),
        }
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::StateChange {
                worker,
                state: WorkerState::Installed,
            } => match self.bridge.registration().await {
                Ok(Some(reg)) if reg.has_controller && reg.active != Some(worker) => {
                    info!(%worker, "New app version installed and waiting");
                    self.set_available(true);
                }
                // First install: nothing is being replaced
                Ok(_) => debug!(%worker, "Worker installed without a controller"),
                Err(e) => warn!(%worker, error = %e, "Could not read worker registration"),
            },
            WorkerEvent::StateChange {
                state: WorkerState::Redundant,
                ..
            } => self.rehydrate().await,
            WorkerEvent::StateChange { worker, state } => {
                debug!(%worker, %state, "Worker state changed");
            }
            WorkerEvent::UpdateFound { worker } => debug!(%worker, "Worker update found"),
            WorkerEvent::ControllerChange => debug!("Worker controller changed"),
        }
    }

    async fn check_for_updates(&self) -> Result<(), UpdateError> {
        let started = self.state.send_if_modified(|s| {
            if s.is_checking {
                return false;
            }
            s.is_checking = true;
            true
        });
        if !started {
            debug!("Update check already in flight");
            return Ok(());
        }
        let _guard = CheckGuard { state: &self.state };

        let limit = self.settings.check_timeout;
        match timeout(limit, self.bridge.update()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Update check failed");
                return Err(UpdateError::UpdateCheckFailed(e.to_string()));
            }
            Err(_) => {
                warn!(timeout_secs = limit.as_secs(), "Update check timed out");
                return Err(UpdateError::UpdateCheckFailed(format!(
                    "timed out after {}s",
                    limit.as_secs()
                )));
            }
        }

        // A worker found by this check may have installed before its event
        // reached the listener.
        match self.bridge.registration().await {
            Ok(Some(reg)) if reg.has_pending_update() => self.set_available(true),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read worker registration"),
        }
        Ok(())
    }
}

async fn listen(inner: Weak<MonitorInner>, mut events: broadcast::Receiver<WorkerEvent>) {
    loop {
        let event = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Ok(event) => inner.handle_event(event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed worker events, re-reading registration");
                inner.rehydrate().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn poll(inner: Weak<MonitorInner>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // Failures are already logged; the next tick retries
        let _ = inner.check_for_updates().await;
    }
}

/// Tracks whether a new app version is waiting and drives check, apply
/// and force refresh.
///
/// Background tasks stop when the monitor is dropped or `shutdown` is called.
pub struct UpdateMonitor {
    inner: Arc<MonitorInner>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl UpdateMonitor {
    /// Rehydrate from the current registration and start listening.
    pub async fn start(bridge: Arc<dyn ServiceWorkerBridge>, settings: UpdateSettings) -> Self {
        let (state, _) = watch::channel(UpdateState::new(Utc::now()));
        // Subscribe before reading the registration so no install is missed
        let events = bridge.subscribe();
        let poll_interval = settings.poll_interval;
        let inner = Arc::new(MonitorInner {
            bridge,
            settings,
            state,
        });

        inner.rehydrate().await;
        if inner.state.borrow().update_available {
            info!("An app update is already waiting");
        }

        let mut tasks = vec![tokio::spawn(listen(Arc::downgrade(&inner), events)).abort_handle()];
        if let Some(every) = poll_interval {
            debug!(interval_secs = every.as_secs(), "Polling for app updates");
            tasks.push(tokio::spawn(poll(Arc::downgrade(&inner), every)).abort_handle());
        }

        Self {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn state(&self) -> UpdateState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.inner.state.subscribe()
    }

    /// Ask the worker to look for a new version.
    ///
    /// A call made while another check is running returns immediately.
    /// `last_checked` is stamped whatever the outcome; on failure nothing
    /// else changes.
    pub async fn check_for_updates(&self) -> Result<(), UpdateError> {
        self.inner.check_for_updates().await
    }

    /// Activate the waiting version and reload.
    pub async fn apply_update(&self) -> Result<ApplyOutcome, UpdateError> {
        let available = self.inner.state.borrow().update_available;
        if !available {
            debug!("No app update to apply");
            return Ok(ApplyOutcome::NothingToApply);
        }

        let waiting = self
            .inner
            .bridge
            .registration()
            .await?
            .and_then(|r| r.waiting);
        let Some(waiting) = waiting else {
            warn!("Update was flagged but no worker is waiting");
            self.inner.set_available(false);
            return Ok(ApplyOutcome::NothingToApply);
        };

        let mut events = self.inner.bridge.subscribe();
        self.inner
            .bridge
            .post_message(waiting, WorkerMessage::SkipWaiting)
            .await?;

        let limit = self.inner.settings.activation_timeout;
        let confirmed = timeout(limit, async {
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::ControllerChange) => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if !confirmed {
            warn!(worker = %waiting, timeout_secs = limit.as_secs(), "New version did not take control");
            return Err(UpdateError::ActivationFailed(limit));
        }

        info!(worker = %waiting, "App update activated, reloading");
        self.inner.state.send_modify(|s| {
            s.update_available = false;
            s.last_updated = Utc::now();
        });
        self.inner.bridge.reload(ReloadMode::Normal).await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Drop app-shell caches and reload past every cache layer.
    ///
    /// A failure to clear caches is logged and the reload still happens.
    pub async fn force_refresh(&self) -> Result<(), UpdateError> {
        if let Err(e) = self.inner.bridge.clear_app_caches().await {
            warn!(error = %e, "Failed to clear app caches, reloading anyway");
        }
        self.inner.bridge.reload(ReloadMode::BypassCache).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for UpdateMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{BridgeError, RegistrationSnapshot, WorkerId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeBridge {
        snapshot: Mutex<Option<RegistrationSnapshot>>,
        events: broadcast::Sender<WorkerEvent>,
        registration_calls: AtomicUsize,
        update_calls: AtomicUsize,
        update_error: Mutex<Option<BridgeError>>,
        update_hangs: AtomicBool,
        gated: AtomicBool,
        gate: Notify,
        install_on_update: Mutex<Option<WorkerId>>,
        confirm_activation: AtomicBool,
        clear_fails: AtomicBool,
        messages: Mutex<Vec<(WorkerId, WorkerMessage)>>,
        reloads: Mutex<Vec<ReloadMode>>,
    }

    impl FakeBridge {
        fn controlled(waiting: Option<WorkerId>) -> Arc<Self> {
            Self::with_snapshot(Some(RegistrationSnapshot {
                installing: None,
                waiting,
                active: Some(WorkerId(1)),
                has_controller: true,
            }))
        }

        fn with_snapshot(snapshot: Option<RegistrationSnapshot>) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                snapshot: Mutex::new(snapshot),
                events,
                registration_calls: AtomicUsize::new(0),
                update_calls: AtomicUsize::new(0),
                update_error: Mutex::new(None),
                update_hangs: AtomicBool::new(false),
                gated: AtomicBool::new(false),
                gate: Notify::new(),
                install_on_update: Mutex::new(None),
                confirm_activation: AtomicBool::new(true),
                clear_fails: AtomicBool::new(false),
                messages: Mutex::new(Vec::new()),
                reloads: Mutex::new(Vec::new()),
            })
        }

        fn install(&self, worker: WorkerId) {
            if let Some(snapshot) = self.snapshot.lock().unwrap().as_mut() {
                snapshot.waiting = Some(worker);
            }
            let _ = self.events.send(WorkerEvent::StateChange {
                worker,
                state: WorkerState::Installed,
            });
        }

        fn reloads(&self) -> Vec<ReloadMode> {
            self.reloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceWorkerBridge for FakeBridge {
        async fn registration(&self) -> Result<Option<RegistrationSnapshot>, BridgeError> {
            self.registration_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.lock().unwrap().clone())
        }

        async fn update(&self) -> Result<(), BridgeError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if self.update_hangs.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let err = self.update_error.lock().unwrap().clone();
            if let Some(err) = err {
                return Err(err);
            }
            let worker = self.install_on_update.lock().unwrap().take();
            if let Some(worker) = worker {
                self.install(worker);
            }
            Ok(())
        }

        async fn post_message(
            &self,
            worker: WorkerId,
            message: WorkerMessage,
        ) -> Result<(), BridgeError> {
            self.messages.lock().unwrap().push((worker, message));
            if self.confirm_activation.load(Ordering::SeqCst) {
                if let Some(snapshot) = self.snapshot.lock().unwrap().as_mut() {
                    snapshot.active = snapshot.waiting.take();
                }
                let _ = self.events.send(WorkerEvent::ControllerChange);
            }
            Ok(())
        }

        async fn clear_app_caches(&self) -> Result<(), BridgeError> {
            if self.clear_fails.load(Ordering::SeqCst) {
                return Err(BridgeError::Message("cache storage locked".into()));
            }
            Ok(())
        }

        async fn reload(&self, mode: ReloadMode) -> Result<(), BridgeError> {
            self.reloads.lock().unwrap().push(mode);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
            self.events.subscribe()
        }
    }

    async fn start(bridge: &Arc<FakeBridge>) -> UpdateMonitor {
        UpdateMonitor::start(
            Arc::clone(bridge) as Arc<dyn ServiceWorkerBridge>,
            UpdateSettings::default(),
        )
        .await
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_rehydrates_waiting_worker() {
        let bridge = FakeBridge::controlled(Some(WorkerId(2)));
        let monitor = start(&bridge).await;
        assert!(monitor.state().update_available);
        assert!(monitor.state().last_checked.is_none());
    }

    #[tokio::test]
    async fn test_installed_worker_sets_update_available() {
        let bridge = FakeBridge::controlled(None);
        let monitor = start(&bridge).await;
        assert!(!monitor.state().update_available);

        bridge.install(WorkerId(2));
        let mut rx = monitor.subscribe();
        timeout(Duration::from_secs(1), rx.wait_for(|s| s.update_available))
            .await
            .unwrap()
            .unwrap();
        // Passive detection never runs a check
        assert!(monitor.state().last_checked.is_none());
    }

    #[tokio::test]
    async fn test_first_install_is_not_an_update() {
        let bridge = FakeBridge::with_snapshot(Some(RegistrationSnapshot::default()));
        let monitor = start(&bridge).await;

        bridge.install(WorkerId(1));
        // One read at start, one for the install event
        wait_until(|| bridge.registration_calls.load(Ordering::SeqCst) >= 2).await;
        assert!(!monitor.state().update_available);
    }

    #[tokio::test]
    async fn test_apply_without_update_is_noop() {
        let bridge = FakeBridge::controlled(None);
        let monitor = start(&bridge).await;

        let outcome = monitor.apply_update().await.unwrap();
        assert_eq!(outcome, ApplyOutcome::NothingToApply);
        assert!(bridge.reloads().is_empty());
        assert!(bridge.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_activates_and_reloads() {
        let bridge = FakeBridge::controlled(Some(WorkerId(2)));
        let monitor = start(&bridge).await;
        let before = monitor.state().last_updated;

        let outcome = monitor.apply_update().await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(
            *bridge.messages.lock().unwrap(),
            vec![(WorkerId(2), WorkerMessage::SkipWaiting)]
        );
        assert_eq!(bridge.reloads(), vec![ReloadMode::Normal]);

        let state = monitor.state();
        assert!(!state.update_available);
        assert!(state.last_updated >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_times_out_without_controller_change() {
        let bridge = FakeBridge::controlled(Some(WorkerId(2)));
        bridge.confirm_activation.store(false, Ordering::SeqCst);
        let monitor = start(&bridge).await;

        let err = monitor.apply_update().await.unwrap_err();
        assert_eq!(err, UpdateError::ActivationFailed(Duration::from_secs(10)));
        assert!(bridge.reloads().is_empty());
        assert!(monitor.state().update_available);
    }

    #[tokio::test]
    async fn test_stale_flag_without_waiting_worker() {
        let bridge = FakeBridge::controlled(Some(WorkerId(2)));
        let monitor = start(&bridge).await;
        // Waiting worker vanished without a redundant event reaching us
        bridge.snapshot.lock().unwrap().as_mut().unwrap().waiting = None;

        let outcome = monitor.apply_update().await.unwrap();
        assert_eq!(outcome, ApplyOutcome::NothingToApply);
        assert!(!monitor.state().update_available);
        assert!(bridge.reloads().is_empty());
    }

    #[tokio::test]
    async fn test_check_finds_update() {
        let bridge = FakeBridge::controlled(None);
        *bridge.install_on_update.lock().unwrap() = Some(WorkerId(2));
        let monitor = start(&bridge).await;

        monitor.check_for_updates().await.unwrap();
        let state = monitor.state();
        assert!(state.update_available);
        assert!(!state.is_checking);
        assert!(state.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_failed_check_changes_only_last_checked() {
        let bridge = FakeBridge::controlled(None);
        *bridge.update_error.lock().unwrap() = Some(BridgeError::Network("offline".into()));
        let monitor = start(&bridge).await;
        let before = monitor.state();

        let err = monitor.check_for_updates().await.unwrap_err();
        assert!(matches!(err, UpdateError::UpdateCheckFailed(ref m) if m.contains("offline")));

        let after = monitor.state();
        assert!(after.last_checked.is_some());
        assert!(!after.is_checking);
        assert_eq!(after.update_available, before.update_available);
        assert_eq!(after.last_updated, before.last_updated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_times_out() {
        let bridge = FakeBridge::controlled(None);
        bridge.update_hangs.store(true, Ordering::SeqCst);
        let monitor = start(&bridge).await;

        let err = monitor.check_for_updates().await.unwrap_err();
        assert!(matches!(err, UpdateError::UpdateCheckFailed(ref m) if m.contains("timed out")));
        assert!(!monitor.state().is_checking);
    }

    #[tokio::test]
    async fn test_concurrent_checks_coalesce() {
        let bridge = FakeBridge::controlled(None);
        bridge.gated.store(true, Ordering::SeqCst);
        let monitor = Arc::new(start(&bridge).await);

        let first = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.check_for_updates().await }
        });
        let mut rx = monitor.subscribe();
        timeout(Duration::from_secs(1), rx.wait_for(|s| s.is_checking))
            .await
            .unwrap()
            .unwrap();

        monitor.check_for_updates().await.unwrap();
        assert_eq!(bridge.update_calls.load(Ordering::SeqCst), 1);
        assert!(monitor.state().is_checking);

        bridge.gate.notify_one();
        first.await.unwrap().unwrap();
        assert!(!monitor.state().is_checking);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let bridge = FakeBridge::controlled(None);
        bridge.clear_fails.store(true, Ordering::SeqCst);
        let monitor = start(&bridge).await;

        monitor.force_refresh().await.unwrap();
        assert_eq!(bridge.reloads(), vec![ReloadMode::BypassCache]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_poll_checks() {
        let bridge = FakeBridge::controlled(None);
        let monitor = UpdateMonitor::start(
            Arc::clone(&bridge) as Arc<dyn ServiceWorkerBridge>,
            UpdateSettings {
                poll_interval: Some(Duration::from_secs(60)),
                ..UpdateSettings::default()
            },
        )
        .await;

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(bridge.update_calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bridge.update_calls.load(Ordering::SeqCst), 1);
        assert!(monitor.state().last_checked.is_some());

        monitor.shutdown();
    }
}
