use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::fetcher::BundleSource;
use crate::models::{Bundle, CacheStatus, DownloadProgress, TripCacheEntry, TripStatus};
use crate::oracle::VersionSource;
use crate::store::PersistentStore;

use super::CacheError;

/// Default overall limit for version check + bundle fetch.
/// Long enough for a large trip on a slow ship connection.
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Default limit for a staleness version check.
const DEFAULT_VERSION_TIMEOUT_SECS: u64 = 10;

/// Capacity of the cache event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Progress reported once the version is known
const PROGRESS_VERSION_DONE: u8 = 5;

/// Progress reported once every section is fetched; the commit takes it to 100
const PROGRESS_FETCH_DONE: u8 = 90;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub download_timeout: Duration,
    pub version_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            version_timeout: Duration::from_secs(DEFAULT_VERSION_TIMEOUT_SECS),
        }
    }
}

/// Change notifications for UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    StatusChanged { trip_id: i64, status: CacheStatus },
    Progress { trip_id: i64, percent: u8 },
    Removed { trip_id: i64 },
}

type DownloadFuture = Shared<BoxFuture<'static, Result<TripStatus, CacheError>>>;

struct InFlight {
    session: u64,
    percent: u8,
    result: DownloadFuture,
    abort: AbortHandle,
}

#[derive(Default)]
struct CacheState {
    /// Committed entries, mirrored from the store
    entries: HashMap<i64, TripCacheEntry>,
    in_flight: HashMap<i64, InFlight>,
    /// Latest session token per trip; a download may only commit while its
    /// token is still the latest
    generations: HashMap<i64, u64>,
    /// Result of the last successful version comparison
    staleness: HashMap<i64, bool>,
    /// Serializes store writes and deletes per trip key
    write_locks: HashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    /// Session driving the global progress value
    progress_owner: u64,
    next_session: u64,
}

impl CacheState {
    fn next_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn write_lock(&mut self, trip_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.write_locks.entry(trip_id).or_default())
    }

    fn is_current(&self, trip_id: i64, session: u64) -> bool {
        self.generations.get(&trip_id) == Some(&session)
    }

    /// Stable status, ignoring any in-flight download
    fn settled_status(&self, trip_id: i64) -> CacheStatus {
        if !self.entries.contains_key(&trip_id) {
            CacheStatus::Absent
        } else if self.staleness.get(&trip_id).copied().unwrap_or(false) {
            CacheStatus::Stale
        } else {
            CacheStatus::Ready
        }
    }
}

struct Inner {
    store: Arc<dyn PersistentStore>,
    fetcher: Arc<dyn BundleSource>,
    oracle: Arc<dyn VersionSource>,
    settings: CacheSettings,
    state: Mutex<CacheState>,
    progress: watch::Sender<DownloadProgress>,
    events: broadcast::Sender<CacheEvent>,
}

/// Owns the per-trip offline entries for one app session.
///
/// Clone is cheap; clones share the same state.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl CacheManager {
    /// Create a manager and rehydrate committed entries from `store`.
    pub async fn open(
        store: Arc<dyn PersistentStore>,
        fetcher: Arc<dyn BundleSource>,
        oracle: Arc<dyn VersionSource>,
        settings: CacheSettings,
    ) -> Result<Self, CacheError> {
        let committed = store
            .list()
            .await
            .map_err(|e| CacheError::StorageUnavailable(e.to_string()))?;

        let mut state = CacheState::default();
        for entry in committed {
            state.entries.insert(entry.trip_id, entry);
        }
        info!(trips = state.entries.len(), "Offline cache opened");

        let (progress, _) = watch::channel(DownloadProgress::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                oracle,
                settings,
                state: Mutex::new(state),
                progress,
                events,
            }),
        })
    }

    // ===== Downloads =====

    /// Make a trip available offline.
    ///
    /// Returns immediately when the trip is already downloaded and joins the
    /// running download when one is in flight. On failure the trip keeps
    /// whatever state it had before the call.
    pub async fn enable_offline_for_trip(
        &self,
        trip_id: i64,
        trip_slug: &str,
    ) -> Result<TripStatus, CacheError> {
        self.start_or_join(trip_id, trip_slug, false).await
    }

    /// Download a trip again even when a bundle is already committed.
    /// The existing bundle stays readable until the new one commits.
    pub async fn redownload_trip(&self, trip_id: i64, trip_slug: &str) -> Result<TripStatus, CacheError> {
        self.start_or_join(trip_id, trip_slug, true).await
    }

    async fn start_or_join(
        &self,
        trip_id: i64,
        trip_slug: &str,
        force: bool,
    ) -> Result<TripStatus, CacheError> {
        let download = {
            let mut state = self.inner.lock_state();

            let joined = state.in_flight.get(&trip_id).map(|flight| {
                debug!(trip_id, session = flight.session, "Joining in-flight download");
                flight.result.clone()
            });
            match joined {
                Some(result) => result,
                None => {
                    if let (false, Some(entry)) = (force, state.entries.get(&trip_id)) {
                        debug!(trip_id, "Trip already available offline");
                        return Ok(entry.status());
                    }
                    self.spawn_download(&mut state, trip_id, trip_slug)
                }
            }
        };

        download.await
    }

    fn spawn_download(&self, state: &mut CacheState, trip_id: i64, trip_slug: &str) -> DownloadFuture {
        let session = state.next_session();
        state.generations.insert(trip_id, session);
        state.progress_owner = session;
        let write_lock = state.write_lock(trip_id);

        info!(trip_id, slug = trip_slug, session, "Starting offline download");

        let inner = Arc::clone(&self.inner);
        let slug = trip_slug.to_string();
        let handle = tokio::spawn(async move {
            inner.run_download(trip_id, slug, session, write_lock).await
        });
        let abort = handle.abort_handle();

        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(CacheError::Cancelled { trip_id }),
                Err(e) => {
                    error!(trip_id, error = %e, "Download task failed");
                    Err(CacheError::Internal(e.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            trip_id,
            InFlight {
                session,
                percent: 0,
                result: result.clone(),
                abort,
            },
        );

        self.inner.progress.send_replace(DownloadProgress {
            trip_id: Some(trip_id),
            percent: 0,
            is_downloading: true,
        });
        self.inner.emit(CacheEvent::StatusChanged {
            trip_id,
            status: CacheStatus::Downloading,
        });
        self.inner.emit(CacheEvent::Progress { trip_id, percent: 0 });

        result
    }

    /// Remove a trip's offline bundle. Cancels an in-flight download for the
    /// trip; its result is discarded even if it completes later.
    ///
    /// If the store refuses the delete, the committed entry is restored and
    /// the trip stays available offline.
    pub async fn disable_offline_for_trip(&self, trip_id: i64) -> Result<(), CacheError> {
        let (session, write_lock, removed) = {
            let mut state = self.inner.lock_state();
            let session = state.next_session();
            state.generations.insert(trip_id, session);

            if let Some(flight) = state.in_flight.remove(&trip_id) {
                info!(trip_id, session = flight.session, "Cancelling in-flight download");
                flight.abort.abort();
                self.inner.release_progress(&mut state, flight.session, false);
            }

            let stale = state.staleness.remove(&trip_id);
            let removed = state.entries.remove(&trip_id).map(|entry| (entry, stale));
            (session, state.write_lock(trip_id), removed)
        };

        // Waits for a cancelled download to release the key before deleting
        let _guard = write_lock.lock().await;
        let superseded = {
            let state = self.inner.lock_state();
            !state.is_current(trip_id, session) && state.entries.contains_key(&trip_id)
        };
        if superseded {
            debug!(trip_id, "Trip re-downloaded before removal finished, keeping new bundle");
            return Ok(());
        }

        let deleted = self
            .inner
            .store
            .delete(&TripCacheEntry::store_key(trip_id))
            .await;

        let mut state = self.inner.lock_state();
        if let Err(e) = deleted {
            warn!(trip_id, error = %e, "Failed to remove offline bundle");
            if let (Some((entry, stale)), false) = (removed, state.entries.contains_key(&trip_id)) {
                state.entries.insert(trip_id, entry);
                if let Some(stale) = stale {
                    state.staleness.insert(trip_id, stale);
                }
            }
            let status = state.settled_status(trip_id);
            drop(state);
            self.inner.emit(CacheEvent::StatusChanged { trip_id, status });
            return Err(CacheError::from_store(trip_id, e));
        }

        // Nothing else touched the trip meanwhile; forget its bookkeeping
        if state.is_current(trip_id, session) && !state.in_flight.contains_key(&trip_id) {
            state.generations.remove(&trip_id);
            state.write_locks.remove(&trip_id);
        }
        drop(state);

        if removed.is_some() {
            info!(trip_id, "Offline bundle removed");
        }
        self.inner.emit(CacheEvent::Removed { trip_id });
        self.inner.emit(CacheEvent::StatusChanged {
            trip_id,
            status: CacheStatus::Absent,
        });
        Ok(())
    }

    /// Cancel every in-flight download. Called when the session ends.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock_state();
        let trips: Vec<i64> = state.in_flight.keys().copied().collect();
        for trip_id in trips {
            let session = state.next_session();
            state.generations.insert(trip_id, session);
            if let Some(flight) = state.in_flight.remove(&trip_id) {
                flight.abort.abort();
            }
        }
        self.inner.progress.send_modify(|p| p.is_downloading = false);
        debug!("Offline cache shut down");
    }

    // ===== Queries =====

    /// True iff a complete bundle is committed for the trip
    pub fn is_offline_enabled(&self, trip_id: i64) -> bool {
        self.inner.lock_state().entries.contains_key(&trip_id)
    }

    pub fn trip_status(&self, trip_id: i64) -> Option<TripStatus> {
        self.inner
            .lock_state()
            .entries
            .get(&trip_id)
            .map(TripCacheEntry::status)
    }

    pub fn entry(&self, trip_id: i64) -> Option<TripCacheEntry> {
        self.inner.lock_state().entries.get(&trip_id).cloned()
    }

    pub fn status(&self, trip_id: i64) -> CacheStatus {
        let state = self.inner.lock_state();
        if state.in_flight.contains_key(&trip_id) {
            CacheStatus::Downloading
        } else {
            state.settled_status(trip_id)
        }
    }

    /// Committed entries sorted by trip id
    pub fn cached_trips(&self) -> Vec<TripCacheEntry> {
        let mut trips: Vec<TripCacheEntry> =
            self.inner.lock_state().entries.values().cloned().collect();
        trips.sort_by_key(|e| e.trip_id);
        trips
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.inner
            .lock_state()
            .entries
            .values()
            .map(|e| e.size_bytes)
            .sum()
    }

    /// Whether the committed bundle differs from the server's current content.
    ///
    /// When the version cannot be fetched the last known answer is returned,
    /// so offline users keep seeing their downloaded content as-is.
    pub async fn is_cache_outdated(&self, trip_id: i64) -> bool {
        let Some(entry) = self.entry(trip_id) else {
            return false;
        };

        let lookup = tokio::time::timeout(
            self.inner.settings.version_timeout,
            self.inner.oracle.get_version(&entry.trip_slug),
        )
        .await;

        let latest = match lookup {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                warn!(trip_id, error = %e, "Version check failed, using last known staleness");
                return self.last_known_staleness(trip_id);
            }
            Err(_) => {
                warn!(trip_id, "Version check timed out, using last known staleness");
                return self.last_known_staleness(trip_id);
            }
        };

        let stale = latest != entry.content_version;
        let changed = {
            let mut state = self.inner.lock_state();
            // Only record the answer if the entry was not replaced meanwhile
            let same_entry = state
                .entries
                .get(&trip_id)
                .is_some_and(|e| e.content_version == entry.content_version);
            if same_entry {
                state.staleness.insert(trip_id, stale) != Some(stale)
            } else {
                false
            }
        };

        if changed {
            debug!(trip_id, stale, stored = %entry.content_version, latest = %latest, "Staleness changed");
            self.inner.emit(CacheEvent::StatusChanged {
                trip_id,
                status: if stale { CacheStatus::Stale } else { CacheStatus::Ready },
            });
        }
        stale
    }

    fn last_known_staleness(&self, trip_id: i64) -> bool {
        self.inner
            .lock_state()
            .staleness
            .get(&trip_id)
            .copied()
            .unwrap_or(false)
    }

    /// Read a trip's committed bundle for offline viewing.
    pub async fn load_bundle(&self, trip_id: i64) -> Result<Option<Bundle>, CacheError> {
        if !self.is_offline_enabled(trip_id) {
            return Ok(None);
        }

        let value = self
            .inner
            .store
            .get(&TripCacheEntry::store_key(trip_id))
            .await
            .map_err(|e| CacheError::from_store(trip_id, e))?;

        match value {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    trip_id,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    // ===== Progress and events =====

    /// Percent of the download session driving the global progress: the
    /// newest one still running, or the last to finish
    pub fn download_progress(&self) -> u8 {
        self.inner.progress.borrow().percent
    }

    /// True while any download is in flight
    pub fn is_downloading(&self) -> bool {
        self.inner.progress.borrow().is_downloading
    }

    /// Progress of the running download for one trip
    pub fn trip_progress(&self, trip_id: i64) -> Option<u8> {
        self.inner
            .lock_state()
            .in_flight
            .get(&trip_id)
            .map(|f| f.percent)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<DownloadProgress> {
        self.inner.progress.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        // State stays consistent across a panicking holder; keep serving it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Record progress for a session; values never move backwards.
    fn report_progress(&self, trip_id: i64, session: u64, percent: u8) {
        let mut state = self.lock_state();
        let owner = state.progress_owner;
        let Some(flight) = state.in_flight.get_mut(&trip_id) else {
            return;
        };
        if flight.session != session || percent <= flight.percent {
            return;
        }
        flight.percent = percent;

        if owner == session {
            self.progress.send_modify(|p| p.percent = percent);
        }
        self.emit(CacheEvent::Progress { trip_id, percent });
    }

    /// Hand global progress to the newest remaining download once `finished`
    /// has left the in-flight set. `is_downloading` is true iff any download
    /// is in flight.
    fn release_progress(&self, state: &mut CacheState, finished: u64, succeeded: bool) {
        if state.progress_owner != finished {
            return;
        }
        let next = state
            .in_flight
            .iter()
            .max_by_key(|(_, f)| f.session)
            .map(|(&trip_id, f)| (trip_id, f.session, f.percent));

        match next {
            Some((trip_id, session, percent)) => {
                state.progress_owner = session;
                self.progress.send_replace(DownloadProgress {
                    trip_id: Some(trip_id),
                    percent,
                    is_downloading: true,
                });
            }
            None => self.progress.send_modify(|p| {
                if succeeded {
                    p.percent = 100;
                }
                p.is_downloading = false;
            }),
        }
    }

    async fn run_download(
        self: Arc<Self>,
        trip_id: i64,
        slug: String,
        session: u64,
        write_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Result<TripStatus, CacheError> {
        let result = self.download_and_commit(trip_id, &slug, session, &write_lock).await;

        let settled = {
            let mut state = self.lock_state();
            if state.in_flight.get(&trip_id).map(|f| f.session) == Some(session) {
                state.in_flight.remove(&trip_id);
                self.release_progress(&mut state, session, result.is_ok());
            }
            state.settled_status(trip_id)
        };

        match &result {
            Ok(status) => {
                info!(trip_id, session, size_bytes = status.size_bytes, "Trip available offline");
                self.emit(CacheEvent::Progress { trip_id, percent: 100 });
                self.emit(CacheEvent::StatusChanged {
                    trip_id,
                    status: CacheStatus::Ready,
                });
            }
            Err(CacheError::Cancelled { .. }) => {
                debug!(trip_id, session, "Download superseded, result discarded");
            }
            Err(e) => {
                warn!(trip_id, session, error = %e, "Offline download failed");
                self.emit(CacheEvent::StatusChanged {
                    trip_id,
                    status: CacheStatus::Failed,
                });
                self.emit(CacheEvent::StatusChanged { trip_id, status: settled });
            }
        }

        result
    }

    async fn download_and_commit(
        &self,
        trip_id: i64,
        slug: &str,
        session: u64,
        write_lock: &tokio::sync::Mutex<()>,
    ) -> Result<TripStatus, CacheError> {
        let on_fetch_progress = |pct: u8| {
            let span = u32::from(PROGRESS_FETCH_DONE - PROGRESS_VERSION_DONE);
            let scaled = u32::from(PROGRESS_VERSION_DONE) + u32::from(pct.min(100)) * span / 100;
            self.report_progress(trip_id, session, scaled as u8);
        };

        let fetch = async {
            let version = self.oracle.get_version(slug).await.map_err(|e| {
                CacheError::BundleFetchFailed(format!("version check failed: {}", e))
            })?;
            self.report_progress(trip_id, session, PROGRESS_VERSION_DONE);

            let bundle = self
                .fetcher
                .fetch_bundle(slug, &on_fetch_progress)
                .await
                .map_err(|e| CacheError::BundleFetchFailed(e.to_string()))?;
            Ok::<_, CacheError>((version, bundle))
        };

        let timeout = self.settings.download_timeout;
        let (version, bundle) = tokio::time::timeout(timeout, fetch).await.map_err(|_| {
            CacheError::BundleFetchFailed(format!("timed out after {}s", timeout.as_secs()))
        })??;

        let value = serde_json::to_value(&bundle).map_err(|e| CacheError::Internal(e.to_string()))?;
        let entry = TripCacheEntry {
            trip_id,
            trip_slug: slug.to_string(),
            content_version: version,
            downloaded_at: Utc::now(),
            size_bytes: self.store.estimate_size(&value),
        };

        let _guard = write_lock.lock().await;
        let current = self.lock_state().is_current(trip_id, session);
        if !current {
            return Err(CacheError::Cancelled { trip_id });
        }

        self.store
            .put(&TripCacheEntry::store_key(trip_id), &value, &entry)
            .await
            .map_err(|e| CacheError::from_store(trip_id, e))?;

        let mut state = self.lock_state();
        if !state.is_current(trip_id, session) {
            // The trip was removed during the write; the remover deletes the
            // payload once it acquires the write lock
            return Err(CacheError::Cancelled { trip_id });
        }
        let status = entry.status();
        state.entries.insert(trip_id, entry);
        state.staleness.insert(trip_id, false);
        Ok(status)
    }
}

// ============================================================================
// Tests
// ============================================================================
