//! Periodic location sampling.
//!
//! A [`LocationSampler`] session runs two tasks per record: a ticker that
//! polls the [`PositionSource`] on a fixed cadence, and a writer that drains
//! an ordered channel into the record store. The split keeps a slow store
//! write from delaying the next sampling tick while preserving strict
//! append order within the stream.
//!
//! Failure policy: a single failed fix is logged and skipped. A permanent
//! denial is surfaced once through a `watch` channel, but the timer keeps
//! running; stopping is the controller's call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PositionError;
use crate::model::{LocationSample, RecordHandle};
use crate::store::RecordStore;

/// A device-level position source. May fail or be denied; never assumed to
/// succeed.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self) -> Result<GeoPosition, PositionError>;
}

/// One raw fix from the platform, before it is stamped into a sample.
#[derive(Debug, Clone)]
pub struct GeoPosition {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub address: Option<String>,
}

impl GeoPosition {
    fn into_sample(self) -> LocationSample {
        LocationSample {
            lat: self.lat,
            lng: self.lng,
            accuracy_m: self.accuracy_m,
            address: self.address,
            captured_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Sampling cadences and the alert thinning factor.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Steady cadence while a session is active.
    pub interval: Duration,
    /// Faster cadence used right after activation for a quick first fix.
    pub fast_fix_interval: Duration,
    /// How many samples are taken at the fast cadence before settling.
    pub fast_fix_count: u32,
    /// Fire the location-update hook every Nth appended sample (0 disables).
    pub alert_every: u32,
    /// Budget for the best-effort single-shot fix at activation.
    pub single_shot_timeout: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval: Duration::from_secs(30),
            fast_fix_interval: Duration::from_secs(2),
            fast_fix_count: 3,
            alert_every: 4,
            single_shot_timeout: Duration::from_secs(2),
        }
    }
}

/// Called by the writer task every Nth appended sample, so contacts get a
/// thinned location feed instead of the raw sampling stream.
pub type LocationUpdateHook = Arc<dyn Fn(RecordHandle) + Send + Sync>;

struct SamplerSession {
    shutdown: watch::Sender<bool>,
    ticker: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct LocationSampler {
    source: Arc<dyn PositionSource>,
    store: Arc<RecordStore>,
    config: SamplerConfig,
    sessions: tokio::sync::Mutex<HashMap<Uuid, SamplerSession>>,
    latest: Arc<Mutex<HashMap<Uuid, LocationSample>>>,
    fatal_tx: watch::Sender<Option<String>>,
}

impl LocationSampler {
    pub fn new(
        source: Arc<dyn PositionSource>,
        store: Arc<RecordStore>,
        config: SamplerConfig,
    ) -> Self {
        let (fatal_tx, _) = watch::channel(None);
        LocationSampler {
            source,
            store,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            latest: Arc::new(Mutex::new(HashMap::new())),
            fatal_tx,
        }
    }

    /// Observe permanent source failures (permission denied). Set at most
    /// once per process; the sampler keeps its timers either way.
    pub fn fatal_errors(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    /// Best-effort immediate fix, bounded by the configured timeout. Never
    /// blocks activation on a slow or failing source.
    pub async fn single_shot(&self) -> Option<LocationSample> {
        match tokio::time::timeout(
            self.config.single_shot_timeout,
            self.source.current_position(),
        )
        .await
        {
            Ok(Ok(position)) => Some(position.into_sample()),
            Ok(Err(e)) => {
                debug!(error = %e, "Single-shot position fix failed");
                None
            }
            Err(_) => {
                debug!("Single-shot position fix timed out");
                None
            }
        }
    }

    /// Begin periodic sampling for a record. Idempotent per record.
    pub async fn start(&self, handle: RecordHandle, hook: Option<LocationUpdateHook>) {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&handle.id()) {
            return;
        }

        let record_id = handle.id();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (sample_tx, mut sample_rx) = mpsc::channel::<LocationSample>(64);

        let source = Arc::clone(&self.source);
        let latest = Arc::clone(&self.latest);
        let fatal_tx = self.fatal_tx.clone();
        let config = self.config.clone();

        let ticker = tokio::spawn(async move {
            let mut taken: u32 = 0;
            let mut denial_reported = false;
            loop {
                let wait = if taken < config.fast_fix_count {
                    config.fast_fix_interval
                } else {
                    config.interval
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => break,
                }
                // Ticks, not successes: a failing source still settles to
                // the steady cadence instead of being hammered at the fast
                // one.
                taken = taken.saturating_add(1);

                match source.current_position().await {
                    Ok(position) => {
                        let sample = position.into_sample();
                        latest
                            .lock()
                            .unwrap()
                            .insert(record_id, sample.clone());
                        if sample_tx.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Err(PositionError::Denied) => {
                        if !denial_reported {
                            denial_reported = true;
                            warn!(record_id = %record_id, "Position source denied; timer kept alive");
                            let _ = fatal_tx.send(Some("position source permission denied".into()));
                        }
                    }
                    Err(PositionError::Unavailable(reason)) => {
                        debug!(record_id = %record_id, %reason, "Position sample skipped");
                    }
                }
            }
        });

        let store = Arc::clone(&self.store);
        let alert_every = self.config.alert_every;
        let writer = tokio::spawn(async move {
            let mut appended: u64 = 0;
            while let Some(sample) = sample_rx.recv().await {
                match store.append_location(&handle, sample).await {
                    Ok(()) => {
                        appended += 1;
                        if alert_every > 0 && appended % u64::from(alert_every) == 0 {
                            if let Some(hook) = &hook {
                                hook(handle.clone());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(record_id = %handle.id(), error = %e, "Failed to append location sample");
                    }
                }
            }
        });

        sessions.insert(
            record_id,
            SamplerSession {
                shutdown: shutdown_tx,
                ticker,
                writer,
            },
        );
    }

    /// Stop sampling for a record, draining any in-flight write. Safe to call
    /// without a matching `start`.
    pub async fn stop(&self, record_id: Uuid) {
        let session = self.sessions.lock().await.remove(&record_id);
        let Some(session) = session else {
            return;
        };

        let _ = session.shutdown.send(true);
        let _ = session.ticker.await;
        // The ticker dropping its sender lets the writer drain and exit.
        let _ = session.writer.await;
        self.latest.lock().unwrap().remove(&record_id);
    }

    /// Latest fix for an active session. Does not touch the store or network.
    pub fn latest(&self, record_id: Uuid) -> Option<LocationSample> {
        self.latest.lock().unwrap().get(&record_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::model::EmergencyKind;

    struct SteppingSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl PositionSource for SteppingSource {
        async fn current_position(&self) -> Result<GeoPosition, PositionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as f64;
            Ok(GeoPosition {
                lat: 10.0 + n * 0.001,
                lng: 20.0,
                accuracy_m: Some(5.0),
                address: None,
            })
        }
    }

    struct DeniedSource;

    #[async_trait]
    impl PositionSource for DeniedSource {
        async fn current_position(&self) -> Result<GeoPosition, PositionError> {
            Err(PositionError::Denied)
        }
    }

    struct FailingSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl PositionSource for FailingSource {
        async fn current_position(&self) -> Result<GeoPosition, PositionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PositionError::Unavailable("no fix".into()))
        }
    }

    fn fast_config() -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(10),
            fast_fix_interval: Duration::from_millis(5),
            fast_fix_count: 2,
            alert_every: 0,
            single_shot_timeout: Duration::from_millis(100),
        }
    }

    async fn store_with_record() -> (Arc<RecordStore>, RecordHandle) {
        let store = Arc::new(RecordStore::open("sqlite::memory:").await.unwrap());
        let handle = store
            .create("traveler-1", EmergencyKind::Panic, None, &[])
            .await
            .unwrap();
        (store, handle)
    }

    #[tokio::test]
    async fn test_samples_append_in_order() {
        let (store, handle) = store_with_record().await;
        let sampler = LocationSampler::new(
            Arc::new(SteppingSource { calls: AtomicU64::new(0) }),
            Arc::clone(&store),
            fast_config(),
        );

        sampler.start(handle.clone(), None).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        sampler.stop(handle.id()).await;

        let record = store.get(handle.id()).await.unwrap();
        assert!(record.location_history.len() >= 3);
        let stamps: Vec<i64> = record
            .location_history
            .iter()
            .map(|s| s.captured_at_ms)
            .collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted, "timestamps must be non-decreasing");
        assert_eq!(record.location.unwrap().captured_at_ms, *stamps.last().unwrap());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_safe() {
        let (store, handle) = store_with_record().await;
        let sampler = LocationSampler::new(
            Arc::new(SteppingSource { calls: AtomicU64::new(0) }),
            store,
            fast_config(),
        );

        sampler.stop(handle.id()).await;
    }

    #[tokio::test]
    async fn test_no_appends_after_stop() {
        let (store, handle) = store_with_record().await;
        let sampler = LocationSampler::new(
            Arc::new(SteppingSource { calls: AtomicU64::new(0) }),
            Arc::clone(&store),
            fast_config(),
        );

        sampler.start(handle.clone(), None).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        sampler.stop(handle.id()).await;

        let before = store.get(handle.id()).await.unwrap().location_history.len();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let after = store.get(handle.id()).await.unwrap().location_history.len();
        assert_eq!(before, after);
        assert!(sampler.latest(handle.id()).is_none());
    }

    #[tokio::test]
    async fn test_denied_source_reports_once_and_keeps_timer() {
        let (store, handle) = store_with_record().await;
        let sampler = LocationSampler::new(Arc::new(DeniedSource), Arc::clone(&store), fast_config());
        let mut fatal = sampler.fatal_errors();

        sampler.start(handle.clone(), None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fatal.has_changed().unwrap());
        assert!(fatal.borrow_and_update().is_some());

        // The session is still there: the controller decides about teardown.
        sampler.stop(handle.id()).await;
        let record = store.get(handle.id()).await.unwrap();
        assert!(record.location_history.is_empty());
    }

    #[tokio::test]
    async fn test_failing_source_settles_to_steady_cadence() {
        let (store, handle) = store_with_record().await;
        let source = Arc::new(FailingSource {
            calls: AtomicU64::new(0),
        });
        let sampler = LocationSampler::new(
            Arc::clone(&source) as _,
            store,
            SamplerConfig {
                interval: Duration::from_millis(60),
                fast_fix_interval: Duration::from_millis(5),
                fast_fix_count: 2,
                alert_every: 0,
                single_shot_timeout: Duration::from_millis(100),
            },
        );

        sampler.start(handle.clone(), None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        sampler.stop(handle.id()).await;

        // Two fast attempts, then the steady interval takes over even though
        // no fix ever succeeded.
        let calls = source.calls.load(Ordering::SeqCst);
        assert!(calls <= 4, "source polled {calls} times in 100ms");
        assert!(calls >= 2);
    }

    #[tokio::test]
    async fn test_single_shot_best_effort() {
        let (store, _) = store_with_record().await;
        let sampler = LocationSampler::new(
            Arc::new(SteppingSource { calls: AtomicU64::new(0) }),
            store,
            fast_config(),
        );

        let fix = sampler.single_shot().await;
        assert!(fix.is_some());
    }

    #[tokio::test]
    async fn test_update_hook_fires_every_nth() {
        let (store, handle) = store_with_record().await;
        let mut config = fast_config();
        config.alert_every = 2;
        let sampler = LocationSampler::new(
            Arc::new(SteppingSource { calls: AtomicU64::new(0) }),
            Arc::clone(&store),
            config,
        );

        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        let hook: LocationUpdateHook = Arc::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        sampler.start(handle.clone(), Some(hook)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        sampler.stop(handle.id()).await;

        let appended = store.get(handle.id()).await.unwrap().location_history.len() as u64;
        assert_eq!(fired.load(Ordering::SeqCst), appended / 2);
    }
}
