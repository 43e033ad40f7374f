//! Periodic still capture and continuous A/V recording.
//!
//! One [`MediaCaptureScheduler`] session per record: up to two still cameras
//! (rear mandatory, front best-effort) and one combined audio+video recorder.
//! A tick loop fires on a fixed interval up to a per-source cap; each tick
//! captures from every available camera concurrently and feeds the results
//! into one ordered sink in deterministic rear-then-front order. Store writes
//! happen on the sink's writer task, so a slow append never delays the next
//! tick; overlapping ticks are acceptable and never coalesced.
//!
//! Sources are owned by the session and released on every exit path: `stop`
//! drains in-flight tick tasks before the camera handles (and the recorder,
//! once finalized) are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CaptureError;
use crate::model::{MediaAsset, MediaKind, RecordHandle, SourceStream};
use crate::store::RecordStore;

/// One captured still image.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// The finalized continuous recording.
#[derive(Debug, Clone)]
pub struct CapturedClip {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// An acquired still-image camera. Dropping the handle releases the device.
#[async_trait]
pub trait StillCamera: Send + Sync {
    fn facing(&self) -> SourceStream;
    async fn capture_still(&self) -> Result<CapturedFrame, CaptureError>;
}

/// An acquired audio+video recorder, already recording. Dropping without
/// `finalize` discards the recording and releases the device.
#[async_trait]
pub trait AvRecorder: Send + Sync {
    async fn finalize(self: Box<Self>) -> Result<CapturedClip, CaptureError>;
}

/// Platform seam for acquiring capture devices. Acquisition errors are
/// catchable and non-fatal to the rest of the pipeline.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn acquire_still(&self, facing: SourceStream)
    -> Result<Box<dyn StillCamera>, CaptureError>;
    async fn acquire_recorder(&self) -> Result<Box<dyn AvRecorder>, CaptureError>;
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Interval between still-capture ticks.
    pub still_interval: Duration,
    /// Cap on stills per source per record.
    pub stills_per_source: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            still_interval: Duration::from_secs(5),
            stills_per_source: 5,
        }
    }
}

struct CaptureSession {
    shutdown: watch::Sender<bool>,
    ticker: JoinHandle<()>,
    writer: JoinHandle<()>,
    recorder: Option<Box<dyn AvRecorder>>,
}

pub struct MediaCaptureScheduler {
    provider: Arc<dyn CaptureProvider>,
    store: Arc<RecordStore>,
    config: CaptureConfig,
    sessions: tokio::sync::Mutex<HashMap<Uuid, CaptureSession>>,
}

impl MediaCaptureScheduler {
    pub fn new(
        provider: Arc<dyn CaptureProvider>,
        store: Arc<RecordStore>,
        config: CaptureConfig,
    ) -> Self {
        MediaCaptureScheduler {
            provider,
            store,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Acquire sources and begin the capture session for a record.
    ///
    /// Rear camera acquisition is mandatory and its failure is returned (the
    /// controller treats it as a degraded session, not a fatal one). Front
    /// camera and recorder failures degrade silently. A second `start` on a
    /// record with a live session is a no-op, since UI retries are expected.
    pub async fn start(&self, handle: RecordHandle) -> Result<(), CaptureError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&handle.id()) {
            debug!(record_id = %handle.id(), "Capture session already running; start ignored");
            return Ok(());
        }

        let record_id = handle.id();
        let rear: Arc<dyn StillCamera> =
            Arc::from(self.provider.acquire_still(SourceStream::Rear).await?);
        let front: Option<Arc<dyn StillCamera>> =
            match self.provider.acquire_still(SourceStream::Front).await {
                Ok(camera) => Some(Arc::from(camera)),
                Err(e) => {
                    debug!(record_id = %record_id, error = %e, "Front camera unavailable; continuing rear-only");
                    None
                }
            };
        let recorder = match self.provider.acquire_recorder().await {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "A/V recorder unavailable; stills only");
                None
            }
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (frame_tx, mut frame_rx) = mpsc::channel::<(MediaAsset, Vec<u8>)>(32);

        let config = self.config.clone();
        let ticker = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            let mut ticks = 0u32;
            while ticks < config.stills_per_source {
                tokio::select! {
                    _ = tokio::time::sleep(config.still_interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
                ticks += 1;

                let rear = Arc::clone(&rear);
                let front = front.clone();
                let tx = frame_tx.clone();
                in_flight.spawn(async move {
                    capture_tick(record_id, rear, front, tx).await;
                });
            }
            // Drain in-flight ticks so no still lands after stop returns.
            while in_flight.join_next().await.is_some() {}
        });

        let store = Arc::clone(&self.store);
        let writer_handle = handle.clone();
        let writer = tokio::spawn(async move {
            while let Some((asset, payload)) = frame_rx.recv().await {
                if let Err(e) = store.append_media(&writer_handle, asset, payload).await {
                    warn!(record_id = %writer_handle.id(), error = %e, "Failed to append media asset");
                }
            }
        });

        sessions.insert(
            record_id,
            CaptureSession {
                shutdown: shutdown_tx,
                ticker,
                writer,
                recorder,
            },
        );
        info!(record_id = %record_id, "Capture session started");
        Ok(())
    }

    /// Stop the session: halt the still timer, drain in-flight captures,
    /// finalize the recording into one combined asset, release all sources.
    /// Safe to call without a matching `start`.
    pub async fn stop(&self, handle: &RecordHandle) {
        let session = self.sessions.lock().await.remove(&handle.id());
        let Some(session) = session else {
            return;
        };

        let _ = session.shutdown.send(true);
        let _ = session.ticker.await;
        // Ticker exit drops the last sender; the writer drains and ends.
        let _ = session.writer.await;

        if let Some(recorder) = session.recorder {
            match recorder.finalize().await {
                Ok(clip) => {
                    let asset = MediaAsset::for_capture(
                        MediaKind::Video,
                        SourceStream::Combined,
                        clip.mime_type.clone(),
                        clip.bytes.len(),
                        Utc::now().timestamp_millis(),
                    );
                    if let Err(e) = self.store.append_media(handle, asset, clip.bytes).await {
                        warn!(record_id = %handle.id(), error = %e, "Failed to append finalized recording");
                    }
                }
                Err(e) => {
                    warn!(record_id = %handle.id(), error = %e, "Recorder finalize failed");
                }
            }
        }
        // Camera handles held by the ticker task are gone by now; the
        // devices are released.
        info!(record_id = %handle.id(), "Capture session stopped");
    }
}

/// Capture one tick from every available camera concurrently, then emit the
/// results in deterministic rear-then-front order. A failure on one source
/// never cancels the other's capture in the same tick.
async fn capture_tick(
    record_id: Uuid,
    rear: Arc<dyn StillCamera>,
    front: Option<Arc<dyn StillCamera>>,
    tx: mpsc::Sender<(MediaAsset, Vec<u8>)>,
) {
    let (rear_result, front_result) = tokio::join!(rear.capture_still(), async {
        match &front {
            Some(camera) => Some(camera.capture_still().await),
            None => None,
        }
    });

    let mut outcomes = vec![(rear.facing(), rear_result)];
    if let (Some(camera), Some(result)) = (&front, front_result) {
        outcomes.push((camera.facing(), result));
    }

    for (source, result) in outcomes {
        match result {
            Ok(frame) => {
                let asset = MediaAsset::for_capture(
                    MediaKind::Photo,
                    source,
                    frame.mime_type.clone(),
                    frame.bytes.len(),
                    Utc::now().timestamp_millis(),
                );
                if tx.send((asset, frame.bytes)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(record_id = %record_id, source = source.as_str(), error = %e, "Still capture failed");
            }
        }
    }
}
