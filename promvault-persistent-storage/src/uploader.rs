use chrono::Utc;
use metrics::{counter, histogram};
use promvault_core::storage::{ObjectStore, PersistentStorageError};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::persistent_metrics::{
    CLOUD_UPLOAD_BYTES_TOTAL, CLOUD_UPLOAD_LATENCY_MS, CLOUD_UPLOAD_OBJECTS_TOTAL,
    SEGMENT_DELETE_FAILURES_TOTAL,
};
use crate::segment::{PendingSegment, SegmentState, SegmentStore, SEGMENT_FORMAT};

mod compress;
mod object_key;
mod retry;

pub use compress::{artifact_path, GzipCompressor, SegmentCompressor, GZIP_EXTENSION};
pub use object_key::{object_key, ObjectKeyBuilder};
pub use retry::{RetryError, RetryPolicy, RETRY_DELAY};

/// Stage of the cycle currently in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UploadStage {
    Idle = 0,
    Rotating = 1,
    Compressing = 2,
    Uploading = 3,
    Deleting = 4,
}

impl UploadStage {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => UploadStage::Rotating,
            2 => UploadStage::Compressing,
            3 => UploadStage::Uploading,
            4 => UploadStage::Deleting,
            _ => UploadStage::Idle,
        }
    }
}

impl Display for UploadStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStage::Idle => "idle",
            UploadStage::Rotating => "rotating",
            UploadStage::Compressing => "compressing",
            UploadStage::Uploading => "uploading",
            UploadStage::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// What one segment went through once it reached the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Rotated segment (or the compressed artifact when resuming one)
    pub segment: PathBuf,
    pub artifact: PathBuf,
    pub key: String,
    pub bytes: u64,
    /// 0 when the artifact was already compressed
    pub compress_attempts: u32,
    pub upload_attempts: u32,
    /// False when the local artifact could not be removed
    pub deleted: bool,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing was appended since the previous rotation.
    NothingBuffered,
    /// Another cycle holds the pipeline; this one was dropped.
    Busy,
    Uploaded(UploadReport),
    /// Stopped before the upload finished; the file stays on disk in its
    /// current state and is picked up by the next startup recovery.
    Interrupted {
        stage: UploadStage,
        path: PathBuf,
        reason: String,
    },
}

/// Longest rotation period the timer accepts.
pub const MAX_UPLOAD_INTERVAL: Duration = Duration::from_secs(30 * 24 * 3600);
const MIN_UPLOAD_INTERVAL: Duration = Duration::from_millis(1);

/// Uploader knobs fixed at startup.
///
/// Fields:
/// - `interval`: period of the rotation timer
/// - `key_prefix`: prepended verbatim to every object key (e.g. "metrics/")
/// - `recover_on_start`: ship segments left by a previous run before the first tick
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub interval: Duration,
    pub key_prefix: String,
    pub recover_on_start: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            key_prefix: String::new(),
            recover_on_start: true,
        }
    }
}

/// Timer-driven rotate → compress → upload → delete loop.
///
/// At most one cycle runs at a time: the timer skips ticks missed while a
/// cycle is in progress, and [`run_cycle`](Self::run_cycle) refuses to start
/// while another holds the pipeline. Compress and upload failures are retried
/// with a fixed delay until they succeed or the pipeline is cancelled.
#[derive(Debug)]
pub struct UploadPipeline {
    cfg: UploaderConfig,
    store: SegmentStore,
    object_store: Arc<dyn ObjectStore>,
    compressor: Arc<dyn SegmentCompressor>,
    retry: RetryPolicy,
    // Held for the whole cycle; owns the key clock
    cycle: Mutex<ObjectKeyBuilder>,
    stage: AtomicU8,
    cancel: CancellationToken,
}

impl UploadPipeline {
    pub fn new(cfg: UploaderConfig, store: SegmentStore, object_store: Arc<dyn ObjectStore>) -> Self {
        Self::with_compressor(cfg, store, object_store, Arc::new(GzipCompressor::default()))
    }

    pub fn with_compressor(
        cfg: UploaderConfig,
        store: SegmentStore,
        object_store: Arc<dyn ObjectStore>,
        compressor: Arc<dyn SegmentCompressor>,
    ) -> Self {
        let keys = ObjectKeyBuilder::new(
            cfg.key_prefix.clone(),
            SEGMENT_FORMAT,
            compressor.extension().to_string(),
        );
        Self {
            cfg,
            store,
            object_store,
            compressor,
            retry: RetryPolicy::default(),
            cycle: Mutex::new(keys),
            stage: AtomicU8::new(UploadStage::Idle as u8),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the background loop and cuts retry delays short.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stage(&self) -> UploadStage {
        UploadStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Spawn the background loop. The first tick fires one interval after start.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                target = "uploader",
                interval_secs = self.cfg.interval.as_secs(),
                key_prefix = %self.cfg.key_prefix,
                provider = self.object_store.provider(),
                buffer_dir = %self.store.dir().display(),
                "upload pipeline started"
            );

            if self.cfg.recover_on_start {
                match self.recover_pending().await {
                    Ok(0) => {}
                    Ok(n) => info!(target = "uploader", segments = n, "recovered pending segments"),
                    Err(e) => error!(target = "uploader", error = %e, "recovery of pending segments failed"),
                }
            }

            let period = self.cfg.interval.clamp(MIN_UPLOAD_INTERVAL, MAX_UPLOAD_INTERVAL);
            if period != self.cfg.interval {
                warn!(
                    target = "uploader",
                    requested_secs = self.cfg.interval.as_secs(),
                    period_ms = period.as_millis() as u64,
                    "upload interval out of range, clamped"
                );
            }
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!(target = "uploader", "upload pipeline stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_cycle().await {
                            Ok(outcome) => log_outcome(&outcome),
                            Err(e) => {
                                error!(target = "uploader", error = %e, "rotating a segment failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Run one full cycle now.
    ///
    /// `Err` is only returned for rotation I/O failures; the active segment
    /// is then still in place and the next cycle tries again.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, PersistentStorageError> {
        let Ok(mut keys) = self.cycle.try_lock() else {
            debug!(target = "uploader", stage = %self.stage(), "previous cycle still running, dropping tick");
            return Ok(CycleOutcome::Busy);
        };

        self.set_stage(UploadStage::Rotating);
        let rotated = match self.store.rotate().await {
            Ok(path) => path,
            Err(e) => {
                self.set_stage(UploadStage::Idle);
                if e.is_no_active_segment() {
                    info!(target = "uploader", "nothing buffered since the last cycle");
                    return Ok(CycleOutcome::NothingBuffered);
                }
                return Err(e);
            }
        };

        let outcome = self.ship(&mut keys, &rotated, SegmentState::Rotated).await;
        self.set_stage(UploadStage::Idle);
        Ok(outcome)
    }

    /// Ship every segment a previous run left in the buffer directory,
    /// oldest first. Returns how many were uploaded.
    pub async fn recover_pending(&self) -> Result<usize, PersistentStorageError> {
        let pending: Vec<PendingSegment> = self.store.pending().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(target = "uploader", segments = pending.len(), "resuming segments left by a previous run");

        let mut keys = self.cycle.lock().await;
        let mut shipped = 0;
        for segment in pending {
            let outcome = self.ship(&mut keys, &segment.path, segment.state).await;
            self.set_stage(UploadStage::Idle);
            match outcome {
                CycleOutcome::Uploaded(_) => shipped += 1,
                other => {
                    log_outcome(&other);
                    break;
                }
            }
        }
        Ok(shipped)
    }

    async fn ship(
        &self,
        keys: &mut ObjectKeyBuilder,
        segment: &Path,
        state: SegmentState,
    ) -> CycleOutcome {
        let cancel = &self.cancel;

        let (artifact, compress_attempts) = match state {
            SegmentState::Compressed => (segment.to_path_buf(), 0),
            SegmentState::Rotated => {
                self.set_stage(UploadStage::Compressing);
                let compressor = &self.compressor;
                match self
                    .retry
                    .run("compress", cancel, move || compressor.compress(segment))
                    .await
                {
                    Ok(done) => done,
                    Err(e) => return interrupted(UploadStage::Compressing, segment, e),
                }
            }
        };

        self.set_stage(UploadStage::Uploading);
        let provider = self.object_store.provider().to_string();
        let key = keys.next_key(Utc::now());
        info!(target = "uploader", file = %artifact.display(), key = %key, "uploading segment");
        let started = Instant::now();
        let store = &self.object_store;
        let (key_ref, artifact_ref) = (key.as_str(), artifact.as_path());
        let (bytes, upload_attempts) = match self
            .retry
            .run("upload", cancel, move || store.put_file(key_ref, artifact_ref))
            .await
        {
            Ok(done) => done,
            Err(e) => {
                counter!(CLOUD_UPLOAD_OBJECTS_TOTAL.name, "provider" => provider, "result" => "error")
                    .increment(1);
                return interrupted(UploadStage::Uploading, &artifact, e);
            }
        };
        histogram!(CLOUD_UPLOAD_LATENCY_MS.name, "provider" => provider.clone())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        counter!(CLOUD_UPLOAD_BYTES_TOTAL.name, "provider" => provider.clone()).increment(bytes);
        counter!(CLOUD_UPLOAD_OBJECTS_TOTAL.name, "provider" => provider, "result" => "ok")
            .increment(1);
        info!(target = "uploader", key = %key, bytes, attempts = upload_attempts, "uploading succeeded");

        self.set_stage(UploadStage::Deleting);
        let deleted = match tokio::fs::remove_file(&artifact).await {
            Ok(()) => true,
            Err(e) => {
                // The object is safe remotely; a leftover file only costs disk space
                warn!(target = "uploader", file = %artifact.display(), error = %e, "deleting uploaded artifact failed");
                counter!(SEGMENT_DELETE_FAILURES_TOTAL.name).increment(1);
                false
            }
        };

        CycleOutcome::Uploaded(UploadReport {
            segment: segment.to_path_buf(),
            artifact,
            key,
            bytes,
            compress_attempts,
            upload_attempts,
            deleted,
        })
    }

    fn set_stage(&self, stage: UploadStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }
}

fn interrupted(stage: UploadStage, path: &Path, err: RetryError) -> CycleOutcome {
    CycleOutcome::Interrupted {
        stage,
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::NothingBuffered | CycleOutcome::Busy => {}
        CycleOutcome::Uploaded(report) if !report.deleted => {
            warn!(target = "uploader", file = %report.artifact.display(), key = %report.key, "uploaded, local artifact left behind");
        }
        CycleOutcome::Uploaded(report) => {
            debug!(target = "uploader", key = %report.key, "cycle complete");
        }
        CycleOutcome::Interrupted {
            stage,
            path,
            reason,
        } => {
            warn!(
                target = "uploader",
                stage = %stage,
                file = %path.display(),
                reason = %reason,
                "cycle interrupted, segment kept for the next run"
            );
        }
    }
}
