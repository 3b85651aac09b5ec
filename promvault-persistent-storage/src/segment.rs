use metrics::counter;
use promvault_core::storage::PersistentStorageError;
use promvault_core::Sample;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::persistent_metrics::{
    SEGMENT_APPEND_BYTES_TOTAL, SEGMENT_APPEND_TOTAL, SEGMENT_ROTATE_TOTAL,
};

mod reader;
mod record;
mod writer;

pub use reader::read_segment;
use writer::SegmentWriter;

/// File name of the active segment inside the buffer directory.
pub const ACTIVE_SEGMENT_FILE: &str = "current.jsonl";
/// Record format extension, also used in remote object keys.
pub const SEGMENT_FORMAT: &str = "jsonl";
/// Marker between the rotation token and the format extension.
pub const ROTATED_MARKER: &str = "done";

/// Lifecycle state of a segment that is no longer active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// `<token>.done.jsonl`, waiting for compression.
    Rotated,
    /// `<token>.done.jsonl.<ext>`, waiting for upload.
    Compressed,
}

/// A rotated or compressed segment found in the buffer directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSegment {
    pub token: u64,
    pub path: PathBuf,
    pub state: SegmentState,
}

/// The buffer directory: one active append-only segment plus rotated ones.
///
/// Cheap to clone; all clones share the same writer. Ingestion calls
/// [`append`](Self::append) / [`append_batch`](Self::append_batch) from many
/// tasks, the upload pipeline calls [`rotate`](Self::rotate) from one.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    inner: Arc<SegmentStoreInner>,
}

#[derive(Debug)]
struct SegmentStoreInner {
    dir: PathBuf,
    active_path: PathBuf,
    state: Mutex<WriterState>,
}

#[derive(Debug)]
struct WriterState {
    writer: SegmentWriter,
    // Last rotation token handed out; tokens are strictly increasing
    last_token: u64,
}

impl SegmentStore {
    /// Open the store rooted at `dir`. Nothing is created on disk until the
    /// first append.
    ///
    /// A non-empty `current.jsonl` left by a previous process is adopted as
    /// the active segment so it is rotated and shipped with the next cycle.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistentStorageError> {
        let dir = dir.into();
        let active_path = dir.join(ACTIVE_SEGMENT_FILE);

        let adopted = match tokio::fs::metadata(&active_path).await {
            Ok(meta) => meta.len() > 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(PersistentStorageError::Io(format!(
                    "stat active segment failed: {}",
                    e
                )))
            }
        };
        let last_token = scan_pending(&dir)
            .await?
            .last()
            .map(|p| p.token)
            .unwrap_or(0);

        if adopted {
            info!(
                target = "segment",
                file = %active_path.display(),
                "adopting active segment left by a previous run"
            );
        }
        debug!(target = "segment", dir = %dir.display(), last_token, "segment store opened");

        Ok(SegmentStore {
            inner: Arc::new(SegmentStoreInner {
                state: Mutex::new(WriterState {
                    writer: SegmentWriter::new(dir.clone(), active_path.clone(), adopted),
                    last_token,
                }),
                dir,
                active_path,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn active_path(&self) -> &Path {
        &self.inner.active_path
    }

    /// Append one sample as one record to the active segment.
    pub async fn append(&self, sample: &Sample) -> Result<(), PersistentStorageError> {
        self.append_batch(std::slice::from_ref(sample)).await.map(|_| ())
    }

    /// Append samples in order with a single write. Serialization happens
    /// before the writer lock is taken.
    pub async fn append_batch(&self, samples: &[Sample]) -> Result<usize, PersistentStorageError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let mut buf = Vec::with_capacity(samples.len() * 160);
        for sample in samples {
            record::encode_line(sample, &mut buf)?;
        }

        {
            let mut state = self.inner.state.lock().await;
            state.writer.write_lines(&buf, samples.len() as u64).await?;
        }

        counter!(SEGMENT_APPEND_TOTAL.name).increment(samples.len() as u64);
        counter!(SEGMENT_APPEND_BYTES_TOTAL.name).increment(buf.len() as u64);
        Ok(samples.len())
    }

    /// Close the active segment and rename it to `<token>.done.jsonl`.
    ///
    /// Excludes appends for its whole duration: every record appended before
    /// this call is in the returned file, none appended after it is.
    /// Fails with `NoActiveSegment`, touching nothing, when nothing was
    /// appended since the last rotation.
    pub async fn rotate(&self) -> Result<PathBuf, PersistentStorageError> {
        let mut state = self.inner.state.lock().await;
        if !state.writer.has_pending() {
            return Err(PersistentStorageError::NoActiveSegment);
        }

        let stats = state.writer.stats();
        state.writer.close().await?;

        let token = next_token(state.last_token);
        let rotated = self.inner.dir.join(rotated_file_name(token));
        tokio::fs::rename(&self.inner.active_path, &rotated)
            .await
            .map_err(|e| {
                PersistentStorageError::Io(format!(
                    "rename {} -> {} failed: {}",
                    self.inner.active_path.display(),
                    rotated.display(),
                    e
                ))
            })?;
        state.last_token = token;
        state.writer.reset();
        drop(state);

        counter!(SEGMENT_ROTATE_TOTAL.name).increment(1);
        info!(
            target = "segment",
            file = %rotated.display(),
            records = stats.records,
            bytes = stats.bytes,
            age_secs = stats.opened_at.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            "rotated active segment"
        );
        Ok(rotated)
    }

    /// Rotated and compressed segments in the buffer directory, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingSegment>, PersistentStorageError> {
        scan_pending(&self.inner.dir).await
    }
}

/// `<token>.done.jsonl`
pub fn rotated_file_name(token: u64) -> String {
    format!("{}.{}.{}", token, ROTATED_MARKER, SEGMENT_FORMAT)
}

fn next_token(last: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    now.max(last + 1)
}

/// Parse a file name produced by rotation or compression.
fn parse_segment_name(name: &str) -> Option<(u64, SegmentState)> {
    let (token, rest) = name.split_once('.')?;
    let token: u64 = token.parse().ok()?;
    let rotated_suffix = format!("{}.{}", ROTATED_MARKER, SEGMENT_FORMAT);
    if rest == rotated_suffix {
        return Some((token, SegmentState::Rotated));
    }
    let ext = rest.strip_prefix(rotated_suffix.as_str())?.strip_prefix('.')?;
    // `.tmp` leftovers are half-written compression output, never pending
    if ext.is_empty() || ext.contains('.') {
        return None;
    }
    Some((token, SegmentState::Compressed))
}

async fn scan_pending(dir: &Path) -> Result<Vec<PendingSegment>, PersistentStorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PersistentStorageError::Io(format!(
                "read buffer dir {} failed: {}",
                dir.display(),
                e
            )))
        }
    };

    let mut found: Vec<PendingSegment> = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                return Err(PersistentStorageError::Io(format!(
                    "read buffer dir entry failed: {}",
                    e
                )))
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_segment_name(name) {
            Some((token, state)) => found.push(PendingSegment {
                token,
                path: entry.path(),
                state,
            }),
            None if name != ACTIVE_SEGMENT_FILE => {
                debug!(target = "segment", file = name, "ignoring unrelated file in buffer dir");
            }
            None => {}
        }
    }

    // A rotated file and its compressed twin can coexist after a crash
    // between the compressed rename and the source removal. Keep the rotated
    // entry: compression sees the finished artifact and only drops the source.
    found.sort_by_key(|p| (p.token, p.state == SegmentState::Compressed));
    found.dedup_by(|later, earlier| {
        let dup = later.token == earlier.token;
        if dup {
            warn!(
                target = "segment",
                file = %later.path.display(),
                "found both rotated and compressed copies of a segment"
            );
        }
        dup
    });
    Ok(found)
}
