use promvault_core::storage::PersistentStorageError;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tracing::{debug, info, warn};

const TAIL_SCAN_CHUNK: u64 = 64 * 1024;

/// Owner of the active segment file handle.
///
/// Lives behind the store mutex: appends and rotation both take `&mut self`,
/// so a line is always written completely before anything else touches the
/// handle.
///
/// `pending` tracks whether the active file holds records that have not been
/// rotated yet. It is independent of the handle: after a failed rotation the
/// handle is closed but the data is still pending, and a segment adopted at
/// startup is pending before any handle is opened.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    dir: PathBuf,
    path: PathBuf,
    handle: Option<BufWriter<File>>,
    pending: bool,
    stats: SegmentStats,
}

/// Counters for the segment currently being written.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SegmentStats {
    pub records: u64,
    pub bytes: u64,
    pub opened_at: Option<Instant>,
}

impl SegmentWriter {
    pub(crate) fn new(dir: PathBuf, path: PathBuf, adopted: bool) -> Self {
        SegmentWriter {
            dir,
            path,
            handle: None,
            pending: adopted,
            stats: SegmentStats::default(),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn stats(&self) -> SegmentStats {
        self.stats
    }

    /// Write complete record lines to the active file, creating the buffer
    /// directory and the file when needed.
    pub(crate) async fn write_lines(
        &mut self,
        bytes: &[u8],
        records: u64,
    ) -> Result<(), PersistentStorageError> {
        if self.handle.is_none() {
            self.handle = Some(self.open_handle().await?);
            self.stats.opened_at.get_or_insert_with(Instant::now);
        }
        let Some(writer) = self.handle.as_mut() else {
            return Err(PersistentStorageError::Other(
                "segment handle missing after open".to_string(),
            ));
        };

        let res = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = res {
            // A short write may have left a torn line; drop the handle so the
            // next open trims it before appending.
            self.handle = None;
            self.pending = true;
            return Err(PersistentStorageError::Io(format!(
                "segment write failed: {}",
                e
            )));
        }

        self.pending = true;
        self.stats.records += records;
        self.stats.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Flush, fsync and drop the handle. Safe to call when no handle is open.
    ///
    /// Pending data without an open handle (an adopted file, or a handle
    /// dropped after a failed write) may end in a torn line; it is trimmed
    /// here so the file being rotated only holds complete records.
    pub(crate) async fn close(&mut self) -> Result<(), PersistentStorageError> {
        if self.handle.is_none() && self.pending {
            return self.repair_unopened().await;
        }
        if let Some(mut writer) = self.handle.take() {
            writer
                .flush()
                .await
                .map_err(|e| PersistentStorageError::Io(format!("segment flush failed: {}", e)))?;
            writer
                .get_ref()
                .sync_all()
                .await
                .map_err(|e| PersistentStorageError::Io(format!("segment fsync failed: {}", e)))?;
            debug!(target = "segment", file = %self.path.display(), "closed active segment");
        }
        Ok(())
    }

    /// Forget the rotated segment; the next write starts a new file.
    pub(crate) fn reset(&mut self) {
        self.handle = None;
        self.pending = false;
        self.stats = SegmentStats::default();
    }

    async fn open_handle(&self) -> Result<BufWriter<File>, PersistentStorageError> {
        ensure_dir(&self.dir).await?;

        let mut opts = OpenOptions::new();
        opts.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(&self.path).await.map_err(|e| {
            PersistentStorageError::Io(format!(
                "open segment {} failed: {}",
                self.path.display(),
                e
            ))
        })?;

        let (len, _) = self.trim_torn_tail(&mut file).await?;
        file.seek(SeekFrom::End(0))
            .await
            .map_err(|e| PersistentStorageError::Io(format!("seek segment failed: {}", e)))?;

        info!(target = "segment", file = %self.path.display(), existing_bytes = len, "opened active segment");
        Ok(BufWriter::new(file))
    }

    /// Trim the active file in place without opening it for appends. A
    /// missing file is left to the caller's rename to report.
    async fn repair_unopened(&self) -> Result<(), PersistentStorageError> {
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(PersistentStorageError::Io(format!(
                    "open segment {} failed: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let (_, torn) = self.trim_torn_tail(&mut file).await?;
        if torn > 0 {
            file.sync_all()
                .await
                .map_err(|e| PersistentStorageError::Io(format!("segment fsync failed: {}", e)))?;
        }
        Ok(())
    }

    /// Cut an unterminated trailing record off `file`. Returns the original
    /// length and the number of bytes dropped.
    async fn trim_torn_tail(&self, file: &mut File) -> Result<(u64, u64), PersistentStorageError> {
        let len = file
            .metadata()
            .await
            .map_err(|e| PersistentStorageError::Io(format!("stat segment failed: {}", e)))?
            .len();
        if len == 0 {
            return Ok((0, 0));
        }
        let torn = torn_tail_len(file, len)
            .await
            .map_err(|e| PersistentStorageError::Io(format!("scan segment tail failed: {}", e)))?;
        if torn > 0 {
            warn!(
                target = "segment",
                file = %self.path.display(),
                dropped_bytes = torn,
                "trimming partially written record"
            );
            file.set_len(len - torn)
                .await
                .map_err(|e| PersistentStorageError::Io(format!("trim segment failed: {}", e)))?;
        }
        Ok((len, torn))
    }
}

/// Create the buffer directory (0700 on unix) if missing.
pub(crate) async fn ensure_dir(dir: &Path) -> Result<(), PersistentStorageError> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }
    info!(target = "segment", dir = %dir.display(), "creating buffer directory");
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await.map_err(|e| {
        PersistentStorageError::Io(format!(
            "create buffer dir {} failed: {}",
            dir.display(),
            e
        ))
    })
}

/// Number of bytes after the last `\n` in the file, i.e. the length of an
/// unterminated trailing record.
async fn torn_tail_len(file: &mut File, len: u64) -> std::io::Result<u64> {
    let mut end = len;
    let mut buf = vec![0u8; TAIL_SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf[..n]).await?;
        if let Some(pos) = buf[..n].iter().rposition(|b| *b == b'\n') {
            return Ok(len - (start + pos as u64 + 1));
        }
        end = start;
    }
    // No newline at all: the whole file is a single torn record.
    Ok(len)
}
