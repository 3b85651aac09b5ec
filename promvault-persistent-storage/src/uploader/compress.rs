use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use promvault_core::storage::PersistentStorageError;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const GZIP_EXTENSION: &str = "gz";

/// Turns a rotated segment into the artifact that gets uploaded.
///
/// Implementations must leave the source in place on failure and replace it
/// with the artifact on success.
#[async_trait]
pub trait SegmentCompressor: Send + Sync + std::fmt::Debug {
    /// Artifact extension, appended to the rotated file name and used in object keys.
    fn extension(&self) -> &str;

    async fn compress(&self, rotated: &Path) -> Result<PathBuf, PersistentStorageError>;
}

/// Artifact path for a rotated segment: `<rotated>.<ext>`.
pub fn artifact_path(rotated: &Path, extension: &str) -> PathBuf {
    let mut name = rotated.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// gzip compression with the same outcome as `gzip <file>`: `<file>.gz`
/// replaces `<file>`.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        GzipCompressor {
            level: Compression::default(),
        }
    }
}

impl GzipCompressor {
    pub fn with_level(level: u32) -> Self {
        GzipCompressor {
            level: Compression::new(level),
        }
    }
}

#[async_trait]
impl SegmentCompressor for GzipCompressor {
    fn extension(&self) -> &str {
        GZIP_EXTENSION
    }

    async fn compress(&self, rotated: &Path) -> Result<PathBuf, PersistentStorageError> {
        let target = artifact_path(rotated, GZIP_EXTENSION);
        let source_exists = exists(rotated).await?;
        let target_exists = exists(&target).await?;

        // The artifact is only ever renamed into place once complete, so an
        // existing one is from an interrupted earlier attempt.
        match (source_exists, target_exists) {
            (false, true) => return Ok(target),
            (true, true) => {
                warn!(target = "uploader", file = %rotated.display(), "artifact already exists, removing source");
                remove_source(rotated).await?;
                return Ok(target);
            }
            (false, false) => {
                return Err(PersistentStorageError::Compress(format!(
                    "segment {} not found",
                    rotated.display()
                )))
            }
            (true, false) => {}
        }

        info!(target = "uploader", file = %rotated.display(), "compressing segment");
        let tmp = artifact_path(&target, "tmp");
        let (src, tmp_path, level) = (rotated.to_path_buf(), tmp.clone(), self.level);
        let (raw, packed) = tokio::task::spawn_blocking(move || gzip_file(&src, &tmp_path, level))
            .await
            .map_err(|e| PersistentStorageError::Compress(format!("compress task failed: {}", e)))?
            .map_err(|e| {
                PersistentStorageError::Compress(format!(
                    "gzip {} failed: {}",
                    rotated.display(),
                    e
                ))
            })?;

        tokio::fs::rename(&tmp, &target).await.map_err(|e| {
            PersistentStorageError::Compress(format!(
                "rename {} -> {} failed: {}",
                tmp.display(),
                target.display(),
                e
            ))
        })?;
        remove_source(rotated).await?;

        debug!(
            target = "uploader",
            file = %target.display(),
            raw_bytes = raw,
            compressed_bytes = packed,
            "segment compressed"
        );
        Ok(target)
    }
}

fn gzip_file(src: &Path, dst: &Path, level: Compression) -> std::io::Result<(u64, u64)> {
    let mut input = BufReader::new(File::open(src)?);
    let out = File::create(dst)?;
    let mut encoder = GzEncoder::new(BufWriter::new(out), level);
    let raw = std::io::copy(&mut input, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    let packed = file.metadata()?.len();
    Ok((raw, packed))
}

async fn exists(path: &Path) -> Result<bool, PersistentStorageError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| PersistentStorageError::Compress(format!("stat {} failed: {}", path.display(), e)))
}

async fn remove_source(path: &Path) -> Result<(), PersistentStorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistentStorageError::Compress(format!(
            "remove {} failed: {}",
            path.display(),
            e
        ))),
    }
}
