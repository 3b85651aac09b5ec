use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistentStorageError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
    /// Rotation was requested but nothing has been buffered since the last one.
    #[error("no record is buffered")]
    NoActiveSegment,
    #[error("compress error: {0}")]
    Compress(String),
    #[error("upload error: {0}")]
    Upload(String),
    #[error("corrupt record in {path} at line {line}: {reason}")]
    CorruptRecord {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

impl PersistentStorageError {
    /// `NoActiveSegment` means "nothing to do", callers usually branch on it.
    pub fn is_no_active_segment(&self) -> bool {
        matches!(self, PersistentStorageError::NoActiveSegment)
    }
}

/// Capability to store a named blob in a remote object store.
///
/// The upload pipeline only needs `put`; listing, reading back and deleting
/// remote objects stay with whatever consumes the bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Store the content of the local file at `path` under `key`, replacing
    /// any object already stored there. Returns the number of bytes written.
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64, PersistentStorageError>;

    /// Short backend name used in logs and metric labels (e.g. "s3", "memory").
    fn provider(&self) -> &str;
}
