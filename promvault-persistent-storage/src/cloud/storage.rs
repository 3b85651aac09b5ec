use async_trait::async_trait;
use opendal::Operator;
use promvault_core::storage::{ObjectStore, PersistentStorageError};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::cloud::storage_config::BackendConfig;

/// Read buffer for streaming a local artifact into the backend writer.
const UPLOAD_READ_CHUNK: usize = 1024 * 1024;
/// Part size handed to opendal; enables multipart uploads on S3/GCS.
const UPLOAD_PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CloudStore {
    /// Optional extra prefix for key joining (used by Local backends)
    root_prefix: String,
    provider: &'static str,
    /// Opendal operator
    op: Operator,
}

impl CloudStore {
    pub fn new(cfg: BackendConfig) -> Result<Self, PersistentStorageError> {
        let (op, root_prefix) = cfg.build_operator()?;
        Ok(Self {
            root_prefix,
            provider: cfg.provider(),
            op,
        })
    }

    pub async fn put_object(&self, path: &str, bytes: &[u8]) -> Result<(), PersistentStorageError> {
        let key = self.join(path);
        self.op
            .write(&key, bytes.to_vec())
            .await
            .map_err(|e| PersistentStorageError::Upload(format!("cloud write {}: {}", key, e)))?;
        Ok(())
    }

    pub async fn get_object(&self, path: &str) -> Result<Vec<u8>, PersistentStorageError> {
        let key = self.join(path);
        let data = self.op.read(&key).await.map_err(|e| {
            PersistentStorageError::Other(format!("cloud get_object {}: {}", key, e))
        })?;
        Ok(data.to_vec())
    }

    /// Keys of all objects under `prefix`, recursively.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PersistentStorageError> {
        let dir = {
            let joined = self.join(prefix);
            if joined.is_empty() || joined.ends_with('/') {
                joined
            } else {
                format!("{}/", joined)
            }
        };
        let entries = self
            .op
            .list_with(&dir)
            .recursive(true)
            .await
            .map_err(|e| PersistentStorageError::Other(format!("cloud list {}: {}", dir, e)))?;
        let strip = if self.root_prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.root_prefix)
        };
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter(|e| e.metadata().is_file())
            .map(|e| {
                let p = e.path();
                p.strip_prefix(strip.as_str()).unwrap_or(p).to_string()
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    #[inline]
    fn join(&self, path: &str) -> String {
        let p = path.trim_start_matches('/');
        if self.root_prefix.is_empty() {
            p.to_string()
        } else {
            format!("{}/{}", self.root_prefix, p)
        }
    }
}

#[async_trait]
impl ObjectStore for CloudStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64, PersistentStorageError> {
        let full_key = self.join(key);
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            PersistentStorageError::Upload(format!("open {} failed: {}", path.display(), e))
        })?;

        let mut writer = self
            .op
            .writer_with(&full_key)
            .chunk(UPLOAD_PART_SIZE)
            .await
            .map_err(|e| {
                PersistentStorageError::Upload(format!("cloud writer {}: {}", full_key, e))
            })?;

        let mut written = 0u64;
        let mut buf = vec![0u8; UPLOAD_READ_CHUNK];
        let res: Result<(), PersistentStorageError> = async {
            loop {
                let n = file.read(&mut buf).await.map_err(|e| {
                    PersistentStorageError::Upload(format!(
                        "read {} failed: {}",
                        path.display(),
                        e
                    ))
                })?;
                if n == 0 {
                    break;
                }
                writer.write(buf[..n].to_vec()).await.map_err(|e| {
                    PersistentStorageError::Upload(format!("cloud write {}: {}", full_key, e))
                })?;
                written += n as u64;
            }
            writer.close().await.map_err(|e| {
                PersistentStorageError::Upload(format!("cloud close {}: {}", full_key, e))
            })?;
            Ok(())
        }
        .await;

        if let Err(e) = res {
            if let Err(abort_err) = writer.abort().await {
                warn!(target = "cloud_store", key = %full_key, error = %abort_err, "abort of failed upload failed");
            }
            return Err(e);
        }

        debug!(target = "cloud_store", key = %full_key, bytes = written, provider = self.provider, "object written");
        Ok(written)
    }

    fn provider(&self) -> &str {
        self.provider
    }
}
