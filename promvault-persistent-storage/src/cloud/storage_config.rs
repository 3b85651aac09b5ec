use opendal::services::{Fs, Gcs, Memory, S3};
use opendal::Operator;
use promvault_core::storage::PersistentStorageError;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum CloudBackend {
    S3,
    Gcs,
}

#[derive(Debug, Clone)]
pub enum LocalBackend {
    Fs,
    Memory,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Cloud backends hosted out of process (S3, GCS)
    Cloud {
        backend: CloudBackend,
        /// A URI-like root, e.g. s3://bucket/prefix, gcs://bucket/prefix
        root: String,
        /// Optional backend-specific options (endpoint, region, credentials, etc.)
        options: HashMap<String, String>,
    },
    /// Local backends colocated with the sink (fs, memory)
    Local {
        backend: LocalBackend,
        /// For fs: an absolute directory like file:///var/lib/promvault/out or /var/lib/promvault/out
        /// For memory: a logical namespace used as a virtual root
        root: String,
    },
}

const S3_OPTIONS: &[&str] = &[
    "endpoint",
    "region",
    "access_key",
    "secret_key",
    "session_token",
    "anonymous",
];
const GCS_OPTIONS: &[&str] = &["endpoint", "credential_file"];

impl BackendConfig {
    /// Short backend name used in logs and metric labels.
    pub fn provider(&self) -> &'static str {
        match self {
            BackendConfig::Cloud {
                backend: CloudBackend::S3,
                ..
            } => "s3",
            BackendConfig::Cloud {
                backend: CloudBackend::Gcs,
                ..
            } => "gcs",
            BackendConfig::Local {
                backend: LocalBackend::Fs,
                ..
            } => "fs",
            BackendConfig::Local {
                backend: LocalBackend::Memory,
                ..
            } => "memory",
        }
    }

    /// Build the opendal operator and the key prefix to join in front of
    /// object keys (only the memory backend needs one).
    pub(crate) fn build_operator(&self) -> Result<(Operator, String), PersistentStorageError> {
        match self {
            BackendConfig::Cloud {
                backend: CloudBackend::S3,
                root,
                options,
            } => {
                // Expect root like s3://bucket or s3://bucket/prefix
                let (bucket, prefix) =
                    split_bucket_prefix(root).map_err(PersistentStorageError::Config)?;
                warn_unknown_options("s3", options, S3_OPTIONS);
                // Builders in opendal 0.54 consume self: use chaining/reassignment
                let mut builder = S3::default().bucket(&bucket);
                if !prefix.is_empty() {
                    // S3 root must be an absolute path
                    builder = builder.root(&format!("/{}", prefix));
                }
                if let Some(endpoint) = options.get("endpoint") {
                    builder = builder.endpoint(endpoint);
                }
                if let Some(region) = options.get("region") {
                    builder = builder.region(region);
                }
                if let Some(ak) = options.get("access_key") {
                    builder = builder.access_key_id(ak);
                }
                if let Some(sk) = options.get("secret_key") {
                    builder = builder.secret_access_key(sk);
                }
                if let Some(token) = options.get("session_token") {
                    builder = builder.session_token(token);
                }
                if options.get("anonymous").map(|v| v == "true").unwrap_or(false) {
                    builder = builder.allow_anonymous();
                }
                let op = Operator::new(builder)
                    .map_err(|e| PersistentStorageError::Config(format!("opendal s3 builder: {}", e)))?
                    .finish();
                Ok((op, String::new()))
            }
            BackendConfig::Cloud {
                backend: CloudBackend::Gcs,
                root,
                options,
            } => {
                // Expect root like gcs://bucket or gcs://bucket/prefix
                let (bucket, prefix) =
                    split_bucket_prefix(root).map_err(PersistentStorageError::Config)?;
                warn_unknown_options("gcs", options, GCS_OPTIONS);
                let mut builder = Gcs::default().bucket(&bucket);
                if !prefix.is_empty() {
                    builder = builder.root(&format!("/{}", prefix));
                }
                if let Some(cred_file) = options.get("credential_file") {
                    builder = builder.credential_path(cred_file);
                }
                if let Some(endpoint) = options.get("endpoint") {
                    builder = builder.endpoint(endpoint);
                }
                let op = Operator::new(builder)
                    .map_err(|e| PersistentStorageError::Config(format!("opendal gcs builder: {}", e)))?
                    .finish();
                Ok((op, String::new()))
            }
            BackendConfig::Local {
                backend: LocalBackend::Fs,
                root,
            } => {
                let builder = Fs::default().root(&split_fs_root(root));
                let op = Operator::new(builder)
                    .map_err(|e| PersistentStorageError::Config(format!("opendal fs builder: {}", e)))?
                    .finish();
                Ok((op, String::new()))
            }
            BackendConfig::Local {
                backend: LocalBackend::Memory,
                root,
            } => {
                // Memory service ignores root but we keep a logical prefix
                let op = Operator::new(Memory::default())
                    .map_err(|e| {
                        PersistentStorageError::Config(format!("opendal memory builder: {}", e))
                    })?
                    .finish();
                Ok((op, normalize_prefix(root)))
            }
        }
    }
}

fn warn_unknown_options(service: &str, options: &HashMap<String, String>, allowed: &[&str]) {
    for k in options.keys() {
        if !allowed.contains(&k.as_str()) {
            warn!(
                target: "cloud_store",
                "unknown {} option '{}'; accepted keys: {:?}",
                service,
                k,
                allowed
            );
        }
    }
}

pub(crate) fn split_bucket_prefix(uri: &str) -> Result<(String, String), String> {
    // Accept formats: s3://bucket, s3://bucket/prefix, gcs://bucket/prefix
    match uri.split_once("://") {
        Some((_, rest)) => {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(format!("invalid uri, missing bucket: {}", uri));
            }
            Ok((bucket.to_string(), normalize_prefix(prefix)))
        }
        // No scheme: the entire string is the bucket
        None if uri.is_empty() => Err("invalid uri, missing bucket".to_string()),
        None => Ok((uri.to_string(), String::new())),
    }
}

pub(crate) fn split_fs_root(uri_or_path: &str) -> String {
    // Accept file:///abs/path or /abs/path
    uri_or_path
        .strip_prefix("file://")
        .unwrap_or(uri_or_path)
        .to_string()
}

pub(crate) fn normalize_prefix(p: &str) -> String {
    p.trim_matches('/').to_string()
}
