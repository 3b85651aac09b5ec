use anyhow::{Context, Result};
use promvault_persistent_storage::{
    BackendConfig, CloudBackend, LocalBackend, UploaderConfig, MAX_UPLOAD_INTERVAL,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default cap on the compressed request body.
pub(crate) const DEFAULT_MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;
const DEFAULT_UPLOAD_INTERVAL: &str = "1h";

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoadConfiguration {
    /// Address the remote-write endpoint listens on, e.g. "0.0.0.0:8080"
    pub(crate) listen_addr: String,
    /// Directory holding the active and rotated segments
    pub(crate) buffer_dir: PathBuf,
    /// Upload pipeline settings
    #[serde(default)]
    pub(crate) upload: UploadNode,
    /// Object store destination
    pub(crate) cloud: CloudConfig,
    /// Prometheus exporter address for the `metrics` facade (optional)
    pub(crate) prom_exporter: Option<String>,
    /// Largest accepted request body in bytes (defaults to 32 MiB)
    pub(crate) max_request_bytes: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub(crate) struct UploadNode {
    /// Rotation period as a humantime string ("1h", "15m", "90s")
    pub(crate) interval: Option<String>,
    /// Prepended verbatim to every object key
    pub(crate) key_prefix: Option<String>,
    /// Ship segments left by a previous run at startup (defaults to true)
    pub(crate) recover_on_start: Option<bool>,
}

/// Cloud configuration enum (tagged by `backend`)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "backend")]
pub(crate) enum CloudConfig {
    #[serde(rename = "memory")]
    Memory { root: String },
    #[serde(rename = "fs")]
    Fs { root: String },
    #[serde(rename = "s3")]
    S3 {
        /// s3://bucket or s3://bucket/prefix
        root: String,
        region: Option<String>,
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
        session_token: Option<String>,
        anonymous: Option<bool>,
    },
    #[serde(rename = "gcs")]
    Gcs {
        /// gcs://bucket or gcs://bucket/prefix
        root: String,
        endpoint: Option<String>,
        credential_file: Option<String>,
    },
}

/// Settings the process runs with, validated and with defaults applied.
#[derive(Debug)]
pub(crate) struct ServiceConfiguration {
    pub(crate) listen_addr: SocketAddr,
    pub(crate) buffer_dir: PathBuf,
    pub(crate) uploader: UploaderConfig,
    pub(crate) cloud: BackendConfig,
    pub(crate) prom_exporter: Option<SocketAddr>,
    pub(crate) max_request_bytes: usize,
}

impl LoadConfiguration {
    pub(crate) fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("invalid configuration file")
    }
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let listen_addr = parse_socket_addr(&config.listen_addr, "listen_addr")?;

        let prom_exporter = config
            .prom_exporter
            .as_deref()
            .map(|addr| parse_socket_addr(addr, "prom_exporter"))
            .transpose()?;

        if config.buffer_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("buffer_dir must not be empty"));
        }

        let interval = parse_interval(
            config
                .upload
                .interval
                .as_deref()
                .unwrap_or(DEFAULT_UPLOAD_INTERVAL),
        )?;

        let max_request_bytes = config
            .max_request_bytes
            .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
        if max_request_bytes == 0 {
            return Err(anyhow::anyhow!("max_request_bytes must be greater than zero"));
        }

        Ok(ServiceConfiguration {
            listen_addr,
            buffer_dir: config.buffer_dir,
            uploader: UploaderConfig {
                interval,
                key_prefix: config.upload.key_prefix.unwrap_or_default(),
                recover_on_start: config.upload.recover_on_start.unwrap_or(true),
            },
            cloud: BackendConfig::from(&config.cloud),
            prom_exporter,
            max_request_bytes,
        })
    }
}

pub(crate) fn parse_socket_addr(addr: &str, field: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Failed to parse {} into Socket address: {}", field, addr))
}

/// Upload interval from a humantime string, between zero (exclusive) and
/// `MAX_UPLOAD_INTERVAL`.
pub(crate) fn parse_interval(value: &str) -> Result<Duration> {
    let interval = humantime::parse_duration(value)
        .with_context(|| format!("upload interval '{}' is not valid", value))?;
    if interval.is_zero() {
        return Err(anyhow::anyhow!("upload interval must be greater than zero"));
    }
    if interval > MAX_UPLOAD_INTERVAL {
        return Err(anyhow::anyhow!(
            "upload interval '{}' is longer than the {} maximum",
            value,
            humantime::format_duration(MAX_UPLOAD_INTERVAL)
        ));
    }
    Ok(interval)
}

// Provide a conversion from the config CloudConfig to storage BackendConfig
impl From<&CloudConfig> for BackendConfig {
    fn from(cfg: &CloudConfig) -> Self {
        match cfg {
            CloudConfig::Memory { root } => BackendConfig::Local {
                backend: LocalBackend::Memory,
                root: root.clone(),
            },
            CloudConfig::Fs { root } => BackendConfig::Local {
                backend: LocalBackend::Fs,
                root: root.clone(),
            },
            CloudConfig::S3 {
                root,
                region,
                endpoint,
                access_key,
                secret_key,
                session_token,
                anonymous,
            } => {
                let mut options: HashMap<String, String> = HashMap::new();
                insert_opt(&mut options, "region", region);
                insert_opt(&mut options, "endpoint", endpoint);
                insert_opt(&mut options, "access_key", access_key);
                insert_opt(&mut options, "secret_key", secret_key);
                insert_opt(&mut options, "session_token", session_token);
                if let Some(v) = anonymous {
                    options.insert("anonymous".into(), v.to_string());
                }
                BackendConfig::Cloud {
                    backend: CloudBackend::S3,
                    root: root.clone(),
                    options,
                }
            }
            CloudConfig::Gcs {
                root,
                endpoint,
                credential_file,
            } => {
                let mut options: HashMap<String, String> = HashMap::new();
                insert_opt(&mut options, "endpoint", endpoint);
                insert_opt(&mut options, "credential_file", credential_file);
                BackendConfig::Cloud {
                    backend: CloudBackend::Gcs,
                    root: root.clone(),
                    options,
                }
            }
        }
    }
}

fn insert_opt(options: &mut HashMap<String, String>, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        options.insert(key.to_string(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
listen_addr: "127.0.0.1:8080"
buffer_dir: "/var/lib/promvault/buffer"
prom_exporter: "127.0.0.1:9040"
max_request_bytes: 1048576
upload:
  interval: "15m"
  key_prefix: "metrics/"
  recover_on_start: false
cloud:
  backend: s3
  root: "s3://bucket/prom"
  region: "us-east-1"
  endpoint: "http://localhost:9000"
  anonymous: true
"#;

    #[test]
    fn test_full_configuration() {
        let loaded = LoadConfiguration::from_yaml(FULL).expect("parse");
        let cfg = ServiceConfiguration::try_from(loaded).expect("valid");

        assert_eq!(cfg.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(cfg.prom_exporter, Some("127.0.0.1:9040".parse().unwrap()));
        assert_eq!(cfg.max_request_bytes, 1024 * 1024);
        assert_eq!(cfg.uploader.interval, Duration::from_secs(900));
        assert_eq!(cfg.uploader.key_prefix, "metrics/");
        assert!(!cfg.uploader.recover_on_start);
        match cfg.cloud {
            BackendConfig::Cloud {
                backend: CloudBackend::S3,
                root,
                options,
            } => {
                assert_eq!(root, "s3://bucket/prom");
                assert_eq!(options["region"], "us-east-1");
                assert_eq!(options["anonymous"], "true");
                assert!(!options.contains_key("access_key"));
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
listen_addr: "0.0.0.0:8080"
buffer_dir: "/tmp/buffer"
cloud:
  backend: fs
  root: "/tmp/out"
"#;
        let cfg = ServiceConfiguration::try_from(LoadConfiguration::from_yaml(yaml).unwrap())
            .expect("valid");
        assert_eq!(cfg.uploader.interval, Duration::from_secs(3600));
        assert_eq!(cfg.uploader.key_prefix, "");
        assert!(cfg.uploader.recover_on_start);
        assert_eq!(cfg.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
        assert!(cfg.prom_exporter.is_none());
        assert!(matches!(
            cfg.cloud,
            BackendConfig::Local {
                backend: LocalBackend::Fs,
                ..
            }
        ));
    }

    #[test]
    fn test_shipped_config_file_is_valid() {
        let yaml = include_str!("../../config/promvault.yml");
        let cfg = ServiceConfiguration::try_from(LoadConfiguration::from_yaml(yaml).unwrap())
            .expect("valid");
        assert_eq!(cfg.uploader.key_prefix, "prometheus/");
        assert_eq!(cfg.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
        assert_eq!(cfg.cloud.provider(), "s3");
    }

    #[test]
    fn test_gcs_options_mapped() {
        let cfg = CloudConfig::Gcs {
            root: "gcs://b/p".into(),
            endpoint: None,
            credential_file: Some("/etc/gcs.json".into()),
        };
        match BackendConfig::from(&cfg) {
            BackendConfig::Cloud { options, .. } => {
                assert_eq!(options.len(), 1);
                assert_eq!(options["credential_file"], "/etc/gcs.json");
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse_interval("soon").is_err());
        assert!(parse_interval("0s").is_err());
        assert_eq!(parse_interval("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_interval("30days").unwrap(), MAX_UPLOAD_INTERVAL);
        assert!(parse_interval("31days").is_err());
        assert!(parse_interval("100000000years").is_err());

        let bad_addr = FULL.replace("127.0.0.1:8080", "not-an-address");
        assert!(ServiceConfiguration::try_from(LoadConfiguration::from_yaml(&bad_addr).unwrap()).is_err());

        let unknown_backend = FULL.replace("backend: s3", "backend: ftp");
        assert!(LoadConfiguration::from_yaml(&unknown_backend).is_err());
    }
}
