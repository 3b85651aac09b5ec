use clap::Parser;
use std::path::PathBuf;

/// Prometheus remote-write sink: buffers samples on local disk and ships
/// them to object storage on a fixed interval.
#[derive(Debug, Parser)]
#[command(name = "promvault-server", version)]
pub(crate) struct Args {
    /// Path to the YAML config file
    #[arg(long)]
    pub(crate) config_file: PathBuf,

    /// Remote-write listen address (overrides `listen_addr`)
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,

    /// Segment buffer directory (overrides `buffer_dir`)
    #[arg(long)]
    pub(crate) buffer_dir: Option<PathBuf>,

    /// Upload interval, e.g. "1h" or "90s" (overrides `upload.interval`)
    #[arg(long)]
    pub(crate) upload_interval: Option<String>,

    /// Object key prefix (overrides `upload.key_prefix`)
    #[arg(long)]
    pub(crate) key_prefix: Option<String>,

    /// Prometheus exporter http address (overrides `prom_exporter`)
    #[arg(long)]
    pub(crate) prom_exporter: Option<String>,
}
