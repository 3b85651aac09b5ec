mod args_parse;
mod ingest_server;
mod remote_write;
mod service_configuration;
mod sink_metrics;

use std::{fs::read_to_string, sync::Arc};

use crate::{
    args_parse::Args,
    ingest_server::{build_router, IngestState},
    service_configuration::{
        parse_interval, parse_socket_addr, LoadConfiguration, ServiceConfiguration,
    },
    sink_metrics::init_metrics,
};

use anyhow::{Context, Result};
use clap::Parser;
use promvault_persistent_storage::{CloudStore, SegmentStore, UploadPipeline};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(&args.config_file).with_context(|| {
        format!("Failed to read config file {}", args.config_file.display())
    })?;
    let load_config = LoadConfiguration::from_yaml(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    if let Some(listen_addr) = args.listen_addr {
        service_config.listen_addr = parse_socket_addr(&listen_addr, "--listen-addr")?;
    }
    if let Some(buffer_dir) = args.buffer_dir {
        service_config.buffer_dir = buffer_dir;
    }
    if let Some(interval) = args.upload_interval {
        service_config.uploader.interval = parse_interval(&interval)?;
    }
    if let Some(key_prefix) = args.key_prefix {
        service_config.uploader.key_prefix = key_prefix;
    }
    if let Some(prom_exporter) = args.prom_exporter {
        service_config.prom_exporter = Some(parse_socket_addr(&prom_exporter, "--prom-exporter")?);
    }

    // Init metrics with or without prometheus exporter
    init_metrics(service_config.prom_exporter)?;

    let store = SegmentStore::open(&service_config.buffer_dir)
        .await
        .context("Failed to open segment buffer")?;

    let provider = service_config.cloud.provider();
    let cloud_store =
        CloudStore::new(service_config.cloud.clone()).context("Failed to init object store")?;
    info!(provider, "object store configured");

    // The pipeline owns its rotation timer and runs as a single background task
    let pipeline = Arc::new(UploadPipeline::new(
        service_config.uploader.clone(),
        store.clone(),
        Arc::new(cloud_store),
    ));
    let cancel = pipeline.cancellation_token();
    let uploader = pipeline.clone().start();

    let state = Arc::new(IngestState::new(store, service_config.max_request_bytes));
    let app = build_router(state);

    let listener = TcpListener::bind(service_config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", service_config.listen_addr))?;
    info!(
        "promvault remote-write sink listening on http://{}",
        service_config.listen_addr
    );

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("http server failed")?;

    // Segments not shipped yet stay in the buffer dir for the next start
    cancel.cancel();
    uploader.await.context("upload pipeline task failed")?;
    info!(stage = %pipeline.stage(), "promvault stopped");

    Ok(())
}
