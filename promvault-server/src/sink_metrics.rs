use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use promvault_persistent_storage::persistent_metrics;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 4] = [
    INGEST_RECEIVED_SAMPLES_TOTAL,
    INGEST_SENT_SAMPLES_TOTAL,
    INGEST_WRITE_REQUESTS_TOTAL,
    INGEST_REJECTED_REQUESTS_TOTAL,
];

pub(crate) const INGEST_RECEIVED_SAMPLES_TOTAL: Metric = Metric {
    name: "promvault_ingest_received_samples_total",
    description: "Samples decoded from remote-write requests",
};

pub(crate) const INGEST_SENT_SAMPLES_TOTAL: Metric = Metric {
    name: "promvault_ingest_sent_samples_total",
    description: "Samples handed to the segment buffer",
};

pub(crate) const INGEST_WRITE_REQUESTS_TOTAL: Metric = Metric {
    name: "promvault_ingest_write_requests_total",
    description: "Remote-write requests that decoded successfully",
};

pub(crate) const INGEST_REJECTED_REQUESTS_TOTAL: Metric = Metric {
    name: "promvault_ingest_rejected_requests_total",
    description: "Remote-write requests rejected (reason={decode,buffer})",
};

/// Install the optional Prometheus listener and describe every metric the
/// process emits through the `metrics` facade.
pub(crate) fn init_metrics(prom_addr: Option<std::net::SocketAddr>) -> Result<()> {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus recorder")?;
        info!(%addr, "prometheus exporter listening");
    }

    for metric in COUNTERS {
        metrics::describe_counter!(metric.name, metric.description);
        let _counter = metrics::counter!(metric.name);
    }
    for metric in persistent_metrics::COUNTERS {
        metrics::describe_counter!(metric.name, metric.description);
    }
    for metric in persistent_metrics::HISTOGRAMS {
        metrics::describe_histogram!(metric.name, metric.description);
    }
    Ok(())
}

/// Process-wide ingestion counters served on `/metrics`.
///
/// Monotonic; only ever incremented.
#[derive(Debug, Default)]
pub(crate) struct SinkMetrics {
    received_samples: AtomicU64,
    sent_samples: AtomicU64,
    write_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SinkSnapshot {
    pub(crate) received_samples: u64,
    pub(crate) sent_samples: u64,
    pub(crate) write_requests: u64,
}

impl SinkMetrics {
    pub(crate) fn record_write_request(&self) {
        self.write_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(INGEST_WRITE_REQUESTS_TOTAL.name).increment(1);
    }

    pub(crate) fn record_received(&self, samples: u64) {
        self.received_samples.fetch_add(samples, Ordering::Relaxed);
        metrics::counter!(INGEST_RECEIVED_SAMPLES_TOTAL.name).increment(samples);
    }

    pub(crate) fn record_sent(&self, samples: u64) {
        self.sent_samples.fetch_add(samples, Ordering::Relaxed);
        metrics::counter!(INGEST_SENT_SAMPLES_TOTAL.name).increment(samples);
    }

    pub(crate) fn record_rejected(&self, reason: &'static str) {
        metrics::counter!(INGEST_REJECTED_REQUESTS_TOTAL.name, "reason" => reason).increment(1);
    }

    pub(crate) fn snapshot(&self) -> SinkSnapshot {
        SinkSnapshot {
            received_samples: self.received_samples.load(Ordering::Relaxed),
            sent_samples: self.sent_samples.load(Ordering::Relaxed),
            write_requests: self.write_requests.load(Ordering::Relaxed),
        }
    }

    /// Plain-text `name value` lines.
    pub(crate) fn render(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        for (name, value) in [
            ("promvault_total_received_samples", snap.received_samples),
            ("promvault_total_sent_samples", snap.sent_samples),
            ("promvault_total_write_requests", snap.write_requests),
        ] {
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }
}
