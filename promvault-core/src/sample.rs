use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Label set of a sample. Keys are unique and ordering carries no meaning;
/// a BTreeMap keeps the serialized form stable.
pub type Labels = BTreeMap<String, String>;

/// Label holding the metric name in the Prometheus data model.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single timestamped value of a time series.
///
/// Samples are produced by the ingestion path, written once into the active
/// segment and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    // May be NaN (including the Prometheus stale marker) or infinite
    pub value: f64,
    pub labels: Labels,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64, labels: Labels) -> Self {
        Sample {
            timestamp,
            value,
            labels,
        }
    }

    /// Build a sample from a millisecond unix timestamp, as carried by remote-write.
    /// Returns `None` when the timestamp is outside the representable range.
    pub fn from_millis(timestamp_ms: i64, value: f64, labels: Labels) -> Option<Self> {
        let timestamp = DateTime::from_timestamp_millis(timestamp_ms)?;
        Some(Self::new(timestamp, value, labels))
    }

    /// Value of the `__name__` label, if present.
    pub fn metric_name(&self) -> Option<&str> {
        self.labels.get(METRIC_NAME_LABEL).map(String::as_str)
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

// NaN-aware: two NaN samples compare equal when their bit patterns match.
impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        let same_value = if self.value.is_nan() || other.value.is_nan() {
            self.value.to_bits() == other.value.to_bits()
        } else {
            self.value == other.value
        };
        same_value && self.timestamp == other.timestamp && self.labels == other.labels
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{{}}} {} @{}",
            self.metric_name().unwrap_or(""),
            self.labels
                .iter()
                .filter(|(k, _)| k.as_str() != METRIC_NAME_LABEL)
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect::<Vec<_>>()
                .join(","),
            self.value,
            self.timestamp_millis()
        )
    }
}
