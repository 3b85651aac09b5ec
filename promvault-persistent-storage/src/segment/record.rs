use chrono::{DateTime, Utc};
use promvault_core::storage::PersistentStorageError;
use promvault_core::{Labels, Sample};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Serialized form of one sample: a single JSON object on its own line.
///
/// JSON has no NaN or infinity, so non-finite values are written as `0`
/// together with a flag. `nanBits` is only emitted for NaN payloads other than
/// the canonical one (the Prometheus stale marker is such a payload).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SegmentRecord<'a> {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<Cow<'a, str>>,
    #[serde(rename = "isNaN", default)]
    pub is_nan: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nan_bits: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_inf: Option<Infinity>,
    pub value: f64,
    #[serde(default)]
    pub labels: Cow<'a, Labels>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Infinity {
    Positive,
    Negative,
}

impl<'a> SegmentRecord<'a> {
    pub(crate) fn from_sample(sample: &'a Sample) -> Self {
        let v = sample.value;
        let (value, is_nan, nan_bits, is_inf) = if v.is_nan() {
            let bits = v.to_bits();
            let nan_bits = (bits != f64::NAN.to_bits()).then_some(bits);
            (0.0, true, nan_bits, None)
        } else if v.is_infinite() {
            let sign = if v > 0.0 {
                Infinity::Positive
            } else {
                Infinity::Negative
            };
            (0.0, false, None, Some(sign))
        } else {
            (v, false, None, None)
        };
        SegmentRecord {
            timestamp: sample.timestamp,
            metric_name: sample.metric_name().map(Cow::Borrowed),
            is_nan,
            nan_bits,
            is_inf,
            value,
            labels: Cow::Borrowed(&sample.labels),
        }
    }

    pub(crate) fn into_sample(self) -> Sample {
        let value = if self.is_nan {
            match self.nan_bits.map(f64::from_bits) {
                Some(v) if v.is_nan() => v,
                _ => f64::NAN,
            }
        } else {
            match self.is_inf {
                Some(Infinity::Positive) => f64::INFINITY,
                Some(Infinity::Negative) => f64::NEG_INFINITY,
                None => self.value,
            }
        };
        Sample::new(self.timestamp, value, self.labels.into_owned())
    }
}

/// Append the record line for `sample` (terminated by `\n`) to `out`.
pub(crate) fn encode_line(sample: &Sample, out: &mut Vec<u8>) -> Result<(), PersistentStorageError> {
    let record = SegmentRecord::from_sample(sample);
    serde_json::to_writer(&mut *out, &record).map_err(|e| {
        PersistentStorageError::Serialize(format!("encode segment record failed: {}", e))
    })?;
    out.push(b'\n');
    Ok(())
}

/// Decode one record line (without its trailing newline).
pub(crate) fn decode_line(line: &str) -> Result<Sample, serde_json::Error> {
    let record: SegmentRecord<'_> = serde_json::from_str(line)?;
    Ok(record.into_sample())
}
