//! Prometheus remote-write (v1) request decoding.
//!
//! The body is a snappy block (not the framed format) wrapping a protobuf
//! `prometheus.WriteRequest`. Only the fields the sink stores are declared;
//! metadata, exemplars and native histograms are skipped by the decoder.

use promvault_core::{Labels, Sample};
use prost::Message;
use thiserror::Error;

#[derive(Clone, PartialEq, Message)]
pub(crate) struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub(crate) timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub(crate) labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub(crate) samples: Vec<WireSample>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct Label {
    #[prost(string, tag = "1")]
    pub(crate) name: String,
    #[prost(string, tag = "2")]
    pub(crate) value: String,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct WireSample {
    #[prost(double, tag = "1")]
    pub(crate) value: f64,
    /// Milliseconds since the unix epoch
    #[prost(int64, tag = "2")]
    pub(crate) timestamp: i64,
}

#[derive(Debug, Error)]
pub(crate) enum DecodeError {
    #[error("snappy decompression failed: {0}")]
    Snappy(#[from] snap::Error),
    #[error("protobuf decoding failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("sample timestamp {0}ms is out of range")]
    Timestamp(i64),
    #[error("decompressed body of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// Decoded request: the samples in series order plus the series count.
#[derive(Debug)]
pub(crate) struct DecodedWrite {
    pub(crate) series: usize,
    pub(crate) samples: Vec<Sample>,
}

/// Decode a remote-write body. Either every sample is returned or none.
///
/// The length announced in the snappy header is checked against
/// `max_decoded_bytes` before anything is allocated.
pub(crate) fn decode(body: &[u8], max_decoded_bytes: usize) -> Result<DecodedWrite, DecodeError> {
    let size = snap::raw::decompress_len(body)?;
    if size > max_decoded_bytes {
        return Err(DecodeError::TooLarge {
            size,
            limit: max_decoded_bytes,
        });
    }
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    let request = WriteRequest::decode(raw.as_slice())?;

    let total = request.timeseries.iter().map(|ts| ts.samples.len()).sum();
    let mut samples = Vec::with_capacity(total);
    let series = request.timeseries.len();
    for ts in request.timeseries {
        let labels: Labels = ts.labels.into_iter().map(|l| (l.name, l.value)).collect();
        for s in ts.samples {
            let sample = Sample::from_millis(s.timestamp, s.value, labels.clone())
                .ok_or(DecodeError::Timestamp(s.timestamp))?;
            samples.push(sample);
        }
    }
    Ok(DecodedWrite { series, samples })
}

/// Snappy-compressed protobuf body, as sent by Prometheus.
#[cfg(test)]
pub(crate) fn encode(request: &WriteRequest) -> Vec<u8> {
    snap::raw::Encoder::new()
        .compress_vec(&request.encode_to_vec())
        .expect("snappy encode")
}

#[cfg(test)]
pub(crate) fn series(labels: &[(&str, &str)], samples: &[(i64, f64)]) -> TimeSeries {
    TimeSeries {
        labels: labels
            .iter()
            .map(|(n, v)| Label {
                name: n.to_string(),
                value: v.to_string(),
            })
            .collect(),
        samples: samples
            .iter()
            .map(|&(timestamp, value)| WireSample { value, timestamp })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    fn test_decode_flattens_series_into_samples() {
        let body = encode(&WriteRequest {
            timeseries: vec![
                series(
                    &[("__name__", "up"), ("job", "node")],
                    &[(1000, 1.0), (2000, 0.0)],
                ),
                series(&[("__name__", "cpu")], &[(1500, 3.14)]),
            ],
        });

        let decoded = decode(&body, LIMIT).expect("decode");
        assert_eq!(decoded.series, 2);
        assert_eq!(decoded.samples.len(), 3);
        assert_eq!(decoded.samples[0].metric_name(), Some("up"));
        assert_eq!(decoded.samples[0].labels["job"], "node");
        assert_eq!(decoded.samples[1].timestamp_millis(), 2000);
        assert_eq!(decoded.samples[2].metric_name(), Some("cpu"));
        assert_eq!(decoded.samples[2].value, 3.14);
    }

    #[test]
    fn test_decode_keeps_stale_marker() {
        let stale = f64::from_bits(0x7ff0_0000_0000_0002);
        let body = encode(&WriteRequest {
            timeseries: vec![series(&[("__name__", "up")], &[(1, stale)])],
        });
        let decoded = decode(&body, LIMIT).expect("decode");
        assert_eq!(decoded.samples[0].value.to_bits(), 0x7ff0_0000_0000_0002);
    }

    #[test]
    fn test_empty_request_decodes_to_nothing() {
        let decoded = decode(&encode(&WriteRequest::default()), LIMIT).expect("decode");
        assert_eq!(decoded.series, 0);
        assert!(decoded.samples.is_empty());
    }

    #[test]
    fn test_decode_rejects_non_snappy_body() {
        let err = decode(b"definitely not snappy", LIMIT).unwrap_err();
        assert!(matches!(err, DecodeError::Snappy(_)), "{err:?}");
    }

    #[test]
    fn test_decode_rejects_bad_protobuf() {
        let body = snap::raw::Encoder::new()
            .compress_vec(&[0x0a, 0xff, 0xff, 0xff])
            .unwrap();
        let err = decode(&body, LIMIT).unwrap_err();
        assert!(matches!(err, DecodeError::Protobuf(_)), "{err:?}");
    }

    #[test]
    fn test_decode_rejects_out_of_range_timestamp() {
        let body = encode(&WriteRequest {
            timeseries: vec![series(&[("a", "b")], &[(1, 1.0), (i64::MAX, 1.0)])],
        });
        let err = decode(&body, LIMIT).unwrap_err();
        assert!(matches!(err, DecodeError::Timestamp(i64::MAX)));
    }

    #[test]
    fn test_decode_rejects_oversized_decompressed_length() {
        // Snappy header announcing 1 GiB, with no payload behind it
        let body = [0x80, 0x80, 0x80, 0x80, 0x04, 0x00];
        let err = decode(&body, LIMIT).unwrap_err();
        assert!(
            matches!(err, DecodeError::TooLarge { size, limit } if size == 1 << 30 && limit == LIMIT),
            "{err:?}"
        );
    }
}
