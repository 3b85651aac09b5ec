use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use promvault_persistent_storage::SegmentStore;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::remote_write;
use crate::sink_metrics::SinkMetrics;

/// Snappy-decoded bodies may be this many times larger than the accepted
/// compressed body.
const DECODED_SIZE_FACTOR: usize = 16;

/// Shared by every request handler.
#[derive(Debug)]
pub(crate) struct IngestState {
    pub(crate) store: SegmentStore,
    pub(crate) metrics: SinkMetrics,
    max_request_bytes: usize,
    max_decoded_bytes: usize,
}

impl IngestState {
    pub(crate) fn new(store: SegmentStore, max_request_bytes: usize) -> Self {
        IngestState {
            store,
            metrics: SinkMetrics::default(),
            max_request_bytes,
            max_decoded_bytes: max_request_bytes.saturating_mul(DECODED_SIZE_FACTOR),
        }
    }
}

#[derive(Serialize)]
struct HealthDto {
    status: &'static str,
}

pub(crate) fn build_router(state: Arc<IngestState>) -> Router {
    let max_request_bytes = state.max_request_bytes;
    Router::new()
        .route("/write", post(write_handler))
        .route("/api/v1/write", post(write_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
}

/// Decode a remote-write body and buffer all of its samples.
///
/// Nothing is buffered when decoding fails. When the append fails the samples
/// of this request are not acknowledged and Prometheus re-sends them.
async fn write_handler(State(state): State<Arc<IngestState>>, body: Bytes) -> Response {
    let decoded = match remote_write::decode(&body, state.max_decoded_bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(target = "ingest", error = %e, body_bytes = body.len(), "rejecting undecodable write request");
            state.metrics.record_rejected("decode");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let count = decoded.samples.len() as u64;
    state.metrics.record_write_request();
    state.metrics.record_received(count);

    match state.store.append_batch(&decoded.samples).await {
        Ok(_) => {
            state.metrics.record_sent(count);
            debug!(target = "ingest", series = decoded.series, samples = count, "write request buffered");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            error!(target = "ingest", error = %e, samples = count, "buffering write request failed");
            state.metrics.record_rejected("buffer");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<IngestState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn health() -> Json<HealthDto> {
    Json(HealthDto { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_write::{encode, series, WriteRequest};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use promvault_persistent_storage::read_segment;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_app(tmp: &TempDir) -> (Router, Arc<IngestState>) {
        let store = SegmentStore::open(tmp.path().join("buffer"))
            .await
            .expect("open store");
        let state = Arc::new(IngestState::new(store, 1024 * 1024));
        (build_router(state.clone()), state)
    }

    fn write_request(path: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Test: A valid remote-write request is buffered
    ///
    /// Expected
    /// - 200, every sample is in the active segment in request order.
    /// - `/metrics` reports one request and the sample counts.
    #[tokio::test]
    async fn test_write_buffers_samples() {
        let tmp = TempDir::new().unwrap();
        let (app, state) = test_app(&tmp).await;
        let body = encode(&WriteRequest {
            timeseries: vec![
                series(&[("__name__", "up"), ("job", "a")], &[(1000, 1.0), (2000, 1.0)]),
                series(&[("__name__", "up"), ("job", "b")], &[(1000, 0.0)]),
            ],
        });

        let resp = app
            .clone()
            .oneshot(write_request("/api/v1/write", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let rotated = state.store.rotate().await.expect("something buffered");
        let samples = read_segment(&rotated).await.unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].labels["job"], "b");

        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_text(resp).await,
            "promvault_total_received_samples 3\n\
             promvault_total_sent_samples 3\n\
             promvault_total_write_requests 1\n"
        );
    }

    /// Test: Garbage body
    ///
    /// Expected
    /// - 400, nothing buffered, no counter moves.
    #[tokio::test]
    async fn test_undecodable_body_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let (app, state) = test_app(&tmp).await;

        let resp = app
            .oneshot(write_request("/write", b"not a remote write body".to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.rotate().await.unwrap_err().is_no_active_segment());
        assert_eq!(state.metrics.snapshot().write_requests, 0);
    }

    /// Test: The buffer directory cannot be written
    ///
    /// Expected
    /// - 500; the request and its samples count as received but not sent.
    #[tokio::test]
    async fn test_buffer_failure_is_server_error() {
        let tmp = TempDir::new().unwrap();
        let (app, state) = test_app(&tmp).await;
        // A regular file where the buffer directory should be
        std::fs::write(tmp.path().join("buffer"), b"blocker").unwrap();

        let body = encode(&WriteRequest {
            timeseries: vec![series(&[("__name__", "up")], &[(1, 1.0)])],
        });
        let resp = app.oneshot(write_request("/write", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let snap = state.metrics.snapshot();
        assert_eq!((snap.write_requests, snap.received_samples, snap.sent_samples), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = SegmentStore::open(tmp.path()).await.unwrap();
        let app = build_router(Arc::new(IngestState::new(store, 16)));

        let resp = app
            .oneshot(write_request("/write", vec![0u8; 64]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    /// Test: Small body announcing a huge decompressed size
    ///
    /// Expected
    /// - 400 without inflating the body; counted as a decode rejection.
    #[tokio::test]
    async fn test_decompression_bomb_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let store = SegmentStore::open(tmp.path()).await.unwrap();
        let state = Arc::new(IngestState::new(store, 1024));
        let app = build_router(state.clone());

        // Snappy header claiming 1 GiB of output
        let body = vec![0x80, 0x80, 0x80, 0x80, 0x04, 0x00];
        let resp = app.oneshot(write_request("/write", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("exceeds"));
        assert_eq!(state.metrics.snapshot().write_requests, 0);
    }

    #[tokio::test]
    async fn test_health_and_unknown_route() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = test_app(&tmp).await;

        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "{\"status\":\"ok\"}");

        let resp = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
