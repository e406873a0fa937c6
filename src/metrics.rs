//! Prometheus metrics for blobgate.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "blobgate_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "blobgate_http_request_duration_seconds";

/// Total blob operations (counter). Labels: operation, status.
pub const BLOB_OPERATIONS_TOTAL: &str = "blobgate_blob_operations_total";

/// Total payload bytes received (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "blobgate_bytes_received_total";

/// Total payload bytes sent (counter).
pub const BYTES_SENT_TOTAL: &str = "blobgate_bytes_sent_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Subsequent calls return
/// the handle installed by the first.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BLOB_OPERATIONS_TOTAL, "Total blob operations by type and outcome");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total payload bytes received");
    describe_counter!(BYTES_SENT_TOTAL, "Total payload bytes sent");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation. Must be the outermost
/// layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a route template for metric labels, so blob ids
/// do not become label values.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/openapi.json" => "/openapi.json",
        "/api/v1/add-blob" => "/api/v1/add-blob",
        "/api/v1/remove-blob" => "/api/v1/remove-blob",
        "/api/v1/transfer-ownership" => "/api/v1/transfer-ownership",
        "/api/v1/authorize" => "/api/v1/authorize",
        p if p.starts_with("/api/v1/blob/") => "/api/v1/blob/{id}",
        _ => "other",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "metrics are disabled".to_string(),
        ),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_static_routes() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/openapi.json"), "/openapi.json");
        assert_eq!(normalize_path("/api/v1/add-blob"), "/api/v1/add-blob");
        assert_eq!(normalize_path("/api/v1/authorize"), "/api/v1/authorize");
    }

    #[test]
    fn test_normalize_path_blob() {
        assert_eq!(
            normalize_path("/api/v1/blob/0b6c3f0e-1e2b-4a51-9c1e-2f3f6a0d2b11"),
            "/api/v1/blob/{id}"
        );
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/"), "other");
        assert_eq!(normalize_path("/wp-admin/setup.php"), "other");
    }
}
