//! Prometheus metrics for tusstore.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "tusstore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "tusstore_http_request_duration_seconds";

/// Storage calls by outcome (counter). Labels: operation, status.
pub const STORAGE_OPERATIONS_TOTAL: &str = "tusstore_storage_operations_total";

/// Retried storage attempts (counter). Labels: operation.
pub const STORAGE_RETRIES_TOTAL: &str = "tusstore_storage_retries_total";

/// Uploads created (counter).
pub const UPLOADS_CREATED_TOTAL: &str = "tusstore_uploads_created_total";

/// Uploads finalized into a stored object (counter).
pub const UPLOADS_COMPLETED_TOTAL: &str = "tusstore_uploads_completed_total";

/// Uploads dropped for inactivity (counter).
pub const UPLOADS_EXPIRED_TOTAL: &str = "tusstore_uploads_expired_total";

/// Sessions currently tracked by the coordinator (gauge).
pub const ACTIVE_UPLOADS: &str = "tusstore_active_uploads";

/// Chunks rejected by checksum verification (counter).
pub const CHECKSUM_MISMATCHES_TOTAL: &str = "tusstore_checksum_mismatches_total";

/// Total upload bytes accepted (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "tusstore_bytes_received_total";

/// Total object bytes served by the read path (counter).
pub const BYTES_SENT_TOTAL: &str = "tusstore_bytes_sent_total";

/// Edge cache lookups (counter). Labels: result (hit, miss).
pub const CACHE_LOOKUPS_TOTAL: &str = "tusstore_cache_lookups_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("a global metrics recorder was already installed");
        }
        handle
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(STORAGE_OPERATIONS_TOTAL, "Storage calls by operation and outcome");
    describe_counter!(STORAGE_RETRIES_TOTAL, "Storage attempts that were retried");
    describe_counter!(UPLOADS_CREATED_TOTAL, "Uploads created");
    describe_counter!(UPLOADS_COMPLETED_TOTAL, "Uploads finalized");
    describe_counter!(UPLOADS_EXPIRED_TOTAL, "Uploads expired before completion");
    describe_gauge!(ACTIVE_UPLOADS, "Upload sessions currently tracked");
    describe_counter!(CHECKSUM_MISMATCHES_TOTAL, "Chunks rejected by checksum");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total upload bytes accepted");
    describe_counter!(BYTES_SENT_TOTAL, "Total object bytes served");
    describe_counter!(CACHE_LOOKUPS_TOTAL, "Edge cache lookups by result");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// This prevents high-cardinality labels from unique namespaces and ids.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/files/attachments` -> `/files/{namespace}`
/// - `/files/attachments/a/b.png` -> `/files/{namespace}/{id}`
/// - anything else -> `/other`
fn normalize_path(path: &str) -> String {
    match path {
        "/health" | "/openapi.json" | "/metrics" => path.to_string(),
        _ => {
            let Some(rest) = path.strip_prefix("/files/") else {
                return "/other".to_string();
            };
            let rest = rest.trim_end_matches('/');
            if rest.is_empty() {
                return "/other".to_string();
            }
            match rest.find('/') {
                None => "/files/{namespace}".to_string(),
                Some(_) => "/files/{namespace}/{id}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = PROMETHEUS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
