//! Operation counters and Prometheus metrics for the gateway.
//!
//! Two layers live here:
//!
//! * [`S3GatewayMetrics`], an injected registry holding one success/failure
//!   counter pair per logical S3 operation.  Endpoints own an
//!   `Arc<S3GatewayMetrics>` and bump exactly one counter per call.
//! * The global `metrics` facade with a Prometheus recorder, HTTP RED
//!   middleware and the `/metrics` exposition handler.  Every registry
//!   increment is mirrored into [`S3_OPERATIONS_TOTAL`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::errors::S3Error;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "s3gateway_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "s3gateway_http_request_duration_seconds";

/// Total S3 operations (counter). Labels: operation, status.
pub const S3_OPERATIONS_TOTAL: &str = "s3gateway_s3_operations_total";

/// Total bytes received in object and part bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "s3gateway_bytes_received_total";

/// Total bytes sent in object bodies (counter).
pub const BYTES_SENT_TOTAL: &str = "s3gateway_bytes_sent_total";

// -- Operation registry -------------------------------------------------------

const OPERATION_COUNT: usize = 17;

/// Logical S3 operations that carry a success/failure counter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    HeadBucket,
    ListS3Buckets,
    GetBucket,
    GetAcl,
    CreateBucket,
    PutAcl,
    DeleteBucket,
    HeadKey,
    CreateKey,
    CopyObject,
    CreateMultipartKey,
    GetKey,
    ListParts,
    DeleteKey,
    AbortMultiPartUpload,
    InitMultiPartUpload,
    CompleteMultiPartUpload,
}

impl Operation {
    /// Every operation, in registry order.
    pub const ALL: [Operation; OPERATION_COUNT] = [
        Operation::HeadBucket,
        Operation::ListS3Buckets,
        Operation::GetBucket,
        Operation::GetAcl,
        Operation::CreateBucket,
        Operation::PutAcl,
        Operation::DeleteBucket,
        Operation::HeadKey,
        Operation::CreateKey,
        Operation::CopyObject,
        Operation::CreateMultipartKey,
        Operation::GetKey,
        Operation::ListParts,
        Operation::DeleteKey,
        Operation::AbortMultiPartUpload,
        Operation::InitMultiPartUpload,
        Operation::CompleteMultiPartUpload,
    ];

    /// The operation name used as counter prefix and metric label.
    pub fn name(self) -> &'static str {
        match self {
            Operation::HeadBucket => "HeadBucket",
            Operation::ListS3Buckets => "ListS3Buckets",
            Operation::GetBucket => "GetBucket",
            Operation::GetAcl => "GetAcl",
            Operation::CreateBucket => "CreateBucket",
            Operation::PutAcl => "PutAcl",
            Operation::DeleteBucket => "DeleteBucket",
            Operation::HeadKey => "HeadKey",
            Operation::CreateKey => "CreateKey",
            Operation::CopyObject => "CopyObject",
            Operation::CreateMultipartKey => "CreateMultipartKey",
            Operation::GetKey => "GetKey",
            Operation::ListParts => "ListParts",
            Operation::DeleteKey => "DeleteKey",
            Operation::AbortMultiPartUpload => "AbortMultiPartUpload",
            Operation::InitMultiPartUpload => "InitMultiPartUpload",
            Operation::CompleteMultiPartUpload => "CompleteMultiPartUpload",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct CounterPair {
    success: AtomicU64,
    failure: AtomicU64,
}

/// Monotonic per-operation success/failure counters.
///
/// Counters start at zero and are never reset.  Increments use relaxed
/// atomics: concurrent updates are never lost, but reading two counters is
/// not a consistent snapshot.
pub struct S3GatewayMetrics {
    counters: [CounterPair; OPERATION_COUNT],
}

impl Default for S3GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for S3GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

impl S3GatewayMetrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| CounterPair::default()),
        }
    }

    pub fn inc_success(&self, op: Operation) {
        self.counters[op.index()]
            .success
            .fetch_add(1, Ordering::Relaxed);
        counter!(S3_OPERATIONS_TOTAL, "operation" => op.name(), "status" => "success")
            .increment(1);
    }

    pub fn inc_failure(&self, op: Operation) {
        self.counters[op.index()]
            .failure
            .fetch_add(1, Ordering::Relaxed);
        counter!(S3_OPERATIONS_TOTAL, "operation" => op.name(), "status" => "failure")
            .increment(1);
    }

    /// Bump the counter matching the outcome of one operation.
    pub fn record<T>(&self, op: Operation, outcome: &Result<T, S3Error>) {
        match outcome {
            Ok(_) => self.inc_success(op),
            Err(_) => self.inc_failure(op),
        }
    }

    pub fn success(&self, op: Operation) -> u64 {
        self.counters[op.index()].success.load(Ordering::Relaxed)
    }

    pub fn failure(&self, op: Operation) -> u64 {
        self.counters[op.index()].failure.load(Ordering::Relaxed)
    }

    /// Look a counter up by its full name, e.g. `"CreateKeySuccess"`.
    pub fn get(&self, name: &str) -> Option<u64> {
        Operation::ALL.iter().find_map(|&op| {
            let rest = name.strip_prefix(op.name())?;
            match rest {
                "Success" => Some(self.success(op)),
                "Failure" => Some(self.failure(op)),
                _ => None,
            }
        })
    }

    /// All counters keyed by full name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for op in Operation::ALL {
            out.insert(format!("{}Success", op.name()), self.success(op));
            out.insert(format!("{}Failure", op.name()), self.failure(op));
        }
        out
    }
}

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent, so tests may
/// call it repeatedly.
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

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(S3_OPERATIONS_TOTAL, "Total S3 operations by type and outcome");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received (object bodies)");
    describe_counter!(BYTES_SENT_TOTAL, "Total bytes sent (object bodies)");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// `/metrics` itself is not instrumented.
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

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Collapse a request path to its route template so bucket and key names
/// do not become label values.
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" | "/gateway/metrics" => path.to_string(),
        _ => {
            let trimmed = path.trim_start_matches('/');
            if trimmed.is_empty() {
                return "/".to_string();
            }
            match trimmed.find('/') {
                None => "/{bucket}".to_string(),
                Some(_) => "/{bucket}/{key}".to_string(),
            }
        }
    }
}

/// `GET /metrics` -- Prometheus exposition text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed_routes() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/gateway/metrics"), "/gateway/metrics");
    }

    #[test]
    fn test_normalize_path_bucket() {
        assert_eq!(normalize_path("/my-bucket"), "/{bucket}");
        assert_eq!(normalize_path("/test-bucket-123"), "/{bucket}");
    }

    #[test]
    fn test_normalize_path_object() {
        assert_eq!(normalize_path("/my-bucket/key"), "/{bucket}/{key}");
        assert_eq!(
            normalize_path("/my-bucket/path/to/object.txt"),
            "/{bucket}/{key}"
        );
    }

    #[test]
    fn test_registry_starts_at_zero() {
        let m = S3GatewayMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.len(), 34);
        assert!(snap.values().all(|&v| v == 0));
    }

    #[test]
    fn test_record_outcomes() {
        let m = S3GatewayMetrics::new();
        let ok: Result<(), S3Error> = Ok(());
        let err: Result<(), S3Error> = Err(S3Error::NoSuchBucket {
            bucket: "b".into(),
        });
        m.record(Operation::CreateKey, &ok);
        m.record(Operation::CreateKey, &ok);
        m.record(Operation::CreateKey, &err);

        assert_eq!(m.get("CreateKeySuccess"), Some(2));
        assert_eq!(m.get("CreateKeyFailure"), Some(1));
        assert_eq!(m.get("GetKeySuccess"), Some(0));
    }

    #[test]
    fn test_get_unknown_name() {
        let m = S3GatewayMetrics::new();
        assert_eq!(m.get("Bogus"), None);
        assert_eq!(m.get("CreateKey"), None);
        assert_eq!(m.get("CreateKeyOther"), None);
    }

    #[test]
    fn test_counters_are_distinct_per_operation() {
        // CreateMultipartKey shares a prefix with CreateKey-like names.
        let m = S3GatewayMetrics::new();
        m.inc_success(Operation::CreateMultipartKey);
        assert_eq!(m.get("CreateMultipartKeySuccess"), Some(1));
        assert_eq!(m.get("CreateKeySuccess"), Some(0));
    }

    #[test]
    fn test_concurrent_increments_not_lost() {
        let m = std::sync::Arc::new(S3GatewayMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.inc_failure(Operation::GetKey);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.failure(Operation::GetKey), 8000);
    }
}
