//! Axum router construction and S3 route mapping.
//!
//! The [`app`] function wires every S3-compatible endpoint to its handler
//! and returns a ready-to-serve [`axum::Router`].
//!
//! S3 distinguishes operations by query parameters, not just path+method.
//! For example, `GET /:bucket` is either a key listing or GetAcl (`?acl`),
//! and `PUT /:bucket/*key` is a plain upload, a copy (`x-amz-copy-source`)
//! or a multipart part (`?uploadId&partNumber`).  Each route handler decides
//! the request variant once and passes it to the endpoint; the endpoint
//! returns a typed result that is rendered here.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::acl::resolve_acl;
use crate::errors::{generate_request_id, S3Error};
use crate::handlers::object::{extract_user_metadata, header_str};
use crate::handlers::{
    ByteRange, CopySource, DeleteObjectRequest, GetBucketRequest, GetBucketResponse,
    GetObjectRequest, GetObjectResponse, ListObjectsParams, ListVersion, PutBucketRequest,
    PutBucketResponse, PutObjectRequest, PutObjectResponse, DEFAULT_MAX_KEYS,
};
use crate::metrics::{metrics_handler, metrics_middleware, Operation, S3GatewayMetrics};
use crate::multipart::UploadOptions;
use crate::store::backend::{ObjectRecord, DEFAULT_STORAGE_CLASS};
use crate::xml;
use crate::AppState;

/// Build the axum [`Router`] with all S3-compatible routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check endpoint (not part of S3 API).
        .route("/health", get(health_check))
        // Prometheus metrics endpoint.
        .route("/metrics", get(metrics_handler))
        // Per-operation success/failure counters as JSON.
        .route("/gateway/metrics", get(gateway_metrics))
        // Service-level: GET / -> ListS3Buckets
        .route("/", get(handle_get_service))
        .route(
            "/:bucket",
            get(handle_get_bucket)
                .put(handle_put_bucket)
                .delete(handle_delete_bucket)
                .head(handle_head_bucket),
        )
        // Object-level routes (wildcard key captures slashes)
        .route(
            "/:bucket/*key",
            get(handle_get_object)
                .put(handle_put_object)
                .delete(handle_delete_object)
                .head(handle_head_object)
                .post(handle_post_object),
        )
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        // Object bodies are unbounded here; max_object_size is enforced by the endpoint.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-amz-request-id`, `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses carry their own request id.
    if !headers.contains_key("x-amz-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("S3Gateway"));

    response
}

// -- Infrastructure endpoints -------------------------------------------------

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn gateway_metrics(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, u64>> {
    Json(state.metrics.snapshot())
}

// -- Request helpers ----------------------------------------------------------

/// Parse a raw query string into a map, percent-decoding keys and values.
/// Flags without a value (`?acl`) map to an empty string.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let decode = |s: &str| {
        percent_encoding::percent_decode_str(&s.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned()
    };

    raw.as_deref()
        .unwrap_or("")
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(part), String::new()),
        })
        .collect()
}

/// Parse an optional numeric query parameter.
fn query_number<T: FromStr>(
    query: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, S3Error> {
    query
        .get(name)
        .map(|v| {
            v.parse::<T>().map_err(|_| S3Error::InvalidArgument {
                message: format!("Invalid value for {name}: {v}"),
            })
        })
        .transpose()
}

/// Count a request rejected while decoding it, before it reached an endpoint.
fn reject(metrics: &S3GatewayMetrics, op: Operation, err: S3Error) -> S3Error {
    metrics.inc_failure(op);
    tracing::debug!(operation = op.name(), code = err.code(), "request rejected");
    err
}

fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [("content-type", "application/xml")], body).into_response()
}

fn list_params(query: &HashMap<String, String>) -> Result<ListObjectsParams, S3Error> {
    let version = if query.get("list-type").is_some_and(|v| v == "2") {
        ListVersion::V2
    } else {
        ListVersion::V1
    };

    let (marker, continuation_token) = match version {
        ListVersion::V1 => (query.get("marker").cloned(), None),
        ListVersion::V2 => (
            query.get("start-after").cloned(),
            query
                .get("continuation-token")
                .map(|t| xml::decode_continuation_token(t))
                .transpose()?,
        ),
    };

    Ok(ListObjectsParams {
        version,
        prefix: query.get("prefix").cloned().unwrap_or_default(),
        delimiter: query.get("delimiter").cloned().unwrap_or_default(),
        marker,
        continuation_token,
        max_keys: query_number(query, "max-keys")?.unwrap_or(DEFAULT_MAX_KEYS),
    })
}

/// Headers describing a stored object, shared by GET and HEAD.
fn insert_object_headers(hdrs: &mut HeaderMap, record: &ObjectRecord) {
    hdrs.insert(
        "content-type",
        HeaderValue::from_str(&record.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(etag) = HeaderValue::from_str(&record.etag) {
        hdrs.insert("etag", etag);
    }
    let last_modified = httpdate::fmt_http_date(SystemTime::from(record.last_modified));
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        hdrs.insert("last-modified", value);
    }
    hdrs.insert("accept-ranges", HeaderValue::from_static("bytes"));
    if record.storage_class != DEFAULT_STORAGE_CLASS {
        if let Ok(value) = HeaderValue::from_str(&record.storage_class) {
            hdrs.insert("x-amz-storage-class", value);
        }
    }

    for (name, value) in &record.user_metadata {
        if let (Ok(hname), Ok(hval)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            hdrs.insert(hname, hval);
        }
    }
}

fn etag_response(etag: &str) -> Response {
    let mut response = StatusCode::OK.into_response();
    if let Ok(value) = HeaderValue::from_str(etag) {
        response.headers_mut().insert("etag", value);
    }
    response
}

// -- Service ------------------------------------------------------------------

async fn handle_get_service(State(state): State<Arc<AppState>>) -> Result<Response, S3Error> {
    let list = state.root.get().await?;
    Ok(xml_response(
        StatusCode::OK,
        xml::render_list_buckets_result(&list.owner, &list.buckets),
    ))
}

// -- Buckets ------------------------------------------------------------------

async fn handle_get_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    let request = if query.contains_key("acl") {
        GetBucketRequest::Acl
    } else {
        let params =
            list_params(&query).map_err(|e| reject(&state.metrics, Operation::GetBucket, e))?;
        GetBucketRequest::ListObjects(params)
    };

    let body = match state.buckets.get(&bucket, request).await? {
        GetBucketResponse::Listing(listing) => xml::render_list_objects_result(&listing),
        GetBucketResponse::Acl(acl) => xml::render_access_control_policy(&acl),
    };
    Ok(xml_response(StatusCode::OK, body))
}

async fn handle_put_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    // A CreateBucket body is a location constraint, never an ACL.
    let request = if query.contains_key("acl") {
        let acl = resolve_acl(&headers, &body, &state.owner)
            .map_err(|e| reject(&state.metrics, Operation::PutAcl, e))?;
        PutBucketRequest::PutAcl { acl }
    } else {
        let acl = resolve_acl(&headers, &[], &state.owner)
            .map_err(|e| reject(&state.metrics, Operation::CreateBucket, e))?;
        PutBucketRequest::Create { acl }
    };

    match state.buckets.put(&bucket, request).await? {
        PutBucketResponse::Created { location } => {
            Ok((StatusCode::OK, [("location", location)]).into_response())
        }
        PutBucketResponse::AclUpdated => Ok(StatusCode::OK.into_response()),
    }
}

async fn handle_delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, S3Error> {
    state.buckets.delete(&bucket).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_head_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Response {
    match state.buckets.head(&bucket).await {
        Ok(_) => (
            StatusCode::OK,
            [("x-amz-bucket-region", state.config.server.region.clone())],
        )
            .into_response(),
        Err(e) => e.into_status_response(),
    }
}

// -- Objects ------------------------------------------------------------------

async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    let request = match query.get("uploadId") {
        Some(upload_id) => {
            let numbers = query_number::<usize>(&query, "max-parts").and_then(|max_parts| {
                Ok((max_parts, query_number::<u32>(&query, "part-number-marker")?))
            });
            let (max_parts, marker) =
                numbers.map_err(|e| reject(&state.metrics, Operation::ListParts, e))?;
            GetObjectRequest::ListParts {
                upload_id: upload_id.clone(),
                max_parts: max_parts.unwrap_or(state.config.multipart.max_parts),
                part_number_marker: marker.unwrap_or(0),
            }
        }
        // An unparseable Range header is ignored and the whole object served.
        None => GetObjectRequest::Content {
            range: header_str(&headers, "range").and_then(ByteRange::parse),
        },
    };

    match state.objects.get(&bucket, &key, request).await? {
        GetObjectResponse::Content(content) => {
            let total = content.record.size;
            let status = if content.range.is_some() {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            let mut response = (status, content.body).into_response();
            let hdrs = response.headers_mut();
            insert_object_headers(hdrs, &content.record);
            if let Some((start, end)) = content.range {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")) {
                    hdrs.insert("content-range", value);
                }
            }
            Ok(response)
        }
        GetObjectResponse::Parts(listing) => Ok(xml_response(
            StatusCode::OK,
            xml::render_list_parts_result(&listing, &state.owner),
        )),
    }
}

async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    let storage_class = header_str(&headers, "x-amz-storage-class").map(str::to_string);

    let request = if let Some(upload_id) = query.get("uploadId") {
        // UploadPartCopy is not supported.
        if headers.contains_key("x-amz-copy-source") {
            return Err(reject(
                &state.metrics,
                Operation::CreateMultipartKey,
                S3Error::NotImplemented,
            ));
        }
        let part_number = query
            .get("partNumber")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                reject(
                    &state.metrics,
                    Operation::CreateMultipartKey,
                    S3Error::InvalidArgument {
                        message: "Part number must be an integer between 1 and 10000, inclusive"
                            .to_string(),
                    },
                )
            })?;
        PutObjectRequest::MultipartPart {
            upload_id: upload_id.clone(),
            part_number,
            body,
        }
    } else if let Some(raw) = header_str(&headers, "x-amz-copy-source") {
        let source = CopySource::parse(raw)
            .map_err(|e| reject(&state.metrics, Operation::CopyObject, e))?;
        PutObjectRequest::Copy {
            source,
            storage_class,
        }
    } else {
        PutObjectRequest::Plain {
            body,
            storage_class,
            content_type: header_str(&headers, "content-type").map(str::to_string),
            user_metadata: extract_user_metadata(&headers),
        }
    };

    match state.objects.put(&bucket, &key, request).await? {
        PutObjectResponse::Created(record) => Ok(etag_response(&record.etag)),
        PutObjectResponse::Part(part) => Ok(etag_response(&part.etag)),
        PutObjectResponse::Copied(record) => Ok(xml_response(
            StatusCode::OK,
            xml::render_copy_object_result(&record),
        )),
    }
}

async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    let request = match query.get("uploadId") {
        Some(upload_id) => DeleteObjectRequest::AbortUpload {
            upload_id: upload_id.clone(),
        },
        None => DeleteObjectRequest::Key,
    };
    state.objects.delete(&bucket, &key, request).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    match state.objects.head(&bucket, &key).await {
        Ok(record) => {
            let mut response = StatusCode::OK.into_response();
            let hdrs = response.headers_mut();
            insert_object_headers(hdrs, &record);
            hdrs.insert("content-length", HeaderValue::from(record.size));
            response
        }
        Err(e) => e.into_status_response(),
    }
}

async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    if query.contains_key("uploads") {
        let defaults = UploadOptions::default();
        let options = UploadOptions {
            storage_class: header_str(&headers, "x-amz-storage-class")
                .map_or(defaults.storage_class, str::to_string),
            content_type: header_str(&headers, "content-type")
                .map_or(defaults.content_type, str::to_string),
            user_metadata: extract_user_metadata(&headers),
        };
        let upload = state
            .objects
            .initialize_multipart_upload(&bucket, &key, options)
            .await?;
        Ok(xml_response(
            StatusCode::OK,
            xml::render_initiate_multipart_upload_result(&bucket, &key, &upload.upload_id),
        ))
    } else if let Some(upload_id) = query.get("uploadId") {
        let parts = xml::parse_complete_multipart_upload(&body)
            .map_err(|e| reject(&state.metrics, Operation::CompleteMultiPartUpload, e))?;
        let done = state
            .objects
            .complete_multipart_upload(&bucket, &key, upload_id, &parts)
            .await?;
        Ok(xml_response(
            StatusCode::OK,
            xml::render_complete_multipart_upload_result(
                &format!("/{bucket}/{key}"),
                &done.bucket,
                &done.key,
                &done.etag,
            ),
        ))
    } else {
        Err(S3Error::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::store::compute_etag;

    #[test]
    fn test_parse_query_flags_and_values() {
        let query = parse_query(Some("acl&prefix=a%2Fb&max-keys=5".to_string()));
        assert_eq!(query.get("acl").map(String::as_str), Some(""));
        assert_eq!(query.get("prefix").map(String::as_str), Some("a/b"));
        assert_eq!(query.get("max-keys").map(String::as_str), Some("5"));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_list_params_v1_uses_marker() {
        let query = parse_query(Some("marker=k1&start-after=k9".to_string()));
        let params = list_params(&query).unwrap();
        assert_eq!(params.version, ListVersion::V1);
        assert_eq!(params.marker.as_deref(), Some("k1"));
        assert_eq!(params.continuation_token, None);
        assert_eq!(params.max_keys, DEFAULT_MAX_KEYS);
    }

    #[test]
    fn test_list_params_v2_decodes_token() {
        let token = xml::encode_continuation_token("photos/2024");
        let query = parse_query(Some(format!(
            "list-type=2&start-after=a&continuation-token={token}&max-keys=2"
        )));
        let params = list_params(&query).unwrap();
        assert_eq!(params.version, ListVersion::V2);
        assert_eq!(params.marker.as_deref(), Some("a"));
        assert_eq!(params.continuation_token.as_deref(), Some("photos/2024"));
        assert_eq!(params.max_keys, 2);
    }

    #[test]
    fn test_list_params_bad_max_keys() {
        let query = parse_query(Some("max-keys=lots".to_string()));
        let err = list_params(&query).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[test]
    fn test_reject_counts_failure() {
        let metrics = S3GatewayMetrics::new();
        let err = reject(&metrics, Operation::CopyObject, S3Error::MalformedXML);
        assert_eq!(err.code(), "MalformedXML");
        assert_eq!(metrics.failure(Operation::CopyObject), 1);
        assert_eq!(metrics.success(Operation::CopyObject), 0);
    }

    // -- Router ------------------------------------------------------------------

    fn gateway() -> (Arc<AppState>, Router) {
        let state = Arc::new(AppState::new(Config::default()));
        (state.clone(), app(state))
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn call(app: &Router, method: &str, uri: &str, body: impl Into<Body>) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap();
        send(app, request).await
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Text of the first `<tag>` element in an XML body.
    fn xml_text(body: &str, tag: &str) -> Option<String> {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let start = body.find(&open)? + open.len();
        let end = body[start..].find(&close)? + start;
        Some(body[start..end].to_string())
    }

    async fn create_bucket(app: &Router, bucket: &str) {
        let response = call(app, "PUT", &format!("/{bucket}"), Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = gateway();
        let response = call(&app, "GET", "/health", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "server"), Some("S3Gateway"));
        assert!(header(&response, "x-amz-request-id").is_some());
    }

    #[tokio::test]
    async fn test_create_and_list_buckets() {
        let (_, app) = gateway();
        let response = call(&app, "PUT", "/photos", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "location"), Some("/photos"));

        let response = call(&app, "GET", "/", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("<ListAllMyBucketsResult"));
        assert_eq!(xml_text(&body, "Name").as_deref(), Some("photos"));

        let response = call(&app, "PUT", "/photos", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "Code").as_deref(), Some("BucketAlreadyExists"));
    }

    #[tokio::test]
    async fn test_invalid_bucket_name() {
        let (state, app) = gateway();
        let response = call(&app, "PUT", "/Bad_Bucket", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.metrics.failure(Operation::CreateBucket), 1);
    }

    #[tokio::test]
    async fn test_object_lifecycle() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;

        let request = Request::builder()
            .method("PUT")
            .uri("/bucket/dir/k1")
            .header("content-type", "text/plain")
            .header("x-amz-meta-color", "blue")
            .body(Body::from("0123456789"))
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let etag = compute_etag(b"0123456789");
        assert_eq!(header(&response, "etag"), Some(etag.as_str()));

        let response = call(&app, "HEAD", "/bucket/dir/k1", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "content-length"), Some("10"));
        assert_eq!(header(&response, "x-amz-meta-color"), Some("blue"));
        assert!(header(&response, "last-modified").is_some());

        let response = call(&app, "GET", "/bucket/dir/k1", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "content-type"), Some("text/plain"));
        assert_eq!(body_string(response).await, "0123456789");

        let response = call(&app, "DELETE", "/bucket/dir/k1", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = call(&app, "GET", "/bucket/dir/k1", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "Code").as_deref(), Some("NoSuchKey"));

        let response = call(&app, "HEAD", "/bucket/dir/k1", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.is_empty());

        assert_eq!(state.metrics.get("CreateKeySuccess"), Some(1));
        assert_eq!(state.metrics.get("HeadKeySuccess"), Some(1));
        assert_eq!(state.metrics.get("HeadKeyFailure"), Some(1));
        assert_eq!(state.metrics.get("GetKeySuccess"), Some(1));
        assert_eq!(state.metrics.get("GetKeyFailure"), Some(1));
        assert_eq!(state.metrics.get("DeleteKeySuccess"), Some(1));
    }

    #[tokio::test]
    async fn test_range_requests() {
        let (_, app) = gateway();
        create_bucket(&app, "bucket").await;
        call(&app, "PUT", "/bucket/k1", "0123456789").await;

        let request = Request::builder()
            .uri("/bucket/k1")
            .header("range", "bytes=0-3")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 0-3/10"));
        assert_eq!(body_string(response).await, "0123");

        let request = Request::builder()
            .uri("/bucket/k1")
            .header("range", "bytes=-2")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_string(response).await, "89");

        let request = Request::builder()
            .uri("/bucket/k1")
            .header("range", "bytes=50-60")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_copy_object() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;
        call(&app, "PUT", "/bucket/src", "payload").await;

        let request = Request::builder()
            .method("PUT")
            .uri("/bucket/dst")
            .header("x-amz-copy-source", "/bucket/src")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("<CopyObjectResult"));

        let response = call(&app, "GET", "/bucket/dst", Body::empty()).await;
        assert_eq!(body_string(response).await, "payload");

        let request = Request::builder()
            .method("PUT")
            .uri("/bucket/src")
            .header("x-amz-copy-source", "bucket/src")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "Code").as_deref(), Some("InvalidRequest"));

        assert_eq!(state.metrics.success(Operation::CopyObject), 1);
        assert_eq!(state.metrics.failure(Operation::CopyObject), 1);
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;

        let response = call(&app, "POST", "/bucket/k2?uploads", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let upload_id = xml_text(&body, "UploadId").unwrap();

        for (n, data) in [(2, "BB"), (1, "AAAA")] {
            let uri = format!("/bucket/k2?partNumber={n}&uploadId={upload_id}");
            let response = call(&app, "PUT", &uri, data).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header(&response, "etag").is_some());
        }

        let response = call(
            &app,
            "GET",
            &format!("/bucket/k2?uploadId={upload_id}&max-parts=1"),
            Body::empty(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "IsTruncated").as_deref(), Some("true"));
        assert_eq!(xml_text(&body, "PartNumber").as_deref(), Some("1"));

        let complete = "<CompleteMultipartUpload>\
            <Part><PartNumber>1</PartNumber></Part>\
            <Part><PartNumber>2</PartNumber></Part>\
            </CompleteMultipartUpload>";
        let uri = format!("/bucket/k2?uploadId={upload_id}");
        let response = call(&app, "POST", &uri, complete).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("<CompleteMultipartUploadResult"));

        let response = call(&app, "GET", "/bucket/k2", Body::empty()).await;
        assert_eq!(body_string(response).await, "AAAABB");

        let response = call(&app, "DELETE", &uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert_eq!(state.metrics.success(Operation::InitMultiPartUpload), 1);
        assert_eq!(state.metrics.success(Operation::CreateMultipartKey), 2);
        assert_eq!(state.metrics.success(Operation::ListParts), 1);
        assert_eq!(state.metrics.success(Operation::CompleteMultiPartUpload), 1);
        assert_eq!(state.metrics.failure(Operation::AbortMultiPartUpload), 1);
    }

    #[tokio::test]
    async fn test_malformed_complete_body() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;
        let response = call(&app, "POST", "/bucket/k?uploads", Body::empty()).await;
        let upload_id = xml_text(&body_string(response).await, "UploadId").unwrap();

        let uri = format!("/bucket/k?uploadId={upload_id}");
        let body = "<CompleteMultipartUpload><Part><ETag>x</ETag></Part></CompleteMultipartUpload>";
        let response = call(&app, "POST", &uri, body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "Code").as_deref(), Some("MalformedXML"));
        assert_eq!(state.metrics.failure(Operation::CompleteMultiPartUpload), 1);
    }

    #[tokio::test]
    async fn test_list_objects_v2_pagination() {
        let (_, app) = gateway();
        create_bucket(&app, "bucket").await;
        for key in ["a", "b", "c"] {
            call(&app, "PUT", &format!("/bucket/{key}"), "x").await;
        }

        let response = call(&app, "GET", "/bucket?list-type=2&max-keys=2", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "KeyCount").as_deref(), Some("2"));
        assert_eq!(xml_text(&body, "IsTruncated").as_deref(), Some("true"));
        let token = xml_text(&body, "NextContinuationToken").unwrap();

        let uri = format!("/bucket?list-type=2&continuation-token={token}");
        let response = call(&app, "GET", &uri, Body::empty()).await;
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "Key").as_deref(), Some("c"));
        assert_eq!(xml_text(&body, "IsTruncated").as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn test_bad_listing_parameter_counts_failure() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;
        let response = call(&app, "GET", "/bucket?max-keys=many", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.metrics.failure(Operation::GetBucket), 1);
        assert_eq!(state.metrics.success(Operation::GetBucket), 0);
    }

    #[tokio::test]
    async fn test_bucket_acl() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;

        let request = Request::builder()
            .method("PUT")
            .uri("/bucket?acl")
            .header("x-amz-acl", "public-read")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = call(&app, "GET", "/bucket?acl", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("<AccessControlPolicy"));
        assert!(body.contains("READ"));

        let response = call(&app, "PUT", "/bucket?acl", "<not-a-policy").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(state.metrics.success(Operation::PutAcl), 1);
        assert_eq!(state.metrics.failure(Operation::PutAcl), 1);
        assert_eq!(state.metrics.success(Operation::GetAcl), 1);
    }

    #[tokio::test]
    async fn test_head_and_delete_bucket() {
        let (_, app) = gateway();
        create_bucket(&app, "bucket").await;

        let response = call(&app, "HEAD", "/bucket", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-amz-bucket-region"), Some("us-east-1"));

        call(&app, "PUT", "/bucket/k", "x").await;
        let response = call(&app, "DELETE", "/bucket", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        call(&app, "DELETE", "/bucket/k", Body::empty()).await;
        let response = call(&app, "DELETE", "/bucket", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = call(&app, "HEAD", "/bucket", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gateway_metrics_json() {
        let (_, app) = gateway();
        create_bucket(&app, "bucket").await;
        call(&app, "PUT", "/missing/k", "x").await;

        let response = call(&app, "GET", "/gateway/metrics", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["CreateBucketSuccess"], 1);
        assert_eq!(json["CreateKeyFailure"], 1);
        assert_eq!(json["CreateKeySuccess"], 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_garbage_body() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;
        let response = call(&app, "POST", "/bucket/k?uploads", Body::empty()).await;
        let upload_id = xml_text(&body_string(response).await, "UploadId").unwrap();
        let uri = format!("/bucket/k?uploadId={upload_id}");
        let response = call(&app, "PUT", &format!("{uri}&partNumber=1"), "AAAA").await;
        assert_eq!(response.status(), StatusCode::OK);

        let bodies = [
            "garbage",
            "",
            "<Foo><Part><PartNumber>1</PartNumber></Part></Foo>",
            "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber></Part>",
            "<CompleteMultipartUpload></CompleteMultipartUpload>",
        ];
        for body in bodies {
            let response = call(&app, "POST", &uri, body).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body:?}");
            let body = body_string(response).await;
            assert_eq!(xml_text(&body, "Code").as_deref(), Some("MalformedXML"));
        }

        let response = call(&app, "GET", "/bucket/k", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.tracker.active_count(), 1);

        // The uploaded part is still there once a well-formed body arrives.
        let complete = "<CompleteMultipartUpload>\
            <Part><PartNumber>1</PartNumber></Part>\
            </CompleteMultipartUpload>";
        let response = call(&app, "POST", &uri, complete).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = call(&app, "GET", "/bucket/k", Body::empty()).await;
        assert_eq!(body_string(response).await, "AAAA");

        assert_eq!(
            state.metrics.failure(Operation::CompleteMultiPartUpload),
            bodies.len() as u64
        );
        assert_eq!(state.metrics.success(Operation::CompleteMultiPartUpload), 1);
    }

    #[tokio::test]
    async fn test_list_parts_zero_max_parts() {
        let (_, app) = gateway();
        create_bucket(&app, "bucket").await;
        let response = call(&app, "POST", "/bucket/k?uploads", Body::empty()).await;
        let upload_id = xml_text(&body_string(response).await, "UploadId").unwrap();
        for n in [1, 2] {
            let uri = format!("/bucket/k?partNumber={n}&uploadId={upload_id}");
            call(&app, "PUT", &uri, "x").await;
        }

        let uri = format!("/bucket/k?uploadId={upload_id}&max-parts=0");
        let response = call(&app, "GET", &uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "MaxParts").as_deref(), Some("1"));
        assert_eq!(xml_text(&body, "IsTruncated").as_deref(), Some("true"));
        assert_eq!(xml_text(&body, "NextPartNumberMarker").as_deref(), Some("1"));

        let uri = format!("/bucket/k?uploadId={upload_id}&max-parts=5000");
        let response = call(&app, "GET", &uri, Body::empty()).await;
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "MaxParts").as_deref(), Some("1000"));
        assert_eq!(xml_text(&body, "IsTruncated").as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn test_upload_part_copy_not_implemented() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;
        call(&app, "PUT", "/bucket/src", "payload").await;
        let response = call(&app, "POST", "/bucket/k?uploads", Body::empty()).await;
        let upload_id = xml_text(&body_string(response).await, "UploadId").unwrap();

        let request = Request::builder()
            .method("PUT")
            .uri(format!("/bucket/k?partNumber=1&uploadId={upload_id}"))
            .header("x-amz-copy-source", "/bucket/src")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = body_string(response).await;
        assert_eq!(xml_text(&body, "Code").as_deref(), Some("NotImplemented"));

        let uri = format!("/bucket/k?uploadId={upload_id}");
        let response = call(&app, "GET", &uri, Body::empty()).await;
        assert!(xml_text(&body_string(response).await, "Part").is_none());
        assert_eq!(state.metrics.failure(Operation::CreateMultipartKey), 1);
        assert_eq!(state.metrics.success(Operation::CreateMultipartKey), 0);
        assert_eq!(state.metrics.failure(Operation::CopyObject), 0);
    }

    #[tokio::test]
    async fn test_abort_under_another_key() {
        let (state, app) = gateway();
        create_bucket(&app, "bucket").await;
        create_bucket(&app, "other").await;
        let response = call(&app, "POST", "/bucket/k?uploads", Body::empty()).await;
        let upload_id = xml_text(&body_string(response).await, "UploadId").unwrap();
        call(&app, "PUT", &format!("/bucket/k?partNumber=1&uploadId={upload_id}"), "AAAA").await;

        for path in ["/bucket/other-key", "/other/k"] {
            let uri = format!("{path}?uploadId={upload_id}");
            let response = call(&app, "DELETE", &uri, Body::empty()).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body = body_string(response).await;
            assert_eq!(xml_text(&body, "Code").as_deref(), Some("NoSuchUpload"));
        }
        assert_eq!(state.tracker.active_count(), 1);

        let complete = "<CompleteMultipartUpload>\
            <Part><PartNumber>1</PartNumber></Part>\
            </CompleteMultipartUpload>";
        let response = call(&app, "POST", &format!("/bucket/k?uploadId={upload_id}"), complete).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.metrics.failure(Operation::AbortMultiPartUpload), 2);
    }

    #[tokio::test]
    async fn test_copy_survives_source_overwrite() {
        let (_, app) = gateway();
        create_bucket(&app, "bucket").await;
        call(&app, "PUT", "/bucket/src", "original").await;

        let request = Request::builder()
            .method("PUT")
            .uri("/bucket/dst")
            .header("x-amz-copy-source", "/bucket/src")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.status(), StatusCode::OK);

        call(&app, "PUT", "/bucket/src", "replaced").await;
        let response = call(&app, "GET", "/bucket/dst", Body::empty()).await;
        assert_eq!(body_string(response).await, "original");
        let response = call(&app, "GET", "/bucket/src", Body::empty()).await;
        assert_eq!(body_string(response).await, "replaced");
    }
}
