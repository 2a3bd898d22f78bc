//! Object-level endpoint: keys, copies and multipart uploads.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use metrics::counter;
use tracing::debug;

use super::{
    observe, CopySource, DeleteObjectRequest, GetObjectRequest, GetObjectResponse, ObjectContent,
    PutObjectRequest, PutObjectResponse, MAX_KEY_LENGTH,
};
use crate::errors::S3Error;
use crate::metrics::{Operation, S3GatewayMetrics, BYTES_RECEIVED_TOTAL, BYTES_SENT_TOTAL};
use crate::multipart::{
    CompletedPart, CompletedUpload, MultipartUpload, MultipartUploadTracker, UploadOptions,
};
use crate::store::backend::{ObjectRecord, ObjectStore, ObjectWrite, DEFAULT_STORAGE_CLASS};

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a Range header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-
    StartOpen(u64),
    /// bytes=-N (last N bytes)
    Suffix(u64),
}

impl ByteRange {
    /// Parse a Range header value like "bytes=0-4", "bytes=5-", "bytes=-3".
    ///
    /// Anything else, including multi-range requests, yields `None` and the
    /// header is ignored.
    pub fn parse(range_str: &str) -> Option<Self> {
        let spec = range_str.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }

        if let Some(suffix) = spec.strip_prefix('-') {
            let n: u64 = suffix.parse().ok()?;
            (n > 0).then_some(ByteRange::Suffix(n))
        } else if let Some(start) = spec.strip_suffix('-') {
            Some(ByteRange::StartOpen(start.parse().ok()?))
        } else {
            let (start, end) = spec.split_once('-')?;
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            (start <= end).then_some(ByteRange::StartEnd(start, end))
        }
    }

    /// Resolve against a total length into inclusive `(start, end)`, or
    /// `None` if unsatisfiable.
    pub fn resolve(self, total: u64) -> Option<(u64, u64)> {
        if total == 0 {
            return None;
        }
        match self {
            ByteRange::StartEnd(start, end) => {
                (start < total).then(|| (start, end.min(total - 1)))
            }
            ByteRange::StartOpen(start) => (start < total).then(|| (start, total - 1)),
            ByteRange::Suffix(n) => Some((total.saturating_sub(n), total - 1)),
        }
    }
}

// -- Header helpers -----------------------------------------------------------

/// Collect `x-amz-meta-*` headers, names lowercased.
pub fn extract_user_metadata(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-amz-meta-"))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl CopySource {
    /// Parse an `x-amz-copy-source` value: `[/]bucket/key`, percent-encoded,
    /// optionally followed by `?versionId=...`.
    pub fn parse(raw: &str) -> Result<Self, S3Error> {
        let path = raw.split_once('?').map_or(raw, |(path, _)| path);
        let decoded = percent_encoding::percent_decode_str(path).decode_utf8_lossy();
        let (bucket, key) = decoded
            .trim_start_matches('/')
            .split_once('/')
            .filter(|(b, k)| !b.is_empty() && !k.is_empty())
            .ok_or_else(|| S3Error::InvalidArgument {
                message: format!("Invalid x-amz-copy-source: {raw}"),
            })?;
        Ok(CopySource {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

fn check_key_length(key: &str) -> Result<(), S3Error> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(S3Error::KeyTooLongError);
    }
    Ok(())
}

// -- Endpoint -----------------------------------------------------------------

/// Handles every operation addressed to `/{bucket}/{key}`.
pub struct ObjectEndpoint {
    store: Arc<dyn ObjectStore>,
    tracker: Arc<MultipartUploadTracker>,
    metrics: Arc<S3GatewayMetrics>,
    max_object_size: u64,
}

impl ObjectEndpoint {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tracker: Arc<MultipartUploadTracker>,
        metrics: Arc<S3GatewayMetrics>,
        max_object_size: u64,
    ) -> Self {
        Self {
            store,
            tracker,
            metrics,
            max_object_size,
        }
    }

    /// HeadKey.
    pub async fn head(&self, bucket: &str, key: &str) -> Result<ObjectRecord, S3Error> {
        debug!(bucket, key, "HeadKey");
        let outcome = self.store.head_key(bucket, key).await.map_err(S3Error::from);
        observe(&self.metrics, Operation::HeadKey, outcome)
    }

    /// CreateKey, CopyObject or CreateMultipartKey depending on the variant.
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        request: PutObjectRequest,
    ) -> Result<PutObjectResponse, S3Error> {
        match request {
            PutObjectRequest::Copy {
                source,
                storage_class,
            } => {
                debug!(bucket, key, src_bucket = %source.bucket, src_key = %source.key, "CopyObject");
                let outcome = self.copy(bucket, key, &source, storage_class).await;
                observe(&self.metrics, Operation::CopyObject, outcome).map(PutObjectResponse::Copied)
            }
            PutObjectRequest::MultipartPart {
                upload_id,
                part_number,
                body,
            } => {
                debug!(bucket, key, upload_id = %upload_id, part_number, "CreateMultipartKey");
                let len = body.len() as u64;
                let outcome = self
                    .tracker
                    .put_part(bucket, key, &upload_id, part_number, body)
                    .await;
                if outcome.is_ok() {
                    counter!(BYTES_RECEIVED_TOTAL).increment(len);
                }
                observe(&self.metrics, Operation::CreateMultipartKey, outcome)
                    .map(PutObjectResponse::Part)
            }
            PutObjectRequest::Plain {
                body,
                storage_class,
                content_type,
                user_metadata,
            } => {
                debug!(bucket, key, size = body.len(), "CreateKey");
                let write = ObjectWrite {
                    data: body,
                    storage_class: storage_class.unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
                    content_type: content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    user_metadata,
                    etag: None,
                };
                let outcome = self.create_key(bucket, key, write).await;
                observe(&self.metrics, Operation::CreateKey, outcome).map(PutObjectResponse::Created)
            }
        }
    }

    async fn create_key(
        &self,
        bucket: &str,
        key: &str,
        write: ObjectWrite,
    ) -> Result<ObjectRecord, S3Error> {
        check_key_length(key)?;
        let len = write.data.len() as u64;
        if len > self.max_object_size {
            return Err(S3Error::EntityTooLarge);
        }
        let record = self.store.put_key(bucket, key, write).await?;
        counter!(BYTES_RECEIVED_TOTAL).increment(len);
        Ok(record)
    }

    async fn copy(
        &self,
        bucket: &str,
        key: &str,
        source: &CopySource,
        storage_class: Option<String>,
    ) -> Result<ObjectRecord, S3Error> {
        // Rejected before touching the store, whatever else the request says.
        if source.bucket == bucket && source.key == key {
            return Err(S3Error::InvalidRequest {
                resource: format!("/{bucket}/{key}"),
            });
        }
        check_key_length(key)?;

        self.store.get_bucket(bucket).await?;
        let src = self.store.get_key(&source.bucket, &source.key).await?;

        let write = ObjectWrite {
            data: src.data,
            storage_class: storage_class.unwrap_or(src.record.storage_class),
            content_type: src.record.content_type,
            user_metadata: src.record.user_metadata,
            etag: None,
        };
        Ok(self.store.put_key(bucket, key, write).await?)
    }

    /// GetKey or ListParts depending on the variant.
    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        request: GetObjectRequest,
    ) -> Result<GetObjectResponse, S3Error> {
        match request {
            GetObjectRequest::Content { range } => {
                debug!(bucket, key, ?range, "GetKey");
                let outcome = self.get_content(bucket, key, range).await;
                observe(&self.metrics, Operation::GetKey, outcome).map(GetObjectResponse::Content)
            }
            GetObjectRequest::ListParts {
                upload_id,
                max_parts,
                part_number_marker,
            } => {
                debug!(bucket, key, upload_id = %upload_id, "ListParts");
                let outcome = self
                    .tracker
                    .list_parts(bucket, key, &upload_id, max_parts, part_number_marker)
                    .await;
                observe(&self.metrics, Operation::ListParts, outcome).map(GetObjectResponse::Parts)
            }
        }
    }

    async fn get_content(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectContent, S3Error> {
        let object = self.store.get_key(bucket, key).await?;

        let content = match range {
            None => ObjectContent {
                record: object.record,
                body: object.data,
                range: None,
            },
            Some(range) => {
                let (start, end) = range
                    .resolve(object.data.len() as u64)
                    .ok_or(S3Error::InvalidRange)?;
                ObjectContent {
                    body: object.data.slice(start as usize..=end as usize),
                    record: object.record,
                    range: Some((start, end)),
                }
            }
        };
        counter!(BYTES_SENT_TOTAL).increment(content.body.len() as u64);
        Ok(content)
    }

    /// DeleteKey or AbortMultiPartUpload depending on the variant.
    ///
    /// Deleting an absent key under an existing bucket succeeds.
    pub async fn delete(
        &self,
        bucket: &str,
        key: &str,
        request: DeleteObjectRequest,
    ) -> Result<(), S3Error> {
        match request {
            DeleteObjectRequest::Key => {
                debug!(bucket, key, "DeleteKey");
                let outcome = self
                    .store
                    .delete_key(bucket, key)
                    .await
                    .map(|_existed| ())
                    .map_err(S3Error::from);
                observe(&self.metrics, Operation::DeleteKey, outcome)
            }
            DeleteObjectRequest::AbortUpload { upload_id } => {
                debug!(bucket, key, upload_id = %upload_id, "AbortMultiPartUpload");
                let outcome = self.tracker.abort(bucket, key, &upload_id).await;
                observe(&self.metrics, Operation::AbortMultiPartUpload, outcome)
            }
        }
    }

    /// InitMultiPartUpload.
    pub async fn initialize_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: UploadOptions,
    ) -> Result<MultipartUpload, S3Error> {
        debug!(bucket, key, "InitMultiPartUpload");
        let outcome = async {
            check_key_length(key)?;
            self.tracker.initiate(bucket, key, options).await
        }
        .await;
        observe(&self.metrics, Operation::InitMultiPartUpload, outcome)
    }

    /// CompleteMultiPartUpload.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, S3Error> {
        debug!(bucket, key, upload_id, parts = parts.len(), "CompleteMultiPartUpload");
        let outcome = self.tracker.complete(bucket, key, upload_id, parts).await;
        observe(&self.metrics, Operation::CompleteMultiPartUpload, outcome)
    }
}
