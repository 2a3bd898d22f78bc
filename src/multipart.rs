//! Multipart upload lifecycle.
//!
//! [`MultipartUploadTracker`] owns every in-flight upload, keyed by its
//! upload ID.  Each upload sits behind its own `tokio::sync::Mutex`, so
//! operations on one upload serialize while unrelated uploads proceed in
//! parallel.  The map itself is only touched to insert, look up or remove
//! an entry; no store I/O happens while a map shard is locked.
//!
//! An upload is usable only while [`UploadState::Active`].  Completing or
//! aborting it is terminal: the entry leaves the map and any caller that
//! already held a handle to it sees the terminal state and fails
//! `NoSuchUpload`.
//!
//! Starting an upload and deleting a bucket both go through the tracker and
//! are ordered by a tracker-wide gate: an upload is only registered while
//! its bucket exists, and a bucket is only deleted while it has no uploads.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use md5::{Digest, Md5};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::errors::S3Error;
use crate::store::backend::{ObjectStore, ObjectWrite, PartRecord, DEFAULT_STORAGE_CLASS};

/// Highest part number a client may use.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Default page size for part listings.
pub const DEFAULT_MAX_PARTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Active,
    Completed,
    Aborted,
}

/// Attributes fixed when an upload is initiated and applied to the final key.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub storage_class: String,
    pub content_type: String,
    pub user_metadata: BTreeMap<String, String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            content_type: "application/octet-stream".to_string(),
            user_metadata: BTreeMap::new(),
        }
    }
}

/// One in-flight upload.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub options: UploadOptions,
    pub initiated: DateTime<Utc>,
    /// Uploaded parts, ascending by part number.
    pub parts: BTreeMap<u32, PartRecord>,
    pub state: UploadState,
}

/// A part reference in a CompleteMultipartUpload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// ETag the client expects, quoted or not.
    pub etag: Option<String>,
}

/// Result of a successful completion.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
}

/// One page of a part listing.
#[derive(Debug, Clone)]
pub struct PartListing {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub storage_class: String,
    pub part_number_marker: u32,
    pub next_part_number_marker: u32,
    pub max_parts: usize,
    pub is_truncated: bool,
    pub parts: Vec<PartRecord>,
}

/// Summary of an in-flight upload, as listed per bucket.
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub upload_id: String,
    pub key: String,
    pub storage_class: String,
    pub initiated: DateTime<Utc>,
}

/// Tracks multipart uploads and drives their part data through the store.
pub struct MultipartUploadTracker {
    store: Arc<dyn ObjectStore>,
    uploads: DashMap<String, Arc<Mutex<MultipartUpload>>>,
    /// Minimum size of every part but the last.  0 disables the check.
    min_part_size: u64,
    /// Held shared while registering an upload, exclusively while deleting a bucket.
    bucket_gate: RwLock<()>,
}

impl MultipartUploadTracker {
    pub fn new(store: Arc<dyn ObjectStore>, min_part_size: u64) -> Self {
        Self {
            store,
            uploads: DashMap::new(),
            min_part_size,
            bucket_gate: RwLock::new(()),
        }
    }

    /// Start a new upload for `(bucket, key)` in an existing bucket.
    pub async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        options: UploadOptions,
    ) -> Result<MultipartUpload, S3Error> {
        let _gate = self.bucket_gate.read().await;
        self.store.get_bucket(bucket).await?;
        Ok(self.register(bucket, key, options))
    }

    /// Delete a bucket that holds no keys and no in-flight uploads.
    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        let _gate = self.bucket_gate.write().await;
        self.store.get_bucket(bucket).await?;
        if !self.list_uploads(bucket).await.is_empty() {
            return Err(S3Error::BucketNotEmpty {
                bucket: bucket.to_string(),
            });
        }
        self.store.delete_bucket(bucket).await?;
        Ok(())
    }

    fn register(&self, bucket: &str, key: &str, options: UploadOptions) -> MultipartUpload {
        let upload = MultipartUpload {
            upload_id: uuid::Uuid::new_v4().to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            options,
            initiated: Utc::now(),
            parts: BTreeMap::new(),
            state: UploadState::Active,
        };
        self.uploads.insert(
            upload.upload_id.clone(),
            Arc::new(Mutex::new(upload.clone())),
        );
        debug!(bucket, key, upload_id = %upload.upload_id, "multipart upload initiated");
        upload
    }

    /// Lock an upload, failing unless it is active and bound to `(bucket, key)`.
    async fn lock_active(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<OwnedMutexGuard<MultipartUpload>, S3Error> {
        let no_such_upload = || S3Error::NoSuchUpload {
            upload_id: upload_id.to_string(),
        };

        // Clone the handle so the shard lock is released before awaiting.
        let entry = self
            .uploads
            .get(upload_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(no_such_upload)?;

        let guard = entry.lock_owned().await;
        if guard.state != UploadState::Active || guard.bucket != bucket || guard.key != key {
            return Err(no_such_upload());
        }
        Ok(guard)
    }

    /// Store one part, replacing any earlier part with the same number.
    pub async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartRecord, S3Error> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(S3Error::InvalidArgument {
                message: format!(
                    "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
                ),
            });
        }

        let mut upload = self.lock_active(bucket, key, upload_id).await?;
        let record = self.store.put_part(upload_id, part_number, body).await?;
        upload.parts.insert(part_number, record.clone());
        Ok(record)
    }

    /// List parts with a number greater than `part_number_marker`.
    ///
    /// `max_parts` is clamped to `1..=DEFAULT_MAX_PARTS`.
    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        max_parts: usize,
        part_number_marker: u32,
    ) -> Result<PartListing, S3Error> {
        let upload = self.lock_active(bucket, key, upload_id).await?;
        let max_parts = max_parts.clamp(1, DEFAULT_MAX_PARTS);

        let mut remaining = upload
            .parts
            .range(part_number_marker.saturating_add(1)..)
            .map(|(_, p)| p.clone());
        let parts: Vec<PartRecord> = remaining.by_ref().take(max_parts).collect();
        let is_truncated = remaining.next().is_some();
        let next_part_number_marker = parts.last().map_or(part_number_marker, |p| p.part_number);

        Ok(PartListing {
            bucket: upload.bucket.clone(),
            key: upload.key.clone(),
            upload_id: upload.upload_id.clone(),
            storage_class: upload.options.storage_class.clone(),
            part_number_marker,
            next_part_number_marker,
            max_parts,
            is_truncated,
            parts,
        })
    }

    /// Assemble the listed parts into the target key and finish the upload.
    ///
    /// Part numbers must be strictly ascending and every part must have
    /// been uploaded (with a matching ETag when one is given).  An empty
    /// list is `MalformedXML`.  On any failure the upload stays active.
    pub async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        requested: &[CompletedPart],
    ) -> Result<CompletedUpload, S3Error> {
        let mut upload = self.lock_active(bucket, key, upload_id).await?;

        if requested.is_empty() {
            return Err(S3Error::MalformedXML);
        }
        if requested
            .windows(2)
            .any(|w| w[1].part_number <= w[0].part_number)
        {
            return Err(S3Error::InvalidPartOrder);
        }

        let mut selected: Vec<PartRecord> = Vec::with_capacity(requested.len());
        for req in requested {
            let part = upload
                .parts
                .get(&req.part_number)
                .ok_or(S3Error::InvalidPart {
                    part_number: req.part_number,
                })?;
            if let Some(etag) = &req.etag {
                if etag.trim_matches('"') != part.etag.trim_matches('"') {
                    return Err(S3Error::InvalidPart {
                        part_number: req.part_number,
                    });
                }
            }
            selected.push(part.clone());
        }

        if self.min_part_size > 0 {
            if let Some((_, leading)) = selected.split_last() {
                if leading.iter().any(|p| p.size < self.min_part_size) {
                    return Err(S3Error::EntityTooSmall);
                }
            }
        }

        let mut data = BytesMut::with_capacity(selected.iter().map(|p| p.size as usize).sum());
        for part in &selected {
            let chunk = self.store.get_part(upload_id, part.part_number).await?;
            data.extend_from_slice(&chunk);
        }

        let etag = composite_etag(&selected)?;
        let write = ObjectWrite {
            data: data.freeze(),
            storage_class: upload.options.storage_class.clone(),
            content_type: upload.options.content_type.clone(),
            user_metadata: upload.options.user_metadata.clone(),
            etag: Some(etag),
        };
        let record = self.store.put_key(bucket, key, write).await?;

        if let Err(e) = self.store.delete_parts(upload_id).await {
            warn!(upload_id, error = %e, "failed to free parts of completed upload");
        }

        upload.state = UploadState::Completed;
        self.uploads.remove(upload_id);
        debug!(bucket, key, upload_id, parts = selected.len(), "multipart upload completed");

        Ok(CompletedUpload {
            bucket: record.bucket,
            key: record.key,
            etag: record.etag,
            size: record.size,
        })
    }

    /// Discard an upload and its parts.  No object is created.
    pub async fn abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), S3Error> {
        let mut upload = self.lock_active(bucket, key, upload_id).await?;
        self.store.delete_parts(upload_id).await?;
        upload.state = UploadState::Aborted;
        self.uploads.remove(upload_id);
        debug!(bucket, key, upload_id, "multipart upload aborted");
        Ok(())
    }

    /// Active uploads of a bucket, ordered by key then initiation time.
    pub async fn list_uploads(&self, bucket: &str) -> Vec<UploadSummary> {
        let entries: Vec<Arc<Mutex<MultipartUpload>>> = self
            .uploads
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut out = Vec::new();
        for entry in entries {
            let upload = entry.lock().await;
            if upload.state == UploadState::Active && upload.bucket == bucket {
                out.push(UploadSummary {
                    upload_id: upload.upload_id.clone(),
                    key: upload.key.clone(),
                    storage_class: upload.options.storage_class.clone(),
                    initiated: upload.initiated,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
        out
    }

    /// Number of uploads currently tracked.
    pub fn active_count(&self) -> usize {
        self.uploads.len()
    }
}

/// ETag of a multipart object: MD5 over the binary MD5s of its parts,
/// suffixed with the part count.
fn composite_etag(parts: &[PartRecord]) -> Result<String, S3Error> {
    let mut hasher = Md5::new();
    for part in parts {
        let digest = hex::decode(part.etag.trim_matches('"')).map_err(anyhow::Error::from)?;
        hasher.update(&digest);
    }
    Ok(format!(
        "\"{}-{}\"",
        hex::encode(hasher.finalize()),
        parts.len()
    ))
}
