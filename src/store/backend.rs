//! Abstract object store trait.
//!
//! Every store must implement [`ObjectStore`].  The gateway endpoints only
//! talk to this trait, so a store can be swapped without touching request
//! handling.  Failures are reported as [`StoreError`], which converts into
//! exactly one S3 error kind.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::acl::{Acl, Owner};

/// Boxed future returned by every [`ObjectStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Storage class applied when the client does not name one.
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Failures reported by an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("part {part_number} of upload {upload_id} not found")]
    PartNotFound { upload_id: String, part_number: u32 },

    /// Any other backend failure (I/O, capacity, timeouts).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A bucket as held by the store.
#[derive(Debug, Clone)]
pub struct BucketRecord {
    pub name: String,
    pub owner: Owner,
    pub created_at: DateTime<Utc>,
    pub acl: Acl,
}

/// Metadata of a stored key.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Quoted ETag.
    pub etag: String,
    pub storage_class: String,
    pub content_type: String,
    pub user_metadata: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

/// A stored key's metadata plus its content.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub record: ObjectRecord,
    pub data: Bytes,
}

/// Everything needed to write a key.
#[derive(Debug, Clone)]
pub struct ObjectWrite {
    pub data: Bytes,
    pub storage_class: String,
    pub content_type: String,
    pub user_metadata: BTreeMap<String, String>,
    /// Precomputed ETag (multipart results); the store hashes `data` when absent.
    pub etag: Option<String>,
}

impl ObjectWrite {
    /// A plain write with default storage class and content type.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            content_type: "application/octet-stream".to_string(),
            user_metadata: BTreeMap::new(),
            etag: None,
        }
    }
}

/// Stored part of a multipart upload.
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub part_number: u32,
    pub size: u64,
    /// Quoted ETag.
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Parameters of a key listing.
#[derive(Debug, Clone, Default)]
pub struct ListKeysQuery {
    pub prefix: String,
    pub delimiter: String,
    /// Only keys strictly greater than this are returned.
    pub start_after: Option<String>,
    pub max_keys: usize,
}

/// One page of a key listing.
#[derive(Debug, Clone, Default)]
pub struct ListKeysResult {
    pub objects: Vec<ObjectRecord>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Last key or common prefix of this page, set when truncated.
    pub next_marker: Option<String>,
}

/// Async object store contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// Create a bucket; fails `BucketAlreadyExists` if the name is taken.
    fn create_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()>;

    fn get_bucket(&self, bucket: &str) -> StoreFuture<'_, BucketRecord>;

    /// All buckets, sorted by name.
    fn list_buckets(&self) -> StoreFuture<'_, Vec<BucketRecord>>;

    /// Delete an empty bucket.
    fn delete_bucket(&self, bucket: &str) -> StoreFuture<'_, ()>;

    fn put_bucket_acl(&self, bucket: &str, acl: Acl) -> StoreFuture<'_, ()>;

    /// Write (or overwrite) a key.
    fn put_key(&self, bucket: &str, key: &str, write: ObjectWrite) -> StoreFuture<'_, ObjectRecord>;

    fn get_key(&self, bucket: &str, key: &str) -> StoreFuture<'_, StoredObject>;

    fn head_key(&self, bucket: &str, key: &str) -> StoreFuture<'_, ObjectRecord>;

    /// Delete a key, returning whether it existed.
    fn delete_key(&self, bucket: &str, key: &str) -> StoreFuture<'_, bool>;

    /// List keys in ascending order.
    fn list_keys(&self, bucket: &str, query: ListKeysQuery) -> StoreFuture<'_, ListKeysResult>;

    /// Write one part of a multipart upload, replacing any earlier content.
    fn put_part(&self, upload_id: &str, part_number: u32, data: Bytes) -> StoreFuture<'_, PartRecord>;

    fn get_part(&self, upload_id: &str, part_number: u32) -> StoreFuture<'_, Bytes>;

    /// Free all part data of an upload.
    fn delete_parts(&self, upload_id: &str) -> StoreFuture<'_, ()>;
}
