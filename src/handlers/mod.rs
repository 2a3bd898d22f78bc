//! S3 endpoint behavior.
//!
//! Each endpoint validates its inputs, calls the object store and/or the
//! multipart tracker, and bumps exactly one success or failure counter per
//! call.  Endpoints return typed descriptors; the HTTP layer in
//! [`crate::server`] turns those into responses.
//!
//! Requests that share an HTTP method but mean different operations arrive
//! as tagged variants, decided once by the router.

pub mod bucket;
pub mod object;
pub mod root;

use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::acl::Acl;
use crate::errors::{ErrorClass, S3Error};
use crate::metrics::{Operation, S3GatewayMetrics};
use crate::store::backend::ObjectRecord;

pub use bucket::BucketEndpoint;
pub use object::{ByteRange, ObjectEndpoint};
pub use root::RootEndpoint;

/// Default and maximum page size for key listings.
pub const DEFAULT_MAX_KEYS: usize = 1000;

/// Longest accepted object key, in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

// -- Bucket requests ----------------------------------------------------------

/// ListObjects dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListVersion {
    #[default]
    V1,
    V2,
}

/// Parameters of a ListObjects request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectsParams {
    pub version: ListVersion,
    pub prefix: String,
    pub delimiter: String,
    /// `marker` (v1) or `start-after` (v2).
    pub marker: Option<String>,
    /// Decoded v2 continuation token, which takes precedence over `marker`.
    pub continuation_token: Option<String>,
    pub max_keys: usize,
}

impl Default for ListObjectsParams {
    fn default() -> Self {
        Self {
            version: ListVersion::V1,
            prefix: String::new(),
            delimiter: String::new(),
            marker: None,
            continuation_token: None,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetBucketRequest {
    ListObjects(ListObjectsParams),
    Acl,
}

/// `acl` is `None` when the request named no ACL at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutBucketRequest {
    Create { acl: Option<Acl> },
    PutAcl { acl: Option<Acl> },
}

// -- Bucket responses ---------------------------------------------------------

/// One page of a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectListing {
    pub bucket: String,
    pub params: ListObjectsParams,
    pub objects: Vec<ObjectRecord>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Where the next page starts, set only when truncated.
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GetBucketResponse {
    Listing(ObjectListing),
    Acl(Acl),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutBucketResponse {
    Created { location: String },
    AclUpdated,
}

// -- Object requests ----------------------------------------------------------

/// Source of a copy, from `x-amz-copy-source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub enum PutObjectRequest {
    Copy {
        source: CopySource,
        storage_class: Option<String>,
    },
    MultipartPart {
        upload_id: String,
        part_number: u32,
        body: Bytes,
    },
    Plain {
        body: Bytes,
        storage_class: Option<String>,
        content_type: Option<String>,
        user_metadata: BTreeMap<String, String>,
    },
}

impl PutObjectRequest {
    /// A plain upload of `body` with default attributes.
    pub fn plain(body: impl Into<Bytes>) -> Self {
        PutObjectRequest::Plain {
            body: body.into(),
            storage_class: None,
            content_type: None,
            user_metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetObjectRequest {
    Content {
        range: Option<ByteRange>,
    },
    ListParts {
        upload_id: String,
        max_parts: usize,
        part_number_marker: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteObjectRequest {
    Key,
    AbortUpload { upload_id: String },
}

// -- Object responses ---------------------------------------------------------

/// Object content, possibly a single byte range of it.
#[derive(Debug, Clone)]
pub struct ObjectContent {
    pub record: ObjectRecord,
    pub body: Bytes,
    /// Inclusive `(start, end)` when a range was served.
    pub range: Option<(u64, u64)>,
}

#[derive(Debug, Clone)]
pub enum PutObjectResponse {
    Created(ObjectRecord),
    Copied(ObjectRecord),
    Part(crate::store::backend::PartRecord),
}

#[derive(Debug, Clone)]
pub enum GetObjectResponse {
    Content(ObjectContent),
    Parts(crate::multipart::PartListing),
}

/// Count an operation's outcome and log failures.
pub(crate) fn observe<T>(
    metrics: &S3GatewayMetrics,
    op: Operation,
    outcome: Result<T, S3Error>,
) -> Result<T, S3Error> {
    metrics.record(op, &outcome);
    if let Err(e) = &outcome {
        match e.class() {
            ErrorClass::Internal => warn!(operation = op.name(), error = ?e, "backend failure"),
            _ => debug!(operation = op.name(), code = e.code(), "operation failed"),
        }
    }
    outcome
}
