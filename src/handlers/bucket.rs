//! Bucket-level endpoint.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::{
    observe, GetBucketRequest, GetBucketResponse, ListObjectsParams, ObjectListing,
    PutBucketRequest, PutBucketResponse, DEFAULT_MAX_KEYS,
};
use crate::acl::{Acl, Owner};
use crate::errors::S3Error;
use crate::metrics::{Operation, S3GatewayMetrics};
use crate::multipart::MultipartUploadTracker;
use crate::store::backend::{BucketRecord, ListKeysQuery, ObjectStore};

// -- Bucket name validation ---------------------------------------------------

/// Validate that a bucket name conforms to S3 naming rules.
///
/// Rules:
/// - 3-63 characters long
/// - Only lowercase letters, numbers, hyphens, and periods
/// - Must begin and end with a letter or number
/// - Cannot be formatted as an IP address (e.g., 192.168.5.4)
/// - Must not start with `xn--` or end with `-s3alias` or `--ol-s3`
pub fn validate_bucket_name(name: &str) -> Result<(), S3Error> {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    let valid = (3..=63).contains(&name.len())
        && name.chars().all(|c| alnum(c) || c == '-' || c == '.')
        && name.starts_with(alnum)
        && name.ends_with(alnum)
        && !looks_like_ip(name)
        && !name.starts_with("xn--")
        && !name.ends_with("-s3alias")
        && !name.ends_with("--ol-s3");

    if valid {
        Ok(())
    } else {
        Err(S3Error::InvalidBucketName {
            name: name.to_string(),
        })
    }
}

/// Check whether a string looks like an IPv4 address (e.g., "192.168.5.4").
fn looks_like_ip(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok())
}

// -- Endpoint -----------------------------------------------------------------

/// Handles every operation addressed to `/{bucket}`.
pub struct BucketEndpoint {
    store: Arc<dyn ObjectStore>,
    tracker: Arc<MultipartUploadTracker>,
    metrics: Arc<S3GatewayMetrics>,
    owner: Owner,
}

impl BucketEndpoint {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tracker: Arc<MultipartUploadTracker>,
        metrics: Arc<S3GatewayMetrics>,
        owner: Owner,
    ) -> Self {
        Self {
            store,
            tracker,
            metrics,
            owner,
        }
    }

    /// HeadBucket.
    pub async fn head(&self, bucket: &str) -> Result<BucketRecord, S3Error> {
        debug!(bucket, "HeadBucket");
        let outcome = self.store.get_bucket(bucket).await.map_err(S3Error::from);
        observe(&self.metrics, Operation::HeadBucket, outcome)
    }

    /// GetBucket (object listing) or GetAcl depending on the variant.
    pub async fn get(
        &self,
        bucket: &str,
        request: GetBucketRequest,
    ) -> Result<GetBucketResponse, S3Error> {
        match request {
            GetBucketRequest::ListObjects(params) => {
                debug!(bucket, prefix = %params.prefix, "GetBucket");
                let outcome = self.list_objects(bucket, params).await;
                observe(&self.metrics, Operation::GetBucket, outcome)
                    .map(GetBucketResponse::Listing)
            }
            GetBucketRequest::Acl => {
                debug!(bucket, "GetAcl");
                let outcome = self
                    .store
                    .get_bucket(bucket)
                    .await
                    .map(|record| record.acl)
                    .map_err(S3Error::from);
                observe(&self.metrics, Operation::GetAcl, outcome).map(GetBucketResponse::Acl)
            }
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> Result<ObjectListing, S3Error> {
        let query = ListKeysQuery {
            prefix: params.prefix.clone(),
            delimiter: params.delimiter.clone(),
            start_after: params
                .continuation_token
                .clone()
                .or_else(|| params.marker.clone()),
            max_keys: params.max_keys.min(DEFAULT_MAX_KEYS),
        };
        let page = self.store.list_keys(bucket, query).await?;

        Ok(ObjectListing {
            bucket: bucket.to_string(),
            params,
            objects: page.objects,
            common_prefixes: page.common_prefixes,
            is_truncated: page.is_truncated,
            next_marker: page.next_marker,
        })
    }

    /// CreateBucket or PutAcl depending on the variant.
    pub async fn put(
        &self,
        bucket: &str,
        request: PutBucketRequest,
    ) -> Result<PutBucketResponse, S3Error> {
        match request {
            PutBucketRequest::Create { acl } => {
                debug!(bucket, "CreateBucket");
                let outcome = self.create(bucket, acl).await;
                observe(&self.metrics, Operation::CreateBucket, outcome)
            }
            PutBucketRequest::PutAcl { acl } => {
                debug!(bucket, "PutAcl");
                let acl = acl.unwrap_or_else(|| Acl::private(&self.owner));
                let outcome = self
                    .store
                    .put_bucket_acl(bucket, acl)
                    .await
                    .map(|()| PutBucketResponse::AclUpdated)
                    .map_err(S3Error::from);
                observe(&self.metrics, Operation::PutAcl, outcome)
            }
        }
    }

    async fn create(&self, bucket: &str, acl: Option<Acl>) -> Result<PutBucketResponse, S3Error> {
        validate_bucket_name(bucket)?;
        let record = BucketRecord {
            name: bucket.to_string(),
            owner: self.owner.clone(),
            created_at: Utc::now(),
            acl: acl.unwrap_or_else(|| Acl::private(&self.owner)),
        };
        self.store.create_bucket(record).await?;
        info!(bucket, "bucket created");
        Ok(PutBucketResponse::Created {
            location: format!("/{bucket}"),
        })
    }

    /// DeleteBucket.  A bucket with keys or in-flight uploads is not empty.
    pub async fn delete(&self, bucket: &str) -> Result<(), S3Error> {
        debug!(bucket, "DeleteBucket");
        let outcome = async {
            self.tracker.delete_bucket(bucket).await?;
            info!(bucket, "bucket deleted");
            Ok::<(), S3Error>(())
        }
        .await;
        observe(&self.metrics, Operation::DeleteBucket, outcome)
    }
}
