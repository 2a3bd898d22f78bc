//! Service-level endpoint (`GET /`).

use std::sync::Arc;

use tracing::debug;

use super::observe;
use crate::acl::Owner;
use crate::errors::S3Error;
use crate::metrics::{Operation, S3GatewayMetrics};
use crate::store::backend::{BucketRecord, ObjectStore};

/// All buckets visible to the gateway owner.
#[derive(Debug, Clone)]
pub struct BucketList {
    pub owner: Owner,
    /// Sorted by name.
    pub buckets: Vec<BucketRecord>,
}

pub struct RootEndpoint {
    store: Arc<dyn ObjectStore>,
    metrics: Arc<S3GatewayMetrics>,
    owner: Owner,
}

impl RootEndpoint {
    pub fn new(store: Arc<dyn ObjectStore>, metrics: Arc<S3GatewayMetrics>, owner: Owner) -> Self {
        Self {
            store,
            metrics,
            owner,
        }
    }

    /// ListS3Buckets.
    pub async fn get(&self) -> Result<BucketList, S3Error> {
        debug!("ListS3Buckets");
        let outcome = self
            .store
            .list_buckets()
            .await
            .map(|buckets| BucketList {
                owner: self.owner.clone(),
                buckets,
            })
            .map_err(S3Error::from);
        observe(&self.metrics, Operation::ListS3Buckets, outcome)
    }
}
