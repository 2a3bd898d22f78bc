//! s3gateway library: an S3-compatible gateway over a pluggable object store.
//!
//! The crate provides the S3 endpoint behavior (buckets, keys, copies and
//! multipart uploads), the per-operation success/failure counters, the
//! multipart upload tracker, an in-memory object store and the axum HTTP
//! adapter that binds it all to the wire.

use std::sync::Arc;

pub mod acl;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod multipart;
pub mod server;
pub mod store;
pub mod xml;

use crate::acl::Owner;
use crate::config::Config;
use crate::handlers::{BucketEndpoint, ObjectEndpoint, RootEndpoint};
use crate::metrics::S3GatewayMetrics;
use crate::multipart::MultipartUploadTracker;
use crate::store::{MemoryStore, ObjectStore};

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Owner of every bucket created through this gateway.
    pub owner: Owner,
    /// Success/failure counters for every S3 operation.
    pub metrics: Arc<S3GatewayMetrics>,
    pub tracker: Arc<MultipartUploadTracker>,
    pub root: RootEndpoint,
    pub buckets: BucketEndpoint,
    pub objects: ObjectEndpoint,
}

impl AppState {
    /// Build the gateway from configuration with a fresh in-memory store and
    /// a fresh counter registry.
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new(config.storage.max_size_bytes));
        Self::with_parts(config, store, Arc::new(S3GatewayMetrics::new()))
    }

    /// Build the gateway around an existing store and counter registry.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn ObjectStore>,
        metrics: Arc<S3GatewayMetrics>,
    ) -> Self {
        let owner = Owner::from(&config.owner);
        let tracker = Arc::new(MultipartUploadTracker::new(
            store.clone(),
            config.multipart.min_part_size,
        ));

        Self {
            root: RootEndpoint::new(store.clone(), metrics.clone(), owner.clone()),
            buckets: BucketEndpoint::new(
                store.clone(),
                tracker.clone(),
                metrics.clone(),
                owner.clone(),
            ),
            objects: ObjectEndpoint::new(
                store,
                tracker.clone(),
                metrics.clone(),
                config.server.max_object_size,
            ),
            config,
            owner,
            metrics,
            tracker,
        }
    }
}
