//! Object store abstraction and implementations.

pub mod backend;
pub mod memory;

pub use backend::{ObjectStore, StoreError};
pub use memory::MemoryStore;

use md5::{Digest, Md5};

/// Compute the quoted MD5-hex ETag for a byte slice.
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}
