//! In-memory object store.
//!
//! Buckets, keys and multipart parts live in `tokio::sync::RwLock` maps.
//! Keys of a bucket are held in a `BTreeMap` so listings come out in
//! ascending key order.  A configurable limit (`max_size_bytes`) caps the
//! total number of stored bytes; exceeding it is a backend error.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::Utc;

use super::backend::{
    BucketRecord, ListKeysQuery, ListKeysResult, ObjectRecord, ObjectStore, ObjectWrite,
    PartRecord, StoreError, StoreFuture, StoredObject,
};
use super::compute_etag;
use crate::acl::Acl;

struct BucketEntry {
    record: BucketRecord,
    objects: BTreeMap<String, (Bytes, ObjectRecord)>,
}

/// In-memory object store.
pub struct MemoryStore {
    /// bucket name -> bucket record and its keys.
    buckets: tokio::sync::RwLock<HashMap<String, BucketEntry>>,
    /// "upload_id/part_number" -> (data, record).
    parts: tokio::sync::RwLock<HashMap<String, (Bytes, PartRecord)>>,
    /// Current total bytes stored (objects + parts).
    current_size: tokio::sync::RwLock<u64>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryStore {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            buckets: tokio::sync::RwLock::new(HashMap::new()),
            parts: tokio::sync::RwLock::new(HashMap::new()),
            current_size: tokio::sync::RwLock::new(0),
            max_size_bytes,
        }
    }

    fn part_key(upload_id: &str, part_number: u32) -> String {
        format!("{upload_id}/{part_number}")
    }

    // ── Memory accounting ──────────────────────────────────────────

    /// Fail if adding `additional` bytes would exceed the limit.
    async fn check_capacity(&self, additional: u64) -> anyhow::Result<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let current = *self.current_size.read().await;
        if current + additional > self.max_size_bytes {
            anyhow::bail!(
                "Memory limit exceeded: current={current}, additional={additional}, max={}",
                self.max_size_bytes
            );
        }
        Ok(())
    }

    async fn adjust_size(&self, delta: i64) {
        let mut size = self.current_size.write().await;
        if delta >= 0 {
            *size = size.saturating_add(delta as u64);
        } else {
            *size = size.saturating_sub(delta.unsigned_abs());
        }
    }

    /// Total bytes currently held.
    pub async fn size_bytes(&self) -> u64 {
        *self.current_size.read().await
    }
}

impl ObjectStore for MemoryStore {
    fn create_bucket(&self, record: BucketRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            if buckets.contains_key(&record.name) {
                return Err(StoreError::BucketAlreadyExists(record.name));
            }
            buckets.insert(
                record.name.clone(),
                BucketEntry {
                    record,
                    objects: BTreeMap::new(),
                },
            );
            Ok(())
        })
    }

    fn get_bucket(&self, bucket: &str) -> StoreFuture<'_, BucketRecord> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            buckets
                .get(&bucket)
                .map(|entry| entry.record.clone())
                .ok_or(StoreError::BucketNotFound(bucket))
        })
    }

    fn list_buckets(&self) -> StoreFuture<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let mut records: Vec<BucketRecord> =
                buckets.values().map(|entry| entry.record.clone()).collect();
            records.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(records)
        })
    }

    fn delete_bucket(&self, bucket: &str) -> StoreFuture<'_, ()> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            let is_empty = match buckets.get(&bucket) {
                Some(entry) => entry.objects.is_empty(),
                None => return Err(StoreError::BucketNotFound(bucket)),
            };
            if !is_empty {
                return Err(StoreError::BucketNotEmpty(bucket));
            }
            buckets.remove(&bucket);
            Ok(())
        })
    }

    fn put_bucket_acl(&self, bucket: &str, acl: Acl) -> StoreFuture<'_, ()> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            let entry = buckets
                .get_mut(&bucket)
                .ok_or(StoreError::BucketNotFound(bucket))?;
            entry.record.acl = acl;
            Ok(())
        })
    }

    fn put_key(&self, bucket: &str, key: &str, write: ObjectWrite) -> StoreFuture<'_, ObjectRecord> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let new_len = write.data.len() as u64;
            let old_len = {
                let buckets = self.buckets.read().await;
                let entry = buckets
                    .get(&bucket)
                    .ok_or_else(|| StoreError::BucketNotFound(bucket.clone()))?;
                entry.objects.get(&key).map(|(d, _)| d.len() as u64)
            };
            let delta = new_len as i64 - old_len.unwrap_or(0) as i64;
            if delta > 0 {
                self.check_capacity(delta as u64).await?;
            }

            let etag = write.etag.unwrap_or_else(|| compute_etag(&write.data));
            let record = ObjectRecord {
                bucket: bucket.clone(),
                key: key.clone(),
                size: new_len,
                etag,
                storage_class: write.storage_class,
                content_type: write.content_type,
                user_metadata: write.user_metadata,
                last_modified: Utc::now(),
            };

            {
                let mut buckets = self.buckets.write().await;
                // The bucket may have been deleted while the lock was released.
                let entry = buckets
                    .get_mut(&bucket)
                    .ok_or(StoreError::BucketNotFound(bucket))?;
                entry.objects.insert(key, (write.data, record.clone()));
            }

            self.adjust_size(delta).await;
            Ok(record)
        })
    }

    fn get_key(&self, bucket: &str, key: &str) -> StoreFuture<'_, StoredObject> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets
                .get(&bucket)
                .ok_or(StoreError::BucketNotFound(bucket))?;
            let (data, record) = entry
                .objects
                .get(&key)
                .ok_or(StoreError::KeyNotFound(key))?;
            Ok(StoredObject {
                record: record.clone(),
                data: data.clone(),
            })
        })
    }

    fn head_key(&self, bucket: &str, key: &str) -> StoreFuture<'_, ObjectRecord> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets
                .get(&bucket)
                .ok_or(StoreError::BucketNotFound(bucket))?;
            entry
                .objects
                .get(&key)
                .map(|(_, record)| record.clone())
                .ok_or(StoreError::KeyNotFound(key))
        })
    }

    fn delete_key(&self, bucket: &str, key: &str) -> StoreFuture<'_, bool> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let removed = {
                let mut buckets = self.buckets.write().await;
                let entry = buckets
                    .get_mut(&bucket)
                    .ok_or(StoreError::BucketNotFound(bucket))?;
                entry.objects.remove(&key)
            };
            match removed {
                Some((data, _)) => {
                    self.adjust_size(-(data.len() as i64)).await;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn list_keys(&self, bucket: &str, query: ListKeysQuery) -> StoreFuture<'_, ListKeysResult> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets
                .get(&bucket)
                .ok_or(StoreError::BucketNotFound(bucket))?;

            let mut result = ListKeysResult::default();
            if query.max_keys == 0 {
                return Ok(result);
            }

            let start_after = query.start_after.as_deref().unwrap_or("");
            let mut emitted = 0usize;
            let mut last_emitted: Option<String> = None;

            for (key, (_, record)) in entry.objects.iter() {
                if key.as_str() <= start_after || !key.starts_with(&query.prefix) {
                    continue;
                }

                let common_prefix = if query.delimiter.is_empty() {
                    None
                } else {
                    let rest = &key[query.prefix.len()..];
                    rest.find(&query.delimiter).map(|idx| {
                        format!(
                            "{}{}",
                            query.prefix,
                            &rest[..idx + query.delimiter.len()]
                        )
                    })
                };

                // A prefix already rolled up (on this page or as the marker)
                // absorbs every key under it.
                if let Some(cp) = &common_prefix {
                    if last_emitted.as_deref() == Some(cp.as_str()) || cp == start_after {
                        continue;
                    }
                }

                if emitted == query.max_keys {
                    result.is_truncated = true;
                    result.next_marker = last_emitted;
                    return Ok(result);
                }

                match common_prefix {
                    Some(cp) => {
                        last_emitted = Some(cp.clone());
                        result.common_prefixes.push(cp);
                    }
                    None => {
                        last_emitted = Some(key.clone());
                        result.objects.push(record.clone());
                    }
                }
                emitted += 1;
            }

            Ok(result)
        })
    }

    fn put_part(&self, upload_id: &str, part_number: u32, data: Bytes) -> StoreFuture<'_, PartRecord> {
        let part_key = Self::part_key(upload_id, part_number);
        Box::pin(async move {
            let new_len = data.len() as u64;
            let old_len = {
                let parts = self.parts.read().await;
                parts.get(&part_key).map(|(d, _)| d.len() as u64)
            };
            let delta = new_len as i64 - old_len.unwrap_or(0) as i64;
            if delta > 0 {
                self.check_capacity(delta as u64).await?;
            }

            let record = PartRecord {
                part_number,
                size: new_len,
                etag: compute_etag(&data),
                last_modified: Utc::now(),
            };

            {
                let mut parts = self.parts.write().await;
                parts.insert(part_key, (data, record.clone()));
            }

            self.adjust_size(delta).await;
            Ok(record)
        })
    }

    fn get_part(&self, upload_id: &str, part_number: u32) -> StoreFuture<'_, Bytes> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let parts = self.parts.read().await;
            parts
                .get(&Self::part_key(&upload_id, part_number))
                .map(|(data, _)| data.clone())
                .ok_or(StoreError::PartNotFound {
                    upload_id,
                    part_number,
                })
        })
    }

    fn delete_parts(&self, upload_id: &str) -> StoreFuture<'_, ()> {
        let prefix = format!("{upload_id}/");
        Box::pin(async move {
            let freed: u64 = {
                let mut parts = self.parts.write().await;
                let keys: Vec<String> = parts
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect();
                keys.iter()
                    .filter_map(|k| parts.remove(k))
                    .map(|(data, _)| data.len() as u64)
                    .sum()
            };
            self.adjust_size(-(freed as i64)).await;
            Ok(())
        })
    }
}
