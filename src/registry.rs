//! Change tracking for the export job.
//!
//! Every bucket with written counters owns a dirty set listing the
//! counter keys touched in it, and is listed in a sorted registry of
//! pending buckets until the export job has flushed it. All writes are
//! set unions, so any number of aggregators can mark buckets dirty
//! concurrently.

use crate::clock::BucketId;
use crate::keys::KeyFactory;
use crate::storage::{Storage, StorageError, WriteBatch};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Clone)]
pub struct ChangeRegistry {
    storage: Arc<dyn Storage>,
    keys: KeyFactory,
}

impl ChangeRegistry {
    pub fn new(storage: Arc<dyn Storage>, keys: KeyFactory) -> Self {
        ChangeRegistry { storage, keys }
    }

    /// Adds the dirty-set union and the registry insert for `bucket` to
    /// an existing batch, so they commit together with the counters.
    pub fn stage<I>(&self, batch: &mut WriteBatch, bucket: &BucketId, keys: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        batch
            .sadd(self.keys.dirty_key(bucket), keys)
            .zadd_nx(self.keys.pending_buckets_key(), bucket.score(), bucket.to_string());
    }

    /// Records `keys` as written in `bucket`.
    pub fn mark_dirty(&self, bucket: &BucketId, keys: &BTreeSet<String>) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        self.stage(&mut batch, bucket, keys.iter().cloned());
        self.storage.apply(&batch)
    }

    /// Buckets waiting for export, oldest first.
    pub fn pending_buckets(&self) -> Result<Vec<BucketId>, StorageError> {
        let members = self.storage.zrange(&self.keys.pending_buckets_key())?;
        Ok(members
            .into_iter()
            .filter_map(|(member, score)| {
                let bucket = BucketId::parse(&member);
                if bucket.is_none() {
                    event!(Level::WARN, member = %member, score, "Unparseable pending bucket ignored.");
                }
                bucket
            })
            .collect())
    }

    pub fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(self.storage.zrange(&self.keys.pending_buckets_key())?.len())
    }

    pub fn dirty_keys(&self, bucket: &BucketId) -> Result<BTreeSet<String>, StorageError> {
        self.storage.smembers(&self.keys.dirty_key(bucket))
    }

    /// Forgets the `exported` keys of `bucket`, given the values they
    /// were exported with (`None` for expired counters). A key whose
    /// counter changed since it was read stays dirty, and the bucket
    /// leaves the pending registry only once its dirty set is empty.
    pub fn clear(&self, bucket: &BucketId, exported: &BTreeMap<String, Option<i64>>) -> Result<(), StorageError> {
        let dirty_key = self.keys.dirty_key(bucket);
        let mut batch = WriteBatch::new();
        for (key, value) in exported {
            batch.srem_if_counter(dirty_key.clone(), key.clone(), *value);
        }
        batch.zrem_if_set_empty(self.keys.pending_buckets_key(), bucket.to_string(), dirty_key);
        self.storage.apply(&batch)?;
        event!(Level::DEBUG, bucket = %bucket, keys = exported.len(), "Bucket cleared.");
        Ok(())
    }

    /// Drops every dirty set and the pending registry. Counters are left
    /// untouched. Returns how many dirty sets were removed.
    pub fn purge_all(&self) -> Result<usize, StorageError> {
        let dirty_sets = self.storage.keys_with_prefix(&self.keys.dirty_prefix())?;
        let mut batch = WriteBatch::new();
        for key in &dirty_sets {
            batch.del(key.clone());
        }
        batch.del(self.keys.pending_buckets_key());
        self.storage.apply(&batch)?;
        event!(Level::INFO, buckets = dirty_sets.len(), "All buckets and dirty keys deleted.");
        Ok(dirty_sets.len())
    }
}
