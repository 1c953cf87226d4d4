//! Single-flight lock for background jobs.
//!
//! A lock is a key with an expiration holding a token unique to its
//! holder. Releasing only succeeds for the current holder, so a job
//! whose lock already expired cannot free a lock taken by a newer run.

use crate::keys::KeyFactory;
use crate::storage::{Storage, StorageError};
use chrono::Utc;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock storage failure")]
    Storage(#[source] StorageError),
}

/// Proof of holding a lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockToken {
    name: String,
    value: String,
}

impl LockToken {
    pub fn new(name: &str, value: &str) -> Self {
        LockToken {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

pub trait ExportLock: Send + Sync {
    /// Takes the lock for `ttl`, or returns `None` if someone else
    /// holds it.
    fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Frees the lock if `token` still owns it. Returns whether it did.
    fn release(&self, token: &LockToken) -> Result<bool, LockError>;

    fn is_held(&self, name: &str) -> Result<bool, LockError>;
}

static TOKEN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_token_value() -> String {
    format!(
        "{}-{}-{}",
        process::id(),
        TOKEN_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        Utc::now().timestamp_millis()
    )
}

/// `ExportLock` on top of the counter store.
#[derive(Clone)]
pub struct StorageLock {
    storage: Arc<dyn Storage>,
    keys: KeyFactory,
}

impl StorageLock {
    pub fn new(storage: Arc<dyn Storage>, keys: KeyFactory) -> Self {
        StorageLock { storage, keys }
    }
}

impl ExportLock for StorageLock {
    fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let value = next_token_value();
        let acquired = self
            .storage
            .set_nx_ex(&self.keys.lock_key(name), &value, ttl)
            .map_err(LockError::Storage)?;
        Ok(acquired.then(|| LockToken::new(name, &value)))
    }

    fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        self.storage
            .delete_if_equals(&self.keys.lock_key(&token.name), &token.value)
            .map_err(LockError::Storage)
    }

    fn is_held(&self, name: &str) -> Result<bool, LockError> {
        Ok(self
            .storage
            .get(&self.keys.lock_key(name))
            .map_err(LockError::Storage)?
            .is_some())
    }
}
