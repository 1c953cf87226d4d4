//! Process-wide switch for stats aggregation.
//!
//! The flag lives in the store but is read at most once per process
//! until someone invalidates the cached copy. Share a single
//! `StatsToggle` (behind an `Arc`) between every aggregator of a process.

use crate::keys::KeyFactory;
use crate::storage::{Storage, StorageError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{event, Level};

const UNKNOWN: u8 = 0;
const DISABLED: u8 = 1;
const ENABLED: u8 = 2;

pub struct StatsToggle {
    storage: Arc<dyn Storage>,
    key: String,
    cached: AtomicU8,
}

impl StatsToggle {
    pub fn new(storage: Arc<dyn Storage>, keys: &KeyFactory) -> Self {
        StatsToggle {
            storage,
            key: keys.toggle_key(),
            cached: AtomicU8::new(UNKNOWN),
        }
    }

    /// Whether aggregation is on. A missing flag means disabled.
    pub fn enabled(&self) -> Result<bool, StorageError> {
        match self.cached.load(Ordering::Acquire) {
            ENABLED => Ok(true),
            DISABLED => Ok(false),
            _ => {
                let enabled = self.storage.get(&self.key)?.as_deref() == Some("1");
                self.cached
                    .store(if enabled { ENABLED } else { DISABLED }, Ordering::Release);
                Ok(enabled)
            }
        }
    }

    pub fn enable(&self) -> Result<(), StorageError> {
        self.storage.set(&self.key, "1")?;
        self.invalidate();
        event!(Level::INFO, "Stats aggregation enabled.");
        Ok(())
    }

    pub fn disable(&self) -> Result<(), StorageError> {
        self.storage.set(&self.key, "0")?;
        self.invalidate();
        event!(Level::INFO, "Stats aggregation disabled.");
        Ok(())
    }

    /// Drops the cached flag; the next `enabled` call reads the store.
    pub fn invalidate(&self) {
        self.cached.store(UNKNOWN, Ordering::Release);
    }
}
