//! Configuration tables for aggregation and export.
//!
//! Which granularities are kept, how long volatile counters live and
//! which response codes are tracked individually all come from here.

use crate::keys::{Granularity, DEFAULT_KEY_PREFIX};
use crate::response_code::DEFAULT_TRACKED_CODES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Longest expiration accepted for a volatile granularity (ten years).
pub const MAX_TTL_SECS: u64 = 10 * 366 * 24 * 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid stats configuration")]
    Parse(#[source] serde_json::Error),

    #[error("at least one granularity must be configured")]
    NoGranularities,

    #[error("bucket size must be positive")]
    InvalidBucketSize,

    #[error("commit attempts must be at least 1")]
    InvalidCommitAttempts,

    #[error("lock ttl of {lock_ttl_secs}s must exceed the worst-case export duration of {max_export_secs}s")]
    InvalidLockTtl {
        lock_ttl_secs: u64,
        max_export_secs: u64,
    },

    #[error("ttl of {ttl_secs}s for {granularity} counters must be between 1 and {max_secs}s", max_secs = MAX_TTL_SECS)]
    InvalidTtl {
        granularity: Granularity,
        ttl_secs: u64,
    },

    #[error("tracked response code {0} is not a valid HTTP status")]
    InvalidTrackedCode(u16),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Granularities every counter is kept at.
    ///
    /// Defaults to all seven, from minute to eternity.
    pub granularities: Vec<Granularity>,

    /// Expiration in seconds per granularity. Granularities missing from
    /// this table are durable. Values must be positive and at most
    /// `MAX_TTL_SECS`.
    pub ttls: BTreeMap<Granularity, u64>,

    /// Response codes that get a counter of their own besides their group.
    pub tracked_response_codes: Vec<u16>,

    /// Width in seconds of the buckets changes are tracked and exported in.
    ///
    /// Defaults to `60`.
    pub bucket_size_secs: u32,

    /// How many times a transaction's write batch is attempted before
    /// the commit is reported as failed.
    pub commit_attempts: u32,

    /// Expiration of the export lock. Must be larger than
    /// `max_export_secs` so a crashed job cannot hold it forever while a
    /// healthy one never loses it.
    pub lock_ttl_secs: u64,

    /// Worst-case duration of a single export run.
    pub max_export_secs: u64,

    pub key_prefix: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            granularities: Granularity::ALL.to_vec(),
            ttls: BTreeMap::from([
                (Granularity::Minute, 180),
                (Granularity::Hour, 2 * 24 * 3600),
                (Granularity::Day, 31 * 24 * 3600),
                (Granularity::Week, 12 * 7 * 24 * 3600),
            ]),
            tracked_response_codes: DEFAULT_TRACKED_CODES.to_vec(),
            bucket_size_secs: 60,
            commit_attempts: 2,
            lock_ttl_secs: 300,
            max_export_secs: 240,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl StatsConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: StatsConfig = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.granularities.is_empty() {
            return Err(ConfigError::NoGranularities);
        }
        if self.bucket_size_secs == 0 {
            return Err(ConfigError::InvalidBucketSize);
        }
        if self.commit_attempts == 0 {
            return Err(ConfigError::InvalidCommitAttempts);
        }
        if self.lock_ttl_secs <= self.max_export_secs {
            return Err(ConfigError::InvalidLockTtl {
                lock_ttl_secs: self.lock_ttl_secs,
                max_export_secs: self.max_export_secs,
            });
        }
        if let Some((granularity, ttl_secs)) = self
            .ttls
            .iter()
            .find(|(_, ttl_secs)| **ttl_secs == 0 || **ttl_secs > MAX_TTL_SECS)
        {
            return Err(ConfigError::InvalidTtl {
                granularity: *granularity,
                ttl_secs: *ttl_secs,
            });
        }
        if let Some(code) = self
            .tracked_response_codes
            .iter()
            .find(|code| !(100..=599).contains(*code))
        {
            return Err(ConfigError::InvalidTrackedCode(*code));
        }
        Ok(())
    }

    /// Configured granularities, deduplicated and ordered finest first.
    pub fn sorted_granularities(&self) -> Vec<Granularity> {
        let mut granularities = self.granularities.clone();
        granularities.sort();
        granularities.dedup();
        granularities
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}
