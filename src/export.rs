//! The background job moving aggregated counters to the warehouse.
//!
//! A run takes the export lock, snapshots the pending buckets, pushes
//! every bucket's dirty counters and only then clears what it pushed.
//! Any failure leaves all buckets pending, so the next run sends the
//! same data again. Aggregators keep writing while a run is in
//! progress; a key added or incremented after its value was read stays
//! dirty for the next run.

use crate::clock::BucketId;
use crate::config::{ConfigError, StatsConfig};
use crate::keys::KeyFactory;
use crate::lock::{ExportLock, LockError};
use crate::registry::ChangeRegistry;
use crate::storage::{Storage, StorageError};
use crate::warehouse::{Warehouse, WarehouseError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

pub static EXPORT_JOB_NAME: &str = "stats_export";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to read pending stats")]
    Storage(#[from] StorageError),

    #[error("failed to push bucket {bucket} to the warehouse")]
    Warehouse {
        bucket: String,
        #[source]
        source: WarehouseError,
    },

    #[error("failed to take the export lock")]
    Lock(#[from] LockError),
}

impl ExportError {
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::Storage(_) => "storage_unavailable",
            ExportError::Warehouse { .. } => "export_failed",
            ExportError::Lock(_) => "lock_failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Idle,
    Locked,
    Exporting,
    Success,
    Failure,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Locked => write!(f, "locked"),
            JobState::Exporting => write!(f, "exporting"),
            JobState::Success => write!(f, "success"),
            JobState::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another run holds the lock.
    Skipped,
    Exported {
        buckets: usize,
        keys: usize,
        /// Start of the newest exported bucket.
        latest: Option<DateTime<Utc>>,
    },
    /// Nothing was cleared; the next run retries.
    Failed { code: &'static str, message: String },
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, JobOutcome::Failed { .. })
    }

    pub fn message(&self) -> String {
        match self {
            JobOutcome::Skipped => "Export already running elsewhere, skipped.".to_string(),
            JobOutcome::Exported { latest: None, .. } => "No pending buckets to export.".to_string(),
            JobOutcome::Exported {
                latest: Some(latest),
                ..
            } => format!("Events imported correctly. Latest ones are from: {}", latest),
            JobOutcome::Failed { message, .. } => message.clone(),
        }
    }
}

struct ExportedBucket {
    bucket: BucketId,
    /// Counter values as pushed, `None` for expired counters.
    values: BTreeMap<String, Option<i64>>,
}

/// Runs exports one at a time across every process sharing the store.
pub struct ExportJob<'a> {
    storage: Arc<dyn Storage>,
    registry: ChangeRegistry,
    lock: Arc<dyn ExportLock>,
    warehouse: Box<dyn Warehouse + 'a>,
    lock_ttl: Duration,
    name: String,
    state: JobState,
}

impl<'a> ExportJob<'a> {
    pub fn new(
        config: &StatsConfig,
        storage: Arc<dyn Storage>,
        lock: Arc<dyn ExportLock>,
        warehouse: Box<dyn Warehouse + 'a>,
    ) -> Result<ExportJob<'a>, ConfigError> {
        config.validate()?;
        let keys = KeyFactory::new(&config.key_prefix);
        Ok(ExportJob {
            registry: ChangeRegistry::new(Arc::clone(&storage), keys),
            storage,
            lock,
            warehouse,
            lock_ttl: config.lock_ttl(),
            name: EXPORT_JOB_NAME.to_string(),
            state: JobState::Idle,
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn transition(&mut self, next: JobState) {
        event!(Level::DEBUG, job = %self.name, from = %self.state, to = %next, "Export job transition.");
        self.state = next;
    }

    /// Performs one export run. Never panics and never returns an
    /// error: failures are reported in the outcome and retried by the
    /// next run.
    pub fn run(&mut self) -> JobOutcome {
        let token = match self.lock.acquire(&self.name, self.lock_ttl) {
            Ok(Some(token)) => token,
            Ok(None) => {
                event!(Level::DEBUG, job = %self.name, "Export lock held elsewhere, skipping run.");
                return JobOutcome::Skipped;
            }
            Err(error) => {
                let error = ExportError::from(error);
                event!(Level::ERROR, job = %self.name, code = error.code(), "Export job failed: {}", error);
                return JobOutcome::Failed {
                    code: error.code(),
                    message: error.to_string(),
                };
            }
        };
        self.transition(JobState::Locked);

        let outcome = match self.export() {
            Ok(outcome) => {
                self.transition(JobState::Success);
                event!(Level::INFO, job = %self.name, "{}", outcome.message());
                outcome
            }
            Err(error) => {
                self.transition(JobState::Failure);
                event!(Level::ERROR, job = %self.name, code = error.code(), "Export job failed: {}", error);
                JobOutcome::Failed {
                    code: error.code(),
                    message: error.to_string(),
                }
            }
        };

        match self.lock.release(&token) {
            Ok(true) => {}
            Ok(false) => {
                event!(Level::WARN, job = %self.name, "Export lock expired before the run finished.")
            }
            Err(error) => {
                event!(Level::WARN, job = %self.name, "Failed to release export lock: {}", error)
            }
        }
        self.transition(JobState::Idle);
        outcome
    }

    fn export(&mut self) -> Result<JobOutcome, ExportError> {
        self.transition(JobState::Exporting);
        let buckets = self.registry.pending_buckets()?;

        let mut exported = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            let keys = self.registry.dirty_keys(&bucket)?;
            let values = self.read_counters(&keys)?;
            let counters: Vec<(String, i64)> = values
                .iter()
                .filter_map(|(key, value)| value.map(|value| (key.clone(), value)))
                .collect();
            if !counters.is_empty() {
                self.warehouse
                    .push(&bucket, &counters)
                    .map_err(|source| ExportError::Warehouse {
                        bucket: bucket.to_string(),
                        source,
                    })?;
            }
            event!(Level::DEBUG, bucket = %bucket, counters = counters.len(), "Bucket pushed.");
            exported.push(ExportedBucket { bucket, values });
        }

        // Nothing is cleared until every bucket made it to the warehouse.
        for entry in &exported {
            self.registry.clear(&entry.bucket, &entry.values)?;
        }

        Ok(JobOutcome::Exported {
            buckets: exported.len(),
            keys: exported.iter().map(|entry| entry.values.len()).sum(),
            latest: exported.iter().map(|entry| entry.bucket.start()).max(),
        })
    }

    /// Current values of `keys`. Counters that already expired read
    /// as `None` and are not pushed.
    fn read_counters(&self, keys: &BTreeSet<String>) -> Result<BTreeMap<String, Option<i64>>, StorageError> {
        let keys: Vec<String> = keys.iter().cloned().collect();
        let values = self.storage.mget(&keys)?;
        let mut counters = BTreeMap::new();
        for (key, value) in keys.into_iter().zip(values) {
            let parsed = match value {
                Some(value) => Some(value.parse::<i64>().map_err(|_| StorageError::NotAnInteger {
                    key: key.clone(),
                    value: value.clone(),
                })?),
                None => None,
            };
            counters.insert(key, parsed);
        }
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::{ExportJob, JobOutcome, JobState, EXPORT_JOB_NAME};
    use crate::aggregator::Aggregator;
    use crate::config::StatsConfig;
    use crate::keys::KeyFactory;
    use crate::lock::{ExportLock, LockError, LockToken, StorageLock};
    use crate::metadata::StaticMetadata;
    use crate::registry::ChangeRegistry;
    use crate::storage::{MemoryStorage, Storage};
    use crate::toggle::StatsToggle;
    use crate::transaction::Transaction;
    use crate::clock::BucketId;
    use crate::warehouse::{DummyWarehouse, Warehouse, WarehouseError};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        aggregator: Aggregator,
        lock: Arc<StorageLock>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let keys = KeyFactory::default();
        let toggle = Arc::new(StatsToggle::new(storage.clone(), &keys));
        toggle.enable().unwrap();
        let aggregator = Aggregator::new(
            &StatsConfig::default(),
            storage.clone(),
            Arc::new(StaticMetadata::new()),
            toggle,
        )
        .unwrap();
        let lock = Arc::new(StorageLock::new(storage.clone(), keys));
        Fixture {
            storage,
            aggregator,
            lock,
        }
    }

    fn job<'a>(fixture: &Fixture, warehouse: DummyWarehouse) -> ExportJob<'a> {
        ExportJob::new(
            &StatsConfig::default(),
            fixture.storage.clone(),
            fixture.lock.clone(),
            Box::new(warehouse),
        )
        .unwrap()
    }

    fn transaction(minute: u32, amount: i64) -> Transaction {
        Transaction::new("1001", "2001", Utc.with_ymd_and_hms(2010, 5, 7, 13, minute, 10).unwrap())
            .with_usage("3001", amount)
    }

    fn registry(fixture: &Fixture) -> ChangeRegistry {
        ChangeRegistry::new(fixture.storage.clone(), KeyFactory::default())
    }

    #[test]
    fn test_export_pushes_and_clears() {
        let fixture = fixture();
        fixture
            .aggregator
            .process(&[transaction(23, 5), transaction(24, 4)])
            .unwrap();

        let warehouse = DummyWarehouse::default();
        let rows = Rc::clone(&warehouse.rows);
        let pushes = Rc::clone(&warehouse.pushes);
        let mut job = job(&fixture, warehouse);

        let outcome = job.run();
        assert_eq!(
            outcome,
            JobOutcome::Exported {
                buckets: 2,
                keys: 28,
                latest: Some(Utc.with_ymd_and_hms(2010, 5, 7, 13, 24, 0).unwrap()),
            }
        );
        assert_eq!(
            outcome.message(),
            "Events imported correctly. Latest ones are from: 2010-05-07 13:24:00 UTC"
        );
        assert_eq!(*pushes.borrow(), vec!["20100507132300".to_string(), "20100507132400".to_string()]);
        assert_eq!(rows.borrow().get("stats/service:1001/metric:3001/eternity/all"), Some(&9));
        assert_eq!(
            rows.borrow().get("stats/service:1001/app:2001/metric:3001/minute/201005071323"),
            Some(&5)
        );

        assert_eq!(registry(&fixture).pending_count().unwrap(), 0);
        assert!(fixture.storage.keys_with_prefix("stats/dirty/").unwrap().is_empty());
        assert_eq!(job.state(), JobState::Idle);
        assert!(!fixture.lock.is_held(EXPORT_JOB_NAME).unwrap());

        // Counters are untouched by the export.
        assert_eq!(
            fixture
                .storage
                .get("stats/service:1001/metric:3001/eternity/all")
                .unwrap(),
            Some("9".to_string())
        );
    }

    #[test]
    fn test_empty_run() {
        let fixture = fixture();
        let mut job = job(&fixture, DummyWarehouse::default());
        let outcome = job.run();
        assert_eq!(
            outcome,
            JobOutcome::Exported {
                buckets: 0,
                keys: 0,
                latest: None
            }
        );
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_failed_push_clears_nothing() {
        let fixture = fixture();
        fixture
            .aggregator
            .process(&[transaction(23, 5), transaction(24, 4)])
            .unwrap();

        let warehouse = DummyWarehouse::default();
        let fail = Rc::clone(&warehouse.fail);
        let rows = Rc::clone(&warehouse.rows);
        *fail.borrow_mut() = true;
        let mut job = job(&fixture, warehouse);

        let outcome = job.run();
        match &outcome {
            JobOutcome::Failed { code, message } => {
                assert_eq!(*code, "export_failed");
                assert!(message.contains("20100507132300"));
            }
            other => panic!("expected a failure, got {:?}", other),
        }
        assert!(!outcome.is_ok());
        assert_eq!(registry(&fixture).pending_count().unwrap(), 2);
        assert!(!fixture.lock.is_held(EXPORT_JOB_NAME).unwrap());

        // The next run exports the same data.
        *fail.borrow_mut() = false;
        assert!(matches!(job.run(), JobOutcome::Exported { buckets: 2, .. }));
        assert_eq!(rows.borrow().get("stats/service:1001/metric:3001/eternity/all"), Some(&9));
        assert_eq!(registry(&fixture).pending_count().unwrap(), 0);
    }

    #[test]
    fn test_reexport_does_not_change_totals() {
        let fixture = fixture();
        fixture
            .aggregator
            .process(&[transaction(23, 5), transaction(23, 2)])
            .unwrap();

        let warehouse = DummyWarehouse::default();
        let rows = Rc::clone(&warehouse.rows);
        let mut job = job(&fixture, warehouse);

        // Simulate a crash between push and clear by pushing the same
        // pending bucket through two runs.
        let registry = registry(&fixture);
        let pending = registry.pending_buckets().unwrap();
        let dirty: BTreeMap<_, _> = pending
            .iter()
            .map(|bucket| (bucket.clone(), registry.dirty_keys(bucket).unwrap()))
            .collect();
        job.run();
        let first: BTreeMap<String, i64> = rows.borrow().clone();

        for (bucket, keys) in &dirty {
            registry.mark_dirty(bucket, keys).unwrap();
        }
        job.run();
        assert_eq!(*rows.borrow(), first);
        assert_eq!(first.get("stats/service:1001/metric:3001/eternity/all"), Some(&7));
    }

    #[test]
    fn test_contention_is_a_silent_skip() {
        let fixture = fixture();
        fixture.aggregator.process(&[transaction(23, 5)]).unwrap();
        let holder = fixture
            .lock
            .acquire(EXPORT_JOB_NAME, Duration::from_secs(300))
            .unwrap()
            .unwrap();

        let warehouse = DummyWarehouse::default();
        let pushes = Rc::clone(&warehouse.pushes);
        let mut job = job(&fixture, warehouse);

        let outcome = job.run();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(outcome.is_ok());
        assert!(pushes.borrow().is_empty());
        assert_eq!(registry(&fixture).pending_count().unwrap(), 1);
        // The other holder's lock is left alone.
        assert!(fixture.lock.is_held(EXPORT_JOB_NAME).unwrap());
        assert!(fixture.lock.release(&holder).unwrap());
    }

    #[test]
    fn test_orphaned_lock_is_reacquired_after_expiry() {
        let fixture = fixture();
        fixture.aggregator.process(&[transaction(23, 5)]).unwrap();
        fixture
            .lock
            .acquire(EXPORT_JOB_NAME, Duration::from_secs(300))
            .unwrap()
            .unwrap();

        let mut job = job(&fixture, DummyWarehouse::default());
        assert_eq!(job.run(), JobOutcome::Skipped);

        fixture.storage.advance(Duration::from_secs(301));
        assert!(matches!(job.run(), JobOutcome::Exported { buckets: 1, .. }));
    }

    /// Warehouse during whose push an aggregator commits more traffic
    /// into the bucket being exported.
    struct BusyWarehouse<'a> {
        inner: DummyWarehouse,
        aggregator: &'a Aggregator,
        late: Option<Transaction>,
    }

    impl Warehouse for BusyWarehouse<'_> {
        fn push(&mut self, bucket: &BucketId, counters: &[(String, i64)]) -> Result<(), WarehouseError> {
            self.inner.push(bucket, counters)?;
            if let Some(late) = self.late.take() {
                self.aggregator.process(&[late]).unwrap();
            }
            Ok(())
        }
    }

    fn busy_job<'a>(fixture: &'a Fixture, warehouse: DummyWarehouse, late: Transaction) -> ExportJob<'a> {
        ExportJob::new(
            &StatsConfig::default(),
            fixture.storage.clone(),
            fixture.lock.clone(),
            Box::new(BusyWarehouse {
                inner: warehouse,
                aggregator: &fixture.aggregator,
                late: Some(late),
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_writes_during_export_stay_pending() {
        let fixture = fixture();
        fixture.aggregator.process(&[transaction(23, 5)]).unwrap();

        // A different metric lands in the same bucket while it is pushed.
        let late = Transaction::new("1001", "2001", Utc.with_ymd_and_hms(2010, 5, 7, 13, 23, 50).unwrap())
            .with_usage("3002", 1);
        let mut job = busy_job(&fixture, DummyWarehouse::default(), late);
        assert!(matches!(job.run(), JobOutcome::Exported { buckets: 1, .. }));

        let registry = registry(&fixture);
        let bucket = registry.pending_buckets().unwrap()[0].clone();
        let remaining = registry.dirty_keys(&bucket).unwrap();
        assert_eq!(remaining.len(), 14);
        assert!(remaining.iter().all(|key| key.contains("metric:3002")));
    }

    #[test]
    fn test_increments_during_export_are_exported_next_run() {
        let fixture = fixture();
        fixture.aggregator.process(&[transaction(23, 5)]).unwrap();

        let warehouse = DummyWarehouse::default();
        let rows = Rc::clone(&warehouse.rows);
        // The same metric is incremented again after its value was read.
        let mut job = busy_job(&fixture, warehouse, transaction(23, 4));
        assert!(matches!(job.run(), JobOutcome::Exported { buckets: 1, .. }));

        let eternity = "stats/service:1001/metric:3001/eternity/all";
        assert_eq!(rows.borrow().get(eternity), Some(&5));
        assert_eq!(fixture.storage.get(eternity).unwrap(), Some("9".to_string()));
        assert_eq!(registry(&fixture).pending_count().unwrap(), 1);

        assert!(matches!(job.run(), JobOutcome::Exported { buckets: 1, .. }));
        assert_eq!(rows.borrow().get(eternity), Some(&9));
        assert_eq!(registry(&fixture).pending_count().unwrap(), 0);
    }

    #[test]
    fn test_expired_counters_are_not_exported() {
        let fixture = fixture();
        fixture.aggregator.process(&[transaction(23, 5)]).unwrap();
        fixture.storage.advance(Duration::from_secs(181));

        let warehouse = DummyWarehouse::default();
        let rows = Rc::clone(&warehouse.rows);
        let mut job = job(&fixture, warehouse);
        assert!(job.run().is_ok());

        let rows = rows.borrow();
        assert!(rows.keys().all(|key| !key.contains("/minute/")));
        assert_eq!(rows.get("stats/service:1001/metric:3001/eternity/all"), Some(&5));
        assert_eq!(registry(&fixture).pending_count().unwrap(), 0);
    }

    /// Lock whose store is unreachable.
    struct BrokenLock;

    impl ExportLock for BrokenLock {
        fn acquire(&self, _name: &str, _ttl: Duration) -> Result<Option<LockToken>, LockError> {
            Err(LockError::Storage(crate::storage::StorageError::Unavailable(
                "connection refused".to_string(),
            )))
        }

        fn release(&self, _token: &LockToken) -> Result<bool, LockError> {
            Ok(false)
        }

        fn is_held(&self, _name: &str) -> Result<bool, LockError> {
            Ok(false)
        }
    }

    #[test]
    fn test_lock_failure_is_reported() {
        let fixture = fixture();
        let mut job = ExportJob::new(
            &StatsConfig::default(),
            fixture.storage.clone(),
            Arc::new(BrokenLock),
            Box::new(DummyWarehouse::default()),
        )
        .unwrap();

        assert!(matches!(job.run(), JobOutcome::Failed { code: "lock_failed", .. }));
        assert_eq!(job.state(), JobState::Idle);
    }
}
