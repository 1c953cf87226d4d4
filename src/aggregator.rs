//! Turns transactions into counter increments.
//!
//! Each transaction fans out into one increment per scope, subject and
//! granularity. All of them, together with the change tracking entries
//! for the export job, are committed as a single write batch, so a
//! transaction is either fully counted or not counted at all.
//!
//! Transactions in a batch are independent units of work: a bad one is
//! reported and skipped while the rest are still counted.

use crate::clock::{BucketClock, BucketId, Periods};
use crate::config::{ConfigError, StatsConfig};
use crate::keys::{Granularity, KeyFactory, Scope, Subject};
use crate::metadata::{EntityMetadata, MetadataError};
use crate::registry::ChangeRegistry;
use crate::response_code::{InvalidResponseCode, ResponseCodeClassifier};
use crate::storage::{Storage, StorageError, WriteBatch};
use crate::toggle::StatsToggle;
use crate::transaction::{Transaction, ValidationError};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// Aggregation is switched off. Callers treat this as a successful
    /// no-op.
    #[error("stats aggregation is disabled")]
    Disabled,

    #[error("invalid transaction: {0}")]
    Validation(#[from] ValidationError),

    /// The response code was the only thing to count and it is invalid.
    #[error(transparent)]
    InvalidResponseCode(#[from] InvalidResponseCode),

    /// Nothing was written. Safe to retry with the same transaction.
    #[error("failed to commit counters after {attempts} attempt(s)")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("failed to read the stats toggle")]
    Toggle(#[source] StorageError),
}

impl AggregationError {
    /// Stable identifier for logs and alerts.
    pub fn code(&self) -> &'static str {
        match self {
            AggregationError::Disabled => "aggregation_disabled",
            AggregationError::Validation(ValidationError::InvalidUsageAmount { .. }) => "invalid_usage_amount",
            AggregationError::Validation(_) => "validation_error",
            AggregationError::InvalidResponseCode(_) => "invalid_response_code",
            AggregationError::CommitFailed { .. } => "aggregation_commit_failed",
            AggregationError::Metadata(_) => "metadata_unavailable",
            AggregationError::Toggle(_) => "storage_unavailable",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, AggregationError::Disabled)
    }

    /// Whether sending the same transaction again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AggregationError::CommitFailed { .. } | AggregationError::Metadata(_) | AggregationError::Toggle(_)
        )
    }
}

/// What a single committed transaction wrote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub bucket: BucketId,
    pub keys: BTreeSet<String>,
    /// Set when the response code was dropped while usage was counted.
    pub rejected_response_code: Option<InvalidResponseCode>,
}

#[derive(Debug, Default)]
pub struct ProcessReport {
    /// The batch was skipped because aggregation is disabled.
    pub disabled: bool,
    pub committed: usize,
    /// Position in the batch and reason of every skipped transaction.
    pub failures: Vec<(usize, AggregationError)>,
    pub rejected_response_codes: Vec<(usize, InvalidResponseCode)>,
}

impl ProcessReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.rejected_response_codes.is_empty()
    }
}

pub struct Aggregator {
    storage: Arc<dyn Storage>,
    metadata: Arc<dyn EntityMetadata>,
    toggle: Arc<StatsToggle>,
    registry: ChangeRegistry,
    keys: KeyFactory,
    clock: BucketClock,
    classifier: ResponseCodeClassifier,
    granularities: Vec<Granularity>,
    commit_attempts: u32,
}

impl Aggregator {
    pub fn new(
        config: &StatsConfig,
        storage: Arc<dyn Storage>,
        metadata: Arc<dyn EntityMetadata>,
        toggle: Arc<StatsToggle>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let keys = KeyFactory::new(&config.key_prefix);
        Ok(Aggregator {
            registry: ChangeRegistry::new(Arc::clone(&storage), keys.clone()),
            storage,
            metadata,
            toggle,
            keys,
            clock: BucketClock::new(&config.ttls, config.bucket_size_secs),
            classifier: ResponseCodeClassifier::new(config.tracked_response_codes.iter().copied()),
            granularities: config.sorted_granularities(),
            commit_attempts: config.commit_attempts,
        })
    }

    /// Counts every transaction of the batch.
    ///
    /// Per-transaction failures are collected in the report. The only
    /// error returned is the failure to read the toggle itself.
    pub fn process(&self, batch: &[Transaction]) -> Result<ProcessReport, AggregationError> {
        if !self.toggle.enabled().map_err(AggregationError::Toggle)? {
            event!(
                Level::DEBUG,
                transactions = batch.len(),
                "Stats aggregation disabled, batch skipped."
            );
            return Ok(ProcessReport {
                disabled: true,
                ..ProcessReport::default()
            });
        }

        let mut report = ProcessReport::default();
        for (index, transaction) in batch.iter().enumerate() {
            match self.commit(transaction) {
                Ok(commit) => {
                    report.committed += 1;
                    if let Some(rejected) = commit.rejected_response_code {
                        report.rejected_response_codes.push((index, rejected));
                    }
                }
                Err(error) => {
                    event!(
                        Level::WARN,
                        index,
                        service_id = %transaction.service_id,
                        code = error.code(),
                        "Transaction not aggregated: {}",
                        error
                    );
                    report.failures.push((index, error));
                }
            }
        }
        Ok(report)
    }

    /// Counts a single transaction. Returns `AggregationError::Disabled`
    /// when aggregation is off.
    pub fn process_one(&self, transaction: &Transaction) -> Result<Commit, AggregationError> {
        if !self.toggle.enabled().map_err(AggregationError::Toggle)? {
            return Err(AggregationError::Disabled);
        }
        self.commit(transaction)
    }

    fn commit(&self, transaction: &Transaction) -> Result<Commit, AggregationError> {
        transaction.validate()?;
        let bucket = self
            .clock
            .bucket_for(&transaction.timestamp)
            .ok_or(ValidationError::TimestampOutOfRange(transaction.timestamp))?;
        let periods = self.clock.periods_for(&transaction.timestamp, &self.granularities);
        let scopes = self.scopes_for(transaction)?;

        let mut batch = WriteBatch::new();
        let mut touched = BTreeSet::new();

        for (metric, amount) in &transaction.usage {
            if *amount == 0 {
                continue;
            }
            self.stage_increments(
                &mut batch,
                &mut touched,
                &scopes,
                &Subject::Metric(metric),
                &periods,
                *amount,
            );
        }

        let mut rejected_response_code = None;
        if let Some(code) = transaction.response_code {
            match self.classifier.classify(code) {
                Ok(class) => {
                    for label in class.labels() {
                        self.stage_increments(
                            &mut batch,
                            &mut touched,
                            &scopes,
                            &Subject::ResponseCode(&label),
                            &periods,
                            1,
                        );
                    }
                }
                Err(error) => {
                    event!(
                        Level::WARN,
                        service_id = %transaction.service_id,
                        application_id = %transaction.application_id,
                        "Response code dropped: {}",
                        error
                    );
                    rejected_response_code = Some(error);
                }
            }
        }

        if touched.is_empty() {
            if let Some(error) = rejected_response_code {
                return Err(error.into());
            }
            return Ok(Commit {
                bucket,
                keys: touched,
                rejected_response_code: None,
            });
        }

        self.registry.stage(&mut batch, &bucket, touched.iter().cloned());
        self.apply_with_retries(&batch)?;
        self.record_application(transaction);

        event!(
            Level::DEBUG,
            service_id = %transaction.service_id,
            application_id = %transaction.application_id,
            bucket = %bucket,
            keys = touched.len(),
            "Transaction aggregated."
        );

        Ok(Commit {
            bucket,
            keys: touched,
            rejected_response_code,
        })
    }

    fn scopes_for<'t>(&self, transaction: &'t Transaction) -> Result<Vec<Scope<'t>>, AggregationError> {
        let service_id = transaction.service_id.as_str();
        let mut scopes = vec![
            Scope::Service { service_id },
            Scope::Application {
                service_id,
                application_id: &transaction.application_id,
            },
        ];
        if let Some(user_id) = transaction.user_id.as_deref().filter(|id| !id.is_empty()) {
            if self.tracks_end_users(transaction)? {
                scopes.push(Scope::EndUser {
                    service_id,
                    user_id,
                });
            }
        }
        Ok(scopes)
    }

    fn tracks_end_users(&self, transaction: &Transaction) -> Result<bool, MetadataError> {
        Ok(self
            .metadata
            .application_requires_end_user(&transaction.service_id, &transaction.application_id)?
            && self
                .metadata
                .service_has_end_user_plans(&transaction.service_id)?)
    }

    fn stage_increments(
        &self,
        batch: &mut WriteBatch,
        touched: &mut BTreeSet<String>,
        scopes: &[Scope],
        subject: &Subject,
        periods: &Periods,
        amount: i64,
    ) {
        for scope in scopes {
            for (granularity, key) in self.keys.keys_for(scope, subject, periods) {
                batch.incr_by(key.clone(), amount);
                if let Some(ttl) = self.clock.ttl_for(granularity) {
                    batch.expire(key.clone(), ttl);
                }
                touched.insert(key);
            }
        }
    }

    fn apply_with_retries(&self, batch: &WriteBatch) -> Result<(), AggregationError> {
        let mut attempt = 1;
        loop {
            match self.storage.apply(batch) {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.commit_attempts => {
                    event!(Level::WARN, attempt, "Counter commit failed, retrying: {}", error);
                    attempt += 1;
                }
                Err(error) => {
                    return Err(AggregationError::CommitFailed {
                        attempts: attempt,
                        source: error,
                    })
                }
            }
        }
    }

    /// Adds the application to its service's inventory. The counters
    /// are already committed at this point, so a failure here is only
    /// logged.
    fn record_application(&self, transaction: &Transaction) {
        let mut batch = WriteBatch::new();
        batch.sadd(
            self.keys.applications_key(&transaction.service_id),
            [transaction.application_id.as_str()],
        );
        if let Err(error) = self.storage.apply(&batch) {
            event!(
                Level::WARN,
                service_id = %transaction.service_id,
                application_id = %transaction.application_id,
                "Failed to record application: {}",
                error
            );
        }
    }
}
