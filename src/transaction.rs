//! The unit of usage reported for every API call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Reasons a transaction is rejected before anything is written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("transaction carries neither usage nor a response code")]
    EmptyTransaction,

    #[error("service id is missing")]
    MissingServiceId,

    #[error("application id is missing")]
    MissingApplicationId,

    #[error("usage contains an empty metric id")]
    EmptyMetricId,

    #[error("usage value \"{amount}\" for metric \"{metric}\" is invalid")]
    InvalidUsageAmount { metric: String, amount: i64 },

    #[error("timestamp {0} cannot be bucketed")]
    TimestampOutOfRange(DateTime<Utc>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub service_id: String,
    pub application_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub usage: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i64>,
}

impl Transaction {
    pub fn new(service_id: &str, application_id: &str, timestamp: DateTime<Utc>) -> Self {
        Transaction {
            service_id: service_id.to_string(),
            application_id: application_id.to_string(),
            user_id: None,
            timestamp,
            usage: BTreeMap::new(),
            response_code: None,
        }
    }

    pub fn with_usage(mut self, metric_id: &str, amount: i64) -> Self {
        self.usage.insert(metric_id.to_string(), amount);
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_response_code(mut self, code: i64) -> Self {
        self.response_code = Some(code);
        self
    }

    /// Checks the shape of the transaction. Response code ranges are
    /// checked later, since a bad code only drops the response code
    /// counters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service_id.is_empty() {
            return Err(ValidationError::MissingServiceId);
        }
        if self.application_id.is_empty() {
            return Err(ValidationError::MissingApplicationId);
        }
        if self.usage.is_empty() && self.response_code.is_none() {
            return Err(ValidationError::EmptyTransaction);
        }
        for (metric, amount) in &self.usage {
            if metric.is_empty() {
                return Err(ValidationError::EmptyMetricId);
            }
            if *amount < 0 {
                return Err(ValidationError::InvalidUsageAmount {
                    metric: metric.clone(),
                    amount: *amount,
                });
            }
        }
        Ok(())
    }
}
