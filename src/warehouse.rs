//! This module provides the abstraction over the analytics warehouse
//! exported buckets are pushed to, so the export job does not depend
//! on the rdkafka producer.
//!
//! Pushes carry absolute counter values, and the warehouse is expected
//! to upsert them by counter key. Sending the same bucket twice is
//! therefore harmless, which is what makes retrying a failed export safe.

use crate::clock::BucketId;
use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::producer::{BaseRecord, Producer, ThreadedProducer};
use rdkafka::producer::{DeliveryResult, ProducerContext};
use rdkafka::{ClientContext, Message};
use serde::Serialize;
#[cfg(test)]
use std::cell::RefCell;
use std::collections::HashMap;
#[cfg(test)]
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

static DEFAULT_TOPIC_NAME: &str = "usage-stats-export";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Producer settings for `KafkaWarehouse`, as librdkafka properties.
///
/// Idempotent delivery is on by default. Any property can be replaced
/// through the override map.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    config_map: HashMap<String, String>,
}

impl KafkaConfig {
    pub fn new_producer_config(
        bootstrap_servers: &str,
        override_params: Option<HashMap<String, String>>,
    ) -> Self {
        let mut config_map: HashMap<String, String> = HashMap::new();
        config_map.insert("bootstrap.servers".to_string(), bootstrap_servers.into());
        config_map.insert("enable.idempotence".to_string(), "true".to_string());

        Self { config_map }.with_overrides(override_params.unwrap_or_default())
    }

    fn with_overrides<V>(mut self, params: HashMap<String, V>) -> Self
    where
        V: Into<String>,
    {
        self.config_map
            .extend(params.into_iter().map(|(param, value)| (param, value.into())));
        self
    }
}

impl From<KafkaConfig> for RdKafkaConfig {
    fn from(item: KafkaConfig) -> Self {
        let mut config_obj = RdKafkaConfig::new();
        for (key, val) in item.config_map.iter() {
            config_obj.set(key, val);
        }
        config_obj
    }
}

/// Logs the broker's verdict on every bucket message.
struct DeliveryLogContext;

impl ClientContext for DeliveryLogContext {}

impl ProducerContext for DeliveryLogContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult, _delivery_opaque: Self::DeliveryOpaque) {
        match result {
            Ok(message) => event!(
                Level::DEBUG,
                partition = message.partition(),
                offset = message.offset(),
                "Bucket export delivered."
            ),
            Err((kafka_err, message)) => event!(
                Level::ERROR,
                partition = message.partition(),
                "Bucket export delivery failed. {}",
                kafka_err
            ),
        }
    }
}

/// Warehouse push errors.
#[derive(Error, Debug)]
pub enum WarehouseError {
    /// Failed to send or flush a kafka message.
    #[error("failed to send kafka message")]
    SendFailed(#[source] rdkafka::error::KafkaError),

    /// Failed to create a kafka producer because of the invalid configuration.
    #[error("failed to create kafka producer: invalid kafka config")]
    InvalidConfig(#[source] rdkafka::error::KafkaError),

    #[error("failed to encode bucket export")]
    Encode(#[source] serde_json::Error),

    /// The warehouse refused the data.
    #[error("warehouse rejected the export: {0}")]
    Rejected(String),
}

/// The destination of exported buckets.
pub trait Warehouse {
    /// Pushes the absolute values of the counters written in `bucket`.
    fn push(&mut self, bucket: &BucketId, counters: &[(String, i64)]) -> Result<(), WarehouseError>;
}

#[derive(Serialize)]
struct CounterRow<'a> {
    key: &'a str,
    value: i64,
}

#[derive(Serialize)]
struct BucketExport<'a> {
    bucket: String,
    timestamp: i64,
    counters: Vec<CounterRow<'a>>,
}

fn encode(bucket: &BucketId, counters: &[(String, i64)]) -> Result<Vec<u8>, WarehouseError> {
    let export = BucketExport {
        bucket: bucket.to_string(),
        timestamp: bucket.score(),
        counters: counters
            .iter()
            .map(|(key, value)| CounterRow { key, value: *value })
            .collect(),
    };
    serde_json::to_vec(&export).map_err(WarehouseError::Encode)
}

/// Publishes one message per bucket, keyed by bucket id.
pub struct KafkaWarehouse {
    producer: ThreadedProducer<DeliveryLogContext>,
    topic: String,
}

impl KafkaWarehouse {
    pub fn new(config: KafkaConfig, topic_name: Option<&str>) -> Result<KafkaWarehouse, WarehouseError> {
        let producer_config: RdKafkaConfig = config.into();
        let producer = producer_config
            .create_with_context(DeliveryLogContext)
            .map_err(WarehouseError::InvalidConfig)?;
        Ok(KafkaWarehouse {
            producer,
            topic: topic_name.unwrap_or(DEFAULT_TOPIC_NAME).to_string(),
        })
    }
}

impl Warehouse for KafkaWarehouse {
    fn push(&mut self, bucket: &BucketId, counters: &[(String, i64)]) -> Result<(), WarehouseError> {
        let payload = encode(bucket, counters)?;
        let key = bucket.to_string();
        let record: BaseRecord<'_, str, [u8]> = BaseRecord::to(self.topic.as_str())
            .key(key.as_str())
            .payload(payload.as_slice());
        self.producer
            .send(record)
            .map_err(|(error, _message)| WarehouseError::SendFailed(error))?;
        // The bucket is only cleared after a successful push, so wait
        // for the broker instead of trusting the local queue.
        self.producer
            .flush(FLUSH_TIMEOUT)
            .map_err(WarehouseError::SendFailed)
    }
}

/// Keeps the latest value per counter key, like an upserting warehouse.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct DummyWarehouse {
    pub rows: Rc<RefCell<std::collections::BTreeMap<String, i64>>>,
    pub pushes: Rc<RefCell<Vec<String>>>,
    pub fail: Rc<RefCell<bool>>,
}

#[cfg(test)]
impl Warehouse for DummyWarehouse {
    fn push(&mut self, bucket: &BucketId, counters: &[(String, i64)]) -> Result<(), WarehouseError> {
        if *self.fail.borrow() {
            return Err(WarehouseError::Rejected("warehouse unavailable".to_string()));
        }
        self.pushes.borrow_mut().push(bucket.to_string());
        let mut rows = self.rows.borrow_mut();
        for (key, value) in counters {
            rows.insert(key.clone(), *value);
        }
        Ok(())
    }
}
