pub mod aggregator;
pub mod clock;
pub mod config;
pub mod export;
pub mod keys;
pub mod lock;
pub mod metadata;
pub mod registry;
pub mod response_code;
pub mod storage;
pub mod toggle;
pub mod transaction;
pub mod warehouse;

pub use aggregator::{AggregationError, Aggregator, ProcessReport};
pub use config::StatsConfig;
pub use export::{ExportJob, JobOutcome};
pub use keys::{Granularity, KeyFactory};
pub use lock::{ExportLock, StorageLock};
pub use metadata::{EntityMetadata, StaticMetadata};
pub use registry::ChangeRegistry;
pub use storage::{MemoryStorage, Storage};
pub use toggle::StatsToggle;
pub use transaction::Transaction;
pub use warehouse::{KafkaConfig, KafkaWarehouse, Warehouse};
