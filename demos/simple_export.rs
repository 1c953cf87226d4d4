extern crate usage_stats;

use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use usage_stats::{
    Aggregator, ExportJob, KafkaConfig, KafkaWarehouse, KeyFactory, MemoryStorage, StaticMetadata,
    StatsConfig, StatsToggle, Storage, StorageLock, Transaction,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kafka broker server in the host:port form
    #[arg(short, long)]
    bootstrap_server: String,

    /// Kafka topic to export onto
    #[arg(short, long)]
    topic: Option<String>,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let config = StatsConfig::default();
    let keys = KeyFactory::new(&config.key_prefix);
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let toggle = Arc::new(StatsToggle::new(Arc::clone(&storage), &keys));
    toggle.enable().unwrap();

    let aggregator = Aggregator::new(
        &config,
        Arc::clone(&storage),
        Arc::new(StaticMetadata::new().with_end_user_application("1001", "2002")),
        toggle,
    )
    .unwrap();

    let now = Utc::now();
    aggregator
        .process(&[
            Transaction::new("1001", "2001", now).with_usage("hits", 5),
            Transaction::new("1001", "2001", now)
                .with_usage("hits", 4)
                .with_response_code(200),
            Transaction::new("1001", "2002", now)
                .with_usage("hits", 1)
                .with_user("alice")
                .with_response_code(429),
        ])
        .unwrap();

    let kafka_config = KafkaConfig::new_producer_config(args.bootstrap_server.as_str(), None);
    let warehouse = KafkaWarehouse::new(kafka_config, args.topic.as_deref()).unwrap();
    let lock = Arc::new(StorageLock::new(Arc::clone(&storage), keys));

    let mut job = ExportJob::new(&config, storage, lock, Box::new(warehouse)).unwrap();
    let outcome = job.run();
    println!("{}", outcome.message());
}
