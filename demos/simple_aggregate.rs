extern crate usage_stats;

use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use usage_stats::{
    Aggregator, KeyFactory, MemoryStorage, StaticMetadata, StatsConfig, StatsToggle, Storage,
    Transaction,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service the usage is reported for
    #[arg(short, long, default_value = "1001")]
    service: String,

    /// Application the usage is reported for
    #[arg(short, long, default_value = "2001")]
    application: String,

    /// Metric to increment
    #[arg(short, long, default_value = "hits")]
    metric: String,

    /// Amount to add
    #[arg(long, default_value_t = 1)]
    amount: i64,

    /// Optional HTTP response code of the call
    #[arg(short, long)]
    response_code: Option<i64>,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let config = StatsConfig::default();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let toggle = Arc::new(StatsToggle::new(
        Arc::clone(&storage),
        &KeyFactory::new(&config.key_prefix),
    ));
    toggle.enable().unwrap();

    let aggregator = Aggregator::new(
        &config,
        Arc::clone(&storage),
        Arc::new(StaticMetadata::new()),
        toggle,
    )
    .unwrap();

    let mut transaction = Transaction::new(&args.service, &args.application, Utc::now())
        .with_usage(&args.metric, args.amount);
    if let Some(code) = args.response_code {
        transaction = transaction.with_response_code(code);
    }

    let report = aggregator.process(&[transaction.clone(), transaction]).unwrap();
    println!("committed {} transaction(s)", report.committed);

    for key in storage.keys_with_prefix(&config.key_prefix).unwrap() {
        if let Ok(Some(value)) = storage.get(&key) {
            println!("{} = {}", key, value);
        }
    }
}
