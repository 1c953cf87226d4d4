//! Quantization of transaction timestamps into period labels and
//! export buckets.
//!
//! All timestamps are converted to UTC here before anything is
//! truncated, so callers can hand over any `DateTime<Tz>`.

use crate::keys::Granularity;
use chrono::{DateTime, Datelike, Duration, DurationRound, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Period label per granularity, ordered finest to coarsest.
pub type Periods = BTreeMap<Granularity, String>;

static ETERNITY_PERIOD: &str = "all";
static BUCKET_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// Label of the period `timestamp` falls into at the given granularity.
pub fn period_label<Tz: TimeZone>(granularity: Granularity, timestamp: &DateTime<Tz>) -> String {
    let ts = timestamp.with_timezone(&Utc);
    match granularity {
        Granularity::Minute => ts.format("%Y%m%d%H%M").to_string(),
        Granularity::Hour => ts.format("%Y%m%d%H").to_string(),
        Granularity::Day => ts.format("%Y%m%d").to_string(),
        Granularity::Week => {
            // Weeks start on Monday.
            let offset = i64::from(ts.weekday().num_days_from_monday());
            (ts.date_naive() - Duration::days(offset))
                .format("%Y%m%d")
                .to_string()
        }
        Granularity::Month => ts.format("%Y%m01").to_string(),
        Granularity::Year => ts.format("%Y0101").to_string(),
        Granularity::Eternity => ETERNITY_PERIOD.to_string(),
    }
}

/// Period labels for `timestamp` at each of `granularities`.
pub fn periods_for<Tz: TimeZone>(timestamp: &DateTime<Tz>, granularities: &[Granularity]) -> Periods {
    granularities
        .iter()
        .map(|granularity| (*granularity, period_label(*granularity, timestamp)))
        .collect()
}

/// Identifier of a coarse export bucket: the UTC start of the window,
/// rendered as `YYYYMMDDHHMMSS`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BucketId(DateTime<Utc>);

impl BucketId {
    pub fn from_start(start: DateTime<Utc>) -> Self {
        BucketId(start)
    }

    pub fn parse(id: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(id, BUCKET_ID_FORMAT)
            .ok()
            .map(|naive| BucketId(Utc.from_utc_datetime(&naive)))
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// Sort score used in the pending registry.
    pub fn score(&self) -> i64 {
        self.0.timestamp()
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.format(BUCKET_ID_FORMAT))
    }
}

/// Knows the configured expirations and the width of export buckets.
#[derive(Clone, Debug)]
pub struct BucketClock {
    ttls: BTreeMap<Granularity, std::time::Duration>,
    bucket_size: Duration,
}

impl BucketClock {
    /// `bucket_size_secs` must be positive; `StatsConfig::validate`
    /// guarantees it for configured clocks.
    pub fn new(ttls: &BTreeMap<Granularity, u64>, bucket_size_secs: u32) -> Self {
        BucketClock {
            ttls: ttls
                .iter()
                .filter(|(granularity, _)| **granularity != Granularity::Eternity)
                .map(|(granularity, secs)| (*granularity, std::time::Duration::from_secs(*secs)))
                .collect(),
            bucket_size: Duration::seconds(i64::from(bucket_size_secs.max(1))),
        }
    }

    pub fn periods_for<Tz: TimeZone>(&self, timestamp: &DateTime<Tz>, granularities: &[Granularity]) -> Periods {
        periods_for(timestamp, granularities)
    }

    /// Expiration of counters at this granularity. `None` means the
    /// counter is durable. Eternity never expires.
    pub fn ttl_for(&self, granularity: Granularity) -> Option<std::time::Duration> {
        self.ttls.get(&granularity).copied()
    }

    /// The export bucket `timestamp` belongs to, or `None` when the
    /// timestamp cannot be truncated (outside chrono's nanosecond range).
    pub fn bucket_for<Tz: TimeZone>(&self, timestamp: &DateTime<Tz>) -> Option<BucketId> {
        timestamp
            .with_timezone(&Utc)
            .duration_trunc(self.bucket_size)
            .ok()
            .map(BucketId)
    }
}
