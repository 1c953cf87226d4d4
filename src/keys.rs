//! Storage key layout for usage counters and the bookkeeping
//! structures around them.
//!
//! Counter keys have the form
//! `<prefix>/service:<id>[/app:<id>|/user:<id>]/metric:<subject>/<granularity>/<period>`.
//! Response code counters live under `<prefix>/response_codes/...` so
//! that a metric whose id happens to look like a status code never
//! shares a counter with it.
//!
//! Every function here is pure: the same inputs always produce the
//! same key, across processes and restarts.

use crate::clock::{BucketId, Periods};
use serde::{Deserialize, Serialize};
use std::fmt;

pub(crate) static DEFAULT_KEY_PREFIX: &str = "stats";

/// Time bucket resolutions, ordered from the finest to the coarsest.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    Eternity,
}

impl Granularity {
    pub const ALL: [Granularity; 7] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
        Granularity::Eternity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
            Granularity::Eternity => "eternity",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity a counter is attributed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope<'a> {
    Service {
        service_id: &'a str,
    },
    Application {
        service_id: &'a str,
        application_id: &'a str,
    },
    EndUser {
        service_id: &'a str,
        user_id: &'a str,
    },
}

impl<'a> Scope<'a> {
    fn write_path(&self, out: &mut String) {
        match self {
            Scope::Service { service_id } => {
                push_component(out, "service", service_id);
            }
            Scope::Application {
                service_id,
                application_id,
            } => {
                push_component(out, "service", service_id);
                push_component(out, "app", application_id);
            }
            Scope::EndUser {
                service_id,
                user_id,
            } => {
                push_component(out, "service", service_id);
                push_component(out, "user", user_id);
            }
        }
    }
}

/// What is being counted: a metric, or a response code label
/// (either a group such as `2XX` or an exact code such as `404`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Subject<'a> {
    Metric(&'a str),
    ResponseCode(&'a str),
}

/// Builds every key this crate writes to the store.
#[derive(Clone, Debug)]
pub struct KeyFactory {
    prefix: String,
}

impl Default for KeyFactory {
    fn default() -> Self {
        KeyFactory::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyFactory {
    pub fn new(prefix: &str) -> Self {
        KeyFactory {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The key of a single counter.
    pub fn counter_key(
        &self,
        scope: &Scope,
        subject: &Subject,
        granularity: Granularity,
        period: &str,
    ) -> String {
        let mut key = String::with_capacity(64);
        key.push_str(&self.prefix);
        let subject_id = match subject {
            Subject::Metric(id) => id,
            Subject::ResponseCode(label) => {
                key.push_str("/response_codes");
                label
            }
        };
        scope.write_path(&mut key);
        push_component(&mut key, "metric", subject_id);
        key.push('/');
        key.push_str(granularity.as_str());
        key.push('/');
        key.push_str(period);
        key
    }

    /// Keys for one scope/subject pair across the given periods, in
    /// granularity order.
    pub fn keys_for(
        &self,
        scope: &Scope,
        subject: &Subject,
        periods: &Periods,
    ) -> Vec<(Granularity, String)> {
        periods
            .iter()
            .map(|(granularity, period)| {
                (
                    *granularity,
                    self.counter_key(scope, subject, *granularity, period),
                )
            })
            .collect()
    }

    /// Set of application ids seen for a service.
    pub fn applications_key(&self, service_id: &str) -> String {
        let mut key = self.prefix.clone();
        push_component(&mut key, "service", service_id);
        key.push_str("/applications");
        key
    }

    pub fn dirty_prefix(&self) -> String {
        format!("{}/dirty/", self.prefix)
    }

    /// Set of counter keys written into a bucket since its last export.
    pub fn dirty_key(&self, bucket: &BucketId) -> String {
        format!("{}{}", self.dirty_prefix(), bucket)
    }

    /// Sorted set of buckets waiting to be exported, scored by bucket
    /// start time.
    pub fn pending_buckets_key(&self) -> String {
        format!("{}/pending_buckets", self.prefix)
    }

    pub fn lock_key(&self, name: &str) -> String {
        format!("{}/lock/{}", self.prefix, name)
    }

    pub fn toggle_key(&self) -> String {
        format!("{}/storage_enabled", self.prefix)
    }
}

/// Appends `/<label>:<id>`, escaping characters that would let an id
/// forge extra path segments.
fn push_component(out: &mut String, label: &str, id: &str) {
    out.push('/');
    out.push_str(label);
    out.push(':');
    for c in id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
}
