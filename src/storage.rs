//! This module provides the abstraction over the key-value store the
//! counters live in, so that the aggregation and export logic never
//! depends on a specific store client.
//!
//! Mutations go through a `WriteBatch`, which a `Storage` must apply
//! all-or-nothing. `MemoryStorage` is a complete in-process store used
//! by tests and demos.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{event, Level};

/// Store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The operation does not apply to the kind of value held at the key.
    #[error("operation against key \"{key}\" holding the wrong kind of value")]
    WrongType { key: String },

    /// A counter holds something that is not an integer.
    #[error("value \"{value}\" at key \"{key}\" is not an integer")]
    NotAnInteger { key: String, value: String },

    #[error("increment of key \"{key}\" overflows")]
    Overflow { key: String },

    /// The expiration cannot be represented by the store clock.
    #[error("expiration of {ttl_secs}s for key \"{key}\" is out of range")]
    InvalidExpiration { key: String, ttl_secs: u64 },

    /// The store could not be reached or is in a broken state.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Remaining lifetime of a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOp {
    IncrBy { key: String, by: i64 },
    /// Sets the expiration of an existing key. No-op on missing keys.
    Expire { key: String, ttl: Duration },
    SAdd { key: String, members: Vec<String> },
    /// Removes `member` from the set at `key` only if the counter stored
    /// under the key named `member` still holds `expected`. `None`
    /// stands for a missing counter.
    SRemIfCounter {
        key: String,
        member: String,
        expected: Option<i64>,
    },
    /// Adds a member to a sorted set unless it is already there.
    ZAddNx { key: String, score: i64, member: String },
    /// Removes a member from a sorted set only if the set at `set` is
    /// empty at that point of the batch.
    ZRemIfSetEmpty { key: String, member: String, set: String },
    Del { key: String },
}

/// An ordered list of mutations applied as a unit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_by(&mut self, key: impl Into<String>, by: i64) -> &mut Self {
        self.ops.push(WriteOp::IncrBy { key: key.into(), by });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(WriteOp::Expire { key: key.into(), ttl });
        self
    }

    pub fn sadd<I>(&mut self, key: impl Into<String>, members: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.ops.push(WriteOp::SAdd {
            key: key.into(),
            members: members.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn srem_if_counter(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        expected: Option<i64>,
    ) -> &mut Self {
        self.ops.push(WriteOp::SRemIfCounter {
            key: key.into(),
            member: member.into(),
            expected,
        });
        self
    }

    pub fn zadd_nx(&mut self, key: impl Into<String>, score: i64, member: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::ZAddNx {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn zrem_if_set_empty(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        set: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(WriteOp::ZRemIfSetEmpty {
            key: key.into(),
            member: member.into(),
            set: set.into(),
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Del { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The operations this crate needs from a key-value store.
///
/// Implementations must be safe to share between threads and must
/// apply a `WriteBatch` atomically: after `apply` returns, either every
/// operation is visible or none is.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Sets `key` only if it does not exist, with an expiration.
    /// Returns whether the key was set.
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Deletes `key` only if it currently holds `value`.
    fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StorageError>;

    fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError>;

    fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StorageError>;

    fn scard(&self, key: &str) -> Result<usize, StorageError>;

    /// Members of a sorted set ordered by score, then by member.
    fn zrange(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError>;

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn apply(&self, batch: &WriteBatch) -> Result<(), StorageError>;
}

#[derive(Clone, Debug)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    SortedSet(BTreeMap<String, i64>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Entry {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    /// Collections that became empty disappear, as in most stores.
    fn is_empty_collection(&self) -> bool {
        match &self.value {
            Value::Str(_) => false,
            Value::Set(set) => set.is_empty(),
            Value::SortedSet(zset) => zset.is_empty(),
        }
    }
}

/// Minimum store-clock time between two sweeps of expired keys.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// In-process `Storage` with lazy expiration.
///
/// Expired keys are dropped when a read runs into them, and `apply`
/// sweeps all of them at most once per `SWEEP_INTERVAL`.
///
/// The store clock can be moved forward with `advance`, which lets
/// tests observe expirations without sleeping.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
    next_sweep: Mutex<Option<Instant>>,
    clock_offset_ms: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves this store's notion of "now" forward.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.clock_offset_ms.fetch_add(millis, Ordering::SeqCst);
    }

    fn now(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.clock_offset_ms.load(Ordering::SeqCst))
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))
    }

    fn read<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&Entry>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let now = self.now();
        let mut entries = self.entries()?;
        if entries.get(key).map_or(false, |entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        f(entries.get(key))
    }

    fn sweep_expired(&self, entries: &mut HashMap<String, Entry>, now: Instant) -> Result<(), StorageError> {
        let mut next_sweep = self
            .next_sweep
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))?;
        if next_sweep.map_or(false, |at| at > now) {
            return Ok(());
        }
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        *next_sweep = now.checked_add(SWEEP_INTERVAL);
        let evicted = before - entries.len();
        if evicted > 0 {
            event!(Level::TRACE, evicted, "Expired keys evicted.");
        }
        Ok(())
    }

    /// Number of entries physically held, expired or not.
    #[cfg(test)]
    fn held_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn expiration(key: &str, now: Instant, ttl: Duration) -> Result<Instant, StorageError> {
    now.checked_add(ttl).ok_or_else(|| StorageError::InvalidExpiration {
        key: key.to_string(),
        ttl_secs: ttl.as_secs(),
    })
}

fn staged<'s>(
    staging: &'s mut HashMap<String, Option<Entry>>,
    entries: &HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> &'s mut Option<Entry> {
    staging
        .entry(key.to_string())
        .or_insert_with(|| entries.get(key).filter(|entry| entry.is_live(now)).cloned())
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::WrongType {
        key: key.to_string(),
    }
}

fn apply_op(
    op: &WriteOp,
    staging: &mut HashMap<String, Option<Entry>>,
    entries: &HashMap<String, Entry>,
    now: Instant,
) -> Result<(), StorageError> {
    match op {
        WriteOp::IncrBy { key, by } => {
            let slot = staged(staging, entries, key, now);
            let next = match &*slot {
                None => *by,
                Some(Entry {
                    value: Value::Str(current),
                    ..
                }) => {
                    let parsed: i64 = current.parse().map_err(|_| StorageError::NotAnInteger {
                        key: key.clone(),
                        value: current.clone(),
                    })?;
                    parsed
                        .checked_add(*by)
                        .ok_or_else(|| StorageError::Overflow { key: key.clone() })?
                }
                Some(_) => return Err(wrong_type(key)),
            };
            // Increments keep whatever expiration the key already had.
            let mut entry = slot.take().unwrap_or_else(|| Entry::new(Value::Str(String::new())));
            entry.value = Value::Str(next.to_string());
            *slot = Some(entry);
        }
        WriteOp::Expire { key, ttl } => {
            if let Some(entry) = staged(staging, entries, key, now) {
                entry.expires_at = Some(expiration(key, now, *ttl)?);
            }
        }
        WriteOp::SAdd { key, members } => {
            let entry = staged(staging, entries, key, now)
                .get_or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
            match &mut entry.value {
                Value::Set(set) => set.extend(members.iter().cloned()),
                _ => return Err(wrong_type(key)),
            }
        }
        WriteOp::SRemIfCounter { key, member, expected } => {
            let current = match staged(staging, entries, member, now) {
                None => None,
                Some(Entry {
                    value: Value::Str(current),
                    ..
                }) => Some(current.parse::<i64>().map_err(|_| StorageError::NotAnInteger {
                    key: member.clone(),
                    value: current.clone(),
                })?),
                Some(_) => return Err(wrong_type(member)),
            };
            if current != *expected {
                return Ok(());
            }
            if let Some(entry) = staged(staging, entries, key, now) {
                match &mut entry.value {
                    Value::Set(set) => {
                        set.remove(member);
                    }
                    _ => return Err(wrong_type(key)),
                }
            }
        }
        WriteOp::ZAddNx { key, score, member } => {
            let slot = staged(staging, entries, key, now);
            let entry = slot.get_or_insert_with(|| Entry::new(Value::SortedSet(BTreeMap::new())));
            match &mut entry.value {
                Value::SortedSet(zset) => {
                    zset.entry(member.clone()).or_insert(*score);
                }
                _ => return Err(wrong_type(key)),
            }
        }
        WriteOp::ZRemIfSetEmpty { key, member, set } => {
            let set_is_empty = match staged(staging, entries, set, now) {
                None => true,
                Some(Entry {
                    value: Value::Set(members),
                    ..
                }) => members.is_empty(),
                Some(_) => return Err(wrong_type(set)),
            };
            if let Some(entry) = staged(staging, entries, key, now) {
                match &mut entry.value {
                    Value::SortedSet(zset) => {
                        if set_is_empty {
                            zset.remove(member);
                        }
                    }
                    _ => return Err(wrong_type(key)),
                }
            }
        }
        WriteOp::Del { key } => {
            *staged(staging, entries, key, now) = None;
        }
    }
    Ok(())
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.read(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        let now = self.now();
        let entries = self.entries()?;
        Ok(keys
            .iter()
            .map(|key| match entries.get(key).filter(|entry| entry.is_live(now)) {
                Some(Entry {
                    value: Value::Str(value),
                    ..
                }) => Some(value.clone()),
                _ => None,
            })
            .collect())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries()?
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string())));
        Ok(())
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = self.now();
        let mut entries = self.entries()?;
        if entries.get(key).map_or(false, |entry| entry.is_live(now)) {
            return Ok(false);
        }
        let expires_at = expiration(key, now, ttl)?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(true)
    }

    fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let now = self.now();
        let mut entries = self.entries()?;
        let matches = matches!(
            entries.get(key).filter(|entry| entry.is_live(now)),
            Some(Entry { value: Value::Str(current), .. }) if current == value
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError> {
        let now = self.now();
        self.read(key, |entry| {
            Ok(match entry {
                None => KeyTtl::Missing,
                Some(Entry {
                    expires_at: None, ..
                }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => KeyTtl::Expires(at.saturating_duration_since(now)),
            })
        })
    }

    fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StorageError> {
        self.read(key, |entry| match entry {
            None => Ok(BTreeSet::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    fn scard(&self, key: &str) -> Result<usize, StorageError> {
        self.read(key, |entry| match entry {
            None => Ok(0),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.len()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    fn zrange(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        self.read(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::SortedSet(zset),
                ..
            }) => {
                let mut members: Vec<(String, i64)> =
                    zset.iter().map(|(member, score)| (member.clone(), *score)).collect();
                members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let now = self.now();
        let entries = self.entries()?;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let now = self.now();
        let mut entries = self.entries()?;
        self.sweep_expired(&mut entries, now)?;

        // Run the whole batch against a copy of the keys it touches and
        // only publish the result once every op succeeded.
        let mut staging: HashMap<String, Option<Entry>> = HashMap::new();
        for op in batch.ops() {
            apply_op(op, &mut staging, &entries, now)?;
        }

        for (key, entry) in staging {
            match entry {
                Some(entry) if !entry.is_empty_collection() => {
                    entries.insert(key, entry);
                }
                _ => {
                    entries.remove(&key);
                }
            }
        }
        event!(Level::TRACE, ops = batch.len(), "Write batch applied.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyTtl, MemoryStorage, Storage, StorageError, WriteBatch};
    use std::collections::BTreeSet;
    use std::time::Duration;

    #[test]
    fn test_incr_and_get() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch.incr_by("a", 5).incr_by("a", 4).incr_by("b", 1);
        storage.apply(&batch).unwrap();

        assert_eq!(storage.get("a").unwrap(), Some("9".to_string()));
        assert_eq!(
            storage
                .mget(&["a".to_string(), "missing".to_string(), "b".to_string()])
                .unwrap(),
            vec![Some("9".to_string()), None, Some("1".to_string())]
        );
    }

    #[test]
    fn test_failed_batch_has_no_effect() {
        let storage = MemoryStorage::new();
        let mut setup = WriteBatch::new();
        setup.sadd("a_set", ["x"]);
        storage.apply(&setup).unwrap();

        let mut batch = WriteBatch::new();
        batch
            .incr_by("counter", 3)
            .sadd("other_set", ["y"])
            .incr_by("a_set", 1);
        assert_eq!(
            storage.apply(&batch),
            Err(StorageError::WrongType {
                key: "a_set".to_string()
            })
        );

        assert_eq!(storage.get("counter").unwrap(), None);
        assert_eq!(storage.scard("other_set").unwrap(), 0);
        assert_eq!(storage.smembers("a_set").unwrap(), BTreeSet::from(["x".to_string()]));
    }

    #[test]
    fn test_non_integer_counter() {
        let storage = MemoryStorage::new();
        storage.set("a", "abc").unwrap();
        let mut batch = WriteBatch::new();
        batch.incr_by("a", 1);
        assert!(matches!(
            storage.apply(&batch),
            Err(StorageError::NotAnInteger { .. })
        ));
    }

    #[test]
    fn test_expiration() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch
            .incr_by("volatile", 1)
            .expire("volatile", Duration::from_secs(180))
            .incr_by("durable", 1)
            .expire("never_written", Duration::from_secs(1));
        storage.apply(&batch).unwrap();

        match storage.ttl("volatile").unwrap() {
            KeyTtl::Expires(left) => {
                assert!(left > Duration::ZERO);
                assert!(left <= Duration::from_secs(180));
            }
            other => panic!("unexpected ttl {:?}", other),
        }
        assert_eq!(storage.ttl("durable").unwrap(), KeyTtl::Persistent);
        assert_eq!(storage.ttl("never_written").unwrap(), KeyTtl::Missing);

        storage.advance(Duration::from_secs(181));
        assert_eq!(storage.get("volatile").unwrap(), None);
        assert_eq!(storage.ttl("volatile").unwrap(), KeyTtl::Missing);
        assert_eq!(storage.get("durable").unwrap(), Some("1".to_string()));

        // An expired key starts over.
        let mut batch = WriteBatch::new();
        batch.incr_by("volatile", 2);
        storage.apply(&batch).unwrap();
        assert_eq!(storage.get("volatile").unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_sets_and_sorted_sets() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch
            .sadd("s", ["a", "b"])
            .sadd("s", ["b", "c"])
            .zadd_nx("z", 20, "late")
            .zadd_nx("z", 10, "early")
            .zadd_nx("z", 99, "early");
        storage.apply(&batch).unwrap();

        assert_eq!(storage.scard("s").unwrap(), 3);
        assert_eq!(
            storage.zrange("z").unwrap(),
            vec![("early".to_string(), 10), ("late".to_string(), 20)]
        );

        let mut batch = WriteBatch::new();
        batch
            .srem_if_counter("s", "a", None)
            .srem_if_counter("s", "b", None)
            .zrem_if_set_empty("z", "early", "s");
        storage.apply(&batch).unwrap();
        assert_eq!(storage.zrange("z").unwrap().len(), 2);

        let mut batch = WriteBatch::new();
        batch.srem_if_counter("s", "c", None).zrem_if_set_empty("z", "early", "s");
        storage.apply(&batch).unwrap();
        assert_eq!(storage.zrange("z").unwrap(), vec![("late".to_string(), 20)]);
        assert_eq!(storage.keys_with_prefix("s").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_set_nx_ex_and_conditional_delete() {
        let storage = MemoryStorage::new();
        assert!(storage.set_nx_ex("lock", "one", Duration::from_secs(10)).unwrap());
        assert!(!storage.set_nx_ex("lock", "two", Duration::from_secs(10)).unwrap());
        assert!(!storage.delete_if_equals("lock", "two").unwrap());
        assert!(storage.delete_if_equals("lock", "one").unwrap());
        assert!(storage.set_nx_ex("lock", "two", Duration::from_secs(10)).unwrap());

        storage.advance(Duration::from_secs(11));
        assert!(storage.set_nx_ex("lock", "three", Duration::from_secs(10)).unwrap());
        assert_eq!(storage.get("lock").unwrap(), Some("three".to_string()));
    }

    #[test]
    fn test_keys_with_prefix() {
        let storage = MemoryStorage::new();
        storage.set("stats/dirty/2", "x").unwrap();
        storage.set("stats/dirty/1", "x").unwrap();
        storage.set("stats/other", "x").unwrap();
        assert_eq!(
            storage.keys_with_prefix("stats/dirty/").unwrap(),
            vec!["stats/dirty/1".to_string(), "stats/dirty/2".to_string()]
        );
    }

    #[test]
    fn test_srem_if_counter_checks_the_current_value() {
        let storage = MemoryStorage::new();
        let mut batch = WriteBatch::new();
        batch.incr_by("counter", 5).sadd("dirty", ["counter", "gone"]);
        storage.apply(&batch).unwrap();

        // The counter moved on since it was read.
        let mut batch = WriteBatch::new();
        batch
            .incr_by("counter", 4)
            .srem_if_counter("dirty", "counter", Some(5))
            .srem_if_counter("dirty", "gone", None);
        storage.apply(&batch).unwrap();
        assert_eq!(storage.smembers("dirty").unwrap(), BTreeSet::from(["counter".to_string()]));

        let mut batch = WriteBatch::new();
        batch.srem_if_counter("dirty", "counter", Some(9));
        storage.apply(&batch).unwrap();
        assert_eq!(storage.scard("dirty").unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_expiration_is_an_error() {
        let storage = MemoryStorage::new();
        let huge = Duration::from_secs(u64::MAX);

        let mut batch = WriteBatch::new();
        batch.incr_by("volatile", 1).expire("volatile", huge);
        assert_eq!(
            storage.apply(&batch),
            Err(StorageError::InvalidExpiration {
                key: "volatile".to_string(),
                ttl_secs: u64::MAX,
            })
        );
        assert_eq!(storage.get("volatile").unwrap(), None);
        assert!(storage.set_nx_ex("lock", "one", huge).is_err());
        assert_eq!(storage.get("lock").unwrap(), None);
    }

    #[test]
    fn test_expired_keys_are_evicted() {
        let storage = MemoryStorage::new();
        for minute in 0..1000 {
            let key = format!("minute/{}", minute);
            let mut batch = WriteBatch::new();
            batch.incr_by(key.clone(), 1).expire(key, Duration::from_secs(180));
            storage.apply(&batch).unwrap();
            storage.advance(Duration::from_secs(181));
        }
        // Only the last write is still held, and it is already dead.
        assert_eq!(storage.held_keys(), 1);
        assert_eq!(storage.get("minute/999").unwrap(), None);
        assert_eq!(storage.held_keys(), 0);
    }
}
