//! Key-value backend abstraction.
//!
//! The store and lock only ever talk to a [`KvBackend`]. The trait exposes
//! the plain GET/hash/set/list primitives plus the handful of atomic
//! compound operations the store relies on for its consistency guarantees:
//!
//! - `create_hash` writes a record and its index entries only if the record
//!   key is absent;
//! - `replace_hash` swaps a record's fields only if its `version` field still
//!   holds the expected value;
//! - `set_nx_px`, `compare_and_pexpire` and `compare_and_delete` back the
//!   cluster lock.
//!
//! Each compound operation is a single backend round trip (a Lua script on
//! Redis, one critical section in memory), so a reader never observes it half
//! applied.

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;

use crate::errors::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Field name every record hash carries for optimistic concurrency.
pub const VERSION_FIELD: &str = "version";

/// A secondary index membership written or removed alongside a record.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEntry {
    /// Membership in a plain set.
    Set {
        /// The set key.
        key: String,
        /// The member.
        member: String,
    },
    /// Membership in a sorted set with a score.
    SortedSet {
        /// The sorted set key.
        key: String,
        /// The member.
        member: String,
        /// The score. Ignored on removal.
        score: f64,
    },
}

impl IndexEntry {
    /// Creates a set membership.
    #[must_use]
    pub fn set(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            member: member.into(),
        }
    }

    /// Creates a sorted-set membership.
    #[must_use]
    pub fn sorted(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        Self::SortedSet {
            key: key.into(),
            member: member.into(),
            score,
        }
    }
}

/// A remote (or in-process) key-value engine.
///
/// Implementations must be safe for concurrent use and must bound every call
/// with a timeout, reporting connectivity problems and timeouts as
/// `StoreError::StoreUnavailable`.
#[async_trait]
pub trait KvBackend: Send + Sync + std::fmt::Debug {
    /// Returns the backend's name, used in logs and errors.
    fn name(&self) -> &str;

    /// Returns the string value at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns every field of the hash at `key`. Empty if absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Atomically writes `fields` to a new hash at `key` and adds `indexes`.
    ///
    /// Returns false and changes nothing if `key` already exists.
    async fn create_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        indexes: &[IndexEntry],
    ) -> Result<bool>;

    /// Atomically replaces the hash at `key` with `fields` if its
    /// [`VERSION_FIELD`] equals `expected_version`.
    ///
    /// Returns false and changes nothing on a mismatch or a missing key.
    async fn replace_hash(
        &self,
        key: &str,
        expected_version: u64,
        fields: &BTreeMap<String, String>,
    ) -> Result<bool>;

    /// Atomically deletes the hash at `key` and removes `indexes`.
    async fn delete_hash(&self, key: &str, indexes: &[IndexEntry]) -> Result<()>;

    /// Returns all members of the set at `key`.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Returns up to `count` members of the sorted set at `key` whose score
    /// is at most `max` (unbounded when `None`), with their scores.
    ///
    /// Members are ordered by descending score, ties by descending member.
    async fn zrevrangebyscore_with_scores(
        &self,
        key: &str,
        max: Option<f64>,
        count: usize,
    ) -> Result<Vec<(String, f64)>>;

    /// Pushes `value` onto the head of the list at `key`.
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;

    /// Returns list elements in the inclusive range `start..=stop`.
    async fn lrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>>;

    /// Sets `key` to `value` with a TTL only if `key` is absent.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Resets the TTL of `key` if it currently holds `value`.
    async fn compare_and_pexpire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` if it currently holds `value`.
    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool>;
}

/// Lua sources shared by script-capable backends.
#[cfg_attr(not(feature = "redis"), allow(dead_code))]
pub(crate) mod scripts {
    /// KEYS[1] = hash. ARGV = field count, field/value pairs, then index
    /// quadruples of (kind, key, member, score) where kind is `s` or `z`.
    pub const CREATE_HASH: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
local n = tonumber(ARGV[1])
local i = 2
for _ = 1, n do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  i = i + 2
end
while i <= #ARGV do
  if ARGV[i] == 's' then
    redis.call('SADD', ARGV[i + 1], ARGV[i + 2])
  else
    redis.call('ZADD', ARGV[i + 1], ARGV[i + 3], ARGV[i + 2])
  end
  i = i + 4
end
return 1
";

    /// KEYS[1] = hash. ARGV = expected version, field count, field/value pairs.
    pub const REPLACE_HASH: &str = r"
local current = redis.call('HGET', KEYS[1], 'version')
if (not current) or current ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
local n = tonumber(ARGV[2])
local i = 3
for _ = 1, n do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  i = i + 2
end
return 1
";

    /// KEYS[1] = hash. ARGV = index triples of (kind, key, member).
    pub const DELETE_HASH: &str = r"
redis.call('DEL', KEYS[1])
local i = 1
while i <= #ARGV do
  if ARGV[i] == 's' then
    redis.call('SREM', ARGV[i + 1], ARGV[i + 2])
  else
    redis.call('ZREM', ARGV[i + 1], ARGV[i + 2])
  end
  i = i + 3
end
return 1
";

    /// KEYS[1] = lock. ARGV = owner token, ttl millis.
    pub const COMPARE_AND_PEXPIRE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

    /// KEYS[1] = lock. ARGV = owner token.
    pub const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";
}
