//! In-process backend with Redis-compatible semantics.

use super::{IndexEntry, KvBackend, VERSION_FIELD};
use crate::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A TTL too large to represent as an `Instant` never expires.
fn expiry_after(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

#[derive(Debug, Default)]
struct MemoryState {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    sorted: HashMap<String, HashMap<String, f64>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl MemoryState {
    /// Returns the live string at `key`, evicting it if expired.
    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|(_, expiry)| expiry.is_some_and(|at| Instant::now() >= at));
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn add_index(&mut self, entry: &IndexEntry) {
        match entry {
            IndexEntry::Set { key, member } => {
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            IndexEntry::SortedSet { key, member, score } => {
                self.sorted
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
        }
    }

    fn remove_index(&mut self, entry: &IndexEntry) {
        match entry {
            IndexEntry::Set { key, member } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                    if set.is_empty() {
                        self.sets.remove(key);
                    }
                }
            }
            IndexEntry::SortedSet { key, member, .. } => {
                if let Some(zset) = self.sorted.get_mut(key) {
                    zset.remove(member);
                    if zset.is_empty() {
                        self.sorted.remove(key);
                    }
                }
            }
        }
    }
}

/// A thread-safe in-memory [`KvBackend`].
///
/// Every compound operation runs under one mutex, which gives it the same
/// all-or-nothing visibility a Lua script has on Redis. Used for tests and
/// single-process deployments.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Returns the number of record hashes held.
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.state.lock().hashes.len()
    }

    /// Overwrites a single hash field without any checks.
    ///
    /// Lets tests simulate foreign writers and corrupted data.
    pub fn force_hset(&self, key: &str, field: &str, value: &str) {
        self.state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

fn inclusive_range<T: Clone>(items: &[T], start: usize, stop: usize) -> Vec<T> {
    if start >= items.len() || start > stop {
        return Vec::new();
    }
    let end = stop.min(items.len() - 1);
    items[start..=end].to_vec()
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().live_string(key).cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn create_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        indexes: &[IndexEntry],
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if state.hashes.contains_key(key) {
            return Ok(false);
        }
        state.hashes.insert(key.to_string(), fields.clone());
        for entry in indexes {
            state.add_index(entry);
        }
        Ok(true)
    }

    async fn replace_hash(
        &self,
        key: &str,
        expected_version: u64,
        fields: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let expected = expected_version.to_string();
        let matches = state
            .hashes
            .get(key)
            .and_then(|h| h.get(VERSION_FIELD))
            .is_some_and(|v| *v == expected);
        if !matches {
            return Ok(false);
        }
        state.hashes.insert(key.to_string(), fields.clone());
        Ok(true)
    }

    async fn delete_hash(&self, key: &str, indexes: &[IndexEntry]) -> Result<()> {
        let mut state = self.state.lock();
        state.hashes.remove(key);
        for entry in indexes {
            state.remove_index(entry);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zrevrangebyscore_with_scores(
        &self,
        key: &str,
        max: Option<f64>,
        count: usize,
    ) -> Result<Vec<(String, f64)>> {
        let state = self.state.lock();
        let Some(zset) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<(String, f64)> = zset
            .iter()
            .filter(|(_, score)| max.map_or(true, |max| **score <= max))
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        ordered.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        ordered.truncate(count);
        Ok(ordered)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>> {
        let state = self.state.lock();
        let items: Vec<String> = state
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default();
        Ok(inclusive_range(&items, start, stop))
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state
            .strings
            .insert(key.to_string(), (value.to_string(), expiry_after(ttl)));
        Ok(true)
    }

    async fn compare_and_pexpire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_string(key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        if let Some(entry) = state.strings.get_mut(key) {
            entry.1 = expiry_after(ttl);
        }
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_string(key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        state.strings.remove(key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(version: u64) -> BTreeMap<String, String> {
        let mut f = BTreeMap::new();
        f.insert("id".to_string(), "run-1".to_string());
        f.insert(VERSION_FIELD.to_string(), version.to_string());
        f
    }

    #[tokio::test]
    async fn test_create_hash_is_exclusive() {
        let backend = MemoryBackend::default();
        let idx = [IndexEntry::set("all", "run-1"), IndexEntry::sorted("app", "run-1", 5.0)];

        assert!(backend.create_hash("h", &fields(0), &idx).await.unwrap());
        assert!(!backend.create_hash("h", &fields(7), &idx).await.unwrap());

        let stored = backend.hgetall("h").await.unwrap();
        assert_eq!(stored.get(VERSION_FIELD).unwrap(), "0");
        assert_eq!(backend.smembers("all").await.unwrap(), vec!["run-1".to_string()]);
        assert_eq!(
            backend.zrevrangebyscore_with_scores("app", None, 10).await.unwrap(),
            vec![("run-1".to_string(), 5.0)]
        );
    }

    #[tokio::test]
    async fn test_replace_hash_checks_version() {
        let backend = MemoryBackend::default();
        backend.create_hash("h", &fields(0), &[]).await.unwrap();

        assert!(!backend.replace_hash("h", 3, &fields(4)).await.unwrap());
        assert!(backend.replace_hash("h", 0, &fields(1)).await.unwrap());
        assert!(!backend.replace_hash("h", 0, &fields(1)).await.unwrap());
        assert!(!backend.replace_hash("missing", 0, &fields(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_hash_removes_indexes() {
        let backend = MemoryBackend::default();
        let idx = [IndexEntry::set("all", "run-1"), IndexEntry::sorted("app", "run-1", 1.0)];
        backend.create_hash("h", &fields(0), &idx).await.unwrap();

        backend.delete_hash("h", &idx).await.unwrap();
        backend.delete_hash("h", &idx).await.unwrap();

        assert!(backend.hgetall("h").await.unwrap().is_empty());
        assert!(backend.smembers("all").await.unwrap().is_empty());
        assert!(backend.zrevrangebyscore_with_scores("app", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zrevrangebyscore_orders_and_bounds() {
        let backend = MemoryBackend::default();
        for (member, score) in [("a", 1.0), ("b", 3.0), ("c", 2.0), ("d", 2.0)] {
            backend
                .create_hash(member, &fields(0), &[IndexEntry::sorted("z", member, score)])
                .await
                .unwrap();
        }
        let members = |entries: Vec<(String, f64)>| -> Vec<String> {
            entries.into_iter().map(|(m, _)| m).collect()
        };

        let first = backend.zrevrangebyscore_with_scores("z", None, 2).await.unwrap();
        assert_eq!(members(first), vec!["b", "d"]);

        let below = backend
            .zrevrangebyscore_with_scores("z", Some(2.0), 10)
            .await
            .unwrap();
        assert_eq!(members(below), vec!["d", "c", "a"]);
        assert!(backend
            .zrevrangebyscore_with_scores("z", Some(0.5), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lock_primitives() {
        let backend = MemoryBackend::default();
        let ttl = Duration::from_secs(30);

        assert!(backend.set_nx_px("lock", "a", ttl).await.unwrap());
        assert!(!backend.set_nx_px("lock", "b", ttl).await.unwrap());
        assert!(!backend.compare_and_pexpire("lock", "b", ttl).await.unwrap());
        assert!(backend.compare_and_pexpire("lock", "a", ttl).await.unwrap());
        assert!(!backend.compare_and_delete("lock", "b").await.unwrap());
        assert!(backend.compare_and_delete("lock", "a").await.unwrap());
        assert!(backend.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_nx_px_expires() {
        let backend = MemoryBackend::default();
        assert!(backend
            .set_nx_px("lock", "a", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(backend.get("lock").await.unwrap().is_none());
        assert!(backend
            .set_nx_px("lock", "b", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let backend = MemoryBackend::default();
        assert!(backend.set_nx_px("lock", "a", Duration::MAX).await.unwrap());
        assert!(backend
            .compare_and_pexpire("lock", "a", Duration::MAX)
            .await
            .unwrap());
        assert_eq!(backend.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[test]
    fn test_lists_push_to_head() {
        let backend = MemoryBackend::default();
        tokio_test::block_on(async {
            backend.lpush("q", "first").await.unwrap();
            backend.lpush("q", "second").await.unwrap();
            assert_eq!(
                backend.lrange("q", 0, 10).await.unwrap(),
                vec!["second".to_string(), "first".to_string()]
            );
        });
    }
}
