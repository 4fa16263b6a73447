//! Failure-injecting backend for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{IndexEntry, KvBackend};
use crate::errors::{Result, StoreError};

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    /// `get`
    Get,
    /// `hgetall`
    HGetAll,
    /// `create_hash`
    CreateHash,
    /// `replace_hash`
    ReplaceHash,
    /// `delete_hash`
    DeleteHash,
    /// `smembers`
    SMembers,
    /// `zrevrangebyscore_with_scores`
    ZRevRangeByScore,
    /// `lpush`
    LPush,
    /// `lrange`
    LRange,
    /// `set_nx_px`
    SetNxPx,
    /// `compare_and_pexpire`
    CompareAndPExpire,
    /// `compare_and_delete`
    CompareAndDelete,
}

/// Wraps a backend and fails selected calls with `StoreUnavailable`.
///
/// Failures can be injected per operation or per key. `replace_hash` can
/// also be made to report a version mismatch a given number of times, which
/// simulates a writer in another process winning the race. `hgetall` can be
/// slowed down or stalled, and its peak concurrency is tracked.
#[derive(Debug)]
pub struct FlakyBackend {
    inner: Arc<dyn KvBackend>,
    failing_ops: Mutex<HashSet<BackendOp>>,
    failing_keys: Mutex<HashSet<String>>,
    stalled_keys: Mutex<HashSet<String>>,
    hgetall_delay: Mutex<Option<Duration>>,
    hgetall_in_flight: AtomicUsize,
    hgetall_peak: AtomicUsize,
    conflicts: Mutex<usize>,
    calls: Mutex<HashMap<BackendOp, usize>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FlakyBackend {
    /// Wraps `inner` with no failures injected.
    #[must_use]
    pub fn new(inner: Arc<dyn KvBackend>) -> Self {
        Self {
            inner,
            failing_ops: Mutex::new(HashSet::new()),
            failing_keys: Mutex::new(HashSet::new()),
            stalled_keys: Mutex::new(HashSet::new()),
            hgetall_delay: Mutex::new(None),
            hgetall_in_flight: AtomicUsize::new(0),
            hgetall_peak: AtomicUsize::new(0),
            conflicts: Mutex::new(0),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fails every call of `op`.
    pub fn fail_op(&self, op: BackendOp) {
        self.failing_ops.lock().insert(op);
    }

    /// Fails every call touching `key`.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.lock().insert(key.into());
    }

    /// Makes `hgetall` of `key` hang until the caller gives up.
    pub fn stall_key(&self, key: impl Into<String>) {
        self.stalled_keys.lock().insert(key.into());
    }

    /// Delays every `hgetall` by `delay`.
    pub fn delay_hgetall(&self, delay: Duration) {
        *self.hgetall_delay.lock() = Some(delay);
    }

    /// Highest number of `hgetall` calls observed in flight at once.
    #[must_use]
    pub fn peak_hgetall_in_flight(&self) -> usize {
        self.hgetall_peak.load(Ordering::SeqCst)
    }

    /// Makes the next `count` `replace_hash` calls report a version mismatch.
    pub fn inject_conflicts(&self, count: usize) {
        *self.conflicts.lock() = count;
    }

    /// Removes every injected failure.
    pub fn heal(&self) {
        self.failing_ops.lock().clear();
        self.failing_keys.lock().clear();
        self.stalled_keys.lock().clear();
        *self.hgetall_delay.lock() = None;
        *self.conflicts.lock() = 0;
    }

    /// Returns how many times `op` was called.
    #[must_use]
    pub fn call_count(&self, op: BackendOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn check(&self, op: BackendOp, key: &str) -> Result<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        if self.failing_ops.lock().contains(&op) || self.failing_keys.lock().contains(key) {
            return Err(StoreError::unavailable(
                self.inner.name(),
                format!("injected failure: {op:?} on '{key}'"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for FlakyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check(BackendOp::Get, key)?;
        self.inner.get(key).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check(BackendOp::HGetAll, key)?;
        let in_flight = self.hgetall_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.hgetall_peak.fetch_max(in_flight, Ordering::SeqCst);
        let _leave = InFlight(&self.hgetall_in_flight);

        let stalled = self.stalled_keys.lock().contains(key);
        if stalled {
            std::future::pending::<()>().await;
        }
        let delay = *self.hgetall_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.hgetall(key).await
    }

    async fn create_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        indexes: &[IndexEntry],
    ) -> Result<bool> {
        self.check(BackendOp::CreateHash, key)?;
        self.inner.create_hash(key, fields, indexes).await
    }

    async fn replace_hash(
        &self,
        key: &str,
        expected_version: u64,
        fields: &BTreeMap<String, String>,
    ) -> Result<bool> {
        self.check(BackendOp::ReplaceHash, key)?;
        {
            let mut conflicts = self.conflicts.lock();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Ok(false);
            }
        }
        self.inner.replace_hash(key, expected_version, fields).await
    }

    async fn delete_hash(&self, key: &str, indexes: &[IndexEntry]) -> Result<()> {
        self.check(BackendOp::DeleteHash, key)?;
        self.inner.delete_hash(key, indexes).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check(BackendOp::SMembers, key)?;
        self.inner.smembers(key).await
    }

    async fn zrevrangebyscore_with_scores(
        &self,
        key: &str,
        max: Option<f64>,
        count: usize,
    ) -> Result<Vec<(String, f64)>> {
        self.check(BackendOp::ZRevRangeByScore, key)?;
        self.inner.zrevrangebyscore_with_scores(key, max, count).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.check(BackendOp::LPush, key)?;
        self.inner.lpush(key, value).await
    }

    async fn lrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>> {
        self.check(BackendOp::LRange, key)?;
        self.inner.lrange(key, start, stop).await
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check(BackendOp::SetNxPx, key)?;
        self.inner.set_nx_px(key, value, ttl).await
    }

    async fn compare_and_pexpire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check(BackendOp::CompareAndPExpire, key)?;
        self.inner.compare_and_pexpire(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        self.check(BackendOp::CompareAndDelete, key)?;
        self.inner.compare_and_delete(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn test_injected_failures() {
        let flaky = FlakyBackend::new(Arc::new(MemoryBackend::default()));
        flaky.fail_op(BackendOp::LPush);
        flaky.fail_key("bad");

        assert!(flaky.lpush("q", "x").await.unwrap_err().is_unavailable());
        assert!(flaky.hgetall("bad").await.is_err());
        assert!(flaky.hgetall("good").await.is_ok());
        assert_eq!(flaky.call_count(BackendOp::HGetAll), 2);

        flaky.heal();
        assert!(flaky.lpush("q", "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let flaky = FlakyBackend::new(Arc::new(MemoryBackend::default()));
        let mut fields = BTreeMap::new();
        fields.insert("version".to_string(), "0".to_string());
        flaky.create_hash("h", &fields, &[]).await.unwrap();

        flaky.inject_conflicts(1);
        assert!(!flaky.replace_hash("h", 0, &fields).await.unwrap());
        assert!(flaky.replace_hash("h", 0, &fields).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_and_delayed_reads() {
        let flaky = Arc::new(FlakyBackend::new(Arc::new(MemoryBackend::default())));
        flaky.stall_key("slow");
        flaky.delay_hgetall(Duration::from_millis(20));

        let stalled = tokio::time::timeout(Duration::from_millis(50), flaky.hgetall("slow")).await;
        assert!(stalled.is_err());

        let (a, b) = tokio::join!(flaky.hgetall("a"), flaky.hgetall("b"));
        assert!(a.is_ok() && b.is_ok());
        assert!(flaky.peak_hgetall_in_flight() >= 2);

        flaky.heal();
        assert!(flaky.hgetall("slow").await.is_ok());
    }
}
