//! Cluster-wide advisory lock.
//!
//! A lock is a single key holding the owner's token with a TTL. Acquisition
//! is an atomic set-if-absent; renewal and release compare the stored token
//! before touching the key, so a holder whose lock expired and was taken
//! over can never extend or delete the new owner's lock.
//!
//! This is best-effort leader election for singleton background jobs, not
//! consensus: a holder that stalls past its expiry may briefly overlap with
//! the next owner. Work that must not overlap should stop when the token
//! passed by [`ClusterLock::run_exclusive`] is cancelled.

use crate::cancellation::CancellationToken;
use crate::errors::{Result, StoreError};
use crate::keys::lock_key;
use crate::router::ClientRouter;
use crate::utils::generate_owner_token;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Proof of ownership of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    /// Name of the lock.
    pub lock_name: String,
    /// Token unique to this acquisition.
    pub owner_token: String,
    /// When the lock is abandoned unless renewed.
    pub expiry: DateTime<Utc>,
}

impl LockHandle {
    /// Returns true once the expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expiry
    }
}

/// Expiry `hold` from now, capped at the latest representable instant.
fn expiry_after(hold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(hold)
        .ok()
        .and_then(|hold| Utc::now().checked_add_signed(hold))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Renewal interval with up to 10% jitter subtracted, so holders of many
/// locks do not renew in lockstep.
fn heartbeat_interval(hold: Duration) -> Duration {
    let base = hold / 3;
    let max_jitter = u64::try_from(base.as_millis() / 10).unwrap_or(0);
    if max_jitter == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    base.saturating_sub(Duration::from_millis(jitter))
}

/// Distributed mutex over the key-value backend.
#[derive(Debug, Clone)]
pub struct ClusterLock {
    router: Arc<ClientRouter>,
    instance_id: String,
}

impl ClusterLock {
    /// Creates a lock client identifying itself as `instance_id`.
    #[must_use]
    pub fn new(router: Arc<ClientRouter>, instance_id: impl Into<String>) -> Self {
        Self {
            router,
            instance_id: instance_id.into(),
        }
    }

    /// The instance id used to prefix owner tokens.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Attempts to take `lock_name` for `hold`.
    ///
    /// Returns `Ok(None)` if another owner holds it.
    pub async fn try_acquire(&self, lock_name: &str, hold: Duration) -> Result<Option<LockHandle>> {
        let key = lock_key(lock_name);
        let token = generate_owner_token(&self.instance_id);
        let acquired = self
            .router
            .client_for(&key)
            .set_nx_px(&key, &token, hold)
            .await?;

        if !acquired {
            debug!(lock = %lock_name, instance = %self.instance_id, "Lock held elsewhere");
            return Ok(None);
        }

        info!(lock = %lock_name, instance = %self.instance_id, hold_ms = hold.as_millis() as u64, "Lock acquired");
        Ok(Some(LockHandle {
            lock_name: lock_name.to_string(),
            owner_token: token,
            expiry: expiry_after(hold),
        }))
    }

    /// Extends a held lock by `hold` from now.
    ///
    /// Fails with `LockLost` if the lock expired or has another owner.
    pub async fn renew(&self, handle: &LockHandle, hold: Duration) -> Result<LockHandle> {
        let key = lock_key(&handle.lock_name);
        let extended = self
            .router
            .client_for(&key)
            .compare_and_pexpire(&key, &handle.owner_token, hold)
            .await?;

        if !extended {
            warn!(lock = %handle.lock_name, instance = %self.instance_id, "Lock lost before renewal");
            return Err(StoreError::lock_lost(&handle.lock_name));
        }

        debug!(lock = %handle.lock_name, hold_ms = hold.as_millis() as u64, "Lock renewed");
        Ok(LockHandle {
            expiry: expiry_after(hold),
            ..handle.clone()
        })
    }

    /// Releases a held lock. Returns false (and changes nothing) if the lock
    /// is no longer owned by `handle`.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let key = lock_key(&handle.lock_name);
        let released = self
            .router
            .client_for(&key)
            .compare_and_delete(&key, &handle.owner_token)
            .await?;

        if released {
            info!(lock = %handle.lock_name, instance = %self.instance_id, "Lock released");
        } else {
            debug!(lock = %handle.lock_name, "Release skipped, lock not owned");
        }
        Ok(released)
    }

    /// Runs `work` while holding `lock_name`, renewing it in the background.
    ///
    /// Returns `Ok(None)` without running `work` if the lock is held
    /// elsewhere. The heartbeat renews every `hold / 3`; if the lock is lost
    /// the token passed to `work` is cancelled and, once `work` returns, the
    /// call fails with `LockLost`. The lock is released when `work` finishes.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        lock_name: &str,
        hold: Duration,
        work: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(handle) = self.try_acquire(lock_name, hold).await? else {
            return Ok(None);
        };

        let work_token = Arc::new(CancellationToken::new());
        let stop = Arc::new(CancellationToken::new());
        let heartbeat = HeartbeatGuard {
            lock: self.clone(),
            handle: handle.clone(),
            stop: Arc::clone(&stop),
            task: Some(tokio::spawn(heartbeat(
                self.clone(),
                handle,
                hold,
                Arc::clone(&work_token),
                stop,
            ))),
        };

        let output = work(Arc::clone(&work_token)).await;

        let (handle, lost) = match heartbeat.finish().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(lock = %lock_name, error = %e, "Lock heartbeat task failed");
                return Err(StoreError::lock_lost(lock_name));
            }
        };

        if lost {
            return Err(StoreError::lock_lost(lock_name));
        }
        self.release(&handle).await?;
        Ok(Some(output))
    }
}

/// Owns the heartbeat of one `run_exclusive` call.
///
/// If the call is abandoned before [`finish`](Self::finish) (the caller
/// dropped the future or `work` panicked), the heartbeat is aborted and the
/// lock is released on a spawned task, so it can never outlive its holder.
struct HeartbeatGuard {
    lock: ClusterLock,
    handle: LockHandle,
    stop: Arc<CancellationToken>,
    task: Option<JoinHandle<(LockHandle, bool)>>,
}

impl HeartbeatGuard {
    /// Stops the heartbeat and returns the latest handle and whether the lock was lost.
    async fn finish(mut self) -> std::result::Result<(LockHandle, bool), tokio::task::JoinError> {
        self.stop.cancel("work finished");
        match self.task.take() {
            Some(task) => task.await,
            None => Ok((self.handle.clone(), false)),
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.stop.cancel("exclusive run abandoned");
        task.abort();

        warn!(lock = %self.handle.lock_name, "Exclusive run abandoned, releasing lock");
        let lock = self.lock.clone();
        let handle = self.handle.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = lock.release(&handle).await {
                    warn!(lock = %handle.lock_name, error = %e, "Release of abandoned lock failed");
                }
            });
        }
    }
}

/// Renews `handle` until `stop` fires or the lock is lost.
///
/// Returns the latest handle and whether the lock was lost.
async fn heartbeat(
    lock: ClusterLock,
    mut handle: LockHandle,
    hold: Duration,
    work_token: Arc<CancellationToken>,
    stop: Arc<CancellationToken>,
) -> (LockHandle, bool) {
    loop {
        tokio::select! {
            () = stop.cancelled() => return (handle, false),
            () = tokio::time::sleep(heartbeat_interval(hold)) => {}
        }

        match lock.renew(&handle, hold).await {
            Ok(renewed) => handle = renewed,
            Err(StoreError::LockLost { .. }) => {
                work_token.cancel("lock lost");
                return (handle, true);
            }
            Err(e) if handle.is_expired() => {
                warn!(lock = %handle.lock_name, error = %e, "Lock expired while renewal failed");
                work_token.cancel("lock expired");
                return (handle, true);
            }
            Err(e) => {
                warn!(lock = %handle.lock_name, error = %e, "Lock renewal failed, retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvBackend, MemoryBackend};
    use crate::testing::{wait_for, BackendOp, FlakyBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locks(count: usize) -> (Arc<ClientRouter>, Vec<ClusterLock>) {
        let router = Arc::new(ClientRouter::single(Arc::new(MemoryBackend::default())));
        let locks = (0..count)
            .map(|i| ClusterLock::new(Arc::clone(&router), format!("node-{i}")))
            .collect();
        (router, locks)
    }

    #[tokio::test]
    async fn test_migration_lock_handover() {
        let (_, nodes) = locks(2);
        let hold = Duration::from_secs(30);

        let a = nodes[0].try_acquire("migration", hold).await.unwrap().unwrap();
        assert!(a.owner_token.starts_with("node-0:"));
        assert!(nodes[1].try_acquire("migration", hold).await.unwrap().is_none());

        assert!(nodes[0].release(&a).await.unwrap());
        let b = nodes[1].try_acquire("migration", hold).await.unwrap();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (_, nodes) = locks(16);
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for node in nodes {
            let winners = Arc::clone(&winners);
            handles.push(tokio::spawn(async move {
                if node
                    .try_acquire("compaction", Duration::from_secs(30))
                    .await
                    .unwrap()
                    .is_some()
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrenewed_lock_expires() {
        let (_, nodes) = locks(2);
        let hold = Duration::from_millis(50);

        let a = nodes[0].try_acquire("cleanup", hold).await.unwrap().unwrap();
        assert!(nodes[1].try_acquire("cleanup", hold).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(a.is_expired());
        assert!(nodes[1].try_acquire("cleanup", hold).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_renew_or_release() {
        let (router, nodes) = locks(2);
        let stale = nodes[0]
            .try_acquire("cleanup", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = nodes[1]
            .try_acquire("cleanup", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = nodes[0].renew(&stale, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, StoreError::LockLost { .. }));
        assert!(!nodes[0].release(&stale).await.unwrap());

        let key = lock_key("cleanup");
        let holder = router.client_for(&key).get(&key).await.unwrap();
        assert_eq!(holder, Some(fresh.owner_token));
    }

    #[tokio::test]
    async fn test_renew_extends_hold() {
        let (_, nodes) = locks(2);
        let a = nodes[0]
            .try_acquire("cleanup", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let renewed = nodes[0].renew(&a, Duration::from_secs(5)).await.unwrap();
        assert!(renewed.expiry > a.expiry);
        assert_eq!(renewed.owner_token, a.owner_token);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(nodes[1]
            .try_acquire("cleanup", Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_run_exclusive_runs_and_releases() {
        let (_, nodes) = locks(2);

        let result = nodes[0]
            .run_exclusive("report", Duration::from_millis(90), |token| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                assert!(!token.is_cancelled());
                42
            })
            .await
            .unwrap();
        assert_eq!(result, Some(42));

        assert!(nodes[1]
            .try_acquire("report", Duration::from_secs(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_run_exclusive_skips_when_held() {
        let (_, nodes) = locks(2);
        let _held = nodes[0]
            .try_acquire("report", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let result = nodes[1]
            .run_exclusive("report", Duration::from_secs(1), |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_exclusive_cancels_work_when_lock_lost() {
        let flaky = Arc::new(FlakyBackend::new(Arc::new(MemoryBackend::default())));
        let router = Arc::new(ClientRouter::single(Arc::clone(&flaky) as Arc<dyn KvBackend>));
        let lock = ClusterLock::new(router, "node-0");
        flaky.fail_op(BackendOp::CompareAndPExpire);

        let result = lock
            .run_exclusive("report", Duration::from_millis(90), |token| async move {
                tokio::time::timeout(Duration::from_secs(2), token.cancelled())
                    .await
                    .is_ok()
            })
            .await;

        assert!(matches!(result, Err(StoreError::LockLost { .. })));
        assert!(flaky.call_count(BackendOp::CompareAndPExpire) >= 1);
    }

    #[tokio::test]
    async fn test_abandoned_run_exclusive_frees_lock() {
        let (router, nodes) = locks(2);
        let a = nodes[0].clone();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            a.run_exclusive("job", Duration::from_secs(30), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }),
        )
        .await;
        assert!(abandoned.is_err());

        let b = nodes[1].clone();
        let acquired = wait_for(Duration::from_secs(2), || {
            let b = b.clone();
            async move {
                b.try_acquire("job", Duration::from_secs(30))
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;
        assert!(acquired);

        // The aborted heartbeat must not keep touching the new owner's lock.
        let key = lock_key("job");
        let holder = router.client_for(&key).get(&key).await.unwrap().unwrap();
        assert!(holder.starts_with("node-1:"));
    }

    #[tokio::test]
    async fn test_panicking_work_frees_lock() {
        let (_, nodes) = locks(2);
        let a = nodes[0].clone();

        let joined = tokio::spawn(async move {
            a.run_exclusive("job", Duration::from_secs(30), |_| async {
                panic!("job failed");
            })
            .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        let b = nodes[1].clone();
        let acquired = wait_for(Duration::from_secs(2), || {
            let b = b.clone();
            async move {
                b.try_acquire("job", Duration::from_secs(30))
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;
        assert!(acquired);
    }

    #[tokio::test]
    async fn test_unrepresentable_hold_caps_expiry() {
        let (_, nodes) = locks(1);
        let hold = Duration::from_secs(10_000_000_000_000);
        let handle = nodes[0].try_acquire("forever", hold).await.unwrap().unwrap();
        assert_eq!(handle.expiry, DateTime::<Utc>::MAX_UTC);
        assert!(!handle.is_expired());

        let renewed = nodes[0].renew(&handle, Duration::MAX).await.unwrap();
        assert_eq!(renewed.expiry, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_heartbeat_interval_is_under_a_third() {
        for _ in 0..100 {
            let interval = heartbeat_interval(Duration::from_millis(3_000));
            assert!(interval <= Duration::from_millis(1_000));
            assert!(interval >= Duration::from_millis(900));
        }
    }
}
