//! Redis backend over a multiplexed connection manager.

use super::{scripts, IndexEntry, KvBackend};
use crate::config::PoolConfig;
use crate::errors::{Result, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script, ScriptInvocation};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// A [`KvBackend`] talking to one Redis server.
///
/// Commands share a reconnecting [`ConnectionManager`]. A semaphore sized to
/// `pool.max_total` caps concurrent in-flight commands so fan-out scans cannot
/// monopolise the server connection, and every command (including the wait for
/// a permit) is bounded by `command_timeout`.
///
/// Compound operations run as Lua scripts invoked by SHA; the full source is
/// only sent when the server has not cached it yet.
#[derive(Clone)]
pub struct RedisBackend {
    name: String,
    manager: ConnectionManager,
    permits: Arc<Semaphore>,
    command_timeout: Duration,
    scripts: Arc<LuaScripts>,
}

/// Compiled handles of the shared Lua sources.
struct LuaScripts {
    create_hash: Script,
    replace_hash: Script,
    delete_hash: Script,
    compare_and_pexpire: Script,
    compare_and_delete: Script,
}

impl LuaScripts {
    fn new() -> Self {
        Self {
            create_hash: Script::new(scripts::CREATE_HASH),
            replace_hash: Script::new(scripts::REPLACE_HASH),
            delete_hash: Script::new(scripts::DELETE_HASH),
            compare_and_pexpire: Script::new(scripts::COMPARE_AND_PEXPIRE),
            compare_and_delete: Script::new(scripts::COMPARE_AND_DELETE),
        }
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("name", &self.name)
            .field("available_permits", &self.permits.available_permits())
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisBackend {
    /// Connects to the Redis server at `url`.
    pub async fn connect(
        name: impl Into<String>,
        url: &str,
        pool: &PoolConfig,
        command_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(StoreError::configuration(format!(
                "shard '{name}': Redis URL must start with redis:// or rediss://"
            )));
        }

        let client = redis::Client::open(url).map_err(|e| {
            StoreError::configuration(format!("shard '{name}': invalid Redis URL: {e}"))
        })?;

        let manager = tokio::time::timeout(command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::unavailable(&name, "timed out connecting"))?
            .map_err(|e| StoreError::unavailable(&name, format!("failed to connect: {e}")))?;

        info!(
            shard = %name,
            max_total = pool.max_total,
            timeout_ms = command_timeout.as_millis() as u64,
            "Connected Redis shard"
        );

        Ok(Self {
            name,
            manager,
            permits: Arc::new(Semaphore::new(pool.max_total)),
            command_timeout,
            scripts: Arc::new(LuaScripts::new()),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T> {
        self.bounded(|mut conn| async move { cmd.query_async::<_, T>(&mut conn).await })
            .await
    }

    async fn invoke<T: FromRedisValue>(&self, invocation: ScriptInvocation<'_>) -> Result<T> {
        self.bounded(|mut conn| async move { invocation.invoke_async::<_, T>(&mut conn).await })
            .await
    }

    /// Runs `call` on a pooled connection under a permit and the command timeout.
    async fn bounded<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let call = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| StoreError::unavailable(&self.name, "connection pool closed"))?;
            call(self.manager.clone())
                .await
                .map_err(|e| StoreError::unavailable(&self.name, e.to_string()))
        };

        match tokio::time::timeout(self.command_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!(shard = %self.name, "Redis command timed out");
                Err(StoreError::unavailable(
                    &self.name,
                    format!("command timed out after {:?}", self.command_timeout),
                ))
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn create_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        indexes: &[IndexEntry],
    ) -> Result<bool> {
        let mut invocation = self.scripts.create_hash.prepare_invoke();
        invocation.key(key).arg(fields.len());
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        for entry in indexes {
            match entry {
                IndexEntry::Set { key, member } => {
                    invocation.arg("s").arg(key).arg(member).arg(0);
                }
                IndexEntry::SortedSet { key, member, score } => {
                    invocation.arg("z").arg(key).arg(member).arg(*score);
                }
            }
        }
        let created: i64 = self.invoke(invocation).await?;
        Ok(created == 1)
    }

    async fn replace_hash(
        &self,
        key: &str,
        expected_version: u64,
        fields: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let mut invocation = self.scripts.replace_hash.prepare_invoke();
        invocation
            .key(key)
            .arg(expected_version.to_string())
            .arg(fields.len());
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let replaced: i64 = self.invoke(invocation).await?;
        Ok(replaced == 1)
    }

    async fn delete_hash(&self, key: &str, indexes: &[IndexEntry]) -> Result<()> {
        let mut invocation = self.scripts.delete_hash.prepare_invoke();
        invocation.key(key);
        for entry in indexes {
            match entry {
                IndexEntry::Set { key, member } => {
                    invocation.arg("s").arg(key).arg(member);
                }
                IndexEntry::SortedSet { key, member, .. } => {
                    invocation.arg("z").arg(key).arg(member);
                }
            }
        }
        let _: i64 = self.invoke(invocation).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn zrevrangebyscore_with_scores(
        &self,
        key: &str,
        max: Option<f64>,
        count: usize,
    ) -> Result<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZREVRANGEBYSCORE");
        cmd.arg(key);
        match max {
            Some(max) => cmd.arg(max),
            None => cmd.arg("+inf"),
        };
        cmd.arg("-inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(count);
        self.query(cmd).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key).arg(value);
        let _: i64 = self.query(cmd).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.query(cmd).await
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_millis(ttl));
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn compare_and_pexpire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut invocation = self.scripts.compare_and_pexpire.prepare_invoke();
        invocation.key(key).arg(value).arg(ttl_millis(ttl));
        let extended: i64 = self.invoke(invocation).await?;
        Ok(extended == 1)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let mut invocation = self.scripts.compare_and_delete.prepare_invoke();
        invocation.key(key).arg(value);
        let deleted: i64 = self.invoke(invocation).await?;
        Ok(deleted == 1)
    }
}
