//! Record fixtures and an in-memory store harness.

use std::sync::Arc;
use std::time::Duration;

use super::FlakyBackend;
use crate::backend::{KvBackend, MemoryBackend};
use crate::config::StoreConfig;
use crate::core::{ExecutionRecord, StageRecord};
use crate::errors::Result;
use crate::router::ClientRouter;
use crate::store::KvExecutionStore;

/// A pipeline record with a fixed build time, for deterministic ordering.
#[must_use]
pub fn pipeline_record(id: &str, application: &str, build_time: i64) -> ExecutionRecord {
    ExecutionRecord::new(id, application).with_build_time(build_time)
}

/// A pipeline record with one `NOT_STARTED` stage per name.
#[must_use]
pub fn record_with_stages(id: &str, application: &str, stages: &[&str]) -> ExecutionRecord {
    stages.iter().fold(ExecutionRecord::new(id, application), |record, name| {
        record.with_stage(StageRecord::new(*name))
    })
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A store over N in-memory shards, each behind a [`FlakyBackend`].
#[derive(Debug)]
pub struct StoreHarness {
    /// The raw shard contents.
    pub memory: Vec<Arc<MemoryBackend>>,
    /// Failure injection per shard, in routing order.
    pub shards: Vec<Arc<FlakyBackend>>,
    /// The router over the flaky shards.
    pub router: Arc<ClientRouter>,
    /// The store under test.
    pub store: Arc<KvExecutionStore>,
}

impl StoreHarness {
    /// Configuration used by [`new`](Self::new): eight scan chunks.
    #[must_use]
    pub fn default_config() -> StoreConfig {
        StoreConfig::default().with_scan_chunk_count(8)
    }

    /// Builds a harness with `shard_count` shards.
    pub fn new(shard_count: usize) -> Result<Self> {
        Self::with_config(shard_count, Self::default_config())
    }

    /// Builds a harness with `shard_count` shards and `config`.
    pub fn with_config(shard_count: usize, config: StoreConfig) -> Result<Self> {
        let memory: Vec<Arc<MemoryBackend>> = (0..shard_count)
            .map(|i| Arc::new(MemoryBackend::new(format!("shard-{i}"))))
            .collect();
        let shards: Vec<Arc<FlakyBackend>> = memory
            .iter()
            .map(|m| Arc::new(FlakyBackend::new(Arc::clone(m) as Arc<dyn KvBackend>)))
            .collect();
        let router = Arc::new(ClientRouter::new(
            shards
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn KvBackend>)
                .collect(),
        )?);
        let store = Arc::new(KvExecutionStore::new(Arc::clone(&router), config)?);

        Ok(Self {
            memory,
            shards,
            router,
            store,
        })
    }

    /// The flaky wrapper of the shard owning `key`.
    #[must_use]
    pub fn shard_for(&self, key: &str) -> &Arc<FlakyBackend> {
        &self.shards[self.router.shard_for(key)]
    }

    /// The raw contents of the shard owning `key`.
    #[must_use]
    pub fn memory_for(&self, key: &str) -> &Arc<MemoryBackend> {
        &self.memory[self.router.shard_for(key)]
    }

    /// Removes every injected failure.
    pub fn heal(&self) {
        for shard in &self.shards {
            shard.heal();
        }
    }
}
