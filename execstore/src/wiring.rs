//! Explicit construction of the store, facade and lock.
//!
//! Nothing here is global: a host builds one [`StoreComponents`] at start-up
//! and hands out the `Arc`s it needs.

use crate::backend::KvBackend;
use crate::config::StoreConfig;
use crate::errors::{Result, StoreError};
use crate::lock::ClusterLock;
use crate::observability::{InstrumentedExecutionStore, StoreMetrics};
use crate::router::ClientRouter;
use crate::store::{ExecutionStore, KvExecutionStore};
use crate::utils::generate_instance_id;
use std::sync::Arc;
use tracing::info;

/// Everything a host needs, built from one [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct StoreComponents {
    /// Shard router.
    pub router: Arc<ClientRouter>,
    /// The instrumented store, or `None` when the store is disabled.
    pub store: Option<Arc<InstrumentedExecutionStore>>,
    /// Metrics fed by the store facade.
    pub metrics: Arc<StoreMetrics>,
    /// Cluster lock over the same router.
    pub lock: Arc<ClusterLock>,
    /// The configuration the components were built from.
    pub config: Arc<StoreConfig>,
}

impl StoreComponents {
    /// Builds components over already-connected backends, in routing order.
    pub fn from_backends(config: StoreConfig, backends: Vec<Arc<dyn KvBackend>>) -> Result<Self> {
        config.validate()?;
        let router = Arc::new(ClientRouter::new(backends)?);
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(generate_instance_id);

        let metrics = Arc::new(StoreMetrics::new());
        let store = if config.enabled {
            let inner = KvExecutionStore::new(Arc::clone(&router), config.clone())?;
            Some(Arc::new(InstrumentedExecutionStore::new(
                Arc::new(inner),
                Arc::clone(&metrics),
            )))
        } else {
            info!("Execution store disabled by configuration");
            None
        };

        let lock = Arc::new(ClusterLock::new(Arc::clone(&router), instance_id));
        info!(
            shards = router.len(),
            instance = %lock.instance_id(),
            store_enabled = store.is_some(),
            "Store components ready"
        );

        Ok(Self {
            router,
            store,
            metrics,
            lock,
            config: Arc::new(config),
        })
    }

    /// Builds components with one in-memory backend per configured shard
    /// (or a single one if none are configured).
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        let names: Vec<String> = if config.shards.is_empty() {
            vec!["memory".to_string()]
        } else {
            config.shards.iter().map(|s| s.name.clone()).collect()
        };
        let backends = names
            .into_iter()
            .map(|name| Arc::new(crate::backend::MemoryBackend::new(name)) as Arc<dyn KvBackend>)
            .collect();
        Self::from_backends(config, backends)
    }

    /// Connects to every configured Redis shard and builds components.
    #[cfg(feature = "redis")]
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if config.shards.is_empty() {
            return Err(StoreError::configuration("no shards configured"));
        }

        let mut backends: Vec<Arc<dyn KvBackend>> = Vec::with_capacity(config.shards.len());
        for shard in &config.shards {
            let backend = crate::backend::RedisBackend::connect(
                shard.name.clone(),
                &shard.url,
                &config.pool,
                config.command_timeout(),
            )
            .await?;
            backends.push(Arc::new(backend));
        }
        Self::from_backends(config, backends)
    }

    /// The store as a trait object, if enabled.
    #[must_use]
    pub fn execution_store(&self) -> Option<Arc<dyn ExecutionStore>> {
        self.store
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn ExecutionStore>)
    }

    /// The store, or a configuration error if it is disabled.
    pub fn require_store(&self) -> Result<Arc<dyn ExecutionStore>> {
        self.execution_store()
            .ok_or_else(|| StoreError::configuration("execution store is disabled"))
    }
}

/// Loads configuration from `EXECSTORE_*` variables and connects.
#[cfg(feature = "redis")]
pub async fn connect_from_env() -> anyhow::Result<StoreComponents> {
    use anyhow::Context;

    let config = StoreConfig::default()
        .apply_env_overrides()
        .context("reading EXECSTORE_* environment")?;
    let components = StoreComponents::connect(config)
        .await
        .context("connecting execution store shards")?;
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::core::ExecutionRecord;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_memory_components() {
        let config = StoreConfig::default()
            .with_shard(ShardConfig::new("a", "redis://a"))
            .with_shard(ShardConfig::new("b", "redis://b"))
            .with_instance_id("node-1");
        let components = StoreComponents::in_memory(config).unwrap();

        assert_eq!(components.router.len(), 2);
        assert_eq!(components.lock.instance_id(), "node-1");

        let store = components.require_store().unwrap();
        store.create(ExecutionRecord::new("run-1", "app-a")).await.unwrap();
        assert_eq!(components.metrics.calls("create"), 1);

        let handle = components
            .lock
            .try_acquire("migration", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.owner_token.starts_with("node-1:"));
    }

    #[test]
    fn test_disabled_store() {
        let mut config = StoreConfig::default();
        config.enabled = false;
        let components = StoreComponents::in_memory(config).unwrap();
        assert!(components.store.is_none());
        assert!(components.require_store().is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StoreConfig::default().with_scan_chunk_count(0);
        assert!(StoreComponents::in_memory(config).is_err());
    }

    #[test]
    fn test_generated_instance_id() {
        let components = StoreComponents::in_memory(StoreConfig::default()).unwrap();
        assert!(components.lock.instance_id().starts_with("execstore-"));
    }
}
