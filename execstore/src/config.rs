//! Store configuration.
//!
//! Configuration is a plain validated struct. Defaults are applied by serde
//! when loading and by [`Default`] when building in code; nothing is bound by
//! inspecting fields at runtime. [`StoreConfig::validate`] must pass before
//! the struct is handed to the store.

use crate::core::ExecutionStatus;
use crate::errors::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "EXECSTORE_";

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent connections borrowed from a shard.
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    /// Maximum idle connections kept open.
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Minimum idle connections kept open.
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    /// Connections held back from scan workers for foreground traffic.
    #[serde(default = "default_scan_reserved")]
    pub scan_reserved: usize,
}

fn default_max_total() -> usize {
    100
}

fn default_max_idle() -> usize {
    100
}

fn default_min_idle() -> usize {
    25
}

fn default_scan_reserved() -> usize {
    25
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_idle: default_max_idle(),
            min_idle: default_min_idle(),
            scan_reserved: default_scan_reserved(),
        }
    }
}

impl PoolConfig {
    /// Number of connections scan workers may hold at once.
    #[must_use]
    pub fn scan_capacity(&self) -> usize {
        self.max_total.saturating_sub(self.scan_reserved)
    }

    /// Validates pool sizing.
    pub fn validate(&self) -> Result<()> {
        if self.max_total == 0 {
            return Err(StoreError::configuration("pool.max_total must be greater than 0"));
        }
        if self.min_idle > self.max_idle {
            return Err(StoreError::configuration(format!(
                "pool.min_idle ({}) must not exceed pool.max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        if self.max_idle > self.max_total {
            return Err(StoreError::configuration(format!(
                "pool.max_idle ({}) must not exceed pool.max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.scan_reserved >= self.max_total {
            return Err(StoreError::configuration(format!(
                "pool.scan_reserved ({}) must be less than pool.max_total ({})",
                self.scan_reserved, self.max_total
            )));
        }
        Ok(())
    }
}

/// One backend shard in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Stable shard name.
    pub name: String,
    /// Connection URL, e.g. `redis://host:6379/0`.
    pub url: String,
}

impl ShardConfig {
    /// Creates a shard entry.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Configuration for the execution store and cluster lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Whether this store implementation is enabled at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connection pool sizing, applied per shard.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Number of chunks a full scan is split into.
    #[serde(default = "default_scan_chunk_count")]
    pub scan_chunk_count: usize,
    /// Key prefix for best-effort status mirroring. Empty disables it.
    #[serde(default)]
    pub buffered_prefix: Option<String>,
    /// Statuses whose transitions are mirrored.
    #[serde(default = "default_mirror_statuses")]
    pub mirror_statuses: Vec<ExecutionStatus>,
    /// Timeout for every backend command, in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Timeout for one mirror write, in milliseconds.
    #[serde(default = "default_mirror_timeout_ms")]
    pub mirror_timeout_ms: u64,
    /// Compare-and-swap attempts before an update reports a conflict.
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: usize,
    /// Index entries fetched per page by application queries.
    #[serde(default = "default_application_page_size")]
    pub application_page_size: usize,
    /// Backend topology. Order is significant for routing.
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
    /// Identifier of this process, used in lock owner tokens.
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_scan_chunk_count() -> usize {
    75
}

fn default_mirror_statuses() -> Vec<ExecutionStatus> {
    ExecutionStatus::ALL.to_vec()
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_mirror_timeout_ms() -> u64 {
    1_000
}

fn default_max_update_attempts() -> usize {
    10
}

fn default_application_page_size() -> usize {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            pool: PoolConfig::default(),
            scan_chunk_count: default_scan_chunk_count(),
            buffered_prefix: None,
            mirror_statuses: default_mirror_statuses(),
            command_timeout_ms: default_command_timeout_ms(),
            mirror_timeout_ms: default_mirror_timeout_ms(),
            max_update_attempts: default_max_update_attempts(),
            application_page_size: default_application_page_size(),
            shards: Vec::new(),
            instance_id: None,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| StoreError::configuration(format!("invalid store config: {e}")))
    }

    /// Sets the scan chunk count.
    #[must_use]
    pub fn with_scan_chunk_count(mut self, chunks: usize) -> Self {
        self.scan_chunk_count = chunks;
        self
    }

    /// Sets the mirroring prefix.
    #[must_use]
    pub fn with_buffered_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.buffered_prefix = Some(prefix.into());
        self
    }

    /// Sets the mirrored statuses.
    #[must_use]
    pub fn with_mirror_statuses(mut self, statuses: Vec<ExecutionStatus>) -> Self {
        self.mirror_statuses = statuses;
        self
    }

    /// Sets the pool config.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the command timeout.
    #[must_use]
    pub fn with_command_timeout_ms(mut self, millis: u64) -> Self {
        self.command_timeout_ms = millis;
        self
    }

    /// Sets the application page size.
    #[must_use]
    pub fn with_application_page_size(mut self, size: usize) -> Self {
        self.application_page_size = size;
        self
    }

    /// Adds a shard to the topology.
    #[must_use]
    pub fn with_shard(mut self, shard: ShardConfig) -> Self {
        self.shards.push(shard);
        self
    }

    /// Sets the instance id.
    #[must_use]
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Returns the mirroring prefix, treating an empty string as unset.
    #[must_use]
    pub fn buffered_prefix(&self) -> Option<&str> {
        self.buffered_prefix.as_deref().filter(|p| !p.is_empty())
    }

    /// Gets the command timeout as a Duration.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Gets the mirror timeout as a Duration.
    #[must_use]
    pub fn mirror_timeout(&self) -> Duration {
        Duration::from_millis(self.mirror_timeout_ms)
    }

    /// Number of concurrent scan workers.
    #[must_use]
    pub fn scan_workers(&self) -> usize {
        self.scan_chunk_count.min(self.pool.scan_capacity()).max(1)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        if self.scan_chunk_count == 0 {
            return Err(StoreError::configuration("scan_chunk_count must be greater than 0"));
        }
        if self.scan_chunk_count > self.pool.scan_capacity() {
            return Err(StoreError::configuration(format!(
                "scan_chunk_count ({}) exceeds the pool's safe scan capacity ({} = max_total {} - scan_reserved {})",
                self.scan_chunk_count,
                self.pool.scan_capacity(),
                self.pool.max_total,
                self.pool.scan_reserved
            )));
        }
        if self.command_timeout_ms == 0 {
            return Err(StoreError::configuration("command_timeout_ms must be greater than 0"));
        }
        if self.mirror_timeout_ms == 0 {
            return Err(StoreError::configuration("mirror_timeout_ms must be greater than 0"));
        }
        if self.max_update_attempts == 0 {
            return Err(StoreError::configuration("max_update_attempts must be greater than 0"));
        }
        if self.application_page_size == 0 {
            return Err(StoreError::configuration(
                "application_page_size must be greater than 0",
            ));
        }

        let mut names = std::collections::HashSet::new();
        for shard in &self.shards {
            if shard.name.is_empty() {
                return Err(StoreError::configuration("shard name must not be empty"));
            }
            if !names.insert(shard.name.as_str()) {
                return Err(StoreError::configuration(format!(
                    "duplicate shard name '{}'",
                    shard.name
                )));
            }
        }
        Ok(())
    }

    /// Applies `EXECSTORE_*` overrides from the process environment.
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies `EXECSTORE_*` overrides from an iterator of variables.
    ///
    /// Recognised keys: `ENABLED`, `SCAN_CHUNK_COUNT`, `BUFFERED_PREFIX`,
    /// `POOL_MAX_TOTAL`, `POOL_MAX_IDLE`, `POOL_MIN_IDLE`,
    /// `POOL_SCAN_RESERVED`, `COMMAND_TIMEOUT_MS`, `INSTANCE_ID`, and
    /// `SHARDS` as a comma-separated list of `name=url` pairs.
    pub fn apply_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();
            match name {
                "ENABLED" => self.enabled = parse_var(name, &value)?,
                "SCAN_CHUNK_COUNT" => self.scan_chunk_count = parse_var(name, &value)?,
                "BUFFERED_PREFIX" => self.buffered_prefix = Some(value),
                "POOL_MAX_TOTAL" => self.pool.max_total = parse_var(name, &value)?,
                "POOL_MAX_IDLE" => self.pool.max_idle = parse_var(name, &value)?,
                "POOL_MIN_IDLE" => self.pool.min_idle = parse_var(name, &value)?,
                "POOL_SCAN_RESERVED" => self.pool.scan_reserved = parse_var(name, &value)?,
                "COMMAND_TIMEOUT_MS" => self.command_timeout_ms = parse_var(name, &value)?,
                "INSTANCE_ID" => self.instance_id = Some(value),
                "SHARDS" => self.shards = parse_shards(&value)?,
                _ => {}
            }
        }
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        StoreError::configuration(format!("invalid value '{value}' for {ENV_PREFIX}{name}"))
    })
}

fn parse_shards(value: &str) -> Result<Vec<ShardConfig>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, url)| ShardConfig::new(name.trim(), url.trim()))
                .ok_or_else(|| {
                    StoreError::configuration(format!(
                        "invalid shard '{pair}', expected name=url"
                    ))
                })
        })
        .collect()
}
