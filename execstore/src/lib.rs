//! # Execstore
//!
//! A distributed execution-record store and cluster lock for pipeline
//! orchestration services, built on a sharded key-value backend.
//!
//! Execstore provides:
//!
//! - **Execution store**: create, update, query and delete execution records
//!   with per-record serialized updates and optimistic concurrency
//! - **Chunked scans**: parallel, cancellable full scans that report partial
//!   failure instead of discarding completed work
//! - **Client routing**: stable MD5-based sharding across named backends
//! - **Cluster lock**: token-checked acquire, renew and release with a
//!   heartbeat helper for singleton background jobs
//! - **Instrumentation**: a pass-through facade counting calls, errors and
//!   latency per operation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use execstore::prelude::*;
//!
//! let components = StoreComponents::in_memory(StoreConfig::default())?;
//! let store = components.require_store()?;
//!
//! store.create(ExecutionRecord::new("run-1", "app-a")).await?;
//! store
//!     .update("run-1", mutator(|r| r.status = ExecutionStatus::Running))
//!     .await?;
//!
//! components
//!     .lock
//!     .run_exclusive("migration", Duration::from_secs(30), |token| async move {
//!         // singleton work; stop when `token` is cancelled
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

pub mod backend;
pub mod cancellation;
pub mod codec;
pub mod config;
pub mod core;
pub mod errors;
pub mod keys;
pub mod lock;
pub mod observability;
pub mod router;
pub mod store;
pub mod testing;
pub mod utils;
pub mod wiring;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{KvBackend, MemoryBackend};
    #[cfg(feature = "redis")]
    pub use crate::backend::RedisBackend;
    pub use crate::cancellation::CancellationToken;
    pub use crate::codec::RecordCodec;
    pub use crate::config::{PoolConfig, ShardConfig, StoreConfig};
    pub use crate::core::{
        ExecutionCriteria, ExecutionRecord, ExecutionStatus, ExecutionType, StageRecord,
    };
    pub use crate::errors::{ErrorKind, Result, StoreError};
    pub use crate::lock::{ClusterLock, LockHandle};
    pub use crate::observability::{InstrumentedExecutionStore, StoreMetrics};
    pub use crate::router::ClientRouter;
    pub use crate::store::{
        mutator, ChunkedScan, ExecutionStore, KvExecutionStore, RecordMutator, ScanReport,
        ScanResult,
    };
    pub use crate::wiring::StoreComponents;
    pub use std::time::Duration;
}
