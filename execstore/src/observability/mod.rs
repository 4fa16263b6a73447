//! Observability utilities.
//!
//! The store reports through `tracing`; hosts that do not install their
//! own subscriber can call [`init_tracing`]. [`InstrumentedExecutionStore`]
//! adds per-operation call, error and latency accounting around any
//! [`ExecutionStore`](crate::store::ExecutionStore).

mod metrics;
mod tracing;

pub use metrics::{operations, InstrumentedExecutionStore, OperationStats, StoreMetrics};
pub use tracing::{init_tracing, SpanTimer};
