//! Per-operation accounting and the instrumented store facade.

use super::SpanTimer;
use crate::core::{ExecutionCriteria, ExecutionRecord};
use crate::errors::{ErrorKind, Result, StoreError};
use crate::store::{ChunkedScan, ExecutionStore, RecordMutator, RecordStream};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Counters for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    /// Completed calls.
    pub calls: u64,
    /// Failed calls by error kind.
    pub errors: BTreeMap<ErrorKind, u64>,
    /// Sum of call latencies.
    pub total_latency_ms: f64,
}

impl OperationStats {
    /// Total failed calls.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.values().sum()
    }

    /// Mean latency per call, or zero before the first call.
    #[must_use]
    pub fn mean_latency_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_latency_ms / self.calls as f64
        }
    }
}

/// Registry of [`OperationStats`] keyed by operation name.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    operations: Mutex<BTreeMap<&'static str, OperationStats>>,
}

impl StoreMetrics {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call.
    pub fn record(&self, operation: &'static str, latency_ms: f64, error: Option<ErrorKind>) {
        let mut operations = self.operations.lock();
        let stats = operations.entry(operation).or_default();
        stats.calls += 1;
        stats.total_latency_ms += latency_ms;
        if let Some(kind) = error {
            *stats.errors.entry(kind).or_insert(0) += 1;
        }
    }

    /// Records an error surfaced after the call returned, e.g. by a stream item.
    pub fn record_error(&self, operation: &'static str, kind: ErrorKind) {
        *self
            .operations
            .lock()
            .entry(operation)
            .or_default()
            .errors
            .entry(kind)
            .or_insert(0) += 1;
    }

    /// Stats for one operation.
    #[must_use]
    pub fn get(&self, operation: &str) -> Option<OperationStats> {
        self.operations.lock().get(operation).cloned()
    }

    /// Number of calls of one operation.
    #[must_use]
    pub fn calls(&self, operation: &str) -> u64 {
        self.get(operation).map_or(0, |s| s.calls)
    }

    /// Number of errors of one kind for one operation.
    #[must_use]
    pub fn errors(&self, operation: &str, kind: ErrorKind) -> u64 {
        self.get(operation)
            .and_then(|s| s.errors.get(&kind).copied())
            .unwrap_or(0)
    }

    /// Clears every counter.
    pub fn reset(&self) {
        self.operations.lock().clear();
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(&*self.operations.lock()).unwrap_or(serde_json::Value::Null)
    }
}

/// Operation names used as metric keys.
pub mod operations {
    /// `create`
    pub const CREATE: &str = "create";
    /// `update`
    pub const UPDATE: &str = "update";
    /// `retrieve`
    pub const RETRIEVE: &str = "retrieve";
    /// `retrieve_by_application`
    pub const RETRIEVE_BY_APPLICATION: &str = "retrieve_by_application";
    /// `retrieve_all_applications`
    pub const RETRIEVE_ALL_APPLICATIONS: &str = "retrieve_all_applications";
    /// `delete`
    pub const DELETE: &str = "delete";
    /// `retrieve_application_names`
    pub const RETRIEVE_APPLICATION_NAMES: &str = "retrieve_application_names";
}

/// [`ExecutionStore`] wrapper that times and counts every call.
///
/// Results and errors pass through untouched.
pub struct InstrumentedExecutionStore {
    inner: Arc<dyn ExecutionStore>,
    metrics: Arc<StoreMetrics>,
}

impl InstrumentedExecutionStore {
    /// Wraps `inner`, reporting into `metrics`.
    #[must_use]
    pub fn new(inner: Arc<dyn ExecutionStore>, metrics: Arc<StoreMetrics>) -> Self {
        Self { inner, metrics }
    }

    /// The metrics registry.
    #[must_use]
    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    fn observe<T>(&self, timer: SpanTimer, result: &Result<T>) {
        let operation = timer.name();
        let latency_ms = timer.finish();
        let error = result.as_ref().err().map(StoreError::kind);
        self.metrics.record(operation, latency_ms, error);
        debug!(
            operation,
            latency_ms,
            error = error.map(ErrorKind::as_str),
            "Execution store call"
        );
    }
}

impl std::fmt::Debug for InstrumentedExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedExecutionStore")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ExecutionStore for InstrumentedExecutionStore {
    async fn create(&self, record: ExecutionRecord) -> Result<()> {
        let timer = SpanTimer::start(operations::CREATE);
        let result = self.inner.create(record).await;
        self.observe(timer, &result);
        result
    }

    async fn update(&self, id: &str, mutator: RecordMutator) -> Result<ExecutionRecord> {
        let timer = SpanTimer::start(operations::UPDATE);
        let result = self.inner.update(id, mutator).await;
        self.observe(timer, &result);
        result
    }

    async fn retrieve(&self, id: &str) -> Result<ExecutionRecord> {
        let timer = SpanTimer::start(operations::RETRIEVE);
        let result = self.inner.retrieve(id).await;
        self.observe(timer, &result);
        result
    }

    fn retrieve_by_application(
        &self,
        application: &str,
        criteria: ExecutionCriteria,
    ) -> RecordStream {
        let timer = SpanTimer::start(operations::RETRIEVE_BY_APPLICATION);
        let stream = self.inner.retrieve_by_application(application, criteria);
        self.observe(timer, &Ok(()));

        let metrics = Arc::clone(&self.metrics);
        stream
            .inspect(move |item| {
                if let Err(e) = item {
                    metrics.record_error(operations::RETRIEVE_BY_APPLICATION, e.kind());
                }
            })
            .boxed()
    }

    fn retrieve_all_applications(&self) -> ChunkedScan {
        let timer = SpanTimer::start(operations::RETRIEVE_ALL_APPLICATIONS);
        let scan = self.inner.retrieve_all_applications();
        self.observe(timer, &Ok(()));
        scan
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let timer = SpanTimer::start(operations::DELETE);
        let result = self.inner.delete(id).await;
        self.observe(timer, &result);
        result
    }

    async fn retrieve_application_names(&self) -> Result<BTreeSet<String>> {
        let timer = SpanTimer::start(operations::RETRIEVE_APPLICATION_NAMES);
        let result = self.inner.retrieve_application_names().await;
        self.observe(timer, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mutator;
    use crate::testing::{pipeline_record, StoreHarness};
    use pretty_assertions::assert_eq;

    fn instrumented(h: &StoreHarness) -> InstrumentedExecutionStore {
        InstrumentedExecutionStore::new(
            Arc::clone(&h.store) as Arc<dyn ExecutionStore>,
            Arc::new(StoreMetrics::new()),
        )
    }

    #[test]
    fn test_stats_accumulate() {
        let metrics = StoreMetrics::new();
        metrics.record("create", 2.0, None);
        metrics.record("create", 4.0, Some(ErrorKind::DuplicateId));

        let stats = metrics.get("create").unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.error_count(), 1);
        assert!((stats.mean_latency_ms() - 3.0).abs() < f64::EPSILON);
        assert_eq!(metrics.to_dict()["create"]["errors"]["duplicate_id"], 1);

        metrics.reset();
        assert_eq!(metrics.calls("create"), 0);
    }

    #[tokio::test]
    async fn test_facade_counts_calls_and_error_kinds() {
        let h = StoreHarness::new(2).unwrap();
        let store = instrumented(&h);

        store.create(pipeline_record("run-1", "app-a", 1)).await.unwrap();
        let dup = store.create(pipeline_record("run-1", "app-a", 1)).await;
        assert!(dup.is_err());
        let missing = store.retrieve("missing").await;
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);
        store
            .update("run-1", mutator(|r| r.status = crate::core::ExecutionStatus::Running))
            .await
            .unwrap();

        let metrics = store.metrics();
        assert_eq!(metrics.calls(operations::CREATE), 2);
        assert_eq!(metrics.errors(operations::CREATE, ErrorKind::DuplicateId), 1);
        assert_eq!(metrics.errors(operations::RETRIEVE, ErrorKind::NotFound), 1);
        assert_eq!(metrics.calls(operations::UPDATE), 1);
        assert_eq!(metrics.get(operations::UPDATE).unwrap().error_count(), 0);
    }

    #[tokio::test]
    async fn test_facade_passes_streams_through() {
        let h = StoreHarness::new(1).unwrap();
        let store = instrumented(&h);
        for t in 1..=3 {
            store
                .create(pipeline_record(&format!("run-{t}"), "app-a", t))
                .await
                .unwrap();
        }

        let ids: Vec<String> = store
            .retrieve_by_application("app-a", ExecutionCriteria::new())
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec!["run-3", "run-2", "run-1"]);

        let scan = store.retrieve_all_applications().collect_all().await;
        assert_eq!(scan.records.len(), 3);
        assert_eq!(store.metrics().calls(operations::RETRIEVE_ALL_APPLICATIONS), 1);
        assert_eq!(
            store.retrieve_application_names().await.unwrap(),
            ["app-a".to_string()].into_iter().collect()
        );
    }
}
