//! Execution record store.
//!
//! [`ExecutionStore`] is the object-safe boundary callers program against;
//! [`KvExecutionStore`] implements it over a sharded [`KvBackend`] and any
//! wrapper (such as the instrumented facade) can implement it by delegating.
//!
//! [`KvBackend`]: crate::backend::KvBackend

mod kv_store;
mod mirror;
mod scan;


pub use kv_store::KvExecutionStore;
pub use mirror::MirrorMessage;
pub use scan::{ChunkFailure, ChunkedScan, ScanReport, ScanResult};

use crate::core::{ExecutionCriteria, ExecutionRecord};
use crate::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeSet;

/// Mutation applied by [`ExecutionStore::update`].
///
/// It may run more than once: on an optimistic-concurrency conflict it is
/// re-applied to a freshly read record.
pub type RecordMutator = Box<dyn Fn(&mut ExecutionRecord) + Send + Sync>;

/// Lazy sequence of records. An error item ends the sequence.
pub type RecordStream = BoxStream<'static, Result<ExecutionRecord>>;

/// Persistence of execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persists a new record.
    ///
    /// Fails with `DuplicateId` if the id exists, leaving the stored record
    /// untouched.
    async fn create(&self, record: ExecutionRecord) -> Result<()>;

    /// Reads, mutates and writes back a record, returning the stored result.
    async fn update(&self, id: &str, mutator: RecordMutator) -> Result<ExecutionRecord>;

    /// Reads one record.
    async fn retrieve(&self, id: &str) -> Result<ExecutionRecord>;

    /// Streams an application's records, newest build time first per shard.
    ///
    /// Calling again restarts from the beginning.
    fn retrieve_by_application(
        &self,
        application: &str,
        criteria: ExecutionCriteria,
    ) -> RecordStream;

    /// Scans every record of every application in parallel chunks.
    ///
    /// Must be called from within a tokio runtime.
    fn retrieve_all_applications(&self) -> ChunkedScan;

    /// Deletes a record and its index entries. Deleting an absent id is a no-op.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Names of every application with at least one record ever created.
    async fn retrieve_application_names(&self) -> Result<BTreeSet<String>>;
}

/// Boxes a closure as a [`RecordMutator`].
pub fn mutator<F>(f: F) -> RecordMutator
where
    F: Fn(&mut ExecutionRecord) + Send + Sync + 'static,
{
    Box::new(f)
}
