//! Backend key layout.
//!
//! Every key that belongs to a record (its hash and its index memberships)
//! lives on the shard chosen by the record id, so a record and its index
//! entries are always written in one atomic call on one shard.

use crate::backend::IndexEntry;
use crate::core::{ExecutionRecord, ExecutionType};

/// Registry set of application names, one per shard.
pub const APPLICATIONS_KEY: &str = "applications";

/// Hash holding one record.
#[must_use]
pub fn execution_key(id: &str) -> String {
    format!("execution:{id}")
}

/// Set of every record id of a type on a shard.
#[must_use]
pub fn all_jobs_key(execution_type: ExecutionType) -> String {
    format!("allJobs:{}", execution_type.key_segment())
}

/// Sorted set of an application's record ids, scored by build time.
#[must_use]
pub fn application_index_key(execution_type: ExecutionType, application: &str) -> String {
    format!("{}:app:{application}", execution_type.key_segment())
}

/// Key of a cluster lock.
#[must_use]
pub fn lock_key(lock_name: &str) -> String {
    format!("lock:{lock_name}")
}

/// List receiving best-effort status mirror messages.
#[must_use]
pub fn buffered_queue_key(prefix: &str) -> String {
    format!("{prefix}:buffered-executions")
}

/// Index memberships written when a record is created.
#[must_use]
pub fn create_indexes(record: &ExecutionRecord) -> Vec<IndexEntry> {
    vec![
        IndexEntry::set(all_jobs_key(record.execution_type), record.id.clone()),
        IndexEntry::sorted(
            application_index_key(record.execution_type, &record.application),
            record.id.clone(),
            record.build_time as f64,
        ),
        IndexEntry::set(APPLICATIONS_KEY, record.application.clone()),
    ]
}

/// Index memberships removed when a record is deleted.
///
/// The application registry is left alone; other records may still use it.
#[must_use]
pub fn record_indexes(
    execution_type: ExecutionType,
    application: &str,
    id: &str,
) -> Vec<IndexEntry> {
    vec![
        IndexEntry::set(all_jobs_key(execution_type), id),
        IndexEntry::sorted(application_index_key(execution_type, application), id, 0.0),
    ]
}
