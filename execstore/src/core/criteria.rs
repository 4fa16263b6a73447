//! Query criteria for per-application retrieval.

use super::{ExecutionRecord, ExecutionStatus, ExecutionType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Filters applied by `retrieve_by_application`.
///
/// The default matches every record of every type with no limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCriteria {
    /// Restrict to one execution type. `None` queries both.
    #[serde(default)]
    pub execution_type: Option<ExecutionType>,
    /// Only yield records in one of these statuses. Empty means any.
    #[serde(default)]
    pub statuses: BTreeSet<ExecutionStatus>,
    /// Stop after yielding this many records.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Skip records built before this epoch-millis instant.
    #[serde(default)]
    pub start_time_cutoff: Option<i64>,
}

impl ExecutionCriteria {
    /// Creates criteria that match everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one execution type.
    #[must_use]
    pub fn with_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = Some(execution_type);
        self
    }

    /// Adds an accepted status.
    #[must_use]
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    /// Sets the maximum number of records to yield.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips records built before `millis`.
    #[must_use]
    pub fn with_start_time_cutoff(mut self, millis: i64) -> Self {
        self.start_time_cutoff = Some(millis);
        self
    }

    /// Execution types this query covers.
    #[must_use]
    pub fn types(&self) -> Vec<ExecutionType> {
        match self.execution_type {
            Some(t) => vec![t],
            None => ExecutionType::ALL.to_vec(),
        }
    }

    /// Returns true if the record passes the status filter.
    #[must_use]
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&record.status)
    }

    /// Returns true if an index entry with this score is older than the cutoff.
    #[must_use]
    pub fn is_before_cutoff(&self, build_time: i64) -> bool {
        self.start_time_cutoff.is_some_and(|cutoff| build_time < cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_everything() {
        let criteria = ExecutionCriteria::new();
        let record = ExecutionRecord::new("r", "a").with_status(ExecutionStatus::Failed);
        assert!(criteria.matches(&record));
        assert_eq!(criteria.types().len(), 2);
        assert!(!criteria.is_before_cutoff(0));
    }

    #[test]
    fn test_status_filter() {
        let criteria = ExecutionCriteria::new().with_status(ExecutionStatus::Running);
        let running = ExecutionRecord::new("r", "a").with_status(ExecutionStatus::Running);
        let failed = ExecutionRecord::new("r", "a").with_status(ExecutionStatus::Failed);
        assert!(criteria.matches(&running));
        assert!(!criteria.matches(&failed));
    }

    #[test]
    fn test_cutoff() {
        let criteria = ExecutionCriteria::new().with_start_time_cutoff(1_000);
        assert!(criteria.is_before_cutoff(999));
        assert!(!criteria.is_before_cutoff(1_000));
    }
}
