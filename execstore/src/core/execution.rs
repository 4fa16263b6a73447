//! Execution and stage records.

use super::{ExecutionStatus, ExecutionType};
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form context attached by the orchestrator. Opaque to the store.
pub type ContextMap = BTreeMap<String, serde_json::Value>;

/// One unit of work within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage identifier, unique within its execution.
    pub id: String,
    /// Human-readable stage name.
    pub name: String,
    /// Current status of the stage.
    pub status: ExecutionStatus,
    /// Epoch millis when the stage started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Epoch millis when the stage ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Stage-scoped context.
    #[serde(default)]
    pub context: ContextMap,
}

impl StageRecord {
    /// Creates a stage in `NOT_STARTED` whose id equals its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            context: ContextMap::new(),
        }
    }

    /// Sets an explicit stage id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the start time.
    #[must_use]
    pub fn with_start_time(mut self, millis: i64) -> Self {
        self.start_time = Some(millis);
        self
    }

    /// Sets the end time.
    #[must_use]
    pub fn with_end_time(mut self, millis: i64) -> Self {
        self.end_time = Some(millis);
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Persisted state of one pipeline or standalone task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Globally unique id, immutable.
    pub id: String,
    /// Pipeline or standalone task.
    #[serde(default)]
    pub execution_type: ExecutionType,
    /// Owning application, immutable.
    pub application: String,
    /// Current execution status.
    pub status: ExecutionStatus,
    /// Epoch millis when the record was built; orders application queries.
    pub build_time: i64,
    /// Epoch millis when the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Epoch millis when the run ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Whether cancellation was requested.
    #[serde(default)]
    pub canceled: bool,
    /// Why the run was canceled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    /// Orchestrator-owned context and outputs.
    #[serde(default)]
    pub context: ContextMap,
    /// Stages in definition order.
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    /// Store-managed optimistic concurrency version.
    #[serde(default)]
    pub version: u64,
}

impl ExecutionRecord {
    /// Creates a new pipeline record in `NOT_STARTED`.
    #[must_use]
    pub fn new(id: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            execution_type: ExecutionType::Pipeline,
            application: application.into(),
            status: ExecutionStatus::NotStarted,
            build_time: now_millis(),
            start_time: None,
            end_time: None,
            canceled: false,
            cancellation_reason: None,
            context: ContextMap::new(),
            stages: Vec::new(),
            version: 0,
        }
    }

    /// Sets the execution type.
    #[must_use]
    pub fn with_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the build time.
    #[must_use]
    pub fn with_build_time(mut self, millis: i64) -> Self {
        self.build_time = millis;
        self
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageRecord) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Returns the stage with the given id.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Returns a mutable reference to the stage with the given id.
    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    /// Marks the run canceled. Only the first reason is kept.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        if !self.canceled {
            self.canceled = true;
            self.cancellation_reason = Some(reason.into());
        }
    }

    /// Checks the invariants a record must satisfy on its own.
    pub(crate) fn check_well_formed(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("id must not be empty".to_string());
        }
        if self.application.is_empty() {
            return Err("application must not be empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.id.is_empty() {
                return Err("stage id must not be empty".to_string());
            }
            if stage.id.contains(',') {
                return Err(format!("stage id '{}' must not contain ','", stage.id));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(format!("duplicate stage id '{}'", stage.id));
            }
        }
        Ok(())
    }

    /// Checks that `next` is a legal successor of `self`.
    ///
    /// Identity fields never change, a terminal status never becomes
    /// non-terminal, set-once fields stay set, and stages that survive the
    /// mutation keep their relative order.
    pub(crate) fn check_transition(&self, next: &Self) -> Result<(), String> {
        next.check_well_formed()?;

        if next.id != self.id {
            return Err("id is immutable".to_string());
        }
        if next.application != self.application {
            return Err("application is immutable".to_string());
        }
        if next.execution_type != self.execution_type {
            return Err("execution type is immutable".to_string());
        }
        if next.build_time != self.build_time {
            return Err("build time is immutable".to_string());
        }
        if self.status.is_terminal() && !next.status.is_terminal() {
            return Err(format!(
                "status cannot move from terminal {} to {}",
                self.status, next.status
            ));
        }
        if self.start_time.is_some() && next.start_time != self.start_time {
            return Err("start time is already set".to_string());
        }
        if self.end_time.is_some() && next.end_time != self.end_time {
            return Err("end time is already set".to_string());
        }
        if self.canceled && !next.canceled {
            return Err("cancellation cannot be revoked".to_string());
        }
        if self.cancellation_reason.is_some()
            && next.cancellation_reason != self.cancellation_reason
        {
            return Err("cancellation reason is already set".to_string());
        }

        let surviving: Vec<&str> = self
            .stages
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| next.stage(id).is_some())
            .collect();
        let reordered: Vec<&str> = next
            .stages
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| self.stage(id).is_some())
            .collect();
        if surviving != reordered {
            return Err("existing stages cannot be reordered".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_record() -> ExecutionRecord {
        ExecutionRecord::new("run-1", "app-a")
            .with_status(ExecutionStatus::Running)
            .with_stage(StageRecord::new("bake"))
            .with_stage(StageRecord::new("deploy"))
    }

    #[test]
    fn test_record_defaults() {
        let record = ExecutionRecord::new("run-1", "app-a");
        assert_eq!(record.status, ExecutionStatus::NotStarted);
        assert_eq!(record.execution_type, ExecutionType::Pipeline);
        assert!(record.build_time > 0);
        assert!(record.stages.is_empty());
    }

    #[test]
    fn test_cancel_keeps_first_reason() {
        let mut record = running_record();
        record.cancel("user");
        record.cancel("system");
        assert!(record.canceled);
        assert_eq!(record.cancellation_reason.as_deref(), Some("user"));
    }

    #[test]
    fn test_stage_lookup() {
        let mut record = running_record();
        record.stage_mut("deploy").unwrap().status = ExecutionStatus::Running;
        assert_eq!(record.stage("deploy").unwrap().status, ExecutionStatus::Running);
        assert!(record.stage("missing").is_none());
    }

    #[test]
    fn test_well_formed_rejects_duplicate_stage_ids() {
        let record = running_record().with_stage(StageRecord::new("bake"));
        assert!(record.check_well_formed().is_err());
    }

    #[test]
    fn test_transition_allows_stage_updates() {
        let before = running_record();
        let mut after = before.clone();
        after.stage_mut("bake").unwrap().status = ExecutionStatus::Succeeded;
        after.stages.push(StageRecord::new("verify"));
        after.context.insert("result".to_string(), json!(null));
        assert!(before.check_transition(&after).is_ok());
    }

    #[test]
    fn test_transition_rejects_terminal_regression() {
        let before = running_record().with_status(ExecutionStatus::Failed);
        let after = before.clone().with_status(ExecutionStatus::Running);
        assert!(before.check_transition(&after).is_err());

        let other_terminal = before.clone().with_status(ExecutionStatus::Canceled);
        assert!(before.check_transition(&other_terminal).is_ok());
    }

    #[test]
    fn test_transition_rejects_reorder() {
        let before = running_record();
        let mut after = before.clone();
        after.stages.swap(0, 1);
        assert!(before.check_transition(&after).is_err());
    }

    #[test]
    fn test_transition_rejects_identity_changes() {
        let before = running_record();

        let mut moved = before.clone();
        moved.application = "app-b".to_string();
        assert!(before.check_transition(&moved).is_err());

        let mut renamed = before.clone();
        renamed.id = "run-2".to_string();
        assert!(before.check_transition(&renamed).is_err());
    }

    #[test]
    fn test_transition_rejects_overwriting_set_once_fields() {
        let mut before = running_record();
        before.start_time = Some(10);
        let mut after = before.clone();
        after.start_time = Some(20);
        assert!(before.check_transition(&after).is_err());

        let mut cleared = before.clone();
        cleared.start_time = None;
        assert!(before.check_transition(&cleared).is_err());
    }
}
