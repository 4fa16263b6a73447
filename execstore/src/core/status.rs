//! Execution status and type enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of run an execution record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// A full pipeline run.
    Pipeline,
    /// A standalone task run outside any pipeline.
    Orchestration,
}

impl ExecutionType {
    /// All execution types, in index order.
    pub const ALL: [Self; 2] = [Self::Pipeline, Self::Orchestration];

    /// Returns the lowercase name used in backend keys.
    #[must_use]
    pub fn key_segment(self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Orchestration => "orchestration",
        }
    }
}

impl Default for ExecutionType {
    fn default() -> Self {
        Self::Pipeline
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "PIPELINE"),
            Self::Orchestration => write!(f, "ORCHESTRATION"),
        }
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PIPELINE" => Ok(Self::Pipeline),
            "ORCHESTRATION" => Ok(Self::Orchestration),
            other => Err(format!("unknown execution type '{other}'")),
        }
    }
}

/// The status of an execution or one of its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created but not yet started.
    NotStarted,
    /// Currently running.
    Running,
    /// Suspended, waiting to be resumed.
    Paused,
    /// Completed successfully.
    Succeeded,
    /// Completed with a failure.
    Failed,
    /// Canceled before completion.
    Canceled,
    /// Ended, but the outcome could not be determined.
    TerminalUnknown,
}

impl ExecutionStatus {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::NotStarted,
        Self::Running,
        Self::Paused,
        Self::Succeeded,
        Self::Failed,
        Self::Canceled,
        Self::TerminalUnknown,
    ];

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::TerminalUnknown
        )
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::TerminalUnknown => "TERMINAL_UNKNOWN",
        }
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown execution status '{s}'"))
    }
}
