//! Core domain model types for the execution store.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Execution status and type enums
//! - Execution and stage records
//! - Query criteria for per-application retrieval

mod criteria;
mod execution;
mod status;

pub use criteria::ExecutionCriteria;
pub use execution::{ContextMap, ExecutionRecord, StageRecord};
pub use status::{ExecutionStatus, ExecutionType};
