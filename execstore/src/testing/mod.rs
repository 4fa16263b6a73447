//! Testing utilities for code built on the execution store.
//!
//! This module provides:
//! - [`FlakyBackend`], a backend wrapper that injects failures and conflicts
//! - record fixtures and a multi-shard in-memory [`StoreHarness`]

mod fixtures;
mod mocks;

pub use fixtures::{pipeline_record, record_with_stages, wait_for, StoreHarness};
pub use mocks::{BackendOp, FlakyBackend};
