//! Error types for the execution store and cluster lock.
//!
//! Every public operation returns [`StoreError`]. The variants map one-to-one
//! onto the outcomes callers are expected to branch on; [`StoreError::kind`]
//! gives a stable label for instrumentation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// The main error type for store and lock operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The record (or lock) does not exist.
    #[error("Execution not found: {id}")]
    NotFound {
        /// The missing execution id.
        id: String,
    },

    /// A record with the same id already exists.
    #[error("Execution already exists: {id}")]
    DuplicateId {
        /// The colliding execution id.
        id: String,
    },

    /// The backend was unreachable or a call timed out.
    #[error("Store unavailable ({backend}): {reason}")]
    StoreUnavailable {
        /// Name of the backend shard that failed.
        backend: String,
        /// What went wrong.
        reason: String,
    },

    /// Stored data could not be decoded.
    #[error("Corrupt record at '{key}': {reason}")]
    CorruptRecord {
        /// The backend key holding the bad data.
        key: String,
        /// Why decoding failed.
        reason: String,
    },

    /// Lock ownership was revoked or expired before a renewal.
    #[error("Lock lost: {lock_name}")]
    LockLost {
        /// The lock that was lost.
        lock_name: String,
    },

    /// A record (or a mutation of one) breaks a record invariant.
    #[error("Invalid record '{id}': {reason}")]
    InvalidRecord {
        /// The execution id.
        id: String,
        /// The violated invariant.
        reason: String,
    },

    /// Optimistic update retries were exhausted.
    #[error("Update conflict on '{id}' after {attempts} attempts")]
    UpdateConflict {
        /// The execution id.
        id: String,
        /// Number of compare-and-swap attempts made.
        attempts: usize,
    },

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StoreError {
    /// Creates a not found error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a duplicate id error.
    #[must_use]
    pub fn duplicate_id(id: impl Into<String>) -> Self {
        Self::DuplicateId { id: id.into() }
    }

    /// Creates a store unavailable error.
    #[must_use]
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Creates a corrupt record error.
    #[must_use]
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a lock lost error.
    #[must_use]
    pub fn lock_lost(lock_name: impl Into<String>) -> Self {
        Self::LockLost {
            lock_name: lock_name.into(),
        }
    }

    /// Creates an invalid record error.
    #[must_use]
    pub fn invalid_record(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns a stable snake-case label for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateId { .. } => ErrorKind::DuplicateId,
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::CorruptRecord { .. } => ErrorKind::CorruptRecord,
            Self::LockLost { .. } => ErrorKind::LockLost,
            Self::InvalidRecord { .. } => ErrorKind::InvalidRecord,
            Self::UpdateConflict { .. } => ErrorKind::UpdateConflict,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Returns true if the backend itself failed, as opposed to a domain outcome.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind().as_str()));

        match self {
            Self::NotFound { id } | Self::DuplicateId { id } => {
                map.insert("id".to_string(), serde_json::json!(id));
            }
            Self::StoreUnavailable { backend, reason } => {
                map.insert("backend".to_string(), serde_json::json!(backend));
                map.insert("reason".to_string(), serde_json::json!(reason));
            }
            Self::CorruptRecord { key, reason } => {
                map.insert("key".to_string(), serde_json::json!(key));
                map.insert("reason".to_string(), serde_json::json!(reason));
            }
            Self::LockLost { lock_name } => {
                map.insert("lock_name".to_string(), serde_json::json!(lock_name));
            }
            Self::InvalidRecord { id, reason } => {
                map.insert("id".to_string(), serde_json::json!(id));
                map.insert("reason".to_string(), serde_json::json!(reason));
            }
            Self::UpdateConflict { id, attempts } => {
                map.insert("id".to_string(), serde_json::json!(id));
                map.insert("attempts".to_string(), serde_json::json!(attempts));
            }
            Self::Configuration(_) => {}
        }

        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Error classification used by metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`StoreError::NotFound`].
    NotFound,
    /// See [`StoreError::DuplicateId`].
    DuplicateId,
    /// See [`StoreError::StoreUnavailable`].
    StoreUnavailable,
    /// See [`StoreError::CorruptRecord`].
    CorruptRecord,
    /// See [`StoreError::LockLost`].
    LockLost,
    /// See [`StoreError::InvalidRecord`].
    InvalidRecord,
    /// See [`StoreError::UpdateConflict`].
    UpdateConflict,
    /// See [`StoreError::Configuration`].
    Configuration,
}

impl ErrorKind {
    /// Returns the snake-case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::DuplicateId => "duplicate_id",
            Self::StoreUnavailable => "store_unavailable",
            Self::CorruptRecord => "corrupt_record",
            Self::LockLost => "lock_lost",
            Self::InvalidRecord => "invalid_record",
            Self::UpdateConflict => "update_conflict",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::unavailable("redis", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(StoreError::not_found("a").kind(), ErrorKind::NotFound);
        assert_eq!(StoreError::duplicate_id("a").kind(), ErrorKind::DuplicateId);
        assert_eq!(
            StoreError::unavailable("shard-0", "timeout").kind(),
            ErrorKind::StoreUnavailable
        );
        assert_eq!(StoreError::lock_lost("l").kind().as_str(), "lock_lost");
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::corrupt("execution:run-1", "missing field 'status'");
        assert_eq!(
            err.to_string(),
            "Corrupt record at 'execution:run-1': missing field 'status'"
        );
    }

    #[test]
    fn test_error_to_dict() {
        let err = StoreError::unavailable("shard-1", "connection refused");
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "store_unavailable");
        assert_eq!(dict.get("backend").unwrap(), "shard-1");
        assert!(dict.get("message").is_some());
    }

    #[test]
    fn test_is_unavailable() {
        assert!(StoreError::unavailable("x", "y").is_unavailable());
        assert!(!StoreError::not_found("x").is_unavailable());
    }
}
