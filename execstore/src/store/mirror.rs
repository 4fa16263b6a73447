//! Best-effort mirroring of status transitions to a buffered queue.

use crate::config::StoreConfig;
use crate::core::{ExecutionRecord, ExecutionStatus, ExecutionType};
use crate::keys::buffered_queue_key;
use crate::router::ClientRouter;
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Message pushed for each mirrored transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorMessage {
    /// Record id.
    pub id: String,
    /// Owning application.
    pub application: String,
    /// Execution type.
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,
    /// Status after the transition.
    pub status: ExecutionStatus,
    /// Status before the transition; absent on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<ExecutionStatus>,
    /// When the transition was written.
    pub timestamp: String,
}

/// Publishes status transitions off the caller's path.
///
/// Each push runs on its own spawned task with a timeout. Failures are
/// logged and dropped; nothing here can fail a store operation, and pushes
/// are not ordered relative to the primary write or to each other.
#[derive(Debug, Clone)]
pub(crate) struct StatusMirror {
    router: Arc<ClientRouter>,
    queue_key: String,
    statuses: BTreeSet<ExecutionStatus>,
    timeout: Duration,
}

impl StatusMirror {
    /// Builds a mirror if a buffered prefix is configured.
    pub(crate) fn from_config(router: Arc<ClientRouter>, config: &StoreConfig) -> Option<Self> {
        let prefix = config.buffered_prefix()?;
        Some(Self {
            router,
            queue_key: buffered_queue_key(prefix),
            statuses: config.mirror_statuses.iter().copied().collect(),
            timeout: config.mirror_timeout(),
        })
    }

    pub(crate) fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Mirrors `record`'s status if it is one of the mirrored statuses.
    pub(crate) fn publish(&self, previous: Option<ExecutionStatus>, record: &ExecutionRecord) {
        if !self.statuses.contains(&record.status) {
            return;
        }

        let message = MirrorMessage {
            id: record.id.clone(),
            application: record.application.clone(),
            execution_type: record.execution_type,
            status: record.status,
            previous_status: previous,
            timestamp: iso_timestamp(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(execution_id = %record.id, error = %e, "Failed to serialize mirror message");
                return;
            }
        };

        let client = Arc::clone(self.router.client_for(&self.queue_key));
        let key = self.queue_key.clone();
        let timeout = self.timeout;
        let id = message.id;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, client.lpush(&key, &payload)).await {
                Ok(Ok(())) => {
                    debug!(execution_id = %id, queue = %key, "Mirrored status transition");
                }
                Ok(Err(e)) => {
                    warn!(execution_id = %id, queue = %key, error = %e, "Status mirror write failed");
                }
                Err(_) => {
                    warn!(
                        execution_id = %id,
                        queue = %key,
                        timeout_ms = timeout.as_millis() as u64,
                        "Status mirror write timed out"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvBackend, MemoryBackend};
    use pretty_assertions::assert_eq;

    fn setup(statuses: Vec<ExecutionStatus>) -> (Arc<MemoryBackend>, StatusMirror) {
        let backend = Arc::new(MemoryBackend::default());
        let router = Arc::new(ClientRouter::single(backend.clone()));
        let config = StoreConfig::default()
            .with_buffered_prefix("keiko")
            .with_mirror_statuses(statuses);
        let mirror = StatusMirror::from_config(router, &config).unwrap();
        (backend, mirror)
    }

    async fn wait_for_messages(backend: &MemoryBackend, key: &str, count: usize) -> Vec<String> {
        for _ in 0..50 {
            let items = backend.lrange(key, 0, 100).await.unwrap();
            if items.len() >= count {
                return items;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        backend.lrange(key, 0, 100).await.unwrap()
    }

    #[test]
    fn test_disabled_without_prefix() {
        let router = Arc::new(ClientRouter::single(Arc::new(MemoryBackend::default())));
        assert!(StatusMirror::from_config(router.clone(), &StoreConfig::default()).is_none());
        let empty = StoreConfig::default().with_buffered_prefix("");
        assert!(StatusMirror::from_config(router, &empty).is_none());
    }

    #[tokio::test]
    async fn test_publishes_message() {
        let (backend, mirror) = setup(ExecutionStatus::ALL.to_vec());
        let record = ExecutionRecord::new("run-1", "app-a").with_status(ExecutionStatus::Running);

        mirror.publish(Some(ExecutionStatus::NotStarted), &record);

        let items = wait_for_messages(&backend, "keiko:buffered-executions", 1).await;
        assert_eq!(items.len(), 1);
        let message: MirrorMessage = serde_json::from_str(&items[0]).unwrap();
        assert_eq!(message.id, "run-1");
        assert_eq!(message.status, ExecutionStatus::Running);
        assert_eq!(message.previous_status, Some(ExecutionStatus::NotStarted));
        assert!(items[0].contains("\"previousStatus\":\"NOT_STARTED\""));
    }

    #[tokio::test]
    async fn test_skips_unmirrored_statuses() {
        let (backend, mirror) = setup(vec![ExecutionStatus::Succeeded]);
        let record = ExecutionRecord::new("run-1", "app-a").with_status(ExecutionStatus::Running);

        mirror.publish(None, &record);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(backend.lrange(mirror.queue_key(), 0, 10).await.unwrap().is_empty());
    }
}
