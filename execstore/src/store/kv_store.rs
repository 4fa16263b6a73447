//! [`ExecutionStore`] over a sharded key-value backend.

use super::mirror::StatusMirror;
use super::scan::{ChunkedScan, ScanPlan};
use super::{ExecutionStore, RecordMutator, RecordStream};
use crate::backend::{IndexEntry, KvBackend};
use crate::codec::RecordCodec;
use crate::config::StoreConfig;
use crate::core::{ExecutionCriteria, ExecutionRecord, ExecutionStatus, ExecutionType};
use crate::errors::{Result, StoreError};
use crate::keys::{
    all_jobs_key, application_index_key, create_indexes, execution_key, record_indexes,
    APPLICATIONS_KEY,
};
use crate::router::ClientRouter;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Execution store backed by [`KvBackend`] shards.
///
/// A record and all of its index entries live on the shard chosen by the
/// record id. Creation is a single create-if-absent call that writes the
/// record hash before its index entries. Updates are serialized per id
/// within this instance by a FIFO async mutex and guarded across instances
/// by a version compare-and-swap. Concurrent full scans share one pool of
/// `pool.scan_capacity()` chunk-load permits.
pub struct KvExecutionStore {
    router: Arc<ClientRouter>,
    codec: RecordCodec,
    config: Arc<StoreConfig>,
    update_locks: DashMap<String, Arc<Mutex<()>>>,
    scan_permits: Arc<Semaphore>,
    mirror: Option<StatusMirror>,
}

/// Drops an id's update lock once no other update holds or awaits it.
struct UpdateLockRelease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: &'a str,
}

impl Drop for UpdateLockRelease<'_> {
    fn drop(&mut self) {
        // The map and the releasing caller each own one reference.
        self.locks
            .remove_if(self.id, |_, entry| Arc::strong_count(entry) <= 2);
    }
}

impl KvExecutionStore {
    /// Creates a store over `router`. The configuration is validated first.
    pub fn new(router: Arc<ClientRouter>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let mirror = StatusMirror::from_config(Arc::clone(&router), &config);

        info!(
            shards = router.len(),
            scan_chunks = config.scan_chunk_count,
            scan_workers = config.scan_workers(),
            mirroring = ?mirror.as_ref().map(StatusMirror::queue_key),
            "Execution store ready"
        );

        Ok(Self {
            router,
            codec: RecordCodec::new(),
            scan_permits: Arc::new(Semaphore::new(config.pool.scan_capacity())),
            config: Arc::new(config),
            update_locks: DashMap::new(),
            mirror,
        })
    }

    /// The router this store writes through.
    #[must_use]
    pub fn router(&self) -> &Arc<ClientRouter> {
        &self.router
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of ids with an update in flight or queued.
    #[must_use]
    pub fn pending_update_locks(&self) -> usize {
        self.update_locks.len()
    }

    async fn read(&self, client: &dyn KvBackend, id: &str) -> Result<ExecutionRecord> {
        let key = execution_key(id);
        let hash = client.hgetall(&key).await?;
        if hash.is_empty() {
            return Err(StoreError::not_found(id));
        }
        self.codec.decode(&key, &hash)
    }

    async fn update_serialized(
        &self,
        id: &str,
        mutator: &(dyn Fn(&mut ExecutionRecord) + Send + Sync),
    ) -> Result<ExecutionRecord> {
        let client = self.router.client_for(id).as_ref();
        let key = execution_key(id);
        let attempts = self.config.max_update_attempts;

        for attempt in 1..=attempts {
            let current = self.read(client, id).await?;
            let mut next = current.clone();
            mutator(&mut next);
            current
                .check_transition(&next)
                .map_err(|reason| StoreError::invalid_record(id, reason))?;
            next.version = current.version + 1;

            let fields = self.codec.encode(&next)?;
            if client.replace_hash(&key, current.version, &fields).await? {
                debug!(
                    execution_id = %id,
                    version = next.version,
                    attempt,
                    "Updated execution"
                );
                if next.status != current.status {
                    self.publish(Some(current.status), &next);
                }
                return Ok(next);
            }

            debug!(execution_id = %id, attempt, "Version conflict, retrying update");
        }

        warn!(execution_id = %id, attempts, "Update retries exhausted");
        Err(StoreError::UpdateConflict {
            id: id.to_string(),
            attempts,
        })
    }

    fn publish(&self, previous: Option<ExecutionStatus>, record: &ExecutionRecord) {
        if let Some(mirror) = &self.mirror {
            mirror.publish(previous, record);
        }
    }
}

#[async_trait]
impl ExecutionStore for KvExecutionStore {
    async fn create(&self, mut record: ExecutionRecord) -> Result<()> {
        record
            .check_well_formed()
            .map_err(|reason| StoreError::invalid_record(&record.id, reason))?;
        record.version = 0;

        let key = execution_key(&record.id);
        let fields = self.codec.encode(&record)?;
        let indexes = create_indexes(&record);
        let client = self.router.client_for(&record.id);

        if !client.create_hash(&key, &fields, &indexes).await? {
            return Err(StoreError::duplicate_id(&record.id));
        }

        debug!(
            execution_id = %record.id,
            application = %record.application,
            shard = %client.name(),
            "Created execution"
        );
        self.publish(None, &record);
        Ok(())
    }

    async fn update(&self, id: &str, mutator: RecordMutator) -> Result<ExecutionRecord> {
        let lock = self
            .update_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _release = UpdateLockRelease {
            locks: &self.update_locks,
            id,
        };
        let _guard = lock.lock().await;
        self.update_serialized(id, mutator.as_ref()).await
    }

    async fn retrieve(&self, id: &str) -> Result<ExecutionRecord> {
        self.read(self.router.client_for(id).as_ref(), id).await
    }

    fn retrieve_by_application(
        &self,
        application: &str,
        criteria: ExecutionCriteria,
    ) -> RecordStream {
        let cursors = self
            .router
            .shards()
            .iter()
            .flat_map(|shard| criteria.types().into_iter().map(move |t| (shard.index, t)))
            .collect();

        let state = ApplicationQuery {
            router: Arc::clone(&self.router),
            codec: self.codec,
            application: application.to_string(),
            page_size: self.config.application_page_size,
            criteria,
            cursors,
            last_score: None,
            seen_at_last_score: HashSet::new(),
            cursor_exhausted: false,
            page: VecDeque::new(),
            yielded: 0,
            done: false,
        };

        futures::stream::unfold(state, ApplicationQuery::advance).boxed()
    }

    fn retrieve_all_applications(&self) -> ChunkedScan {
        let plan = ScanPlan {
            chunk_count: self.config.scan_chunk_count,
            workers: self.config.scan_workers(),
        };
        debug!(
            chunks = plan.chunk_count,
            workers = plan.workers,
            "Starting full scan"
        );
        ChunkedScan::start(
            Arc::clone(&self.router),
            self.codec,
            plan,
            Arc::clone(&self.scan_permits),
        )
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let client = self.router.client_for(id);
        let key = execution_key(id);
        let hash = client.hgetall(&key).await?;
        if hash.is_empty() {
            return Ok(());
        }

        let indexes = match self.codec.decode_identity(&key, &hash) {
            Ok((execution_type, application)) => record_indexes(execution_type, &application, id),
            Err(e) => {
                warn!(execution_id = %id, error = %e, "Deleting record with unreadable identity");
                ExecutionType::ALL
                    .into_iter()
                    .map(|t| IndexEntry::set(all_jobs_key(t), id))
                    .collect()
            }
        };

        client.delete_hash(&key, &indexes).await?;
        debug!(execution_id = %id, "Deleted execution");
        Ok(())
    }

    async fn retrieve_application_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for shard in self.router.shards() {
            names.extend(shard.client.smembers(APPLICATIONS_KEY).await?);
        }
        Ok(names)
    }
}

impl std::fmt::Debug for KvExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvExecutionStore")
            .field("shards", &self.router.len())
            .field("pending_update_locks", &self.update_locks.len())
            .field("mirroring", &self.mirror.is_some())
            .finish()
    }
}

/// Cursor state of one `retrieve_by_application` stream.
struct ApplicationQuery {
    router: Arc<ClientRouter>,
    codec: RecordCodec,
    application: String,
    page_size: usize,
    criteria: ExecutionCriteria,
    /// Remaining (shard, type) index walks.
    cursors: VecDeque<(usize, ExecutionType)>,
    /// Lowest score yielded so far by the current walk; the next page starts there.
    last_score: Option<f64>,
    /// Ids already taken at `last_score`, skipped when the next page re-reads it.
    seen_at_last_score: HashSet<String>,
    cursor_exhausted: bool,
    page: VecDeque<String>,
    yielded: usize,
    done: bool,
}

impl ApplicationQuery {
    async fn advance(mut self) -> Option<(Result<ExecutionRecord>, Self)> {
        loop {
            if self.done || self.criteria.limit.is_some_and(|limit| self.yielded >= limit) {
                return None;
            }

            if let Some(id) = self.page.pop_front() {
                let loaded = self.load(&id).await;
                match loaded {
                    Ok(Some(record)) if self.criteria.matches(&record) => {
                        self.yielded += 1;
                        return Some((Ok(record), self));
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some((Err(e), self));
                    }
                }
            }

            let Some(&(shard_index, execution_type)) = self.cursors.front() else {
                return None;
            };
            if self.cursor_exhausted {
                self.cursors.pop_front();
                self.last_score = None;
                self.seen_at_last_score.clear();
                self.cursor_exhausted = false;
                continue;
            }

            if let Err(e) = self.fetch_page(shard_index, execution_type).await {
                self.done = true;
                return Some((Err(e), self));
            }
        }
    }

    async fn fetch_page(&mut self, shard_index: usize, execution_type: ExecutionType) -> Result<()> {
        let Some(shard) = self.router.shard(shard_index) else {
            self.cursor_exhausted = true;
            return Ok(());
        };
        let key = application_index_key(execution_type, &self.application);
        // Over-fetch by the ids already taken at the boundary score so each
        // page still makes progress when many records share a build time.
        let count = self.seen_at_last_score.len() + self.page_size;
        let entries = shard
            .client
            .zrevrangebyscore_with_scores(&key, self.last_score, count)
            .await?;

        if entries.len() < count {
            self.cursor_exhausted = true;
        }

        for (id, score) in entries {
            let at_boundary = self.is_last_score(score);
            if at_boundary && self.seen_at_last_score.contains(&id) {
                continue;
            }
            // Entries are ordered by build time, so nothing after this is newer.
            if self.criteria.is_before_cutoff(score as i64) {
                self.cursor_exhausted = true;
                break;
            }
            if !at_boundary {
                self.last_score = Some(score);
                self.seen_at_last_score.clear();
            }
            self.seen_at_last_score.insert(id.clone());
            self.page.push_back(id);
        }
        Ok(())
    }

    fn is_last_score(&self, score: f64) -> bool {
        self.last_score
            .is_some_and(|last| last.total_cmp(&score).is_eq())
    }

    /// Loads a record named by an index entry; `None` if it was deleted since.
    async fn load(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let key = execution_key(id);
        let hash = self.router.client_for(id).hgetall(&key).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        self.codec.decode(&key, &hash).map(Some)
    }
}
