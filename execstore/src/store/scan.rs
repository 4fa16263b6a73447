//! Chunked parallel scan over every record in the store.
//!
//! A scan runs in three phases on background tasks:
//!
//! 1. list every record id from the `allJobs` sets of every shard;
//! 2. assign each id to one of N chunks by a stable hash of the id;
//! 3. let a bounded pool of workers pull chunks from a shared queue, load the
//!    chunk's records and report each chunk as a whole over a bounded channel.
//!
//! Every chunk load holds a permit from a semaphore owned by the store, so
//! concurrent scans together never exceed the scan share of the pool.
//!
//! [`ChunkedScan`] merges those reports into one lazy stream. A chunk that
//! fails does not discard the chunks that succeeded; the failure is recorded
//! in the [`ScanReport`] instead. Dropping the scan cancels every worker.

use crate::cancellation::CancellationToken;
use crate::codec::RecordCodec;
use crate::core::{ExecutionRecord, ExecutionType};
use crate::errors::StoreError;
use crate::keys::{all_jobs_key, execution_key};
use crate::router::{bucket_for, ClientRouter};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A chunk that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    /// Chunk number in `0..chunk_count`.
    pub chunk_id: usize,
    /// Why the chunk failed.
    pub reason: String,
}

/// Completeness report of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Number of chunks the id space was split into.
    pub chunk_count: usize,
    /// Chunks whose records were all delivered.
    pub completed_chunks: usize,
    /// Chunks that failed, by chunk id.
    pub failed_chunks: Vec<ChunkFailure>,
    /// Shards whose id listing failed; their records are missing entirely.
    pub failed_shards: Vec<String>,
    /// Records delivered.
    pub records: usize,
}

impl ScanReport {
    /// True if any chunk or shard listing failed.
    #[must_use]
    pub fn incomplete(&self) -> bool {
        !self.failed_chunks.is_empty() || !self.failed_shards.is_empty()
    }

    /// Ids of the failed chunks.
    #[must_use]
    pub fn failed_chunk_ids(&self) -> Vec<usize> {
        self.failed_chunks.iter().map(|f| f.chunk_id).collect()
    }
}

/// Fully drained scan.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Every delivered record.
    pub records: Vec<ExecutionRecord>,
    /// Completeness report.
    pub report: ScanReport,
}

impl ScanResult {
    /// True if any chunk or shard listing failed.
    #[must_use]
    pub fn incomplete(&self) -> bool {
        self.report.incomplete()
    }
}

/// Parameters of one scan.
#[derive(Debug, Clone)]
pub(crate) struct ScanPlan {
    pub(crate) chunk_count: usize,
    pub(crate) workers: usize,
}

#[derive(Debug)]
enum ScanEvent {
    Planned {
        chunk_count: usize,
        failed_shards: Vec<String>,
    },
    Completed {
        chunk_id: usize,
        records: Vec<ExecutionRecord>,
    },
    Failed(ChunkFailure),
}

type ChunkQueue = Arc<Mutex<VecDeque<(usize, Vec<String>)>>>;

/// Lazy stream of every record in the store.
///
/// Yields records as their chunks complete, in no particular order. Once the
/// stream returns `None`, [`report`](Self::report) describes what was
/// missed. Chunks that never reported (for example because a worker
/// panicked) are counted as failed.
pub struct ChunkedScan {
    events: mpsc::Receiver<ScanEvent>,
    buffer: VecDeque<ExecutionRecord>,
    reported: BTreeSet<usize>,
    report: ScanReport,
    finished: bool,
    cancel: Arc<CancellationToken>,
    _tasks: JoinSet<()>,
}

impl ChunkedScan {
    pub(crate) fn start(
        router: Arc<ClientRouter>,
        codec: RecordCodec,
        plan: ScanPlan,
        permits: Arc<Semaphore>,
    ) -> Self {
        let cancel = Arc::new(CancellationToken::new());
        let (tx, rx) = mpsc::channel(plan.workers.max(1));
        let mut tasks = JoinSet::new();
        tasks.spawn(coordinate(
            router,
            codec,
            plan,
            permits,
            tx,
            Arc::clone(&cancel),
        ));

        Self {
            events: rx,
            buffer: VecDeque::new(),
            reported: BTreeSet::new(),
            report: ScanReport::default(),
            finished: false,
            cancel,
            _tasks: tasks,
        }
    }

    /// Cancels the scan. Buffered records are still yielded.
    pub fn cancel(&self) {
        self.cancel.cancel("scan cancelled");
    }

    /// Completeness report; final once the stream is exhausted.
    #[must_use]
    pub fn report(&self) -> &ScanReport {
        &self.report
    }

    /// Returns true once the stream is exhausted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }

    /// Drains the scan.
    pub async fn collect_all(mut self) -> ScanResult {
        use futures::StreamExt;

        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        ScanResult {
            records,
            report: self.report.clone(),
        }
    }

    fn apply(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Planned {
                chunk_count,
                failed_shards,
            } => {
                self.report.chunk_count = chunk_count;
                self.report.failed_shards = failed_shards;
            }
            ScanEvent::Completed { chunk_id, records } => {
                if self.reported.insert(chunk_id) {
                    self.report.completed_chunks += 1;
                    self.report.records += records.len();
                    self.buffer.extend(records);
                }
            }
            ScanEvent::Failed(failure) => {
                if self.reported.insert(failure.chunk_id) {
                    self.report.failed_chunks.push(failure);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        let cancelled = self.cancel.is_cancelled();
        for chunk_id in 0..self.report.chunk_count {
            if !self.reported.contains(&chunk_id) {
                let reason = if cancelled {
                    "scan cancelled"
                } else {
                    "worker ended without reporting"
                };
                self.report.failed_chunks.push(ChunkFailure {
                    chunk_id,
                    reason: reason.to_string(),
                });
            }
        }
        self.report.failed_chunks.sort_by_key(|f| f.chunk_id);

        if self.report.incomplete() {
            warn!(
                failed_chunks = ?self.report.failed_chunk_ids(),
                failed_shards = ?self.report.failed_shards,
                records = self.report.records,
                "Scan finished incomplete"
            );
        } else {
            info!(
                chunks = self.report.chunk_count,
                records = self.report.records,
                "Scan finished"
            );
        }
    }
}

impl Stream for ChunkedScan {
    type Item = ExecutionRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(record) = this.buffer.pop_front() {
                return Poll::Ready(Some(record));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            match this.events.poll_recv(cx) {
                Poll::Ready(Some(event)) => this.apply(event),
                Poll::Ready(None) => this.finish(),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for ChunkedScan {
    fn drop(&mut self) {
        self.cancel.cancel("scan dropped");
    }
}

impl std::fmt::Debug for ChunkedScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedScan")
            .field("buffered", &self.buffer.len())
            .field("finished", &self.finished)
            .field("report", &self.report)
            .finish()
    }
}

/// Lists ids, plans chunks, and runs the worker pool to completion.
async fn coordinate(
    router: Arc<ClientRouter>,
    codec: RecordCodec,
    plan: ScanPlan,
    permits: Arc<Semaphore>,
    tx: mpsc::Sender<ScanEvent>,
    cancel: Arc<CancellationToken>,
) {
    let (ids, failed_shards) = list_ids(&router, &cancel).await;

    let mut chunks: BTreeMap<usize, Vec<String>> =
        (0..plan.chunk_count).map(|c| (c, Vec::new())).collect();
    for id in ids {
        chunks
            .entry(bucket_for(&id, plan.chunk_count))
            .or_default()
            .push(id);
    }

    debug!(
        chunks = plan.chunk_count,
        workers = plan.workers,
        failed_shards = failed_shards.len(),
        "Scan planned"
    );

    if tx
        .send(ScanEvent::Planned {
            chunk_count: plan.chunk_count,
            failed_shards,
        })
        .await
        .is_err()
    {
        return;
    }

    let queue: ChunkQueue = Arc::new(Mutex::new(chunks.into_iter().collect()));
    let mut workers = JoinSet::new();
    for worker_id in 0..plan.workers.min(plan.chunk_count).max(1) {
        workers.spawn(run_worker(
            worker_id,
            Arc::clone(&router),
            codec,
            Arc::clone(&queue),
            Arc::clone(&permits),
            tx.clone(),
            Arc::clone(&cancel),
        ));
    }
    drop(tx);

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                warn!(error = %e, "Scan worker panicked");
            }
        }
    }
}

async fn list_ids(
    router: &ClientRouter,
    cancel: &CancellationToken,
) -> (BTreeSet<String>, Vec<String>) {
    let mut ids = BTreeSet::new();
    let mut failed_shards = Vec::new();

    'shards: for shard in router.shards() {
        for execution_type in ExecutionType::ALL {
            if cancel.is_cancelled() {
                break 'shards;
            }
            match shard.client.smembers(&all_jobs_key(execution_type)).await {
                Ok(members) => ids.extend(members),
                Err(e) => {
                    warn!(shard = %shard.name(), error = %e, "Failed to list record ids");
                    failed_shards.push(shard.name().to_string());
                    continue 'shards;
                }
            }
        }
    }
    (ids, failed_shards)
}

async fn run_worker(
    worker_id: usize,
    router: Arc<ClientRouter>,
    codec: RecordCodec,
    queue: ChunkQueue,
    permits: Arc<Semaphore>,
    tx: mpsc::Sender<ScanEvent>,
    cancel: Arc<CancellationToken>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some((chunk_id, ids)) = queue.lock().pop_front() else {
            return;
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            outcome = load_chunk(&router, codec, &permits, &ids) => outcome,
        };

        let event = match outcome {
            Ok(records) => {
                debug!(worker_id, chunk_id, records = records.len(), "Chunk completed");
                ScanEvent::Completed { chunk_id, records }
            }
            Err(e) => {
                warn!(worker_id, chunk_id, error = %e, "Chunk failed");
                ScanEvent::Failed(ChunkFailure {
                    chunk_id,
                    reason: e.to_string(),
                })
            }
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}

async fn load_chunk(
    router: &ClientRouter,
    codec: RecordCodec,
    permits: &Semaphore,
    ids: &[String],
) -> Result<Vec<ExecutionRecord>, StoreError> {
    let _permit = permits
        .acquire()
        .await
        .map_err(|_| StoreError::unavailable("scan", "scan permits closed"))?;
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let key = execution_key(id);
        let hash = router.client_for(id).hgetall(&key).await?;
        // Deleted between listing and loading.
        if hash.is_empty() {
            continue;
        }
        records.push(codec.decode(&key, &hash)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_incomplete() {
        let mut report = ScanReport::default();
        assert!(!report.incomplete());

        report.failed_chunks.push(ChunkFailure {
            chunk_id: 3,
            reason: "boom".to_string(),
        });
        assert!(report.incomplete());
        assert_eq!(report.failed_chunk_ids(), vec![3]);

        let shard_only = ScanReport {
            failed_shards: vec!["shard-1".to_string()],
            ..ScanReport::default()
        };
        assert!(shard_only.incomplete());
    }
}
