//! Fixed-size pool of ledger readers.
//!
//! Heavy read-only queries run on dedicated OS threads so the event loop
//! never blocks on a full table scan. Jobs go through one shared queue and
//! each reply comes back on its own oneshot channel. A worker that panics is
//! replaced; the job it was running fails with [`PoolError::WorkerLost`] and
//! is resubmitted as a fresh task up to the configured retry count.

use crate::errors::PoolError;
use forgeshare_storage::LedgerReader;
use forgeshare_types::{Allocation, LastPaidSummary, PendingSummary};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadJob {
    Height,
    VotersLastAllocation,
    UnsettledTxids,
    LastPaidSummary,
    PendingSummary,
}

impl ReadJob {
    fn name(&self) -> &'static str {
        match self {
            ReadJob::Height => "height",
            ReadJob::VotersLastAllocation => "voters_last_allocation",
            ReadJob::UnsettledTxids => "unsettled_txids",
            ReadJob::LastPaidSummary => "last_paid_summary",
            ReadJob::PendingSummary => "pending_summary",
        }
    }

    fn run(&self, reader: &dyn LedgerReader) -> Result<ReadReply, PoolError> {
        Ok(match self {
            ReadJob::Height => ReadReply::Height(reader.height()?),
            ReadJob::VotersLastAllocation => {
                ReadReply::Allocations(reader.all_voters_last_allocation()?)
            }
            ReadJob::UnsettledTxids => ReadReply::Txids(reader.unsettled_txids()?),
            ReadJob::LastPaidSummary => ReadReply::LastPaid(reader.last_paid_summary()?),
            ReadJob::PendingSummary => ReadReply::Pending(reader.pending_summary()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadReply {
    Height(u64),
    Allocations(Vec<Allocation>),
    Txids(Vec<String>),
    LastPaid(Option<LastPaidSummary>),
    Pending(Option<PendingSummary>),
}

struct Task {
    job: ReadJob,
    reply: oneshot::Sender<Result<ReadReply, PoolError>>,
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<Task>>>;

/// Respawns its worker if the thread unwinds.
struct Sentinel {
    id: usize,
    queue: SharedQueue,
    reader: Arc<dyn LedgerReader>,
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(target: "pool", worker = self.id, "Ledger reader panicked, respawning");
            if let Err(e) = spawn_worker(self.id, self.queue.clone(), self.reader.clone()) {
                error!(target: "pool", worker = self.id, error = %e, "Failed to respawn ledger reader");
            }
        }
    }
}

fn spawn_worker(
    id: usize,
    queue: SharedQueue,
    reader: Arc<dyn LedgerReader>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("ledger-reader-{id}"))
        .spawn(move || {
            let _sentinel = Sentinel {
                id,
                queue: queue.clone(),
                reader: reader.clone(),
            };
            loop {
                let next = queue.lock().recv();
                let Ok(task) = next else {
                    debug!(target: "pool", worker = id, "Read queue closed, worker exiting");
                    break;
                };
                let result = task.job.run(reader.as_ref());
                // the caller may have given up waiting
                let _ = task.reply.send(result);
            }
        })?;
    Ok(())
}

pub struct ReadPool {
    queue: Mutex<mpsc::Sender<Task>>,
    workers: usize,
    retries: u32,
}

impl ReadPool {
    /// One worker per core, capped at `max_workers`, never fewer than one.
    pub fn new(
        reader: Arc<dyn LedgerReader>,
        max_workers: usize,
        retries: u32,
    ) -> Result<Self, PoolError> {
        let workers = num_cpus::get().min(max_workers).max(1);
        let (tx, rx) = mpsc::channel();
        let queue: SharedQueue = Arc::new(Mutex::new(rx));
        for id in 1..=workers {
            spawn_worker(id, queue.clone(), reader.clone())?;
        }
        debug!(target: "pool", workers, "Ledger read pool started");
        Ok(Self {
            queue: Mutex::new(tx),
            workers,
            retries,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    async fn submit(&self, job: ReadJob) -> Result<ReadReply, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .lock()
            .send(Task { job, reply })
            .map_err(|_| PoolError::QueueClosed)?;
        rx.await.map_err(|_| PoolError::WorkerLost)?
    }

    /// Run `job`, resubmitting it when its worker dies mid-job.
    pub async fn run(&self, job: ReadJob) -> Result<ReadReply, PoolError> {
        let mut attempt = 0;
        loop {
            match self.submit(job.clone()).await {
                Err(PoolError::WorkerLost) if attempt < self.retries => {
                    attempt += 1;
                    warn!(target: "pool", job = job.name(), attempt, "Read job lost its worker, retrying");
                }
                other => return other,
            }
        }
    }

    pub async fn voters_last_allocation(&self) -> Result<Vec<Allocation>, PoolError> {
        match self.run(ReadJob::VotersLastAllocation).await? {
            ReadReply::Allocations(rows) => Ok(rows),
            _ => Err(PoolError::UnexpectedReply("voters_last_allocation")),
        }
    }

    pub async fn unsettled_txids(&self) -> Result<Vec<String>, PoolError> {
        match self.run(ReadJob::UnsettledTxids).await? {
            ReadReply::Txids(ids) => Ok(ids),
            _ => Err(PoolError::UnexpectedReply("unsettled_txids")),
        }
    }

    pub async fn height(&self) -> Result<u64, PoolError> {
        match self.run(ReadJob::Height).await? {
            ReadReply::Height(h) => Ok(h),
            _ => Err(PoolError::UnexpectedReply("height")),
        }
    }

    pub async fn last_paid_summary(&self) -> Result<Option<LastPaidSummary>, PoolError> {
        match self.run(ReadJob::LastPaidSummary).await? {
            ReadReply::LastPaid(summary) => Ok(summary),
            _ => Err(PoolError::UnexpectedReply("last_paid_summary")),
        }
    }

    pub async fn pending_summary(&self) -> Result<Option<PendingSummary>, PoolError> {
        match self.run(ReadJob::PendingSummary).await? {
            ReadReply::Pending(summary) => Ok(summary),
            _ => Err(PoolError::UnexpectedReply("pending_summary")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeshare_storage::{LedgerStore, MemoryLedgerStore, Result as StoreResult};
    use forgeshare_types::{Amount, ForgedBlock, MissedBlock, PayeeType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn block(height: u64) -> ForgedBlock {
        ForgedBlock {
            round: 1,
            height,
            timestamp: height * 8,
            delegate: "bp".into(),
            reward: Amount(100),
            fund_deduction: Amount::ZERO,
            fees: Amount::ZERO,
            burned_fees: Amount::ZERO,
            votes: Amount(10),
            valid_votes: Amount(10),
            org_valid_votes: Amount(10),
            voter_count: 1,
        }
    }

    fn seeded() -> MemoryLedgerStore {
        let store = MemoryLedgerStore::new();
        let mut row = Allocation::payee(5, PayeeType::Voter, "alice", 50.0, Amount(50), 0);
        row.balance = Amount(10);
        row.org_balance = Amount(10);
        store.insert(&[block(5)], &[], &[row]).unwrap();
        store
    }

    /// Panics on the first `panics` scans of the allocation table.
    struct Flaky {
        inner: MemoryLedgerStore,
        panics: AtomicUsize,
    }

    impl LedgerReader for Flaky {
        fn height(&self) -> StoreResult<u64> {
            self.inner.height()
        }
        fn forged_block(&self, height: u64) -> StoreResult<Option<ForgedBlock>> {
            self.inner.forged_block(height)
        }
        fn forged_blocks(&self) -> StoreResult<Vec<ForgedBlock>> {
            self.inner.forged_blocks()
        }
        fn missed_blocks(&self) -> StoreResult<Vec<MissedBlock>> {
            self.inner.missed_blocks()
        }
        fn allocations_at(&self, height: u64) -> StoreResult<Vec<Allocation>> {
            self.inner.allocations_at(height)
        }
        fn allocations(&self) -> StoreResult<Vec<Allocation>> {
            let left = self.panics.load(Ordering::SeqCst);
            if left > 0 {
                self.panics.store(left - 1, Ordering::SeqCst);
                panic!("simulated reader crash");
            }
            self.inner.allocations()
        }
    }

    #[tokio::test]
    async fn answers_typed_queries() {
        let pool = ReadPool::new(Arc::new(seeded()), 2, 0).unwrap();
        assert!(pool.workers() >= 1);
        assert_eq!(pool.height().await.unwrap(), 5);
        let rows = pool.voters_last_allocation().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(pool.unsettled_txids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_worker_is_replaced_and_job_retried() {
        let reader = Arc::new(Flaky {
            inner: seeded(),
            panics: AtomicUsize::new(1),
        });
        let pool = ReadPool::new(reader, 1, 1).unwrap();
        let rows = pool.voters_last_allocation().await.unwrap();
        assert_eq!(rows[0].address, "alice");
        // the respawned worker keeps serving
        assert_eq!(pool.height().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn lost_worker_without_retries_fails_the_caller() {
        let reader = Arc::new(Flaky {
            inner: seeded(),
            panics: AtomicUsize::new(1),
        });
        let pool = ReadPool::new(reader, 1, 0).unwrap();
        assert!(matches!(
            pool.voters_last_allocation().await,
            Err(PoolError::WorkerLost)
        ));
        assert_eq!(pool.height().await.unwrap(), 5);
    }
}
