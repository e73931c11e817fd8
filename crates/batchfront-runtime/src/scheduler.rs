use std::sync::Arc;
use std::time::Duration;

use batchfront_core::BatchError;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::task::{Batch, BatchTask};

/// Invoked with unique ownership of each closed batch.
pub type BatchCallback = Arc<dyn Fn(Batch) + Send + Sync>;

/// Object-safe scheduler interface; the session holds one per signature.
///
/// `schedule` takes ownership of the task on success. On failure it returns
/// synchronously and the task never enters a batch.
pub trait BatchScheduler: Send + Sync {
    fn schedule(&self, task: BatchTask) -> Result<(), BatchError>;
}

#[derive(Clone, Debug)]
pub struct BatchPolicy {
    /// Upper bound on a batch's summed batch-axis size.
    pub max_batch_size: usize,
    /// How long a non-full batch may wait for more tasks.
    pub max_delay: Duration,
    /// Worker tasks driving the batch callback.
    pub num_workers: usize,
    /// Admission queue depth; a full queue rejects instead of blocking.
    pub queue_capacity: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_delay: Duration::from_millis(5),
            num_workers: 1,
            queue_capacity: 1024,
        }
    }
}

/// Groups admitted tasks into batches, closed by size or by delay,
/// whichever trips first, and fans closed batches out round-robin to
/// worker tasks.
pub struct BasicScheduler {
    max_task_size: usize,
    tx: mpsc::Sender<BatchTask>,
}

impl BasicScheduler {
    /// Spawns the assembler and worker tasks. Must be called from within a
    /// tokio runtime.
    pub fn spawn(policy: BatchPolicy, on_batch_ready: BatchCallback) -> Self {
        let (tx, rx) = mpsc::channel(policy.queue_capacity.max(1));
        let mut worker_txs = Vec::with_capacity(policy.num_workers.max(1));
        for _ in 0..policy.num_workers.max(1) {
            let (worker_tx, mut worker_rx) = mpsc::channel::<Batch>(1);
            let callback = on_batch_ready.clone();
            tokio::spawn(async move {
                while let Some(batch) = worker_rx.recv().await {
                    callback(batch);
                }
            });
            worker_txs.push(worker_tx);
        }
        let max_task_size = policy.max_batch_size;
        tokio::spawn(assemble(policy, rx, worker_txs));
        Self { max_task_size, tx }
    }
}

impl BatchScheduler for BasicScheduler {
    fn schedule(&self, task: BatchTask) -> Result<(), BatchError> {
        if task.size() > self.max_task_size {
            return Err(BatchError::InvalidArgument(format!(
                "task size {} exceeds the maximum batch size {}",
                task.size(),
                self.max_task_size
            )));
        }
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BatchError::Unavailable(
                "batch scheduling queue is full".into(),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(BatchError::Internal("batch assembler is gone".into()))
            }
        }
    }
}

async fn assemble(
    policy: BatchPolicy,
    mut rx: mpsc::Receiver<BatchTask>,
    worker_txs: Vec<mpsc::Sender<Batch>>,
) {
    let mut pending: Vec<BatchTask> = Vec::new();
    let mut pending_size = 0usize;
    let mut first_seen: Option<Instant> = None;
    let mut rr = 0usize;

    loop {
        tokio::select! {
            maybe_task = rx.recv() => {
                match maybe_task {
                    None => break,
                    Some(task) => {
                        // A task that would overflow the open batch closes
                        // it first.
                        if !pending.is_empty() && pending_size + task.size() > policy.max_batch_size {
                            flush(&mut pending, &mut pending_size, &worker_txs, &mut rr).await;
                            first_seen = None;
                        }
                        if pending.is_empty() {
                            first_seen = Some(Instant::now());
                        }
                        pending_size += task.size();
                        pending.push(task);
                        if pending_size >= policy.max_batch_size {
                            flush(&mut pending, &mut pending_size, &worker_txs, &mut rr).await;
                            first_seen = None;
                        }
                    }
                }
            }
            _ = async {
                // With pending tasks, sleep until the batching window expires.
                if let Some(t0) = first_seen {
                    sleep(policy.max_delay.saturating_sub(t0.elapsed())).await;
                }
            }, if first_seen.is_some() => {
                flush(&mut pending, &mut pending_size, &worker_txs, &mut rr).await;
                first_seen = None;
            }
        }
    }

    // Shutting down; tasks already accepted still get their batch.
    flush(&mut pending, &mut pending_size, &worker_txs, &mut rr).await;
}

async fn flush(
    pending: &mut Vec<BatchTask>,
    pending_size: &mut usize,
    worker_txs: &[mpsc::Sender<Batch>],
    rr: &mut usize,
) {
    if pending.is_empty() {
        return;
    }
    let batch = Batch::new(std::mem::take(pending));
    *pending_size = 0;
    debug!(tasks = batch.num_tasks(), size = batch.size(), "dispatching batch");
    let idx = *rr % worker_txs.len();
    *rr += 1;
    // If the worker is gone the batch is dropped with it, and each caller
    // observes the failure through its own receiver.
    let _ = worker_txs[idx].send(batch).await;
}
