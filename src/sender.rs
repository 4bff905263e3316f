//! Transaction Sender (spec §4.3): a single FIFO queue per signing
//! identity. Generalizes the teacher's implicit single-sequential-send
//! (one `collect()` per concurrently-completing task, arbitrated only by
//! `NonceManagerMiddleware`) into an explicit owned queue, because this
//! spec has several independent components — the fulfillment router, the
//! keep-alive driver, the sweeper, the maintenance loops — submitting
//! writes concurrently, which the teacher's single-purpose keeper never
//! has to arbitrate.
//!
//! "Callers submit a closure that, when invoked, returns a transaction
//! hash or an error; the sender invokes closures strictly sequentially"
//! (spec §4.3) is modeled as a already-lazy boxed future (Rust futures do
//! not run until polled, so accepting a future is equivalent to accepting
//! a closure that produces one) drained one at a time by a single worker
//! task reading off an mpsc channel — the channel itself is the FIFO.

use ethers::types::H256;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::shutdown::Shutdown;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("gas estimation failed (would revert): {0}")]
    GasEstimationFailed(String),

    #[error("transaction {tx_hash:?} reverted in block {block:?}")]
    Reverted {
        tx_hash: H256,
        block: Option<u64>,
    },

    #[error("timed out waiting for receipt of {tx_hash:?}")]
    ReceiptTimeout { tx_hash: H256 },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("sender is shutting down")]
    ShuttingDown,
}

/// A unit of work the sender runs to completion before accepting the
/// next one. Callers are expected to have already estimated gas, applied
/// the 20% safety buffer, and consulted the profitability gate (spec
/// §4.3 preconditions 1-3) before constructing this future; the sender
/// itself does not re-derive those checks.
pub type SendJob = BoxFuture<'static, Result<H256, SenderError>>;

struct QueuedJob {
    run: SendJob,
    respond: oneshot::Sender<Result<H256, SenderError>>,
}

#[derive(Clone)]
pub struct TransactionSender {
    queue: mpsc::UnboundedSender<QueuedJob>,
}

impl TransactionSender {
    /// Spawns the single worker task that drains the queue strictly
    /// sequentially. `shutdown` lets the worker exit once no more jobs
    /// will be submitted; jobs already queued are still drained before
    /// exit, since discarding a job that already consumed a nonce slot
    /// assumption would violate P2 (monotonic nonces).
    pub fn spawn(shutdown: Shutdown) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<QueuedJob>();

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    biased;
                    job = rx.recv() => {
                        match job {
                            Some(job) => {
                                let result = job.run.await;
                                let _ = job.respond.send(result);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        // Drain whatever is already queued before exiting,
                        // then stop accepting new work implicitly (the
                        // sender clone's channel will start erroring once
                        // this task drops `rx`).
                        while let Ok(job) = rx.try_recv() {
                            let result = job.run.await;
                            let _ = job.respond.send(result);
                        }
                        break;
                    }
                }
            }
        });

        Self { queue }
    }

    /// Enqueues `job` and awaits its result. Ordering across concurrent
    /// callers is FIFO by submission (spec §5: "strict submission order
    /// via the transaction mutex").
    pub async fn submit(&self, job: SendJob) -> Result<H256, SenderError> {
        let (respond, rx) = oneshot::channel();
        self.queue
            .send(QueuedJob { run: job, respond })
            .map_err(|_| SenderError::ShuttingDown)?;
        rx.await.map_err(|_| SenderError::ShuttingDown)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_strictly_one_at_a_time_in_submission_order() {
        let shutdown = Shutdown::new();
        let sender = TransactionSender::spawn(shutdown);

        let order = Arc::new(std::sync::Mutex::new(Vec::<u32>::new()));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let sender = sender.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let order = order.clone();
                let job: SendJob = Box::pin(async move {
                    // Later-submitted jobs sleep less, so if execution
                    // were concurrent they'd finish out of order; FIFO
                    // draining means they still run in submission order.
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    order.lock().unwrap().push(i);
                    Ok(H256::from_low_u64_be(i as u64))
                });
                sender.submit(job).await.unwrap();
            }));
            // Ensure deterministic submission order for the test.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn reverted_receipt_surfaces_as_typed_error_not_success() {
        let shutdown = Shutdown::new();
        let sender = TransactionSender::spawn(shutdown);

        let job: SendJob = Box::pin(async move {
            Err(SenderError::Reverted {
                tx_hash: H256::zero(),
                block: Some(10),
            })
        });

        let result = sender.submit(job).await;
        assert!(matches!(result, Err(SenderError::Reverted { .. })));
    }

    #[tokio::test]
    async fn a_shared_counter_never_observes_concurrent_increments() {
        // If two jobs ran concurrently instead of strictly sequentially,
        // a racy read-modify-write on a plain (non-atomic) counter could
        // lose updates. Since the sender serializes, a plain counter
        // guarded only by the FIFO still ends up exactly right.
        let shutdown = Shutdown::new();
        let sender = TransactionSender::spawn(shutdown);
        let counter = Arc::new(AtomicU64::new(0));

        for i in 0..20u64 {
            let counter = counter.clone();
            let job: SendJob = Box::pin(async move {
                let before = counter.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(before + 1, Ordering::SeqCst);
                Ok(H256::from_low_u64_be(i))
            });
            sender.submit(job).await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
