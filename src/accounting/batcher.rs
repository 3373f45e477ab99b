//! Continuous chained batching for ledger transfer submissions.
//!
//! Producers append their transfer lists under a short-held mutex; a single
//! worker task is running whenever the queue is non-empty. Each iteration
//! the worker packs up to [`MAX_BATCH`] items from the head of the
//! outstanding submissions into one RPC, recording a
//! `(submission, item_offset, batch_offset, count)` span per contribution.
//! Per-index failures from the response are mapped back through the spans
//! into each submission's local index space; a submission resolves once all
//! of its items have been through a batch.
//!
//! While an RPC is in flight the mutex is free, so new producers enqueue
//! into the *next* batch. The worker tears itself down when the queue
//! drains; the next `submit` spawns a fresh one.
//!
//! A wholesale RPC error (not a per-index failure) is propagated to every
//! submission mapped into that batch. The worker keeps draining the rest of
//! the queue so the "worker runs while queue is non-empty" invariant holds.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Notify};

use super::error::AccountingError;
use super::remote::{LedgerTransport, NewTransfer, TransferFailure};

/// Maximum items per ledger RPC.
pub const MAX_BATCH: usize = 8190;

type SubmitResult = Result<Vec<TransferFailure>, AccountingError>;

struct Submission {
    items: Vec<NewTransfer>,
    /// Items already packed into some batch.
    taken: usize,
    /// Items whose batch RPC has completed.
    acked: usize,
    /// Failures collected so far, in the submission's local index space.
    failures: Vec<TransferFailure>,
    /// Wholesale batch error, if any of this submission's batches died.
    error: Option<String>,
    done: Option<oneshot::Sender<SubmitResult>>,
}

/// One submission's contribution to a batch.
struct Span {
    submission: u64,
    item_offset: usize,
    batch_offset: usize,
    count: usize,
}

#[derive(Default)]
struct BatchQueue {
    subs: HashMap<u64, Submission>,
    /// FIFO of submission ids that still have unpacked items.
    order: VecDeque<u64>,
    next_id: u64,
    worker_running: bool,
}

struct BatcherInner {
    transport: Arc<dyn LedgerTransport>,
    max_batch: usize,
    state: Mutex<BatchQueue>,
    drained: Notify,
}

/// Coalesces concurrent transfer submissions into bounded ledger batches.
#[derive(Clone)]
pub struct ChainedTransferBatcher {
    inner: Arc<BatcherInner>,
}

impl ChainedTransferBatcher {
    pub fn new(transport: Arc<dyn LedgerTransport>, max_batch: usize) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                transport,
                max_batch: max_batch.max(1),
                state: Mutex::new(BatchQueue::default()),
                drained: Notify::new(),
            }),
        }
    }

    /// Submit transfers for batched execution.
    ///
    /// Resolves once every item has been through an RPC, with the per-index
    /// failures parallel to the input (sparse: only failed indexes appear,
    /// in input order). Within one call index positions are preserved;
    /// across calls there is no ordering guarantee.
    pub async fn submit(&self, transfers: Vec<NewTransfer>) -> SubmitResult {
        if transfers.is_empty() {
            return Ok(Vec::new());
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut q = self.inner.state.lock().await;
            let id = q.next_id;
            q.next_id += 1;
            q.subs.insert(
                id,
                Submission {
                    items: transfers,
                    taken: 0,
                    acked: 0,
                    failures: Vec::new(),
                    error: None,
                    done: Some(tx),
                },
            );
            q.order.push_back(id);
            self.ensure_worker(&mut q);
        }

        rx.await.map_err(|_| AccountingError::BatcherClosed)?
    }

    /// Process the queue to empty and wait for it.
    ///
    /// The chained worker never idles between batches, so this only has to
    /// make sure a worker exists and then wait for the drain notification.
    /// In-flight RPCs are not cancelled.
    pub async fn flush_now(&self) {
        loop {
            let notified = self.inner.drained.notified();
            {
                let mut q = self.inner.state.lock().await;
                if q.subs.is_empty() {
                    return;
                }
                self.ensure_worker(&mut q);
            }
            notified.await;
        }
    }

    /// Outstanding (unresolved) submissions, for shutdown logging.
    pub async fn backlog(&self) -> usize {
        self.inner.state.lock().await.subs.len()
    }

    fn ensure_worker(&self, q: &mut BatchQueue) {
        if !q.worker_running && !q.order.is_empty() {
            q.worker_running = true;
            let inner = self.inner.clone();
            tokio::spawn(run_worker(inner));
        }
    }
}

async fn run_worker(inner: Arc<BatcherInner>) {
    loop {
        // Assemble the next batch under the lock.
        let (batch, spans) = {
            let mut q = inner.state.lock().await;
            if q.order.is_empty() {
                q.worker_running = false;
                return;
            }

            let mut batch: Vec<NewTransfer> = Vec::new();
            let mut spans: Vec<Span> = Vec::new();
            while batch.len() < inner.max_batch {
                let Some(&id) = q.order.front() else { break };
                let sub = q.subs.get_mut(&id).expect("queued submission exists");
                let remaining = sub.items.len() - sub.taken;
                let count = remaining.min(inner.max_batch - batch.len());
                spans.push(Span {
                    submission: id,
                    item_offset: sub.taken,
                    batch_offset: batch.len(),
                    count,
                });
                batch.extend_from_slice(&sub.items[sub.taken..sub.taken + count]);
                sub.taken += count;
                if sub.taken == sub.items.len() {
                    q.order.pop_front();
                } else {
                    break; // batch is full, tail goes into the next one
                }
            }
            (batch, spans)
        };

        tracing::debug!(
            batch_len = batch.len(),
            submissions = spans.len(),
            "ledger batch dispatch"
        );

        // The RPC runs outside the lock; producers enqueue freely meanwhile.
        let result = inner.transport.create_transfers(batch).await;

        // Map results back and resolve completed submissions under the lock.
        {
            let mut q = inner.state.lock().await;
            match result {
                Ok(failures) => {
                    for span in &spans {
                        let sub = q.subs.get_mut(&span.submission).expect("in-flight submission");
                        for f in &failures {
                            if f.index >= span.batch_offset && f.index < span.batch_offset + span.count
                            {
                                sub.failures.push(TransferFailure {
                                    index: span.item_offset + (f.index - span.batch_offset),
                                    code: f.code.clone(),
                                });
                            }
                        }
                        ack_span(&mut q, span);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "ledger batch failed wholesale");
                    let msg = e.to_string();
                    for span in &spans {
                        let sub = q.subs.get_mut(&span.submission).expect("in-flight submission");
                        sub.error = Some(msg.clone());
                        ack_span(&mut q, span);
                    }
                }
            }
        }
        inner.drained.notify_waiters();
    }
}

fn ack_span(q: &mut BatchQueue, span: &Span) {
    let sub = q.subs.get_mut(&span.submission).expect("in-flight submission");
    sub.acked += span.count;
    if sub.acked == sub.items.len() {
        let mut sub = q.subs.remove(&span.submission).expect("completed submission");
        if let Some(done) = sub.done.take() {
            let result = match sub.error.take() {
                Some(msg) => Err(AccountingError::Transport(msg)),
                None => Ok(std::mem::take(&mut sub.failures)),
            };
            // receiver may have been dropped on request cancellation
            let _ = done.send(result);
        }
    }
}
