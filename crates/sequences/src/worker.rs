//! Queue poller and bounded execution pool.
//!
//! The poll loop only pops due ids and spawns; every execution runs on its
//! own task behind a semaphore permit, so slow collaborators never hold up
//! the dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::interval;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::SequenceResult;
use crate::executor::{ExecutionOutcome, StepExecutor};
use crate::queue::InMemoryQueue;

/// Counts for one drained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub dispatched: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_ops: usize,
    pub deferred: usize,
    pub errors: usize,
}

type Executed = (Uuid, SequenceResult<ExecutionOutcome>);

impl DrainReport {
    fn collect(&mut self, joined: Result<Executed, JoinError>) {
        match joined {
            Ok((_, Ok(outcome))) => self.record(&outcome),
            Ok((execution_id, Err(e))) => {
                self.errors += 1;
                error!(execution_id = %execution_id, error = %e, "Execution errored");
            }
            Err(e) => {
                self.errors += 1;
                error!(error = %e, "Execution task panicked");
            }
        }
    }

    fn record(&mut self, outcome: &ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Completed { .. } => self.completed += 1,
            ExecutionOutcome::Skipped { .. } => self.skipped += 1,
            ExecutionOutcome::Failed { .. } => self.failed += 1,
            ExecutionOutcome::NoOp { .. } => self.no_ops += 1,
            ExecutionOutcome::Deferred => self.deferred += 1,
        }
    }
}

pub struct SequenceWorker {
    executor: Arc<StepExecutor>,
    queue: Arc<InMemoryQueue>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
}

impl SequenceWorker {
    pub fn new(
        executor: Arc<StepExecutor>,
        queue: Arc<InMemoryQueue>,
        clock: Arc<dyn Clock>,
        max_concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            executor,
            queue,
            clock,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            poll_interval,
        }
    }

    /// Runs everything due now and waits for the batch to finish.
    pub async fn drain_due(&self) -> DrainReport {
        let mut tasks = JoinSet::new();
        let mut report = DrainReport {
            dispatched: self.dispatch_due(&mut tasks),
            ..DrainReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            report.collect(joined);
        }
        if report.dispatched > 0 {
            metrics::counter!("sequence.worker_batches").increment(1);
        }
        report
    }

    /// Pops every due id and spawns its execution into `tasks` without
    /// waiting for any of them. Returns how many were spawned.
    fn dispatch_due(&self, tasks: &mut JoinSet<Executed>) -> usize {
        let due = self.queue.due(self.clock.now());
        if due.is_empty() {
            return 0;
        }
        debug!(count = due.len(), in_flight = tasks.len(), "Dispatching due executions");
        let dispatched = due.len();
        for execution_id in due {
            let executor = self.executor.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (execution_id, executor.execute(&execution_id).await)
            });
        }
        dispatched
    }

    /// Drains repeatedly until a round dispatches nothing or `max_rounds`
    /// is reached. Useful when zero-delay steps schedule more due work.
    pub async fn drain_until_idle(&self, max_rounds: usize) -> DrainReport {
        let mut total = DrainReport::default();
        for _ in 0..max_rounds {
            let round = self.drain_due().await;
            if round.dispatched == 0 {
                break;
            }
            total.dispatched += round.dispatched;
            total.completed += round.completed;
            total.skipped += round.skipped;
            total.failed += round.failed;
            total.no_ops += round.no_ops;
            total.deferred += round.deferred;
            total.errors += round.errors;
        }
        total
    }

    /// Polls until `shutdown` fires or its sender is dropped. Executions
    /// run on a set that outlives each tick, so a slow handler never delays
    /// the next poll. In-flight executions are awaited before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = interval(self.poll_interval);
        let mut tasks: JoinSet<Executed> = JoinSet::new();
        let mut window = DrainReport::default();
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Sequence worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    window.dispatched += self.dispatch_due(&mut tasks);
                    if window.dispatched > 0 && tasks.is_empty() {
                        info!(
                            dispatched = window.dispatched,
                            completed = window.completed,
                            failed = window.failed,
                            skipped = window.skipped,
                            "Worker batch finished"
                        );
                        metrics::counter!("sequence.worker_batches").increment(1);
                        window = DrainReport::default();
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    window.collect(joined);
                }
                _ = &mut shutdown => {
                    info!(in_flight = tasks.len(), "Sequence worker shutting down");
                    break;
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            window.collect(joined);
        }
    }
}
