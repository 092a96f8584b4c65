//! Worker loop: claim one entry, run its handler, report the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cadence_core::{QueueEntryId, StoreError};

use super::handler::JobHandler;
use super::store::JobQueue;
use super::types::{CompleteOutcome, FailOutcome, Failure, HandlerOutput, QueueEntry};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging.
    pub name: String,
    /// How long to wait when the queue is empty or the store is unavailable.
    pub idle_interval: Duration,
    /// Upper bound on one handler call. `None` lets handlers run unbounded.
    pub handler_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            idle_interval: Duration::from_secs(1),
            handler_timeout: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

/// What one claim/execute/report cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was eligible.
    Idle,
    Succeeded(QueueEntryId),
    Retrying {
        entry_id: QueueEntryId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    PermanentlyFailed(QueueEntryId),
    /// The entry turned terminal before we reported (e.g. a stale lock was reclaimed).
    AlreadyProcessed(QueueEntryId),
    /// Claiming or reporting hit the store.
    StoreError(StoreError),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub permanently_failed: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    permanently_failed: AtomicU64,
    store_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Idle | CycleOutcome::AlreadyProcessed(_) => {}
            CycleOutcome::Succeeded(_) => Self::bump(&self.succeeded),
            CycleOutcome::Retrying { .. } => Self::bump(&self.retried),
            CycleOutcome::PermanentlyFailed(_) => Self::bump(&self.permanently_failed),
            CycleOutcome::StoreError(_) => Self::bump(&self.store_errors),
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    ///
    /// An entry already being handled is finished and reported first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.join.await {
            error!(worker = %self.name, error = %e, "worker task ended abnormally");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Single-flight worker loop over a queue.
///
/// Processes at most one entry at a time. Run several workers against the
/// same queue to scale out; the queue's claim keeps them from sharing entries.
pub struct Worker<Q, H> {
    queue: Q,
    handler: Arc<H>,
    config: WorkerConfig,
    counters: Arc<Counters>,
}

impl<Q, H> Worker<Q, H>
where
    Q: JobQueue + 'static,
    H: JobHandler,
{
    pub fn new(queue: Q, handler: Arc<H>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Run one claim/execute/report cycle.
    pub async fn run_once(&self) -> CycleOutcome {
        let outcome = match self.queue.claim_next().await {
            Ok(Some(entry)) => {
                Counters::bump(&self.counters.claimed);
                debug!(
                    worker = %self.config.name,
                    entry_id = %entry.id,
                    tenant_id = %entry.tenant_id,
                    kind = entry.payload.kind_name(),
                    attempts = entry.attempts,
                    "claimed entry"
                );
                let result = self.execute(&entry).await;
                self.report(&entry, result).await
            }
            Ok(None) => CycleOutcome::Idle,
            Err(e) => {
                error!(worker = %self.config.name, error = %e, "failed to claim entry");
                CycleOutcome::StoreError(e)
            }
        };
        self.counters.record(&outcome);
        outcome
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = self.config.name.clone();
        let counters = self.counters.clone();
        let join = tokio::spawn(self.run(stop_rx));

        WorkerHandle {
            name,
            stop: stop_tx,
            join,
            counters,
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "worker started");

        while !*stop.borrow() {
            match self.run_once().await {
                CycleOutcome::Idle | CycleOutcome::StoreError(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_interval) => {}
                        changed = stop.changed() => {
                            // A dropped handle detaches the worker; keep pacing the loop.
                            if changed.is_err() {
                                tokio::time::sleep(self.config.idle_interval).await;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        info!(worker = %self.config.name, "worker stopped");
    }

    /// Run the handler in its own task so a panic surfaces as a join error
    /// instead of unwinding through the loop and leaving the entry locked.
    async fn execute(&self, entry: &QueueEntry) -> Result<HandlerOutput, Failure> {
        let handler = self.handler.clone();
        let owned = entry.clone();
        let mut task = tokio::spawn(async move { handler.execute(&owned).await });

        let joined = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(Failure::new(format!(
                        "handler timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.into()),
            Err(e) if e.is_panic() => Err(Failure::new(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(Failure::new(format!("handler task failed: {e}"))),
        }
    }

    async fn report(&self, entry: &QueueEntry, result: Result<HandlerOutput, Failure>) -> CycleOutcome {
        let name = &self.config.name;
        match result {
            Ok(output) => match self.queue.complete(entry.id, output).await {
                Ok(CompleteOutcome::Completed(_)) => {
                    debug!(worker = %name, entry_id = %entry.id, "entry completed");
                    CycleOutcome::Succeeded(entry.id)
                }
                Ok(CompleteOutcome::AlreadyProcessed) => {
                    warn!(worker = %name, entry_id = %entry.id, "entry was already processed");
                    CycleOutcome::AlreadyProcessed(entry.id)
                }
                Err(e) => {
                    error!(worker = %name, entry_id = %entry.id, error = %e, "failed to complete entry");
                    CycleOutcome::StoreError(e)
                }
            },
            Err(failure) => {
                let message = failure.message.clone();
                match self.queue.fail(entry, failure).await {
                    Ok(FailOutcome::Retrying {
                        attempts,
                        next_run_at,
                    }) => {
                        warn!(
                            worker = %name,
                            entry_id = %entry.id,
                            tenant_id = %entry.tenant_id,
                            attempts,
                            max_attempts = entry.max_attempts,
                            %next_run_at,
                            error = %message,
                            "entry failed, retry scheduled"
                        );
                        CycleOutcome::Retrying {
                            entry_id: entry.id,
                            attempts,
                            next_run_at,
                        }
                    }
                    Ok(FailOutcome::PermanentlyFailed(run)) => {
                        error!(
                            worker = %name,
                            entry_id = %entry.id,
                            tenant_id = %entry.tenant_id,
                            attempts = run.attempt,
                            error = %message,
                            "entry failed permanently"
                        );
                        CycleOutcome::PermanentlyFailed(entry.id)
                    }
                    Ok(FailOutcome::AlreadyProcessed) => {
                        warn!(worker = %name, entry_id = %entry.id, "entry was already processed");
                        CycleOutcome::AlreadyProcessed(entry.id)
                    }
                    Err(e) => {
                        error!(worker = %name, entry_id = %entry.id, error = %e, "failed to record entry failure");
                        CycleOutcome::StoreError(e)
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
