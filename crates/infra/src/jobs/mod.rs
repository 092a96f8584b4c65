//! Durable job queue with retry, quadratic backoff and cron scheduling.
//!
//! ## Design
//!
//! - Entries are tenant-scoped and carry a typed payload
//! - Claiming is one atomic step that skips entries held by other workers
//! - Failed attempts are retried after `attempts² × 60s` until the budget is spent
//! - Only terminal outcomes are written to the audit trail
//!
//! ## Components
//!
//! - `JobQueue` / `DefinitionStore`: persistence (in-memory or Postgres)
//! - `Worker`: claim → execute → report loop with cooperative shutdown
//! - `JobHandler` / `HandlerRegistry`: the work itself, routed by payload kind
//! - `SchedulerRegistrar`: keeps cron triggers in step with definitions

pub mod handler;
pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod types;
#[cfg(feature = "webhook")]
pub mod webhook;
pub mod worker;

pub use handler::{FnHandler, HandlerRegistry, JobHandler};
pub use postgres::PostgresJobQueue;
pub use scheduler::{CronSchedule, FireFn, SchedulerRegistrar, TokioTriggerRegistrar, TriggerRegistrar};
pub use store::{DefinitionStore, InMemoryJobQueue, JobQueue, QueueOptions};
pub use types::{
    Backoff, CompleteOutcome, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_ATTEMPTS, EntryState, FailOutcome,
    Failure, HandlerOutput, HttpMethod, JobDefinition, JobPayload, JobRun, JobRunStatus,
    NewQueueEntry, QueueEntry, QueueStats, TargetKind,
};
#[cfg(feature = "webhook")]
pub use webhook::WebhookHandler;
pub use worker::{CycleOutcome, Worker, WorkerConfig, WorkerHandle, WorkerStats};
