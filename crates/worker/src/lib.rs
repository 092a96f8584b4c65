//! Worker process: Postgres-backed queue, cron triggers and a pool of
//! worker loops sharing one handler registry.
//!
//! The stock registry only routes `webhook`. Processes that run other kinds
//! (`run_prompts`, custom kinds) embed this crate and register their own
//! handlers before calling `spawn_workers`.

pub mod throttle;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use cadence_infra::CadenceConfig;
use cadence_infra::jobs::{
    HandlerRegistry, JobHandler, JobQueue, PostgresJobQueue, SchedulerRegistrar, TokioTriggerRegistrar,
    WebhookHandler, Worker, WorkerHandle,
};
use cadence_infra::rate_limit::{RateLimiter, SlidingWindowLimiter};

pub use throttle::{ThrottledHandler, initiator_key, webhook_host_key};

/// Kinds the payload model defines outside of `Custom`.
pub const BUILT_IN_KINDS: [&str; 2] = ["run_prompts", "webhook"];

/// Handlers this process can run.
///
/// Webhook calls share the vendor quota per host, and calls a user initiated
/// also count against that user's quota.
pub fn handlers(limiter: Arc<dyn RateLimiter>, config: &CadenceConfig) -> HandlerRegistry {
    let per_host = ThrottledHandler::new(
        WebhookHandler::new(),
        limiter.clone(),
        config.vendor_quota,
        webhook_host_key,
    );
    HandlerRegistry::new().with(
        "webhook",
        ThrottledHandler::new(per_host, limiter, config.user_quota, initiator_key),
    )
}

/// Built-in kinds `registry` has no handler for.
pub fn unrouted_kinds(registry: &HandlerRegistry) -> Vec<&'static str> {
    BUILT_IN_KINDS
        .into_iter()
        .filter(|kind| !registry.routes(kind))
        .collect()
}

/// Start `config.workers` loops over one queue and handler.
pub fn spawn_workers<Q, H>(queue: Q, handler: Arc<H>, config: &CadenceConfig) -> Vec<WorkerHandle>
where
    Q: JobQueue + Clone + 'static,
    H: JobHandler,
{
    (0..config.workers)
        .map(|i| Worker::new(queue.clone(), handler.clone(), config.worker_config(i)).spawn())
        .collect()
}

/// Stop every worker, letting in-flight entries finish.
pub async fn shutdown(workers: Vec<WorkerHandle>) {
    for worker in workers {
        let name = worker.name().to_string();
        let stats = worker.stats();
        worker.shutdown().await;
        info!(
            worker = %name,
            claimed = stats.claimed,
            succeeded = stats.succeeded,
            retried = stats.retried,
            permanently_failed = stats.permanently_failed,
            "worker shut down"
        );
    }
}

#[cfg(feature = "redis")]
async fn rate_limiter(config: &CadenceConfig) -> anyhow::Result<Arc<dyn RateLimiter>> {
    let store = cadence_infra::rate_limit::RedisRateLimitStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to redis at {}", config.redis_url))?;
    Ok(Arc::new(SlidingWindowLimiter::new(store)))
}

#[cfg(not(feature = "redis"))]
async fn rate_limiter(_config: &CadenceConfig) -> anyhow::Result<Arc<dyn RateLimiter>> {
    tracing::warn!("built without redis; vendor quotas are enforced per process");
    Ok(Arc::new(SlidingWindowLimiter::new(
        cadence_infra::rate_limit::InMemoryRateLimitStore::new(),
    )))
}

/// Run until ctrl-c.
pub async fn run(config: CadenceConfig) -> anyhow::Result<()> {
    let database_url = config.require_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(u32::try_from(config.workers).unwrap_or(u32::MAX).saturating_add(2))
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;

    let queue = Arc::new(PostgresJobQueue::with_options(pool, config.queue_options()));
    queue.migrate().await.context("failed to apply job queue schema")?;

    let registrar = SchedulerRegistrar::new(queue.clone(), queue.clone(), TokioTriggerRegistrar::new());
    let restored = registrar.restore().await.context("failed to restore cron triggers")?;

    let limiter = rate_limiter(&config).await?;
    let registry = handlers(limiter, &config);
    let unrouted = unrouted_kinds(&registry);
    if !unrouted.is_empty() {
        warn!(kinds = ?unrouted, "no handler registered; entries of these kinds will fail permanently");
    }
    let registry = Arc::new(registry);
    let workers = spawn_workers(queue, registry, &config);
    info!(workers = workers.len(), restored, "cadence worker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Stop firing before draining so no new entries appear mid-shutdown.
    drop(registrar);
    shutdown(workers).await;
    Ok(())
}
