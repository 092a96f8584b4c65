//! Queue and definition storage: traits plus the in-memory backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_core::{Clock, JobDefinitionId, QueueEntryId, StoreError, SystemClock, TenantId};

use super::types::{
    Backoff, CompleteOutcome, FailOutcome, Failure, HandlerOutput, JobDefinition, JobRun,
    NewQueueEntry, QueueEntry, QueueStats,
};

/// Durable table of pending work items.
///
/// `claim_next` is the only concurrency primitive: implementations must select,
/// stamp and return one eligible entry as a single atomic step, skipping
/// entries held by other claimants rather than waiting for them.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new entry (`attempts = 0`, unlocked, eligible now).
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntryId, StoreError>;

    /// Claim the oldest eligible entry. `None` means the queue is idle.
    async fn claim_next(&self) -> Result<Option<QueueEntry>, StoreError>;

    /// Mark an entry processed and append a success record. Idempotent.
    async fn complete(
        &self,
        entry_id: QueueEntryId,
        output: HandlerOutput,
    ) -> Result<CompleteOutcome, StoreError>;

    /// Count a failed attempt: reschedule with backoff or fail permanently.
    async fn fail(&self, entry: &QueueEntry, failure: Failure) -> Result<FailOutcome, StoreError>;

    async fn get(&self, entry_id: QueueEntryId) -> Result<Option<QueueEntry>, StoreError>;

    /// Audit records of an entry, oldest first.
    async fn runs_for_entry(&self, entry_id: QueueEntryId) -> Result<Vec<JobRun>, StoreError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError>;

    /// Remove every entry enqueued for a definition. Returns how many were removed.
    async fn purge_definition(&self, definition_id: JobDefinitionId) -> Result<usize, StoreError>;
}

/// Persistence for recurring job definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn insert(&self, definition: &JobDefinition) -> Result<(), StoreError>;

    /// Overwrite a live definition owned by the same tenant.
    async fn update(&self, definition: &JobDefinition) -> Result<(), StoreError>;

    /// Live (not soft-deleted) definition, tenant-checked.
    async fn get(
        &self,
        tenant_id: TenantId,
        id: JobDefinitionId,
    ) -> Result<Option<JobDefinition>, StoreError>;

    /// Mark deleted and cascade-remove its queue entries in one step.
    /// Returns the number of queue entries removed.
    async fn soft_delete(&self, tenant_id: TenantId, id: JobDefinitionId) -> Result<usize, StoreError>;

    /// Every enabled, live definition across tenants.
    async fn list_enabled(&self) -> Result<Vec<JobDefinition>, StoreError>;
}

#[async_trait]
impl<T: JobQueue + ?Sized> JobQueue for Arc<T> {
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntryId, StoreError> {
        (**self).enqueue(entry).await
    }

    async fn claim_next(&self) -> Result<Option<QueueEntry>, StoreError> {
        (**self).claim_next().await
    }

    async fn complete(
        &self,
        entry_id: QueueEntryId,
        output: HandlerOutput,
    ) -> Result<CompleteOutcome, StoreError> {
        (**self).complete(entry_id, output).await
    }

    async fn fail(&self, entry: &QueueEntry, failure: Failure) -> Result<FailOutcome, StoreError> {
        (**self).fail(entry, failure).await
    }

    async fn get(&self, entry_id: QueueEntryId) -> Result<Option<QueueEntry>, StoreError> {
        (**self).get(entry_id).await
    }

    async fn runs_for_entry(&self, entry_id: QueueEntryId) -> Result<Vec<JobRun>, StoreError> {
        (**self).runs_for_entry(entry_id).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError> {
        (**self).stats(tenant_id).await
    }

    async fn purge_definition(&self, definition_id: JobDefinitionId) -> Result<usize, StoreError> {
        (**self).purge_definition(definition_id).await
    }
}

#[async_trait]
impl<T: DefinitionStore + ?Sized> DefinitionStore for Arc<T> {
    async fn insert(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        (**self).insert(definition).await
    }

    async fn update(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        (**self).update(definition).await
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: JobDefinitionId,
    ) -> Result<Option<JobDefinition>, StoreError> {
        (**self).get(tenant_id, id).await
    }

    async fn soft_delete(&self, tenant_id: TenantId, id: JobDefinitionId) -> Result<usize, StoreError> {
        (**self).soft_delete(tenant_id, id).await
    }

    async fn list_enabled(&self) -> Result<Vec<JobDefinition>, StoreError> {
        (**self).list_enabled().await
    }
}

/// Tunables shared by every queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub backoff: Backoff,
    /// Locks older than this are treated as abandoned and reclaimable.
    /// `None` keeps a claimed entry held until it is completed or failed.
    pub lock_timeout: Option<Duration>,
}

impl QueueOptions {
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<QueueEntryId, QueueEntry>,
    runs: Vec<JobRun>,
    definitions: HashMap<JobDefinitionId, JobDefinition>,
}

/// In-memory queue and definition store for tests and single-process use.
///
/// All state sits behind one mutex, so every operation is atomic with respect
/// to every other, which is the guarantee the Postgres backend gets from row
/// locks and transactions.
#[derive(Debug)]
pub struct InMemoryJobQueue<C: Clock = SystemClock> {
    state: Mutex<QueueState>,
    clock: C,
    options: QueueOptions,
}

impl InMemoryJobQueue<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock, QueueOptions::default())
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryJobQueue<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryJobQueue<C> {
    pub fn with_clock(clock: C, options: QueueOptions) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            options,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::poisoned("job queue"))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[async_trait]
impl<C: Clock> JobQueue for InMemoryJobQueue<C> {
    async fn enqueue(&self, request: NewQueueEntry) -> Result<QueueEntryId, StoreError> {
        let entry = QueueEntry::from_request(request, self.now());
        let id = entry.id;
        self.lock()?.entries.insert(id, entry);
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<QueueEntry>, StoreError> {
        let now = self.now();
        let mut state = self.lock()?;

        let next = state
            .entries
            .values()
            .filter(|e| e.is_claimable(now, self.options.lock_timeout))
            .min_by_key(|e| (e.created_at, *e.id.as_uuid()))
            .map(|e| e.id);

        Ok(next.and_then(|id| {
            state.entries.get_mut(&id).map(|entry| {
                entry.locked_at = Some(now);
                entry.clone()
            })
        }))
    }

    async fn complete(
        &self,
        entry_id: QueueEntryId,
        output: HandlerOutput,
    ) -> Result<CompleteOutcome, StoreError> {
        let now = self.now();
        let mut state = self.lock()?;

        let entry = state
            .entries
            .get_mut(&entry_id)
            .ok_or_else(|| StoreError::not_found(format!("queue entry {entry_id}")))?;

        let outcome = entry.record_success(&output, now);
        if let CompleteOutcome::Completed(run) = &outcome {
            state.runs.push(run.clone());
        }
        Ok(outcome)
    }

    async fn fail(&self, entry: &QueueEntry, failure: Failure) -> Result<FailOutcome, StoreError> {
        let now = self.now();
        let mut state = self.lock()?;

        let stored = state
            .entries
            .get_mut(&entry.id)
            .ok_or_else(|| StoreError::not_found(format!("queue entry {}", entry.id)))?;

        let outcome = stored.record_failure(&failure, now, &self.options.backoff);
        if let FailOutcome::PermanentlyFailed(run) = &outcome {
            state.runs.push(run.clone());
        }
        Ok(outcome)
    }

    async fn get(&self, entry_id: QueueEntryId) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self.lock()?.entries.get(&entry_id).cloned())
    }

    async fn runs_for_entry(&self, entry_id: QueueEntryId) -> Result<Vec<JobRun>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.queue_entry_id == Some(entry_id))
            .cloned()
            .collect())
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError> {
        let state = self.lock()?;
        let mut stats = QueueStats::default();
        for entry in state.entries.values().filter(|e| e.tenant_id == tenant_id) {
            stats.record(entry.state());
        }
        Ok(stats)
    }

    async fn purge_definition(&self, definition_id: JobDefinitionId) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        Ok(purge_entries(&mut state, definition_id))
    }
}

fn purge_entries(state: &mut QueueState, definition_id: JobDefinitionId) -> usize {
    let before = state.entries.len();
    state
        .entries
        .retain(|_, e| e.definition_id != Some(definition_id));
    before - state.entries.len()
}

#[async_trait]
impl<C: Clock> DefinitionStore for InMemoryJobQueue<C> {
    async fn insert(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.definitions.contains_key(&definition.id) {
            return Err(StoreError::corrupt(format!(
                "job definition already exists: {}",
                definition.id
            )));
        }
        state.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn update(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        let now = self.now();
        let mut state = self.lock()?;
        let stored = state
            .definitions
            .get_mut(&definition.id)
            .filter(|d| d.deleted_at.is_none())
            .ok_or_else(|| StoreError::not_found(format!("job definition {}", definition.id)))?;
        if stored.tenant_id != definition.tenant_id {
            return Err(StoreError::TenantIsolation);
        }

        let created_at = stored.created_at;
        *stored = definition.clone();
        stored.created_at = created_at;
        stored.updated_at = now;
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: JobDefinitionId,
    ) -> Result<Option<JobDefinition>, StoreError> {
        let state = self.lock()?;
        match state.definitions.get(&id) {
            Some(d) if d.deleted_at.is_some() => Ok(None),
            Some(d) if d.tenant_id == tenant_id => Ok(Some(d.clone())),
            Some(_) => Err(StoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn soft_delete(&self, tenant_id: TenantId, id: JobDefinitionId) -> Result<usize, StoreError> {
        let now = self.now();
        let mut state = self.lock()?;
        let stored = state
            .definitions
            .get_mut(&id)
            .filter(|d| d.deleted_at.is_none())
            .ok_or_else(|| StoreError::not_found(format!("job definition {id}")))?;
        if stored.tenant_id != tenant_id {
            return Err(StoreError::TenantIsolation);
        }

        stored.deleted_at = Some(now);
        stored.enabled = false;
        Ok(purge_entries(&mut state, id))
    }

    async fn list_enabled(&self) -> Result<Vec<JobDefinition>, StoreError> {
        let state = self.lock()?;
        let mut result: Vec<_> = state
            .definitions
            .values()
            .filter(|d| d.is_active())
            .cloned()
            .collect();
        result.sort_by_key(|d| d.created_at);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{EntryState, JobPayload, JobRunStatus};
    use cadence_core::ManualClock;
    use serde_json::{Map, json};

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn queue() -> (InMemoryJobQueue<ManualClock>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (
            InMemoryJobQueue::with_clock(clock.clone(), QueueOptions::default()),
            clock,
        )
    }

    fn request(tenant: TenantId) -> NewQueueEntry {
        NewQueueEntry::new(tenant, JobPayload::custom("test", Map::new()))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let (queue, _) = queue();
        let tenant = test_tenant();

        let id = queue.enqueue(request(tenant)).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts, 0);
        assert!(claimed.locked_at.is_some());
        assert_eq!(claimed.state(), EntryState::Locked);

        // Held entries are invisible to other claimants.
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let (queue, clock) = queue();
        let tenant = test_tenant();

        let first = queue.enqueue(request(tenant)).await.unwrap();
        clock.advance(Duration::from_millis(5));
        let second = queue.enqueue(request(tenant)).await.unwrap();
        clock.advance(Duration::from_millis(5));
        let third = queue.enqueue(request(tenant)).await.unwrap();

        let order = vec![
            queue.claim_next().await.unwrap().unwrap().id,
            queue.claim_next().await.unwrap().unwrap().id,
            queue.claim_next().await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![first, second, third]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimants_never_share_an_entry() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let tenant = test_tenant();
        let entries = 5;
        let claimants = 16;

        for _ in 0..entries {
            queue.enqueue(request(tenant)).await.unwrap();
        }

        let handles: Vec<_> = (0..claimants)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.claim_next().await.unwrap() })
            })
            .collect();

        let mut claimed = Vec::new();
        let mut empty = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Some(entry) => claimed.push(entry.id),
                None => empty += 1,
            }
        }

        assert_eq!(claimed.len(), entries);
        assert_eq!(empty, claimants - entries);
        claimed.sort_by_key(|id| *id.as_uuid());
        claimed.dedup();
        assert_eq!(claimed.len(), entries);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (queue, _) = queue();
        let id = queue.enqueue(request(test_tenant())).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        let first = queue
            .complete(id, HandlerOutput::new(json!({"ok": true})))
            .await
            .unwrap();
        assert!(matches!(first, CompleteOutcome::Completed(ref run) if run.status == JobRunStatus::Success));

        let second = queue.complete(id, HandlerOutput::empty()).await.unwrap();
        assert_eq!(second, CompleteOutcome::AlreadyProcessed);

        let runs = queue.runs_for_entry(id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].output, Some(json!({"ok": true})));

        let entry = JobQueue::get(&queue, id).await.unwrap().unwrap();
        assert_eq!(entry.state(), EntryState::Succeeded);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_schedules_quadratic_backoff() {
        let (queue, clock) = queue();
        let id = queue
            .enqueue(request(test_tenant()).with_max_attempts(4))
            .await
            .unwrap();

        for (attempt, delay_secs) in [(1u32, 60u64), (2, 240), (3, 540)] {
            let claimed = queue.claim_next().await.unwrap().unwrap();
            let failed_at = clock.now();
            let outcome = queue.fail(&claimed, Failure::new("boom")).await.unwrap();

            match outcome {
                FailOutcome::Retrying { attempts, next_run_at } => {
                    assert_eq!(attempts, attempt);
                    assert_eq!(
                        next_run_at - failed_at,
                        chrono::Duration::seconds(delay_secs as i64)
                    );
                }
                other => panic!("expected retry, got {other:?}"),
            }

            // Invisible until the backoff elapses.
            clock.advance(Duration::from_secs(delay_secs - 1));
            assert!(queue.claim_next().await.unwrap().is_none());
            clock.advance(Duration::from_secs(1));
        }

        let entry = JobQueue::get(&queue, id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
        assert!(queue.runs_for_entry(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausting_attempts_fails_permanently() {
        let (queue, clock) = queue();
        let id = queue
            .enqueue(request(test_tenant()).with_max_attempts(3))
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let claimed = queue.claim_next().await.unwrap().unwrap();
            outcomes.push(queue.fail(&claimed, Failure::new("vendor down")).await.unwrap());
            clock.advance(Duration::from_secs(3600));
        }

        assert!(matches!(outcomes[0], FailOutcome::Retrying { attempts: 1, .. }));
        assert!(matches!(outcomes[1], FailOutcome::Retrying { attempts: 2, .. }));
        assert!(matches!(outcomes[2], FailOutcome::PermanentlyFailed(_)));

        let entry = JobQueue::get(&queue, id).await.unwrap().unwrap();
        assert!(entry.processed);
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.state(), EntryState::PermanentlyFailed);

        let runs = queue.runs_for_entry(id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobRunStatus::Failed);
        assert_eq!(runs[0].attempt, 3);
        assert_eq!(runs[0].error.as_deref(), Some("vendor down"));

        // Terminal: never claimed again, further failures are no-ops.
        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(
            queue.fail(&entry, Failure::new("late")).await.unwrap(),
            FailOutcome::AlreadyProcessed
        );
        assert_eq!(JobQueue::get(&queue, id).await.unwrap().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn stale_locks_are_reclaimed_when_configured() {
        let clock = ManualClock::new(Utc::now());
        let queue = InMemoryJobQueue::with_clock(
            clock.clone(),
            QueueOptions::default().with_lock_timeout(Duration::from_secs(300)),
        );
        let id = queue.enqueue(request(test_tenant())).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        clock.advance(Duration::from_secs(299));
        assert!(queue.claim_next().await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let reclaimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let (queue, clock) = queue();
        let tenant = test_tenant();

        for _ in 0..5 {
            queue.enqueue(request(tenant)).await.unwrap();
            clock.advance(Duration::from_millis(1));
        }
        queue.enqueue(request(test_tenant())).await.unwrap();

        let stats = queue.stats(tenant).await.unwrap();
        assert_eq!(stats.pending, 5);

        let a = queue.claim_next().await.unwrap().unwrap();
        let b = queue.claim_next().await.unwrap().unwrap();
        queue.complete(a.id, HandlerOutput::empty()).await.unwrap();
        queue.fail(&b, Failure::new("x")).await.unwrap();

        let stats = queue.stats(tenant).await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.retry_pending, 1);
        assert_eq!(stats.locked, 0);
    }

    #[tokio::test]
    async fn soft_delete_cascades_to_entries() {
        let (queue, _) = queue();
        let tenant = test_tenant();
        let def = JobDefinition::new(
            tenant,
            "hourly",
            "0 * * * *",
            "UTC",
            JobPayload::custom("report", Map::new()),
        );
        queue.insert(&def).await.unwrap();
        queue.enqueue(def.to_entry()).await.unwrap();
        queue.enqueue(def.to_entry()).await.unwrap();
        let ad_hoc = queue.enqueue(request(tenant)).await.unwrap();

        assert!(matches!(
            queue.soft_delete(test_tenant(), def.id).await,
            Err(StoreError::TenantIsolation)
        ));

        let removed = queue.soft_delete(tenant, def.id).await.unwrap();
        assert_eq!(removed, 2);
        assert!(DefinitionStore::get(&queue, tenant, def.id).await.unwrap().is_none());
        assert!(queue.list_enabled().await.unwrap().is_empty());
        assert!(JobQueue::get(&queue, ad_hoc).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn definition_reads_are_tenant_scoped() {
        let (queue, _) = queue();
        let def = JobDefinition::new(
            test_tenant(),
            "daily",
            "0 9 * * *",
            "UTC",
            JobPayload::custom("digest", Map::new()),
        );
        queue.insert(&def).await.unwrap();

        assert!(matches!(
            DefinitionStore::get(&queue, test_tenant(), def.id).await,
            Err(StoreError::TenantIsolation)
        ));

        let mut edited = def.clone();
        edited.name = "daily digest".into();
        queue.update(&edited).await.unwrap();
        let stored = DefinitionStore::get(&queue, def.tenant_id, def.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "daily digest");
        assert_eq!(stored.created_at, def.created_at);
    }
}
