//! Core job types: definitions, queue entries, audit records and backoff.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use cadence_core::{JobDefinitionId, JobRunId, QueueEntryId, TenantId, UserId, WorkspaceId};

/// Default retry budget for new definitions and ad-hoc entries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff unit: the first retry waits one minute.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(60);

/// HTTP method of a webhook call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Work carried by a definition or a queue entry.
///
/// Known job kinds are typed; anything else travels as `Custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Run every tracked prompt of a workspace.
    RunPrompts { workspace_id: WorkspaceId },
    /// Call an external HTTP endpoint.
    Webhook {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// Generic/custom job.
    Custom {
        kind: String,
        #[serde(default)]
        data: Map<String, JsonValue>,
    },
}

impl JobPayload {
    pub fn run_prompts(workspace_id: WorkspaceId) -> Self {
        Self::RunPrompts { workspace_id }
    }

    pub fn webhook(url: impl Into<String>, method: HttpMethod, body: Option<JsonValue>) -> Self {
        Self::Webhook {
            url: url.into(),
            method,
            body,
            headers: BTreeMap::new(),
        }
    }

    pub fn custom(kind: impl Into<String>, data: Map<String, JsonValue>) -> Self {
        Self::Custom {
            kind: kind.into(),
            data,
        }
    }

    /// Name used to route the payload to a handler.
    pub fn kind_name(&self) -> &str {
        match self {
            JobPayload::RunPrompts { .. } => "run_prompts",
            JobPayload::Webhook { .. } => "webhook",
            JobPayload::Custom { kind, .. } => kind,
        }
    }

    pub fn target_kind(&self) -> TargetKind {
        match self {
            JobPayload::Webhook { .. } => TargetKind::Webhook,
            _ => TargetKind::Internal,
        }
    }
}

/// Where a definition's work is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Internal,
    Webhook,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Internal => "internal",
            TargetKind::Webhook => "webhook",
        }
    }
}

/// Quadratic retry backoff: `attempts² × base`.
///
/// With the default one-minute base the delays run 1 min, 4 min, 9 min, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl Backoff {
    pub fn with_base(base: Duration) -> Self {
        Self { base }
    }

    /// Delay before the next run after `attempts` failures (1-indexed).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = attempts.saturating_mul(attempts);
        self.base.saturating_mul(factor)
    }

    /// When an entry that just failed for the `attempts`-th time runs again.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A named, recurring unit of work owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobDefinitionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub cron_expression: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    pub payload: JobPayload,
    pub enabled: bool,
    pub max_attempts: u32,
    /// Identity merged into every entry this definition enqueues.
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl JobDefinition {
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        timezone: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobDefinitionId::new(),
            tenant_id,
            name: name.into(),
            cron_expression: cron_expression.into(),
            timezone: timezone.into(),
            payload,
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_by: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn created_by(mut self, user_id: UserId) -> Self {
        self.created_by = Some(user_id);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn target_kind(&self) -> TargetKind {
        self.payload.target_kind()
    }

    /// Enabled and not soft-deleted.
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }

    /// Build the queue entry a schedule fire enqueues.
    pub fn to_entry(&self) -> NewQueueEntry {
        let mut entry = NewQueueEntry::new(self.tenant_id, self.payload.clone())
            .for_definition(self.id)
            .with_max_attempts(self.max_attempts);
        entry.initiated_by = self.created_by;
        entry
    }
}

/// Request to enqueue one runnable entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub definition_id: Option<JobDefinitionId>,
    pub tenant_id: TenantId,
    pub initiated_by: Option<UserId>,
    pub payload: JobPayload,
    pub max_attempts: u32,
}

impl NewQueueEntry {
    /// Ad-hoc entry with the default retry budget.
    pub fn new(tenant_id: TenantId, payload: JobPayload) -> Self {
        Self {
            definition_id: None,
            tenant_id,
            initiated_by: None,
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn for_definition(mut self, definition_id: JobDefinitionId) -> Self {
        self.definition_id = Some(definition_id);
        self
    }

    pub fn initiated_by(mut self, user_id: UserId) -> Self {
        self.initiated_by = Some(user_id);
        self
    }

    /// Values below 1 are clamped to 1: every entry runs at least once.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Lifecycle state derived from a queue entry's columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Locked,
    RetryPending,
    Succeeded,
    PermanentlyFailed,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Succeeded | EntryState::PermanentlyFailed)
    }
}

/// One concrete, runnable instance of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub definition_id: Option<JobDefinitionId>,
    pub tenant_id: TenantId,
    pub initiated_by: Option<UserId>,
    pub payload: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    /// `None` means "eligible now".
    pub next_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn from_request(request: NewQueueEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            id: QueueEntryId::new(),
            definition_id: request.definition_id,
            tenant_id: request.tenant_id,
            initiated_by: request.initiated_by,
            payload: request.payload,
            attempts: 0,
            max_attempts: request.max_attempts,
            next_run_at: None,
            locked_at: None,
            processed: false,
            last_error: None,
            created_at,
        }
    }

    pub fn state(&self) -> EntryState {
        if self.processed {
            if self.attempts >= self.max_attempts {
                EntryState::PermanentlyFailed
            } else {
                EntryState::Succeeded
            }
        } else if self.locked_at.is_some() {
            EntryState::Locked
        } else if self.attempts > 0 {
            EntryState::RetryPending
        } else {
            EntryState::Pending
        }
    }

    /// Whether a claimant may take this entry at `now`.
    ///
    /// A held lock blocks claims unless `lock_timeout` is set and the lock is
    /// at least that old.
    pub fn is_claimable(&self, now: DateTime<Utc>, lock_timeout: Option<Duration>) -> bool {
        if self.processed {
            return false;
        }
        if self.next_run_at.is_some_and(|at| at > now) {
            return false;
        }
        match (self.locked_at, lock_timeout) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(locked_at), Some(timeout)) => {
                let Ok(timeout) = chrono::Duration::from_std(timeout) else {
                    return false;
                };
                now.checked_sub_signed(timeout)
                    .is_some_and(|cutoff| locked_at <= cutoff)
            }
        }
    }

    /// Mark a claimed entry processed and build its success record.
    pub fn record_success(&mut self, output: &HandlerOutput, now: DateTime<Utc>) -> CompleteOutcome {
        if self.processed {
            return CompleteOutcome::AlreadyProcessed;
        }
        let run = JobRun::success(self, output, now);
        self.processed = true;
        self.locked_at = None;
        CompleteOutcome::Completed(run)
    }

    /// Count one failed attempt: reschedule with backoff, or turn terminal and
    /// build the failure record once the budget is spent.
    pub fn record_failure(&mut self, failure: &Failure, now: DateTime<Utc>, backoff: &Backoff) -> FailOutcome {
        if self.processed {
            return FailOutcome::AlreadyProcessed;
        }

        let started_at = self.locked_at.unwrap_or(now);
        self.attempts = self.attempts.saturating_add(1);
        self.locked_at = None;
        self.last_error = Some(failure.message.clone());

        if self.attempts >= self.max_attempts {
            self.processed = true;
            return FailOutcome::PermanentlyFailed(JobRun::failure(self, failure, started_at, now));
        }

        let next_run_at = backoff.next_run_at(self.attempts, now);
        self.next_run_at = Some(next_run_at);
        FailOutcome::Retrying {
            attempts: self.attempts,
            next_run_at,
        }
    }
}

/// Terminal outcome recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Success,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Success => "success",
            JobRunStatus::Failed => "failed",
        }
    }
}

/// Immutable audit record of one terminal execution outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub queue_entry_id: Option<QueueEntryId>,
    pub definition_id: Option<JobDefinitionId>,
    pub tenant_id: TenantId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobRunStatus,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub output: Option<JsonValue>,
}

impl JobRun {
    /// Success record for `entry`, which is still in its claimed state.
    pub fn success(entry: &QueueEntry, output: &HandlerOutput, finished_at: DateTime<Utc>) -> Self {
        Self {
            id: JobRunId::new(),
            queue_entry_id: Some(entry.id),
            definition_id: entry.definition_id,
            tenant_id: entry.tenant_id,
            attempt: entry.attempts + 1,
            started_at: entry.locked_at.unwrap_or(finished_at),
            finished_at,
            status: JobRunStatus::Success,
            http_status: output.http_status,
            error: None,
            output: Some(output.output.clone()),
        }
    }

    /// Failure record for `entry` after its final attempt was counted.
    pub fn failure(
        entry: &QueueEntry,
        failure: &Failure,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobRunId::new(),
            queue_entry_id: Some(entry.id),
            definition_id: entry.definition_id,
            tenant_id: entry.tenant_id,
            attempt: entry.attempts,
            started_at,
            finished_at,
            status: JobRunStatus::Failed,
            http_status: failure.http_status,
            error: Some(failure.message.clone()),
            output: None,
        }
    }
}

/// What a successful handler returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub output: JsonValue,
    pub http_status: Option<u16>,
}

impl HandlerOutput {
    pub fn new(output: JsonValue) -> Self {
        Self {
            output,
            http_status: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

/// Error text (and optional HTTP status) reported to `fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub http_status: Option<u16>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            http_status: None,
        }
    }
}

impl From<cadence_core::HandlerError> for Failure {
    fn from(err: cadence_core::HandlerError) -> Self {
        Self {
            message: err.message,
            http_status: err.http_status,
        }
    }
}

/// Result of `complete`.
#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    Completed(JobRun),
    /// The entry was already terminal; nothing was written.
    AlreadyProcessed,
}

/// Result of `fail`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Rescheduled with backoff; claimable again at `next_run_at`.
    Retrying {
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; the audit record was written.
    PermanentlyFailed(JobRun),
    AlreadyProcessed,
}

/// Per-tenant queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub locked: usize,
    pub retry_pending: usize,
    pub succeeded: usize,
    pub permanently_failed: usize,
}

impl QueueStats {
    pub fn record(&mut self, state: EntryState) {
        match state {
            EntryState::Pending => self.pending += 1,
            EntryState::Locked => self.locked += 1,
            EntryState::RetryPending => self.retry_pending += 1,
            EntryState::Succeeded => self.succeeded += 1,
            EntryState::PermanentlyFailed => self.permanently_failed += 1,
        }
    }
}
