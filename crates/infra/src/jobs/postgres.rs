//! Postgres-backed job queue and definition store.
//!
//! ## Claiming
//!
//! `claim_next` is a single statement: a `FOR UPDATE SKIP LOCKED LIMIT 1`
//! subselect picks the oldest eligible row and the outer `UPDATE` stamps
//! `locked_at = NOW()`. Concurrent claimants skip each other's rows instead of
//! blocking, and no row is returned to two of them.
//!
//! ## Outcomes
//!
//! `complete` and `fail` lock the row (`FOR UPDATE`), apply the transition and
//! write the audit record in one transaction, so a terminal entry always has
//! exactly one `job_runs` row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Corrupt` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) | Any other | `Unavailable` |
//! | RowNotFound | N/A | `NotFound` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | Other | N/A | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use cadence_core::{JobDefinitionId, QueueEntryId, StoreError, TenantId};

use super::store::{DefinitionStore, JobQueue, QueueOptions};
use super::types::{
    CompleteOutcome, FailOutcome, Failure, HandlerOutput, JobDefinition, JobPayload, JobRun,
    JobRunStatus, NewQueueEntry, QueueEntry, QueueStats,
};

/// Schema for the three tables; every statement is idempotent.
pub const SCHEMA: &str = include_str!("../../migrations/0001_job_queue.sql");

macro_rules! entry_columns {
    () => {
        "id, definition_id, tenant_id, initiated_by, payload, attempts, max_attempts, \
         next_run_at, locked_at, processed, last_error, created_at"
    };
}

macro_rules! definition_columns {
    () => {
        "id, tenant_id, name, cron_expression, timezone, payload, enabled, max_attempts, \
         created_by, created_at, updated_at, deleted_at"
    };
}

macro_rules! run_columns {
    () => {
        "id, queue_entry_id, definition_id, tenant_id, attempt, started_at, finished_at, \
         status, http_status, error, output"
    };
}

/// Postgres job queue.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: Arc<PgPool>,
    options: QueueOptions,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_options(pool, QueueOptions::default())
    }

    pub fn with_options(pool: PgPool, options: QueueOptions) -> Self {
        Self {
            pool: Arc::new(pool),
            options,
        }
    }

    /// Create the tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    /// Lock an entry row for the rest of the transaction and read the database clock.
    async fn lock_entry(
        tx: &mut Transaction<'static, Postgres>,
        entry_id: QueueEntryId,
        operation: &str,
    ) -> Result<(QueueEntry, DateTime<Utc>), StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            entry_columns!(),
            ", NOW() AS db_now FROM job_queue WHERE id = $1 FOR UPDATE"
        ))
        .bind(entry_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or_else(|| StoreError::not_found(format!("queue entry {entry_id}")))?;

        let now: DateTime<Utc> = row
            .try_get("db_now")
            .map_err(|e| map_sqlx_error(operation, e))?;
        let entry = QueueEntryRow::from_row(&row)
            .map_err(|e| map_sqlx_error(operation, e))?
            .try_into()?;
        Ok((entry, now))
    }

    async fn save_entry_state(
        tx: &mut Transaction<'static, Postgres>,
        entry: &QueueEntry,
        operation: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET attempts = $2, next_run_at = $3, locked_at = $4, processed = $5, last_error = $6
            WHERE id = $1
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(to_i32(entry.attempts))
        .bind(entry.next_run_at)
        .bind(entry.locked_at)
        .bind(entry.processed)
        .bind(entry.last_error.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    async fn insert_run(
        tx: &mut Transaction<'static, Postgres>,
        run: &JobRun,
        operation: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (
                id, queue_entry_id, definition_id, tenant_id, attempt,
                started_at, finished_at, status, http_status, error, output
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.queue_entry_id.map(Uuid::from))
        .bind(run.definition_id.map(Uuid::from))
        .bind(run.tenant_id.as_uuid())
        .bind(to_i32(run.attempt))
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(run.http_status.map(i32::from))
        .bind(run.error.as_deref())
        .bind(run.output.as_ref().map(Json))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    /// Explain why a tenant-scoped write matched no row.
    async fn ownership_error(&self, tenant_id: TenantId, id: JobDefinitionId, operation: &str) -> StoreError {
        let owner = sqlx::query("SELECT tenant_id FROM job_definitions WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await;

        match owner {
            Ok(Some(row)) => match row.try_get::<Uuid, _>("tenant_id") {
                Ok(owner) if owner != *tenant_id.as_uuid() => StoreError::TenantIsolation,
                Ok(_) => StoreError::not_found(format!("job definition {id}")),
                Err(e) => map_sqlx_error(operation, e),
            },
            Ok(None) => StoreError::not_found(format!("job definition {id}")),
            Err(e) => map_sqlx_error(operation, e),
        }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(
        skip(self, entry),
        fields(tenant_id = %entry.tenant_id, kind = entry.payload.kind_name()),
        err
    )]
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntryId, StoreError> {
        let id = QueueEntryId::new();
        sqlx::query(
            r#"
            INSERT INTO job_queue (
                id, definition_id, tenant_id, initiated_by, payload,
                attempts, max_attempts, processed, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, FALSE, NOW())
            "#,
        )
        .bind(id.as_uuid())
        .bind(entry.definition_id.map(Uuid::from))
        .bind(entry.tenant_id.as_uuid())
        .bind(entry.initiated_by.map(Uuid::from))
        .bind(Json(&entry.payload))
        .bind(to_i32(entry.max_attempts.max(1)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE job_queue
            SET locked_at = NOW()
            WHERE id = (
                SELECT id
                FROM job_queue
                WHERE processed = FALSE
                  AND (next_run_at IS NULL OR next_run_at <= NOW())
                  AND (
                    locked_at IS NULL
                    OR ($1::DOUBLE PRECISION IS NOT NULL
                        AND locked_at <= NOW() - make_interval(secs => $1::DOUBLE PRECISION))
                  )
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            entry_columns!()
        ))
        .bind(self.options.lock_timeout.map(|t| t.as_secs_f64()))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        match row {
            Some(row) => {
                let entry = QueueEntryRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("claim_next", e))?
                    .try_into()?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, output), fields(entry_id = %entry_id), err)]
    async fn complete(
        &self,
        entry_id: QueueEntryId,
        output: HandlerOutput,
    ) -> Result<CompleteOutcome, StoreError> {
        let mut tx = self.begin("complete").await?;
        let (mut entry, now) = Self::lock_entry(&mut tx, entry_id, "complete").await?;

        let outcome = entry.record_success(&output, now);
        if let CompleteOutcome::Completed(run) = &outcome {
            Self::save_entry_state(&mut tx, &entry, "complete").await?;
            Self::insert_run(&mut tx, run, "complete").await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;
        Ok(outcome)
    }

    #[instrument(
        skip(self, entry, failure),
        fields(entry_id = %entry.id, tenant_id = %entry.tenant_id),
        err
    )]
    async fn fail(&self, entry: &QueueEntry, failure: Failure) -> Result<FailOutcome, StoreError> {
        let mut tx = self.begin("fail").await?;
        let (mut stored, now) = Self::lock_entry(&mut tx, entry.id, "fail").await?;

        let outcome = stored.record_failure(&failure, now, &self.options.backoff);
        match &outcome {
            FailOutcome::AlreadyProcessed => {}
            FailOutcome::Retrying { .. } => {
                Self::save_entry_state(&mut tx, &stored, "fail").await?;
            }
            FailOutcome::PermanentlyFailed(run) => {
                Self::save_entry_state(&mut tx, &stored, "fail").await?;
                Self::insert_run(&mut tx, run, "fail").await?;
            }
        }

        tx.commit().await.map_err(|e| map_sqlx_error("fail", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(entry_id = %entry_id), err)]
    async fn get(&self, entry_id: QueueEntryId) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query(concat!("SELECT ", entry_columns!(), " FROM job_queue WHERE id = $1"))
            .bind(entry_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_entry", e))?;

        match row {
            Some(row) => {
                let entry = QueueEntryRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("get_entry", e))?
                    .try_into()?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(entry_id = %entry_id), err)]
    async fn runs_for_entry(&self, entry_id: QueueEntryId) -> Result<Vec<JobRun>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            run_columns!(),
            " FROM job_runs WHERE queue_entry_id = $1 ORDER BY finished_at ASC, id ASC"
        ))
        .bind(entry_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("runs_for_entry", e))?;

        let mut runs: Vec<JobRun> = Vec::with_capacity(rows.len());
        for row in rows {
            let run = JobRunRow::from_row(&row).map_err(|e| map_sqlx_error("runs_for_entry", e))?;
            runs.push(run.try_into()?);
        }
        Ok(runs)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT processed AND locked_at IS NULL AND attempts = 0) AS pending,
                COUNT(*) FILTER (WHERE NOT processed AND locked_at IS NOT NULL) AS locked,
                COUNT(*) FILTER (WHERE NOT processed AND locked_at IS NULL AND attempts > 0) AS retry_pending,
                COUNT(*) FILTER (WHERE processed AND attempts < max_attempts) AS succeeded,
                COUNT(*) FILTER (WHERE processed AND attempts >= max_attempts) AS permanently_failed
            FROM job_queue
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, StoreError> {
            let n: i64 = row.try_get(column).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        Ok(QueueStats {
            pending: count("pending")?,
            locked: count("locked")?,
            retry_pending: count("retry_pending")?,
            succeeded: count("succeeded")?,
            permanently_failed: count("permanently_failed")?,
        })
    }

    #[instrument(skip(self), fields(definition_id = %definition_id), err)]
    async fn purge_definition(&self, definition_id: JobDefinitionId) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE definition_id = $1")
            .bind(definition_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_definition", e))?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl DefinitionStore for PostgresJobQueue {
    #[instrument(
        skip(self, definition),
        fields(definition_id = %definition.id, tenant_id = %definition.tenant_id),
        err
    )]
    async fn insert(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_definitions (
                id, tenant_id, name, cron_expression, timezone, target_kind, payload,
                enabled, max_attempts, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            "#,
        )
        .bind(definition.id.as_uuid())
        .bind(definition.tenant_id.as_uuid())
        .bind(&definition.name)
        .bind(&definition.cron_expression)
        .bind(&definition.timezone)
        .bind(definition.target_kind().as_str())
        .bind(Json(&definition.payload))
        .bind(definition.enabled)
        .bind(to_i32(definition.max_attempts.max(1)))
        .bind(definition.created_by.map(Uuid::from))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_definition", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, definition),
        fields(definition_id = %definition.id, tenant_id = %definition.tenant_id),
        err
    )]
    async fn update(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_definitions
            SET name = $3, cron_expression = $4, timezone = $5, target_kind = $6, payload = $7,
                enabled = $8, max_attempts = $9, created_by = $10, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(definition.id.as_uuid())
        .bind(definition.tenant_id.as_uuid())
        .bind(&definition.name)
        .bind(&definition.cron_expression)
        .bind(&definition.timezone)
        .bind(definition.target_kind().as_str())
        .bind(Json(&definition.payload))
        .bind(definition.enabled)
        .bind(to_i32(definition.max_attempts.max(1)))
        .bind(definition.created_by.map(Uuid::from))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_definition", e))?;

        if result.rows_affected() == 0 {
            return Err(self
                .ownership_error(definition.tenant_id, definition.id, "update_definition")
                .await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(definition_id = %id, tenant_id = %tenant_id), err)]
    async fn get(
        &self,
        tenant_id: TenantId,
        id: JobDefinitionId,
    ) -> Result<Option<JobDefinition>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            definition_columns!(),
            " FROM job_definitions WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_definition", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let definition: JobDefinition = JobDefinitionRow::from_row(&row)
            .map_err(|e| map_sqlx_error("get_definition", e))?
            .try_into()?;
        if definition.tenant_id != tenant_id {
            return Err(StoreError::TenantIsolation);
        }
        Ok(Some(definition))
    }

    #[instrument(skip(self), fields(definition_id = %id, tenant_id = %tenant_id), err)]
    async fn soft_delete(&self, tenant_id: TenantId, id: JobDefinitionId) -> Result<usize, StoreError> {
        let mut tx = self.begin("soft_delete").await?;

        let marked = sqlx::query(
            r#"
            UPDATE job_definitions
            SET deleted_at = NOW(), enabled = FALSE, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(tenant_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("soft_delete", e))?;

        if marked.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("soft_delete", e))?;
            return Err(self.ownership_error(tenant_id, id, "soft_delete").await);
        }

        let purged = sqlx::query("DELETE FROM job_queue WHERE definition_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("soft_delete", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("soft_delete", e))?;
        Ok(purged.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    async fn list_enabled(&self) -> Result<Vec<JobDefinition>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            definition_columns!(),
            " FROM job_definitions WHERE enabled AND deleted_at IS NULL ORDER BY created_at ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_enabled", e))?;

        let mut definitions: Vec<JobDefinition> = Vec::with_capacity(rows.len());
        for row in rows {
            let definition =
                JobDefinitionRow::from_row(&row).map_err(|e| map_sqlx_error("list_enabled", e))?;
            definitions.push(definition.try_into()?);
        }
        Ok(definitions)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Corrupt(msg),
                Some("23503") => StoreError::NotFound(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::not_found(format!("unexpected row not found in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::corrupt(format!("failed to decode row in {operation}: {err}"))
        }
        _ => StoreError::unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::corrupt(format!("negative {column}: {value}")))
}

// SQLx row types

#[derive(Debug)]
struct QueueEntryRow {
    id: Uuid,
    definition_id: Option<Uuid>,
    tenant_id: Uuid,
    initiated_by: Option<Uuid>,
    payload: Json<JobPayload>,
    attempts: i32,
    max_attempts: i32,
    next_run_at: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    processed: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for QueueEntryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueEntryRow {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            tenant_id: row.try_get("tenant_id")?,
            initiated_by: row.try_get("initiated_by")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            locked_at: row.try_get("locked_at")?,
            processed: row.try_get("processed")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = StoreError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        Ok(QueueEntry {
            id: row.id.into(),
            definition_id: row.definition_id.map(Into::into),
            tenant_id: row.tenant_id.into(),
            initiated_by: row.initiated_by.map(Into::into),
            payload: row.payload.0,
            attempts: to_u32(row.attempts, "attempts")?,
            max_attempts: to_u32(row.max_attempts, "max_attempts")?,
            next_run_at: row.next_run_at,
            locked_at: row.locked_at,
            processed: row.processed,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct JobDefinitionRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    cron_expression: String,
    timezone: String,
    payload: Json<JobPayload>,
    enabled: bool,
    max_attempts: i32,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobDefinitionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobDefinitionRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            cron_expression: row.try_get("cron_expression")?,
            timezone: row.try_get("timezone")?,
            payload: row.try_get("payload")?,
            enabled: row.try_get("enabled")?,
            max_attempts: row.try_get("max_attempts")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl TryFrom<JobDefinitionRow> for JobDefinition {
    type Error = StoreError;

    fn try_from(row: JobDefinitionRow) -> Result<Self, Self::Error> {
        Ok(JobDefinition {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            name: row.name,
            cron_expression: row.cron_expression,
            timezone: row.timezone,
            payload: row.payload.0,
            enabled: row.enabled,
            max_attempts: to_u32(row.max_attempts, "max_attempts")?,
            created_by: row.created_by.map(Into::into),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug)]
struct JobRunRow {
    id: Uuid,
    queue_entry_id: Option<Uuid>,
    definition_id: Option<Uuid>,
    tenant_id: Uuid,
    attempt: i32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    status: String,
    http_status: Option<i32>,
    error: Option<String>,
    output: Option<Json<serde_json::Value>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRunRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRunRow {
            id: row.try_get("id")?,
            queue_entry_id: row.try_get("queue_entry_id")?,
            definition_id: row.try_get("definition_id")?,
            tenant_id: row.try_get("tenant_id")?,
            attempt: row.try_get("attempt")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            status: row.try_get("status")?,
            http_status: row.try_get("http_status")?,
            error: row.try_get("error")?,
            output: row.try_get("output")?,
        })
    }
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = StoreError;

    fn try_from(row: JobRunRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_str() {
            "success" => JobRunStatus::Success,
            "failed" => JobRunStatus::Failed,
            other => return Err(StoreError::corrupt(format!("unknown job run status: {other}"))),
        };
        Ok(JobRun {
            id: row.id.into(),
            queue_entry_id: row.queue_entry_id.map(Into::into),
            definition_id: row.definition_id.map(Into::into),
            tenant_id: row.tenant_id.into(),
            attempt: to_u32(row.attempt, "attempt")?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status,
            http_status: row.http_status.and_then(|s| u16::try_from(s).ok()),
            error: row.error,
            output: row.output.map(|o| o.0),
        })
    }
}

#[cfg(test)]
mod tests {
    //! Live tests against a disposable database: they truncate the job tables.

    use super::*;
    use crate::jobs::types::EntryState;
    use serde_json::{Map, json};

    async fn queue() -> PostgresJobQueue {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for live tests");
        let pool = PgPool::connect(&url).await.unwrap();
        let queue = PostgresJobQueue::new(pool);
        queue.migrate().await.unwrap();
        sqlx::query("TRUNCATE job_runs, job_queue, job_definitions")
            .execute(&*queue.pool)
            .await
            .unwrap();
        queue
    }

    fn request(tenant: TenantId) -> NewQueueEntry {
        NewQueueEntry::new(tenant, JobPayload::custom("test", Map::new()))
    }

    #[test]
    fn maps_missing_rows_to_not_found() {
        assert!(matches!(
            map_sqlx_error("get_entry", sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            map_sqlx_error("claim_next", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn rejects_negative_counters() {
        assert_eq!(to_u32(3, "attempts").unwrap(), 3);
        assert!(matches!(to_u32(-1, "attempts"), Err(StoreError::Corrupt(_))));
        assert_eq!(to_i32(u32::MAX), i32::MAX);
    }

    #[tokio::test]
    #[ignore = "requires a disposable Postgres at DATABASE_URL"]
    async fn lifecycle_against_postgres() {
        let queue = queue().await;
        let tenant = TenantId::new();

        let ok = queue.enqueue(request(tenant)).await.unwrap();
        let failing = queue.enqueue(request(tenant).with_max_attempts(1)).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, ok);
        assert_eq!(claimed.state(), EntryState::Locked);
        let outcome = queue
            .complete(ok, HandlerOutput::new(json!({"done": true})))
            .await
            .unwrap();
        assert!(matches!(outcome, CompleteOutcome::Completed(_)));
        assert_eq!(
            queue.complete(ok, HandlerOutput::empty()).await.unwrap(),
            CompleteOutcome::AlreadyProcessed
        );

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, failing);
        let outcome = queue.fail(&claimed, Failure::new("boom")).await.unwrap();
        assert!(matches!(outcome, FailOutcome::PermanentlyFailed(_)));

        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.runs_for_entry(ok).await.unwrap().len(), 1);
        let runs = queue.runs_for_entry(failing).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].error.as_deref(), Some("boom"));

        let stats = queue.stats(tenant).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.permanently_failed, 1);
    }

    #[tokio::test]
    #[ignore = "requires a disposable Postgres at DATABASE_URL"]
    async fn skip_locked_claims_against_postgres() {
        let queue = queue().await;
        let tenant = TenantId::new();
        for _ in 0..5 {
            queue.enqueue(request(tenant)).await.unwrap();
        }

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.claim_next().await.unwrap() })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(entry) = handle.await.unwrap() {
                claimed.push(entry.id);
            }
        }
        assert_eq!(claimed.len(), 5);
        claimed.sort_by_key(|id| *id.as_uuid());
        claimed.dedup();
        assert_eq!(claimed.len(), 5);
    }

    #[tokio::test]
    #[ignore = "requires a disposable Postgres at DATABASE_URL"]
    async fn soft_delete_cascades_against_postgres() {
        let queue = queue().await;
        let def = JobDefinition::new(
            TenantId::new(),
            "hourly",
            "0 * * * *",
            "UTC",
            JobPayload::custom("report", Map::new()),
        );
        queue.insert(&def).await.unwrap();
        queue.enqueue(def.to_entry()).await.unwrap();

        assert!(matches!(
            queue.soft_delete(TenantId::new(), def.id).await,
            Err(StoreError::TenantIsolation)
        ));
        assert_eq!(queue.soft_delete(def.tenant_id, def.id).await.unwrap(), 1);
        assert!(DefinitionStore::get(&queue, def.tenant_id, def.id).await.unwrap().is_none());
        assert!(queue.list_enabled().await.unwrap().is_empty());
    }
}
