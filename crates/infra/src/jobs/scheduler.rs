//! Scheduler registrar: validates recurring definitions and keeps one cron
//! trigger per live definition.
//!
//! A trigger fire re-reads the definition, so edits to the payload take effect
//! on the next fire without touching the trigger itself.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cadence_core::{JobDefinitionId, RegistrarError, StoreError, TenantId, ValidationError};

use super::store::{DefinitionStore, JobQueue};
use super::types::JobDefinition;

/// Parsed cron expression bound to an IANA timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse `expression` evaluated in `timezone`.
    ///
    /// Standard five-field expressions get a `0` seconds field and their
    /// day-of-week read as 0-7 from Sunday. Six and seven field expressions
    /// are taken as-is, in the `cron` crate's dialect (1 = Sunday).
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, ValidationError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingField("cron_expression"));
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, day, month, weekday] => {
                let weekday = standard_weekdays(weekday)
                    .map_err(|reason| ValidationError::invalid_cron(trimmed, reason))?;
                format!("0 {minute} {hour} {day} {month} {weekday}")
            }
            _ => trimmed.to_string(),
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| ValidationError::invalid_cron(trimmed, e.to_string()))?;

        let timezone = Tz::from_str(timezone.trim())
            .map_err(|_| ValidationError::UnknownTimezone(timezone.to_string()))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|at| at.with_timezone(&Utc))
    }
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a standard day-of-week field (0-7, 0 and 7 both Sunday) as a list
/// of day names, which the `cron` crate reads unambiguously.
fn standard_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step '{step}'"))?;
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((start, end)) => (weekday(start)?, weekday(end)?),
            // `n/step` runs from n to the end of the week.
            None if step.is_some() => (weekday(range)?, 6),
            None => {
                let day = weekday(range)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("day-of-week range '{range}' runs backwards"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    Ok(WEEKDAYS
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect::<Vec<_>>()
        .join(","))
}

fn weekday(token: &str) -> Result<usize, String> {
    if let Ok(day) = token.parse::<usize>() {
        return if day <= 7 {
            Ok(day)
        } else {
            Err(format!("day-of-week {day} out of range 0-7"))
        };
    }
    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| format!("unknown day of week '{token}'"))
}

/// Callback run on every trigger fire.
pub type FireFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Named recurring triggers.
pub trait TriggerRegistrar: Send + Sync {
    /// Register a new trigger. Fails if the name is taken.
    fn schedule(&self, name: &str, schedule: CronSchedule, on_fire: FireFn) -> Result<(), RegistrarError>;

    /// Remove a trigger. Returns whether one was registered.
    fn unschedule(&self, name: &str) -> bool;

    /// Swap the trigger registered under `name` (or register it) in one step.
    fn replace(&self, name: &str, schedule: CronSchedule, on_fire: FireFn);

    fn is_scheduled(&self, name: &str) -> bool;
}

/// In-process triggers: one tokio task per trigger sleeping until the next
/// instant. Must be used from within a tokio runtime.
#[derive(Debug, Default)]
pub struct TokioTriggerRegistrar {
    triggers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTriggerRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    // The map only holds join handles, so a poisoned lock leaves nothing half-written.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TriggerRegistrar for TokioTriggerRegistrar {
    fn schedule(&self, name: &str, schedule: CronSchedule, on_fire: FireFn) -> Result<(), RegistrarError> {
        let mut triggers = self.lock();
        if triggers.get(name).is_some_and(|t| !t.is_finished()) {
            return Err(RegistrarError::DuplicateTrigger(name.to_string()));
        }
        triggers.insert(name.to_string(), spawn_trigger(name.to_string(), schedule, on_fire));
        Ok(())
    }

    fn unschedule(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn replace(&self, name: &str, schedule: CronSchedule, on_fire: FireFn) {
        let mut triggers = self.lock();
        if let Some(old) = triggers.remove(name) {
            old.abort();
        }
        triggers.insert(name.to_string(), spawn_trigger(name.to_string(), schedule, on_fire));
    }

    fn is_scheduled(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TokioTriggerRegistrar {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }
}

fn spawn_trigger(name: String, schedule: CronSchedule, on_fire: FireFn) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut after = Utc::now();
        loop {
            let Some(next) = schedule.next_after(after) else {
                warn!(trigger = %name, cron = schedule.expression(), "schedule has no upcoming instants");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            debug!(trigger = %name, fire_at = %next, "trigger fired");
            on_fire().await;
            // Never evaluate from before the instant just fired, even if the wall clock stepped back.
            after = next.max(Utc::now());
        }
    })
}

fn trigger_name(id: JobDefinitionId) -> String {
    format!("job-definition:{id}")
}

/// Registers, edits and removes recurring definitions, keeping triggers in
/// step with what is persisted.
pub struct SchedulerRegistrar<S, Q, T> {
    definitions: Arc<S>,
    queue: Arc<Q>,
    triggers: T,
}

impl<S, Q, T> SchedulerRegistrar<S, Q, T>
where
    S: DefinitionStore + 'static,
    Q: JobQueue + 'static,
    T: TriggerRegistrar,
{
    pub fn new(definitions: Arc<S>, queue: Arc<Q>, triggers: T) -> Self {
        Self {
            definitions,
            queue,
            triggers,
        }
    }

    pub fn triggers(&self) -> &T {
        &self.triggers
    }

    /// Check a definition without persisting it.
    pub fn validate(definition: &JobDefinition) -> Result<CronSchedule, ValidationError> {
        if definition.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        CronSchedule::parse(&definition.cron_expression, &definition.timezone)
    }

    /// Validate, persist and start triggering a new definition.
    pub async fn create(&self, definition: JobDefinition) -> Result<JobDefinitionId, RegistrarError> {
        let schedule = Self::validate(&definition)?;
        self.definitions.insert(&definition).await?;

        if definition.enabled {
            if let Err(e) = self.triggers.schedule(
                &trigger_name(definition.id),
                schedule,
                self.fire_fn(definition.tenant_id, definition.id),
            ) {
                // Never leave a persisted definition without its trigger.
                if let Err(rollback) = self.definitions.soft_delete(definition.tenant_id, definition.id).await {
                    error!(
                        definition_id = %definition.id,
                        tenant_id = %definition.tenant_id,
                        error = %rollback,
                        "failed to roll back definition after trigger registration failed"
                    );
                }
                return Err(e);
            }
        }

        info!(
            definition_id = %definition.id,
            tenant_id = %definition.tenant_id,
            cron = %definition.cron_expression,
            timezone = %definition.timezone,
            enabled = definition.enabled,
            "job definition created"
        );
        Ok(definition.id)
    }

    /// Validate and persist an edit. The trigger is swapped only when the
    /// timing or the enabled flag changed.
    pub async fn update(&self, definition: JobDefinition) -> Result<(), RegistrarError> {
        let schedule = Self::validate(&definition)?;
        let current = self
            .definitions
            .get(definition.tenant_id, definition.id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job definition {}", definition.id)))?;

        self.definitions.update(&definition).await?;

        let retimed = current.cron_expression != definition.cron_expression
            || current.timezone != definition.timezone
            || current.enabled != definition.enabled;
        if retimed {
            let name = trigger_name(definition.id);
            if definition.enabled {
                self.triggers
                    .replace(&name, schedule, self.fire_fn(definition.tenant_id, definition.id));
            } else {
                self.triggers.unschedule(&name);
            }
        }

        info!(
            definition_id = %definition.id,
            tenant_id = %definition.tenant_id,
            retimed,
            "job definition updated"
        );
        Ok(())
    }

    /// Soft-delete, removing pending entries, then stop triggering.
    /// Returns the number of queue entries removed.
    ///
    /// If the store write fails the trigger keeps running; a fire that races
    /// the delete re-reads the definition and skips it.
    pub async fn delete(&self, tenant_id: TenantId, id: JobDefinitionId) -> Result<usize, RegistrarError> {
        // Tenant check first so a foreign tenant cannot stop someone else's trigger.
        if self.definitions.get(tenant_id, id).await?.is_none() {
            return Err(StoreError::not_found(format!("job definition {id}")).into());
        }

        let removed = self.definitions.soft_delete(tenant_id, id).await?;
        self.triggers.unschedule(&trigger_name(id));

        info!(definition_id = %id, tenant_id = %tenant_id, removed, "job definition deleted");
        Ok(removed)
    }

    /// Register triggers for every enabled definition (process start-up).
    ///
    /// Definitions whose stored expression no longer parses are skipped.
    pub async fn restore(&self) -> Result<usize, RegistrarError> {
        let mut restored = 0;
        for definition in self.definitions.list_enabled().await? {
            match Self::validate(&definition) {
                Ok(schedule) => {
                    self.triggers.replace(
                        &trigger_name(definition.id),
                        schedule,
                        self.fire_fn(definition.tenant_id, definition.id),
                    );
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        definition_id = %definition.id,
                        tenant_id = %definition.tenant_id,
                        error = %e,
                        "skipping definition with invalid schedule"
                    );
                }
            }
        }

        info!(restored, "job definition triggers restored");
        Ok(restored)
    }

    fn fire_fn(&self, tenant_id: TenantId, id: JobDefinitionId) -> FireFn {
        let definitions = self.definitions.clone();
        let queue = self.queue.clone();
        Arc::new(move || {
            let definitions = definitions.clone();
            let queue = queue.clone();
            async move { fire(definitions.as_ref(), queue.as_ref(), tenant_id, id).await }.boxed()
        })
    }
}

/// Enqueue the definition's current payload, or skip if it is gone or disabled.
async fn fire<S, Q>(definitions: &S, queue: &Q, tenant_id: TenantId, id: JobDefinitionId)
where
    S: DefinitionStore + ?Sized,
    Q: JobQueue + ?Sized,
{
    let definition = match definitions.get(tenant_id, id).await {
        Ok(Some(d)) => d,
        Ok(None) => {
            warn!(definition_id = %id, tenant_id = %tenant_id, "definition no longer exists, skipping fire");
            return;
        }
        Err(e) => {
            error!(definition_id = %id, tenant_id = %tenant_id, error = %e, "failed to load definition");
            return;
        }
    };

    if !definition.enabled {
        debug!(definition_id = %id, tenant_id = %tenant_id, "definition disabled, skipping fire");
        return;
    }

    match queue.enqueue(definition.to_entry()).await {
        Ok(entry_id) => {
            info!(
                definition_id = %id,
                tenant_id = %tenant_id,
                entry_id = %entry_id,
                kind = definition.payload.kind_name(),
                "scheduled job enqueued"
            );
        }
        Err(e) => {
            error!(definition_id = %id, tenant_id = %tenant_id, error = %e, "failed to enqueue scheduled job");
        }
    }
}
