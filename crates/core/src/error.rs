//! Error taxonomy shared by the queue, the scheduler and the rate limiters.

use thiserror::Error;

/// Input was rejected before anything was persisted.
///
/// Surfaced to the caller verbatim (malformed cron expression, unknown timezone,
/// missing identifiers).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation failed: {0}")]
    Invalid(String),
}

impl ValidationError {
    pub fn invalid_cron(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// The datastore or the shared store could not serve a request.
///
/// Never retried by the core; callers decide whether to retry the whole operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("tenant isolation violation")]
    TenantIsolation,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Build the error reported when an in-process lock was poisoned by a panic.
    pub fn poisoned(what: &str) -> Self {
        Self::Unavailable(format!("{what} lock poisoned"))
    }
}

/// Failure reported by a job handler.
///
/// Always caught by the worker loop and turned into a queue `fail` transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// HTTP status of the downstream call, when the handler made one.
    pub http_status: Option<u16>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            http_status: None,
        }
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Failure of a scheduler registrar call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("trigger already scheduled: {0}")]
    DuplicateTrigger(String),
}
