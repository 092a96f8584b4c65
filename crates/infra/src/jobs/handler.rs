//! Job handler abstraction and kind-based routing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use cadence_core::HandlerError;

use super::types::{HandlerOutput, JobPayload, QueueEntry};

/// Callback that performs the work of a claimed entry.
///
/// Whether the work runs in-process or over the network is the handler's
/// business; the worker loop only sees the result.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn execute(&self, entry: &QueueEntry) -> Result<HandlerOutput, HandlerError>;
}

#[async_trait]
impl<T: JobHandler + ?Sized> JobHandler for Arc<T> {
    async fn execute(&self, entry: &QueueEntry) -> Result<HandlerOutput, HandlerError> {
        (**self).execute(entry).await
    }
}

/// Adapter turning an async closure over the payload into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobPayload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn execute(&self, entry: &QueueEntry) -> Result<HandlerOutput, HandlerError> {
        (self.0)(entry.payload.clone()).await
    }
}

/// Routes entries to handlers by payload kind.
///
/// Lookup order: exact kind, then `prefix.*` category patterns, then `*`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, handler: impl JobHandler) -> &mut Self {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    pub fn with(mut self, pattern: impl Into<String>, handler: impl JobHandler) -> Self {
        self.register(pattern, handler);
        self
    }

    /// Whether entries of `kind` have a handler.
    pub fn routes(&self, kind: &str) -> bool {
        self.resolve(kind).is_some()
    }

    fn resolve(&self, kind: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(kind) {
            return Some(h);
        }

        // Longest matching category wins ("ai.vendor.*" before "ai.*").
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = kind.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);

        category.or_else(|| self.handlers.get("*"))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[async_trait]
impl JobHandler for HandlerRegistry {
    async fn execute(&self, entry: &QueueEntry) -> Result<HandlerOutput, HandlerError> {
        let kind = entry.payload.kind_name();
        match self.resolve(kind) {
            Some(handler) => handler.execute(entry).await,
            None => Err(HandlerError::new(format!("no handler for job kind: {kind}"))),
        }
    }
}
