// src/worker/handler.rs

//! Pluggable task handlers.
//!
//! Workers never look inside a task beyond its kind: they pick a
//! [`Handler`] from the [`HandlerRegistry`] they were built with and run
//! the future it returns. The registry is assembled once at startup and
//! passed in explicitly.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::task::{Payload, Task};
use crate::types::TaskKind;

/// Successful handler outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The task ran; `data` becomes the result payload.
    Done(Payload),
    /// Nothing to do for this task.
    Skipped,
}

/// Execution failure. Never leaves the worker: it becomes an `error`
/// result and counts against the circuit breaker (except `NoHandler`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no handler registered for kind '{0}'")]
    NoHandler(TaskKind),
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Outcome, HandlerError>> + Send + 'static>>;

/// Runs one task.
///
/// The returned future owns everything it needs, so the worker can move it
/// onto its own tokio task (isolating panics) and drop it on timeout.
pub trait Handler: Send + Sync {
    fn handle(&self, task: Task) -> HandlerFuture;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    fn handle(&self, task: Task) -> HandlerFuture {
        Box::pin((self.f)(task))
    }
}

/// `kind -> handler` map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: TaskKind, handler: impl Handler + 'static) -> Self {
        self.insert(kind, Arc::new(handler));
        self
    }

    pub fn insert(&mut self, kind: TaskKind, handler: Arc<dyn Handler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> BTreeSet<TaskKind> {
        self.handlers.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_dispatches_by_kind() {
        let registry = HandlerRegistry::new().register(
            TaskKind::Render,
            handler_fn(|task: Task| async move {
                let mut data = Payload::new();
                data.insert("id".into(), task.id.into());
                Ok::<_, HandlerError>(Outcome::Done(data))
            }),
        );

        assert_eq!(registry.kinds(), BTreeSet::from([TaskKind::Render]));
        assert!(registry.get(TaskKind::Mutate).is_none());

        let handler = registry.get(TaskKind::Render).unwrap();
        let task = Task {
            id: "t1".into(),
            kind: TaskKind::Render,
            payload: Payload::new(),
            requires: BTreeSet::new(),
            attempts: 0,
            created_at: chrono::Utc::now(),
            schema_version: 1,
        };
        match handler.handle(task).await.unwrap() {
            Outcome::Done(data) => assert_eq!(data["id"], "t1"),
            Outcome::Skipped => panic!("expected data"),
        }
    }
}
