//! Handlers with scripted behaviour for worker and end-to-end tests.

use std::future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use workdag::task::{Payload, Task};
use workdag::worker::{Handler, HandlerError, HandlerFuture, Outcome, handler_fn};

/// Returns the task payload as result data.
pub fn echo() -> impl Handler {
    handler_fn(|task: Task| async move { Ok::<_, HandlerError>(Outcome::Done(task.payload)) })
}

/// Always fails with `reason`.
pub fn failing(reason: &str) -> impl Handler {
    let reason = reason.to_string();
    handler_fn(move |_task: Task| {
        let reason = reason.clone();
        async move { Err::<Outcome, _>(HandlerError::Failed(reason)) }
    })
}

/// Reports that there was nothing to do.
pub fn skipping() -> impl Handler {
    handler_fn(|_task: Task| async { Ok::<_, HandlerError>(Outcome::Skipped) })
}

/// Never completes.
pub fn hanging() -> impl Handler {
    handler_fn(|_task: Task| future::pending::<Result<Outcome, HandlerError>>())
}

/// Panics inside the handler future.
pub fn panicking(message: &'static str) -> impl Handler {
    handler_fn(move |_task: Task| async move { explode(message) })
}

fn explode(message: &str) -> Result<Outcome, HandlerError> {
    panic!("{message}")
}

/// Records every task it sees and answers with `data`.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<Task>>>,
    data: Payload,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Payload) -> Self {
        Self {
            seen: Arc::default(),
            data,
        }
    }

    /// Ids of the tasks handled so far, in order.
    pub fn seen_ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|t| t.id.clone()).collect()
    }

    pub fn seen(&self) -> Vec<Task> {
        self.seen.lock().unwrap().clone()
    }
}

impl Handler for RecordingHandler {
    fn handle(&self, task: Task) -> HandlerFuture {
        self.seen.lock().unwrap().push(task);
        let data = self.data.clone();
        Box::pin(async move { Ok(Outcome::Done(data)) })
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Clone)]
pub struct FlakyHandler {
    remaining: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining: Arc::new(AtomicU32::new(failures)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Handler for FlakyHandler {
    fn handle(&self, _task: Task) -> HandlerFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if fail {
                Err(HandlerError::Failed("flaky failure".to_string()))
            } else {
                Ok(Outcome::Done(Payload::new()))
            }
        })
    }
}
