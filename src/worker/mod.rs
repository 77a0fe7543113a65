// src/worker/mod.rs

//! Worker runtime.
//!
//! - [`handler`] defines the [`Handler`] trait and the kind-keyed registry.
//! - [`breaker`] is the per-key circuit breaker consulted before each run.
//! - [`single`] is the one-task-then-exit worker.
//! - [`presence`] keeps the `workers` set and `worker:<id>` entries alive.
//! - [`command`] runs shell commands for local use.

pub mod breaker;
pub mod command;
pub mod handler;
pub mod presence;
pub mod single;

pub use breaker::{Admission, CircuitBreaker, CircuitState};
pub use command::CommandHandler;
pub use handler::{FnHandler, Handler, HandlerError, HandlerFuture, HandlerRegistry, Outcome, handler_fn};
pub use single::{CIRCUIT_OPEN_REASON, SingleTaskWorker, WorkerConfig, WorkerExit};
