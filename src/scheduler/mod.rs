// src/scheduler/mod.rs

//! Gateway (scheduler) side of the engine.
//!
//! - [`gateway`] owns submission, gating, the scheduling pass and result
//!   processing.
//! - [`control`] implements pause / resume / cancel / retry / retry_from,
//!   plus label-scoped pause / resume / cancel.
//! - [`store`] is the persistence seam for task runs.
//! - [`predicate`] parses and evaluates edge predicates.

pub mod control;
pub mod gateway;
pub mod predicate;
pub mod store;

pub use control::{ControlOp, ControlReport, Rejection};
pub use gateway::{
    DEFAULT_TASK_TTL, Gateway, ResultDisposition, SubmitOutcome, deps_satisfied, worker_supports,
};
pub use predicate::{Predicate, PredicateError};
pub use store::{MemoryRunStore, RunStore, StoreError, Transition};
