// src/dag/mod.rs

//! Dependency graph over task records.
//!
//! - [`graph`] holds the pure ordering functions (forward graph, Kahn
//!   topological sort, transitive sorts and dependency lookups).

pub mod graph;

pub use graph::{
    DependencyRecord, ForwardGraph, GraphError, Record, build_forward_graph,
    immediate_dependencies, topological_sort, transitive_dependency_sort, transitive_dependents,
};
