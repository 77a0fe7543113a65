// src/dag/graph.rs

//! Pure dependency-graph functions.
//!
//! Everything here works on any slice of [`DependencyRecord`]s and has no
//! side effects. Edge direction is `dependency -> dependent`: for a record
//! `B` with `deps = ["A"]` the forward graph holds the edge `A -> B`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use thiserror::Error;

/// Anything with an id and a list of ids it depends on.
pub trait DependencyRecord {
    fn id(&self) -> &str;
    fn deps(&self) -> &[String];
}

impl<T: DependencyRecord + ?Sized> DependencyRecord for &T {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn deps(&self) -> &[String] {
        (**self).deps()
    }
}

/// Minimal owned record, handy for callers that only have ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub deps: Vec<String>,
}

impl Record {
    pub fn new(id: impl Into<String>, deps: &[&str]) -> Self {
        Self {
            id: id.into(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl DependencyRecord for Record {
    fn id(&self) -> &str {
        &self.id
    }

    fn deps(&self) -> &[String] {
        &self.deps
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected in task graph involving: {}", members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task '{task}' depends on unknown task '{dep}'")]
    UnknownDependency { task: String, dep: String },

    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
}

/// Forward adjacency view of a set of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardGraph {
    /// `dependency -> [dependents]`, dependents in input order.
    pub adjacency: HashMap<String, Vec<String>>,
    /// Number of distinct dependencies per node.
    pub in_degree: HashMap<String, usize>,
    /// Every node, in input order (records without deps included).
    pub nodes: Vec<String>,
}

impl ForwardGraph {
    /// Immediate dependents of `id` (empty for unknown ids and leaves).
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Build the forward graph, in-degree map and node set.
///
/// Every dependency must name a record in `records`; an unknown one is a
/// [`GraphError::UnknownDependency`] rather than a silently dropped edge.
pub fn build_forward_graph<R: DependencyRecord>(records: &[R]) -> Result<ForwardGraph, GraphError> {
    let index = index_records(records)?;
    let mut graph = ForwardGraph::default();

    for rec in records {
        graph.nodes.push(rec.id().to_string());
        graph.adjacency.entry(rec.id().to_string()).or_default();
        graph.in_degree.entry(rec.id().to_string()).or_insert(0);
    }

    for rec in records {
        for dep in unique_deps(rec) {
            if !index.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    task: rec.id().to_string(),
                    dep: dep.to_string(),
                });
            }
            graph
                .adjacency
                .entry(dep.to_string())
                .or_default()
                .push(rec.id().to_string());
            *graph.in_degree.entry(rec.id().to_string()).or_insert(0) += 1;
        }
    }

    Ok(graph)
}

/// Kahn's algorithm. Among nodes that are ready at the same time, the one
/// that appears first in `records` is emitted first.
pub fn topological_sort<R: DependencyRecord>(records: &[R]) -> Result<Vec<&R>, GraphError> {
    let order = kahn_order(records)?;
    Ok(order.into_iter().map(|i| &records[i]).collect())
}

/// The ancestors of `start_id` (inclusive), in topological order.
pub fn transitive_dependency_sort<'a, R: DependencyRecord>(
    records: &'a [R],
    start_id: &str,
) -> Result<Vec<&'a R>, GraphError> {
    let index = index_records(records)?;
    let start = *index
        .get(start_id)
        .ok_or_else(|| GraphError::UnknownTask(start_id.to_string()))?;

    let mut keep: HashSet<usize> = HashSet::new();
    let mut stack = vec![start];
    while let Some(i) = stack.pop() {
        if !keep.insert(i) {
            continue;
        }
        for dep in unique_deps(&records[i]) {
            let j = *index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                task: records[i].id().to_string(),
                dep: dep.to_string(),
            })?;
            stack.push(j);
        }
    }

    // Keep input order inside the subset so tie-breaking matches the full sort.
    let subset: Vec<&R> = (0..records.len())
        .filter(|i| keep.contains(i))
        .map(|i| &records[i])
        .collect();
    let order = kahn_order(&subset)?;
    Ok(order.into_iter().map(|i| subset[i]).collect())
}

/// Direct predecessors of `id`.
pub fn immediate_dependencies<R: DependencyRecord>(
    records: &[R],
    id: &str,
) -> Result<Vec<String>, GraphError> {
    let rec = records
        .iter()
        .find(|r| r.id() == id)
        .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
    Ok(unique_deps(rec).map(str::to_string).collect())
}

/// Every node reachable forward from `id` (exclusive), in topological order.
pub fn transitive_dependents<R: DependencyRecord>(
    records: &[R],
    id: &str,
) -> Result<Vec<String>, GraphError> {
    let graph = build_forward_graph(records)?;
    if !graph.in_degree.contains_key(id) {
        return Err(GraphError::UnknownTask(id.to_string()));
    }

    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = graph.dependents_of(id).iter().map(String::as_str).collect();
    while let Some(name) = queue.pop_front() {
        if reached.insert(name) {
            queue.extend(graph.dependents_of(name).iter().map(String::as_str));
        }
    }

    let order = topological_sort(records)?;
    Ok(order
        .into_iter()
        .filter(|r| reached.contains(r.id()))
        .map(|r| r.id().to_string())
        .collect())
}

fn index_records<R: DependencyRecord>(records: &[R]) -> Result<HashMap<&str, usize>, GraphError> {
    let mut index = HashMap::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        if index.insert(rec.id(), i).is_some() {
            return Err(GraphError::DuplicateTask(rec.id().to_string()));
        }
    }
    Ok(index)
}

fn unique_deps<R: DependencyRecord>(rec: &R) -> impl Iterator<Item = &str> {
    let mut seen = HashSet::new();
    rec.deps()
        .iter()
        .map(String::as_str)
        .filter(move |d| seen.insert(*d))
}

fn kahn_order<R: DependencyRecord>(records: &[R]) -> Result<Vec<usize>, GraphError> {
    let graph = build_forward_graph(records)?;
    let index = index_records(records)?;
    let mut in_degree = graph.in_degree.clone();

    let mut ready: BinaryHeap<Reverse<usize>> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| in_degree.get(r.id()).copied().unwrap_or(0) == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(records.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for dependent in graph.dependents_of(records[i].id()) {
            if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(index[dependent.as_str()]));
                }
            }
        }
    }

    if order.len() < records.len() {
        let emitted: HashSet<usize> = order.iter().copied().collect();
        let leftover: Vec<&R> = (0..records.len())
            .filter(|i| !emitted.contains(i))
            .map(|i| &records[i])
            .collect();
        return Err(GraphError::Cycle {
            members: cycle_members(&leftover),
        });
    }

    Ok(order)
}

/// Ids that sit on a cycle (as opposed to merely downstream of one).
fn cycle_members<R: DependencyRecord>(leftover: &[&R]) -> Vec<String> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for rec in leftover {
        graph.add_node(rec.id());
    }
    for rec in leftover {
        for dep in rec.deps() {
            if graph.contains_node(dep.as_str()) {
                graph.add_edge(dep.as_str(), rec.id(), ());
            }
        }
    }

    let mut members: Vec<String> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(str::to_string)
        .collect();
    members.sort();
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<R: DependencyRecord>(recs: &[&R]) -> Vec<String> {
        recs.iter().map(|r| r.id().to_string()).collect()
    }

    #[test]
    fn forward_graph_includes_isolated_nodes() {
        let recs = vec![Record::new("a", &[]), Record::new("b", &["a"]), Record::new("c", &[])];
        let g = build_forward_graph(&recs).unwrap();
        assert_eq!(g.nodes, vec!["a", "b", "c"]);
        assert_eq!(g.dependents_of("a"), ["b".to_string()]);
        assert!(g.dependents_of("c").is_empty());
        assert_eq!(g.in_degree["b"], 1);
        assert_eq!(g.in_degree["c"], 0);
    }

    #[test]
    fn ties_are_broken_by_input_order() {
        let recs = vec![
            Record::new("z", &[]),
            Record::new("y", &["z"]),
            Record::new("x", &[]),
            Record::new("w", &["x", "z"]),
        ];
        let order = topological_sort(&recs).unwrap();
        assert_eq!(ids(&order), vec!["z", "y", "x", "w"]);
    }

    #[test]
    fn cycle_is_reported_with_members_only() {
        let recs = vec![
            Record::new("a", &["c"]),
            Record::new("b", &["a"]),
            Record::new("c", &["b"]),
            Record::new("d", &["c"]),
            Record::new("e", &[]),
        ];
        match topological_sort(&recs) {
            Err(GraphError::Cycle { members }) => assert_eq!(members, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let recs = vec![Record::new("a", &["a"])];
        assert_eq!(
            topological_sort(&recs).unwrap_err(),
            GraphError::Cycle {
                members: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let recs = vec![Record::new("a", &["ghost"])];
        assert!(matches!(
            build_forward_graph(&recs),
            Err(GraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn transitive_sort_keeps_only_ancestors() {
        let recs = vec![
            Record::new("a", &[]),
            Record::new("b", &["a"]),
            Record::new("unrelated", &[]),
            Record::new("c", &["b"]),
            Record::new("d", &["c"]),
        ];
        let order = transitive_dependency_sort(&recs, "c").unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
        assert_eq!(
            transitive_dependency_sort(&recs, "nope").unwrap_err(),
            GraphError::UnknownTask("nope".to_string())
        );
    }

    #[test]
    fn immediate_dependencies_are_direct_only() {
        let recs = vec![
            Record::new("a", &[]),
            Record::new("b", &["a"]),
            Record::new("c", &["b", "b"]),
        ];
        assert_eq!(immediate_dependencies(&recs, "c").unwrap(), vec!["b"]);
        assert!(immediate_dependencies(&recs, "a").unwrap().is_empty());
        assert!(immediate_dependencies(&recs, "zzz").is_err());
    }

    #[test]
    fn transitive_dependents_follow_forward_edges() {
        let recs = vec![
            Record::new("a", &[]),
            Record::new("b", &["a"]),
            Record::new("c", &["b"]),
            Record::new("d", &["a"]),
            Record::new("e", &[]),
        ];
        assert_eq!(transitive_dependents(&recs, "a").unwrap(), vec!["b", "c", "d"]);
        assert!(transitive_dependents(&recs, "e").unwrap().is_empty());
    }
}
