use std::collections::{BTreeSet, HashMap, HashSet};

use proptest::prelude::*;
use workdag::dag::{
    GraphError, Record, topological_sort, transitive_dependency_sort, transitive_dependents,
};

fn name(i: usize) -> String {
    format!("task_{i}")
}

// Acyclic by construction: task N may only depend on tasks 0..N-1.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<Record>> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..4),
            num_tasks,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, picks)| {
                    let deps: BTreeSet<usize> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        picks.into_iter().map(|p| p % i).collect()
                    };
                    Record {
                        id: name(i),
                        deps: deps.into_iter().map(name).collect(),
                    }
                })
                .collect()
        })
    })
}

fn ancestors(records: &[Record], start: &str) -> HashSet<String> {
    let by_id: HashMap<&str, &Record> = records.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut seen = HashSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(id) = stack.pop() {
        if seen.insert(id.clone()) {
            stack.extend(by_id[id.as_str()].deps.iter().cloned());
        }
    }
    seen
}

proptest! {
    #[test]
    fn every_task_comes_after_its_dependencies(records in dag_strategy(12)) {
        let order = topological_sort(&records).unwrap();
        prop_assert_eq!(order.len(), records.len());

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.as_str(), i))
            .collect();
        for record in &records {
            for dep in &record.deps {
                prop_assert!(position[dep.as_str()] < position[record.id.as_str()]);
            }
        }
    }

    #[test]
    fn sorting_is_deterministic(records in dag_strategy(12)) {
        let first: Vec<String> = topological_sort(&records).unwrap().iter().map(|r| r.id.clone()).collect();
        let second: Vec<String> = topological_sort(&records).unwrap().iter().map(|r| r.id.clone()).collect();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn transitive_sort_is_exactly_the_ancestors(records in dag_strategy(12)) {
        let last = records.last().unwrap().id.clone();
        let subset = transitive_dependency_sort(&records, &last).unwrap();

        let got: HashSet<String> = subset.iter().map(|r| r.id.clone()).collect();
        prop_assert_eq!(got, ancestors(&records, &last));
        prop_assert_eq!(&subset.last().unwrap().id, &last);
    }

    #[test]
    fn dependents_exclude_the_root_and_depend_on_it(records in dag_strategy(12)) {
        let root = records[0].id.clone();
        let dependents = transitive_dependents(&records, &root).unwrap();

        prop_assert!(!dependents.contains(&root));
        for id in &dependents {
            prop_assert!(ancestors(&records, id).contains(&root));
        }
        for record in &records[1..] {
            if ancestors(&records, &record.id).contains(&root) {
                prop_assert!(dependents.contains(&record.id));
            }
        }
    }

    #[test]
    fn closing_a_chain_reports_a_cycle(len in 2usize..10) {
        let mut records: Vec<Record> = (0..len)
            .map(|i| Record {
                id: name(i),
                deps: if i == 0 { vec![] } else { vec![name(i - 1)] },
            })
            .collect();
        records[0].deps.push(name(len - 1));

        match topological_sort(&records) {
            Err(GraphError::Cycle { members }) => {
                prop_assert_eq!(members.len(), len);
                prop_assert!(members.contains(&name(0)));
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|o| o.len())),
        }
    }
}

#[test]
fn ties_are_broken_by_input_order() {
    let records = vec![
        Record::new("b", &[]),
        Record::new("a", &[]),
        Record::new("c", &["b"]),
    ];
    let order: Vec<&str> = topological_sort(&records)
        .unwrap()
        .iter()
        .map(|r| r.id.as_str())
        .collect();
    assert_eq!(order, vec!["b", "a", "c"]);
}

#[test]
fn unknown_dependency_is_reported() {
    let records = vec![Record::new("a", &["ghost"])];
    assert_eq!(
        topological_sort(&records).unwrap_err(),
        GraphError::UnknownDependency {
            task: "a".into(),
            dep: "ghost".into()
        }
    );
}
