//! Dependency resolution over a `petgraph` step graph.
//!
//! Steps become nodes in declaration order with an edge from each dependency
//! to its dependent. `petgraph::algo::toposort` rejects cycles; the order
//! itself comes from a post-order walk of the reversed graph rooted at each
//! step in declaration order, visiting dependencies in the order they are
//! listed. Identical definitions therefore always resolve to the identical
//! order.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{DfsPostOrder, Reversed};
use stepflow_types::workflow::StepDefinition;

use super::error::{CycleError, ResolveError};

/// Build the dependency graph: one node per step, edges dependency -> dependent.
fn build_graph(steps: &[StepDefinition]) -> Result<DiGraph<&str, ()>, ResolveError> {
    let mut graph = DiGraph::<&str, ()>::with_capacity(steps.len(), steps.len());
    let nodes: Vec<NodeIndex> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    // First occurrence wins; duplicate ids are rejected by definition
    // validation before resolution is relevant.
    let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        id_to_idx.entry(step.id.as_str()).or_insert(i);
    }

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                ResolveError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(nodes[*from_idx], nodes[to_idx], ());
        }
    }

    Ok(graph)
}

/// Reject graphs containing a cycle, naming a step on it.
fn check_acyclic(graph: &DiGraph<&str, ()>) -> Result<(), ResolveError> {
    toposort(graph, None).map(|_| ()).map_err(|cycle| {
        CycleError {
            step_id: graph[cycle.node_id()].to_string(),
        }
        .into()
    })
}

/// Compute an execution order in which every step follows all of its
/// dependencies.
pub fn resolve_order(steps: &[StepDefinition]) -> Result<Vec<String>, ResolveError> {
    let graph = build_graph(steps)?;
    check_acyclic(&graph)?;

    // Incoming edges are yielded newest first and the walk pops the last one
    // pushed, so dependencies are entered in their listed order.
    let upstream = Reversed(&graph);
    let mut dfs = DfsPostOrder::empty(upstream);
    let mut order = Vec::with_capacity(steps.len());
    for root in graph.node_indices() {
        dfs.move_to(root);
        while let Some(node) = dfs.next(upstream) {
            order.push(graph[node].to_string());
        }
    }

    Ok(order)
}

/// Check acyclicity and dependency references without keeping the order.
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), ResolveError> {
    check_acyclic(&build_graph(steps)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, depends_on: Vec<&str>) -> StepDefinition {
        StepDefinition::new(id, "noop").depends_on(depends_on)
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|s| s == id).unwrap()
    }

    /// Walk the dependency edges from `start` and report whether it can reach
    /// itself again.
    fn on_cycle(steps: &[StepDefinition], start: &str) -> bool {
        let mut frontier: Vec<&str> = steps
            .iter()
            .find(|s| s.id == start)
            .map(|s| s.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = frontier.pop() {
            if id == start {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(s) = steps.iter().find(|s| s.id == id) {
                frontier.extend(s.depends_on.iter().map(String::as_str));
            }
        }
        false
    }

    #[test]
    fn test_independent_steps_keep_declaration_order() {
        let steps = vec![step("c", vec![]), step("a", vec![]), step("b", vec![])];
        assert_eq!(resolve_order(&steps).unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        // Declared out of order: d -> {b, c} -> a
        let steps = vec![
            step("d", vec!["b", "c"]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("a", vec![]),
        ];
        let order = resolve_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_every_step_after_its_dependencies() {
        let steps = vec![
            step("report", vec!["whois", "dns", "ports"]),
            step("ports", vec!["dns"]),
            step("whois", vec![]),
            step("dns", vec!["whois"]),
            step("screens", vec!["ports"]),
        ];
        let order = resolve_order(&steps).unwrap();
        assert_eq!(order.len(), steps.len());
        for s in &steps {
            for dep in &s.depends_on {
                assert!(
                    position(&order, dep) < position(&order, &s.id),
                    "{dep} must precede {}",
                    s.id
                );
            }
        }
    }

    #[test]
    fn test_order_is_deterministic() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("e", vec![]),
            step("d", vec!["c", "b"]),
        ];
        let first = resolve_order(&steps).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve_order(&steps).unwrap(), first);
        }
        assert_eq!(first, vec!["a", "b", "c", "e", "d"]);
    }

    #[test]
    fn test_two_step_cycle() {
        // X depends on Y depends on X
        let steps = vec![step("x", vec!["y"]), step("y", vec!["x"])];
        let err = resolve_order(&steps).unwrap_err();
        assert!(
            matches!(&err, ResolveError::Cycle(CycleError { step_id }) if step_id == "x" || step_id == "y"),
            "got: {err:?}"
        );
        let msg = err.to_string();
        assert!(msg.contains("cycle detected"), "got: {msg}");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![step("a", vec![]), step("b", vec!["b"])];
        let err = resolve_order(&steps).unwrap_err();
        assert!(matches!(err, ResolveError::Cycle(CycleError { step_id }) if step_id == "b"));
    }

    #[test]
    fn test_reported_cycle_step_is_on_the_cycle() {
        // The tail `entry -> a` leads into the cycle a -> b -> c -> a.
        let steps = vec![
            step("entry", vec!["a"]),
            step("a", vec!["b"]),
            step("b", vec!["c"]),
            step("c", vec!["a"]),
            step("other", vec![]),
        ];
        let Err(ResolveError::Cycle(cycle)) = resolve_order(&steps) else {
            panic!("expected a cycle");
        };
        assert_ne!(cycle.step_id, "entry");
        assert!(on_cycle(&steps, &cycle.step_id), "{} not on cycle", cycle.step_id);
    }

    #[test]
    fn test_validate_dag_names_cycle_member() {
        let steps = vec![
            step("fetch", vec![]),
            step("parse", vec!["fetch", "store"]),
            step("store", vec!["parse"]),
        ];
        let Err(ResolveError::Cycle(cycle)) = validate_dag(&steps) else {
            panic!("expected a cycle");
        };
        assert!(on_cycle(&steps, &cycle.step_id), "{} not on cycle", cycle.step_id);
        assert!(validate_dag(&steps[..1]).is_ok());
    }

    #[test]
    fn test_unknown_dependency() {
        let steps = vec![step("a", vec!["nonexistent"])];
        let err = resolve_order(&steps).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownDependency {
                step: "a".to_string(),
                dependency: "nonexistent".to_string()
            }
        );
    }

    #[test]
    fn test_long_chain_does_not_overflow() {
        let mut steps = vec![step("s0", vec![])];
        for i in 1..20_000 {
            let prev = format!("s{}", i - 1);
            steps.push(StepDefinition::new(format!("s{i}"), "noop").depends_on([prev]));
        }
        steps.reverse();
        let order = resolve_order(&steps).unwrap();
        assert_eq!(order.first().map(String::as_str), Some("s0"));
        assert_eq!(order.len(), 20_000);
    }

    #[test]
    fn test_empty_steps() {
        assert!(resolve_order(&[]).unwrap().is_empty());
        assert!(validate_dag(&[]).is_ok());
    }
}
