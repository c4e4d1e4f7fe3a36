/// Deterministic topological scheduler
///
/// Computes the execution order for one flow snapshot using Kahn's in-degree
/// reduction over a petgraph DiGraph. Ties among ready nodes are broken
/// ascending by node id, so recomputing the order for an unchanged definition
/// always returns the identical sequence. Any node that never reaches zero
/// in-degree participates in a cycle; all such nodes are reported together.

use crate::error::EngineError;
use crate::flow::types::{Edge, Node};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};

/// Build the dependency graph induced by the edge list.
///
/// Edge direction = dependency: source must execute before target.
/// Fails on edges referencing unknown nodes and on duplicate node ids.
fn build_graph(
    nodes: &[Node],
    edges: &[Edge],
) -> Result<(DiGraph<String, ()>, HashMap<String, NodeIndex>), EngineError> {
    let mut graph = DiGraph::new();
    let mut index_of = HashMap::new();

    for node in nodes {
        if index_of.contains_key(&node.id) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
        let idx = graph.add_node(node.id.clone());
        index_of.insert(node.id.clone(), idx);
    }

    for edge in edges {
        let source = *index_of
            .get(&edge.source)
            .ok_or_else(|| EngineError::UnknownNode {
                edge_id: edge.id.clone(),
                node_id: edge.source.clone(),
            })?;
        let target = *index_of
            .get(&edge.target)
            .ok_or_else(|| EngineError::UnknownNode {
                edge_id: edge.id.clone(),
                node_id: edge.target.clone(),
            })?;
        graph.add_edge(source, target, ());
    }

    Ok((graph, index_of))
}

/// Compute a deterministic topological order covering every node exactly once.
///
/// Returns the ordered node ids, or a cycle error naming all unresolved nodes.
pub fn topological_order(nodes: &[Node], edges: &[Edge]) -> Result<Vec<String>, EngineError> {
    let (graph, _) = build_graph(nodes, edges)?;

    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in graph.node_indices() {
        let degree = graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .count();
        in_degree.insert(idx, degree);
    }

    // BTreeSet keyed by node id gives the stable tie-break among ready nodes.
    let mut ready: BTreeSet<(String, NodeIndex)> = BTreeSet::new();
    for idx in graph.node_indices() {
        if in_degree[&idx] == 0 {
            ready.insert((graph[idx].clone(), idx));
        }
    }

    let mut order: Vec<String> = Vec::with_capacity(graph.node_count());

    while let Some(entry) = ready.iter().next().cloned() {
        ready.remove(&entry);
        let (node_id, idx) = entry;
        order.push(node_id);

        for succ in graph.neighbors_directed(idx, petgraph::Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&succ) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((graph[succ].clone(), succ));
                }
            }
        }
    }

    if order.len() < graph.node_count() {
        let mut unresolved: Vec<String> = graph
            .node_indices()
            .filter(|idx| !order.contains(&graph[*idx]))
            .map(|idx| graph[idx].clone())
            .collect();
        unresolved.sort();
        tracing::warn!("🔁 Cycle detected among nodes: {:?}", unresolved);
        return Err(EngineError::CycleDetected { nodes: unresolved });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: "debug".to_string(),
            position: json!(null),
            config: json!({}),
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> Edge {
        Edge {
            id: id.to_string(),
            source: source.to_string(),
            source_slot: 0,
            target: target.to_string(),
            target_slot: 0,
        }
    }

    #[test]
    fn order_is_deterministic_across_calls() {
        let nodes = vec![node("c"), node("a"), node("b"), node("d")];
        let edges = vec![
            edge("e1", "a", "d"),
            edge("e2", "b", "d"),
            edge("e3", "c", "d"),
        ];

        let first = topological_order(&nodes, &edges).unwrap();
        for _ in 0..10 {
            assert_eq!(topological_order(&nodes, &edges).unwrap(), first);
        }
        // Equal in-degree ties resolve ascending by node id.
        assert_eq!(first, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn diamond_respects_dependencies() {
        let nodes = vec![node("top"), node("left"), node("right"), node("bottom")];
        let edges = vec![
            edge("e1", "top", "left"),
            edge("e2", "top", "right"),
            edge("e3", "left", "bottom"),
            edge("e4", "right", "bottom"),
        ];
        let order = topological_order(&nodes, &edges).unwrap();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("top") < pos("left"));
        assert!(pos("top") < pos("right"));
        assert!(pos("left") < pos("bottom"));
        assert!(pos("right") < pos("bottom"));
    }

    #[test]
    fn cycle_reports_all_unresolved_nodes() {
        let nodes = vec![node("a"), node("b"), node("c"), node("free")];
        let edges = vec![
            edge("e1", "a", "b"),
            edge("e2", "b", "c"),
            edge("e3", "c", "a"),
        ];
        match topological_order(&nodes, &edges) {
            Err(EngineError::CycleDetected { nodes }) => {
                assert_eq!(nodes, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let nodes = vec![node("a")];
        let edges = vec![edge("e1", "a", "ghost")];
        assert!(matches!(
            topological_order(&nodes, &edges),
            Err(EngineError::UnknownNode { .. })
        ));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let nodes = vec![node("a"), node("a")];
        assert!(matches!(
            topological_order(&nodes, &[]),
            Err(EngineError::DuplicateNodeId(_))
        ));
    }
}
