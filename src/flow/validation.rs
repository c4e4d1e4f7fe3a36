/// Flow graph validation
///
/// Everything here runs before any node executes: a definition that fails
/// validation is refused outright at deploy or run-start, never partially
/// executed. Slot bounds and required inputs are checked against each node's
/// *current* I/O rules, since slot counts can depend on configuration.

use crate::error::EngineError;
use crate::flow::types::FlowDefinition;
use crate::runtime::executor::ExecutorRegistry;
use crate::runtime::scheduler;
use std::collections::{HashMap, HashSet};

/// Resolve the edge list into the per-run input binding table:
/// (target node id, input slot) -> source node id.
///
/// Resolved once per compile instead of re-parsed per node execution.
pub fn resolve_bindings(flow: &FlowDefinition) -> HashMap<(String, usize), String> {
    let mut bindings = HashMap::new();
    for edge in &flow.edges {
        bindings.insert(
            (edge.target.clone(), edge.target_slot),
            edge.source.clone(),
        );
    }
    bindings
}

/// Validate a flow definition for execution/deployment.
///
/// Checks, in order: node id uniqueness and edge endpoints, acyclicity,
/// known node types, slot bounds, and required-input connectivity.
pub fn validate(flow: &FlowDefinition, executors: &ExecutorRegistry) -> Result<(), EngineError> {
    // Covers duplicate ids, dangling edges, and cycles.
    scheduler::topological_order(&flow.nodes, &flow.edges)?;

    let mut rules_by_node = HashMap::new();
    for node in &flow.nodes {
        let executor =
            executors
                .get(&node.node_type)
                .ok_or_else(|| EngineError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                })?;
        rules_by_node.insert(node.id.clone(), executor.io_rules(node));
    }

    let mut wired: HashSet<(String, usize)> = HashSet::new();
    for edge in &flow.edges {
        let target_rules = &rules_by_node[&edge.target];
        if edge.target_slot >= target_rules.inputs.len() {
            return Err(EngineError::InputSlotOutOfBounds {
                edge_id: edge.id.clone(),
                node_id: edge.target.clone(),
                slot: edge.target_slot,
                declared: target_rules.inputs.len(),
            });
        }

        let source_rules = &rules_by_node[&edge.source];
        if edge.source_slot >= source_rules.outputs {
            return Err(EngineError::OutputSlotOutOfBounds {
                edge_id: edge.id.clone(),
                node_id: edge.source.clone(),
                slot: edge.source_slot,
                declared: source_rules.outputs,
            });
        }

        wired.insert((edge.target.clone(), edge.target_slot));
    }

    for node in &flow.nodes {
        let rules = &rules_by_node[&node.id];
        for (slot, spec) in rules.inputs.iter().enumerate() {
            if spec.required && !wired.contains(&(node.id.clone(), slot)) {
                return Err(EngineError::MissingRequiredInput {
                    node_id: node.id.clone(),
                    input: spec.name.clone(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{Edge, ExecutionMode, Node};
    use serde_json::json;

    fn flow(nodes: Vec<Node>, edges: Vec<Edge>) -> FlowDefinition {
        FlowDefinition {
            id: "f1".to_string(),
            name: "test".to_string(),
            nodes,
            edges,
            mode: ExecutionMode::Manual,
            scan_interval_ms: 1000,
        }
    }

    fn node(id: &str, node_type: &str, config: serde_json::Value) -> Node {
        Node {
            id: id.to_string(),
            node_type: node_type.to_string(),
            position: json!(null),
            config,
        }
    }

    fn edge(id: &str, source: &str, target: &str, target_slot: usize) -> Edge {
        Edge {
            id: id.to_string(),
            source: source.to_string(),
            source_slot: 0,
            target: target.to_string(),
            target_slot,
        }
    }

    #[test]
    fn fully_wired_flow_validates() {
        let registry = ExecutorRegistry::with_builtins();
        let f = flow(
            vec![
                node("a", "tag_input", json!({"tag": "t1"})),
                node("b", "tag_input", json!({"tag": "t2"})),
                node("sum", "arithmetic", json!({"operation": "add"})),
            ],
            vec![edge("e1", "a", "sum", 0), edge("e2", "b", "sum", 1)],
        );
        assert!(validate(&f, &registry).is_ok());
    }

    #[test]
    fn unconnected_required_input_is_rejected() {
        let registry = ExecutorRegistry::with_builtins();
        let f = flow(
            vec![
                node("a", "tag_input", json!({"tag": "t1"})),
                node("sum", "arithmetic", json!({"operation": "add"})),
            ],
            vec![edge("e1", "a", "sum", 0)],
        );
        assert!(matches!(
            validate(&f, &registry),
            Err(EngineError::MissingRequiredInput { .. })
        ));
    }

    #[test]
    fn slot_bounds_follow_current_configuration() {
        let registry = ExecutorRegistry::with_builtins();
        // `not` declares a single input: slot 1 is out of bounds.
        let f = flow(
            vec![
                node("a", "tag_input", json!({"tag": "t1"})),
                node("inv", "logic", json!({"operation": "not"})),
            ],
            vec![edge("e1", "a", "inv", 1)],
        );
        assert!(matches!(
            validate(&f, &registry),
            Err(EngineError::InputSlotOutOfBounds { .. })
        ));

        // `and` declares two: the same edge becomes valid once slot 0 is wired.
        let f = flow(
            vec![
                node("a", "tag_input", json!({"tag": "t1"})),
                node("gate", "logic", json!({"operation": "and"})),
            ],
            vec![edge("e1", "a", "gate", 0), edge("e2", "a", "gate", 1)],
        );
        assert!(validate(&f, &registry).is_ok());
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let registry = ExecutorRegistry::with_builtins();
        let f = flow(vec![node("x", "quantum_entangler", json!({}))], vec![]);
        assert!(matches!(
            validate(&f, &registry),
            Err(EngineError::UnknownNodeType { .. })
        ));
    }

    #[test]
    fn cycle_is_rejected_before_anything_else_runs() {
        let registry = ExecutorRegistry::with_builtins();
        let f = flow(
            vec![
                node("a", "debug", json!({})),
                node("b", "debug", json!({})),
            ],
            vec![edge("e1", "a", "b", 0), edge("e2", "b", "a", 0)],
        );
        assert!(matches!(
            validate(&f, &registry),
            Err(EngineError::CycleDetected { .. })
        ));
    }
}
