/// Hot-reload flow registry using ArcSwap
///
/// Lock-free, atomic updates to the in-memory flow map. Each update swaps the
/// entire registry pointer, so concurrent executions keep running against the
/// snapshot they started with while new runs pick up the fresh definition.

use crate::error::EngineError;
use crate::flow::types::FlowDefinition;
use crate::flow::validation;
use crate::runtime::executor::ExecutorRegistry;
use crate::runtime::scheduler;
use arc_swap::ArcSwap;
use std::{
    collections::HashMap,
    sync::Arc,
};

/// Compiled flow with execution metadata
///
/// Extends the base definition with everything the runtime needs without
/// re-deriving it per tick: the deterministic execution order, the resolved
/// input binding table, and the trigger entry points.
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub flow: FlowDefinition,

    /// Deterministic topological execution order, recomputed on every upsert
    pub order: Vec<String>,

    /// (target node id, input slot) -> source node id
    pub bindings: HashMap<(String, usize), String>,

    /// Manual-trigger node ids, consumed by the trigger coordinator
    pub manual_trigger_ids: Vec<String>,

    /// Schedule-trigger nodes: (node id, cron expression)
    pub schedule_triggers: Vec<(String, String)>,
}

impl CompiledFlow {
    /// Validate and compile a flow snapshot into execution-ready form.
    pub fn compile(
        flow: FlowDefinition,
        executors: &ExecutorRegistry,
    ) -> Result<Self, EngineError> {
        validation::validate(&flow, executors)?;
        let order = scheduler::topological_order(&flow.nodes, &flow.edges)?;
        let bindings = validation::resolve_bindings(&flow);

        let mut manual_trigger_ids = Vec::new();
        let mut schedule_triggers = Vec::new();
        for node in &flow.nodes {
            match node.node_type.as_str() {
                "manual_trigger" => manual_trigger_ids.push(node.id.clone()),
                "schedule_trigger" => {
                    let expression = node
                        .config
                        .get("schedule")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| EngineError::InvalidSchedule {
                            node_id: node.id.clone(),
                            expression: String::new(),
                            reason: "missing `schedule` in node configuration".to_string(),
                        })?;
                    schedule_triggers.push((node.id.clone(), expression.to_string()));
                }
                _ => {}
            }
        }

        Ok(Self {
            flow,
            order,
            bindings,
            manual_trigger_ids,
            schedule_triggers,
        })
    }
}

/// Lock-free flow registry
///
/// The single source of truth for flow definitions the engine knows about.
/// Reads never block; writers clone the map, mutate the clone, and swap.
#[derive(Debug)]
pub struct FlowRegistry {
    flows: ArcSwap<HashMap<String, CompiledFlow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Validate, compile, and store a flow definition.
    ///
    /// Rejected definitions leave the registry untouched.
    pub fn upsert(
        &self,
        flow: FlowDefinition,
        executors: &ExecutorRegistry,
    ) -> Result<CompiledFlow, EngineError> {
        let flow_id = flow.id.clone();
        let compiled = CompiledFlow::compile(flow, executors)?;

        let current = self.flows.load();
        let mut next = (**current).clone();
        next.insert(flow_id.clone(), compiled.clone());
        self.flows.store(Arc::new(next));

        tracing::info!("📋 Registered flow: {}", flow_id);
        Ok(compiled)
    }

    /// Get a compiled flow by id (lock-free read).
    pub fn get(&self, flow_id: &str) -> Option<CompiledFlow> {
        self.flows.load().get(flow_id).cloned()
    }

    /// All registered flow ids.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All registered definitions.
    pub fn list(&self) -> Vec<FlowDefinition> {
        self.flows
            .load()
            .values()
            .map(|compiled| compiled.flow.clone())
            .collect()
    }

    /// Remove a flow. Returns the removed compiled form, if any.
    pub fn remove(&self, flow_id: &str) -> Option<CompiledFlow> {
        let current = self.flows.load();
        let mut next = (**current).clone();
        let removed = next.remove(flow_id);
        if removed.is_some() {
            self.flows.store(Arc::new(next));
            tracing::info!("🗑️ Removed flow from registry: {}", flow_id);
        }
        removed
    }
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{Edge, ExecutionMode, Node};
    use serde_json::json;

    fn simple_flow(id: &str) -> FlowDefinition {
        FlowDefinition {
            id: id.to_string(),
            name: "registry test".to_string(),
            nodes: vec![
                Node {
                    id: "fire".to_string(),
                    node_type: "manual_trigger".to_string(),
                    position: json!(null),
                    config: json!({}),
                },
                Node {
                    id: "dbg".to_string(),
                    node_type: "debug".to_string(),
                    position: json!(null),
                    config: json!({}),
                },
            ],
            edges: vec![Edge {
                id: "e1".to_string(),
                source: "fire".to_string(),
                source_slot: 0,
                target: "dbg".to_string(),
                target_slot: 0,
            }],
            mode: ExecutionMode::Manual,
            scan_interval_ms: 1000,
        }
    }

    #[test]
    fn compile_extracts_order_bindings_and_triggers() {
        let executors = ExecutorRegistry::with_builtins();
        let compiled = CompiledFlow::compile(simple_flow("f1"), &executors).unwrap();

        assert_eq!(compiled.order, vec!["fire", "dbg"]);
        assert_eq!(
            compiled.bindings.get(&("dbg".to_string(), 0)),
            Some(&"fire".to_string())
        );
        assert_eq!(compiled.manual_trigger_ids, vec!["fire"]);
        assert!(compiled.schedule_triggers.is_empty());
    }

    #[test]
    fn schedule_trigger_requires_expression() {
        let executors = ExecutorRegistry::with_builtins();
        let mut flow = simple_flow("f1");
        flow.nodes.push(Node {
            id: "cron".to_string(),
            node_type: "schedule_trigger".to_string(),
            position: json!(null),
            config: json!({}),
        });
        assert!(matches!(
            CompiledFlow::compile(flow, &executors),
            Err(EngineError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn invalid_flow_leaves_registry_untouched() {
        let executors = ExecutorRegistry::with_builtins();
        let registry = FlowRegistry::new();
        registry.upsert(simple_flow("good"), &executors).unwrap();

        let mut bad = simple_flow("bad");
        bad.edges.push(Edge {
            id: "e2".to_string(),
            source: "dbg".to_string(),
            source_slot: 0,
            target: "fire".to_string(),
            target_slot: 0,
        });
        assert!(registry.upsert(bad, &executors).is_err());
        assert_eq!(registry.list_ids(), vec!["good"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let executors = ExecutorRegistry::with_builtins();
        let registry = FlowRegistry::new();
        registry.upsert(simple_flow("f1"), &executors).unwrap();

        assert!(registry.remove("f1").is_some());
        assert!(registry.remove("f1").is_none());
        assert!(registry.list_ids().is_empty());
    }
}
