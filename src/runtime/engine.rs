/// Flow execution engine
///
/// Walks one flow snapshot in deterministic topological order, dispatching
/// each node to its executor and accumulating outputs in the pass's execution
/// context. Failures are node-scoped: a failed node is recorded and the pass
/// continues, with downstream nodes that require the missing value recorded as
/// dependency-propagation failures rather than executed against garbage.

use crate::error::EngineError;
use crate::flow::registry::CompiledFlow;
use crate::flow::types::{
    ExecutionOrderEntry, FailureKind, FlowDefinition, NodeExecutionResult, RunResult,
};
use crate::flow::validation;
use crate::runtime::context::ExecutionContext;
use crate::runtime::executor::{ExecEnv, ExecutorRegistry};
use crate::runtime::scheduler;
use crate::runtime::script::ScriptSandbox;
use crate::tags::{FlowStateStore, TagProvider};
use std::collections::HashMap;
use std::sync::Arc;

/// Drives single passes over flow snapshots
///
/// Holds the shared services every pass needs; per-pass state lives entirely
/// in the ExecutionContext handed in by the caller.
pub struct FlowEngine {
    executors: Arc<ExecutorRegistry>,
    tags: Arc<dyn TagProvider>,
    state: Arc<FlowStateStore>,
    sandbox: ScriptSandbox,
}

impl FlowEngine {
    pub fn new(
        executors: Arc<ExecutorRegistry>,
        tags: Arc<dyn TagProvider>,
        state: Arc<FlowStateStore>,
        sandbox: ScriptSandbox,
    ) -> Self {
        Self {
            executors,
            tags,
            state,
            sandbox,
        }
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    pub fn state(&self) -> &Arc<FlowStateStore> {
        &self.state
    }

    /// One manual/test pass over a raw definition.
    ///
    /// Only graph-shape errors (cycles, dangling edges, duplicate ids) refuse
    /// the pass outright; partially-wired graphs stay executable so a flow can
    /// be exercised mid-edit. A refused pass produces no context entries.
    pub async fn execute(&self, flow: &FlowDefinition, ctx: ExecutionContext) -> RunResult {
        let order = match scheduler::topological_order(&flow.nodes, &flow.edges) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!("❌ Refusing to execute flow {}: {}", flow.id, e);
                return RunResult {
                    success: false,
                    flow_id: flow.id.clone(),
                    execution_id: ctx.execution_id,
                    node_outputs: HashMap::new(),
                    node_results: HashMap::new(),
                    error: Some(e.to_string()),
                };
            }
        };
        let bindings = validation::resolve_bindings(flow);
        self.run_pass(flow, &order, &bindings, ctx).await
    }

    /// One pass over a compiled (validated) flow, used by the scan loop and
    /// trigger paths so the order and bindings are not re-derived per tick.
    pub async fn execute_compiled(
        &self,
        compiled: &CompiledFlow,
        ctx: ExecutionContext,
    ) -> RunResult {
        self.run_pass(&compiled.flow, &compiled.order, &compiled.bindings, ctx)
            .await
    }

    /// Compile-only script check against the identical capability surface.
    pub fn validate_script(&self, code: &str) -> Vec<crate::runtime::script::ScriptDiagnostic> {
        self.sandbox.validate(code)
    }

    /// "Show execution order" diagnostic; no side effects.
    pub fn calculate_execution_order(
        &self,
        flow: &FlowDefinition,
    ) -> Result<Vec<ExecutionOrderEntry>, EngineError> {
        let order = scheduler::topological_order(&flow.nodes, &flow.edges)?;
        Ok(order
            .into_iter()
            .enumerate()
            .map(|(order, node_id)| ExecutionOrderEntry { node_id, order })
            .collect())
    }

    async fn run_pass(
        &self,
        flow: &FlowDefinition,
        order: &[String],
        bindings: &HashMap<(String, usize), String>,
        mut ctx: ExecutionContext,
    ) -> RunResult {
        let pass_start = std::time::Instant::now();
        tracing::info!(
            "🚀 Executing flow {} ({} nodes, execution {})",
            flow.id,
            order.len(),
            ctx.execution_id
        );

        let nodes_by_id: HashMap<&str, &crate::flow::types::Node> =
            flow.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let env = ExecEnv {
            bindings,
            tags: &self.tags,
            state: &self.state,
            sandbox: &self.sandbox,
        };

        let mut node_results: HashMap<String, NodeExecutionResult> = HashMap::new();

        for node_id in order {
            // Ids in `order` come from the same snapshot, so the lookup holds.
            let Some(node) = nodes_by_id.get(node_id.as_str()) else {
                continue;
            };

            let Some(executor) = self.executors.get(&node.node_type) else {
                node_results.insert(
                    node_id.clone(),
                    NodeExecutionResult::failure(
                        FailureKind::Execution,
                        format!("unknown node type '{}'", node.node_type),
                    ),
                );
                continue;
            };

            // A required upstream that ran and failed poisons this node; an
            // unwired or not-yet-produced input merely defaults.
            if let Some(failed_source) = failed_required_upstream(
                node,
                &executor.io_rules(node),
                bindings,
                &node_results,
            ) {
                tracing::debug!(
                    "⏭️ Skipping node {} in flow {}: upstream {} failed",
                    node_id,
                    flow.id,
                    failed_source
                );
                node_results.insert(
                    node_id.clone(),
                    NodeExecutionResult::failure(
                        FailureKind::DependencyPropagation,
                        format!("required input from failed node '{}'", failed_source),
                    ),
                );
                continue;
            }

            let result = executor.execute(node, &ctx, &env).await;
            if result.success {
                tracing::debug!("✅ Node {} completed", node_id);
                ctx.node_outputs
                    .insert(node_id.clone(), result.output.clone());
            } else if let Some(failure) = &result.error {
                tracing::warn!(
                    "❌ Node {} failed in flow {}: {}",
                    node_id,
                    flow.id,
                    failure.message
                );
            }
            node_results.insert(node_id.clone(), result);
        }

        let success = node_results.values().all(|r| r.success);
        tracing::info!(
            "🏁 Flow {} pass finished in {:?} (success: {})",
            flow.id,
            pass_start.elapsed(),
            success
        );

        RunResult {
            success,
            flow_id: flow.id.clone(),
            execution_id: ctx.execution_id,
            node_outputs: ctx.node_outputs,
            node_results,
            error: None,
        }
    }
}

fn failed_required_upstream(
    node: &crate::flow::types::Node,
    rules: &crate::runtime::executor::IoRules,
    bindings: &HashMap<(String, usize), String>,
    node_results: &HashMap<String, NodeExecutionResult>,
) -> Option<String> {
    for (slot, spec) in rules.inputs.iter().enumerate() {
        if !spec.required {
            continue;
        }
        let Some(source) = bindings.get(&(node.id.clone(), slot)) else {
            continue;
        };
        if node_results.get(source).is_some_and(|r| !r.success) {
            return Some(source.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{Edge, ExecutionMode, Node};
    use crate::tags::InMemoryTagProvider;
    use serde_json::json;

    fn engine() -> (FlowEngine, Arc<InMemoryTagProvider>) {
        let provider = Arc::new(InMemoryTagProvider::new());
        let tags: Arc<dyn TagProvider> = provider.clone();
        let engine = FlowEngine::new(
            Arc::new(ExecutorRegistry::with_builtins()),
            tags,
            Arc::new(FlowStateStore::new()),
            ScriptSandbox::default(),
        );
        (engine, provider)
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

    fn flow(nodes: Vec<Node>, edges: Vec<Edge>) -> FlowDefinition {
        FlowDefinition {
            id: "f1".to_string(),
            name: "engine test".to_string(),
            nodes,
            edges,
            mode: ExecutionMode::Manual,
            scan_interval_ms: 1000,
        }
    }

    fn arithmetic_flow() -> FlowDefinition {
        flow(
            vec![
                node("a", "tag_input", json!({"tag": "plant/a"})),
                node("b", "tag_input", json!({"tag": "plant/b"})),
                node(
                    "calc",
                    "script",
                    json!({"script": "return inputs.a.value + inputs.b.value", "inputs": ["a", "b"]}),
                ),
                node("out", "debug", json!({})),
            ],
            vec![
                edge("e1", "a", "calc", 0),
                edge("e2", "b", "calc", 1),
                edge("e3", "calc", "out", 0),
            ],
        )
    }

    #[tokio::test]
    async fn repeated_execution_with_stable_tags_is_identical() {
        let (engine, provider) = engine();
        provider.set("plant/a", json!(4.0));
        provider.set("plant/b", json!(9.0));
        let definition = arithmetic_flow();

        let first = engine
            .execute(&definition, ExecutionContext::new("f1"))
            .await;
        let second = engine
            .execute(&definition, ExecutionContext::new("f1"))
            .await;

        assert!(first.success);
        assert_eq!(first.node_outputs["calc"], json!(13.0));
        // Tag samples carry timestamps, so compare the computed values.
        assert_eq!(first.node_outputs["calc"], second.node_outputs["calc"]);
        assert_eq!(first.node_outputs["out"], second.node_outputs["out"]);
    }

    #[tokio::test]
    async fn cyclic_flow_is_refused_with_no_outputs() {
        let (engine, _) = engine();
        let definition = flow(
            vec![node("a", "debug", json!({})), node("b", "debug", json!({}))],
            vec![edge("e1", "a", "b", 0), edge("e2", "b", "a", 0)],
        );

        let result = engine
            .execute(&definition, ExecutionContext::new("f1"))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(result.node_outputs.is_empty());
        assert!(result.node_results.is_empty());
    }

    #[tokio::test]
    async fn failure_propagates_to_required_dependents_only() {
        let (engine, provider) = engine();
        provider.set("plant/x", json!(10.0));

        // div fails (by zero); sum requires div's output; probe is independent.
        let definition = flow(
            vec![
                node("ten", "tag_input", json!({"tag": "plant/x"})),
                node("zero", "arithmetic", json!({"operation": "add"})),
                node("div", "arithmetic", json!({"operation": "divide"})),
                node("sum", "arithmetic", json!({"operation": "add"})),
                node("probe", "debug", json!({})),
            ],
            vec![
                edge("e1", "ten", "div", 0),
                edge("e2", "zero", "div", 1),
                edge("e3", "div", "sum", 0),
                edge("e4", "zero", "sum", 1),
                edge("e5", "zero", "probe", 0),
            ],
        );

        let result = engine
            .execute(&definition, ExecutionContext::new("f1"))
            .await;

        assert!(!result.success);
        let div_failure = result.node_results["div"].error.as_ref().unwrap();
        assert_eq!(div_failure.message, "Division by zero");

        let sum_failure = result.node_results["sum"].error.as_ref().unwrap();
        assert_eq!(sum_failure.kind, FailureKind::DependencyPropagation);
        assert!(!result.node_outputs.contains_key("sum"));

        // The independent branch still ran.
        assert!(result.node_results["probe"].success);
    }

    #[tokio::test]
    async fn execution_order_diagnostic_is_deterministic() {
        let (engine, _) = engine();
        let definition = arithmetic_flow();

        let first = engine.calculate_execution_order(&definition).unwrap();
        let second = engine.calculate_execution_order(&definition).unwrap();

        let ids = |entries: &[ExecutionOrderEntry]| {
            entries
                .iter()
                .map(|e| e.node_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(ids(&first), vec!["a", "b", "calc", "out"]);
        assert_eq!(first[2].order, 2);
    }

    #[tokio::test]
    async fn manual_trigger_output_reflects_pending_firing() {
        let (engine, _) = engine();
        let definition = flow(
            vec![
                node("fire", "manual_trigger", json!({})),
                node("probe", "debug", json!({})),
            ],
            vec![edge("e1", "fire", "probe", 0)],
        );

        let idle = engine
            .execute(&definition, ExecutionContext::new("f1"))
            .await;
        assert_eq!(idle.node_outputs["fire"], json!(false));

        let fired_ctx =
            ExecutionContext::new("f1").with_trigger("manual", vec!["fire".to_string()]);
        let fired = engine.execute(&definition, fired_ctx).await;
        assert_eq!(fired.node_outputs["fire"], json!(true));
    }
}
