/// Core flow type definitions
///
/// Defines the fundamental structures for flows, nodes, and edges. A flow is a
/// user-authored node/edge graph describing a telemetry processing pipeline.
/// These types are serialized/deserialized from JSON and consumed by the engine
/// as an immutable snapshot per run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A complete flow definition containing nodes and their connections
///
/// The editing surface owns creation and mutation; the engine takes a snapshot
/// at deploy or run-start and never observes concurrent edits mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Unique flow identifier (e.g., "flow-boiler-trim")
    pub id: String,
    /// Human-readable flow name
    pub name: String,
    /// List of nodes in this flow
    pub nodes: Vec<Node>,
    /// List of edges connecting nodes
    pub edges: Vec<Edge>,
    /// How the flow runs: one pass on demand, or a repeating scan cycle
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Scan interval in milliseconds (continuous mode only)
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

fn default_scan_interval_ms() -> u64 {
    1000
}

/// Execution mode of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One pass through the topological order per invocation
    #[default]
    Manual,
    /// Repeating scan cycle at the configured interval (requires deploy or test mode)
    Continuous,
}

/// A single node in the flow graph
///
/// Nodes are dispatched by their type tag to an executor from the registry.
/// The `config` object is free-form and interpreted by the executor; slot
/// counts may depend on it (a script node declares one input slot per entry
/// in its `inputs` config list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the flow (e.g., "n1", "divide-rate")
    pub id: String,
    /// Type tag resolved through the executor registry
    pub node_type: String,
    /// Editor canvas position, opaque to the engine
    #[serde(default)]
    pub position: Value,
    /// Node-specific configuration as flexible JSON
    #[serde(default)]
    pub config: Value,
}

impl Node {
    /// Read a config key, honoring runtime parameter overrides first.
    ///
    /// Parameters are keyed `"{node_id}.{key}"` in the execution context and
    /// take precedence over the node's stored configuration.
    pub fn config_value(&self, overrides: &HashMap<String, Value>, key: &str) -> Option<Value> {
        if let Some(v) = overrides.get(&format!("{}.{}", self.id, key)) {
            return Some(v.clone());
        }
        self.config.get(key).cloned()
    }

    pub fn config_str(&self, overrides: &HashMap<String, Value>, key: &str) -> Option<String> {
        self.config_value(overrides, key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }
}

/// Connection between two nodes in the flow graph
///
/// Edges are the sole source of inter-node dependency: the source node must
/// execute before the target. Slot indices select which declared input/output
/// the connection attaches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    /// Source node ID
    pub source: String,
    /// Output slot index on the source node
    #[serde(default)]
    pub source_slot: usize,
    /// Target node ID
    pub target: String,
    /// Input slot index on the target node
    #[serde(default)]
    pub target_slot: usize,
}

/// Classification of a node-scoped failure
///
/// `ScriptTimeout` is kept distinct from `ScriptRuntime` so tooling can tell
/// "too slow" apart from "wrong".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Generic execution failure (divide-by-zero, tag provider error, ...)
    Execution,
    /// The embedded script failed to compile
    ScriptCompile,
    /// The embedded script raised an error at runtime
    ScriptRuntime,
    /// The embedded script exceeded its wall-clock budget
    ScriptTimeout,
    /// A required upstream value is missing because that upstream node failed
    DependencyPropagation,
}

/// Result of executing a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub success: bool,
    /// Output value produced by the node (null on failure)
    pub output: Value,
    /// Failure detail, present iff `success` is false
    pub error: Option<NodeFailure>,
}

/// Failure detail attached to a failed node result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl NodeExecutionResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(NodeFailure {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// Result of one full pass through a flow
///
/// A failed pass still enumerates which nodes succeeded or failed and why;
/// `error` carries only top-level refusals surfaced before any node ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// True iff every executed node succeeded
    pub success: bool,
    /// Flow id this pass ran against
    pub flow_id: String,
    /// Execution id of the pass
    pub execution_id: String,
    /// Final node-outputs mapping (node id -> last produced value)
    pub node_outputs: HashMap<String, Value>,
    /// Per-node results, including failures and their classification
    pub node_results: HashMap<String, NodeExecutionResult>,
    /// Top-level error (e.g., cycle detected), never set when nodes ran
    pub error: Option<String>,
}

/// One entry of the "show execution order" diagnostic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOrderEntry {
    pub node_id: String,
    pub order: usize,
}
