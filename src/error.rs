/// Engine error taxonomy
///
/// Graph-level validation errors are fatal before any node runs: a flow with a
/// cycle, a dangling edge, or an unconnected required input is refused outright
/// at deploy or run-start. Node-scoped failures never surface here; they are
/// captured per node in `NodeExecutionResult` so a pass can keep going.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The flow graph is not a DAG. Names every node that never reached
    /// zero in-degree, not just an arbitrary member of the cycle.
    #[error("flow contains a cycle involving nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("edge '{edge_id}' references unknown node '{node_id}'")]
    UnknownNode { edge_id: String, node_id: String },

    #[error("duplicate node id '{0}' in flow definition")]
    DuplicateNodeId(String),

    #[error(
        "edge '{edge_id}' targets input slot {slot} but node '{node_id}' declares {declared} input slot(s)"
    )]
    InputSlotOutOfBounds {
        edge_id: String,
        node_id: String,
        slot: usize,
        declared: usize,
    },

    #[error(
        "edge '{edge_id}' sources output slot {slot} but node '{node_id}' declares {declared} output slot(s)"
    )]
    OutputSlotOutOfBounds {
        edge_id: String,
        node_id: String,
        slot: usize,
        declared: usize,
    },

    #[error("node '{node_id}' required input '{input}' is not connected")]
    MissingRequiredInput { node_id: String, input: String },

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow '{0}' is not deployed")]
    NotDeployed(String),

    #[error("node '{node_id}' in flow '{flow_id}' is not a manual trigger")]
    NotATrigger { flow_id: String, node_id: String },

    #[error("test mode is not active for flow '{0}'")]
    TestModeNotActive(String),

    #[error("invalid schedule expression '{expression}' on node '{node_id}': {reason}")]
    InvalidSchedule {
        node_id: String,
        expression: String,
        reason: String,
    },

    #[error("scheduler error: {0}")]
    Scheduler(String),
}
