/// Flow definition model, validation, and registry

pub mod params;
pub mod registry;
pub mod types;
pub mod validation;

pub use registry::{CompiledFlow, FlowRegistry};
pub use types::{
    Edge, ExecutionMode, ExecutionOrderEntry, FailureKind, FlowDefinition, Node, NodeExecutionResult,
    NodeFailure, RunResult,
};
