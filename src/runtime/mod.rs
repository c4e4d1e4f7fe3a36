/// Runtime execution engine
///
/// Everything that runs a flow lives here:
/// - Deterministic topological scheduling over the flow graph
/// - Node executor dispatch and the built-in node types
/// - Per-run execution contexts and data flow between nodes
/// - The sandboxed script host with timeout enforcement
/// - Trigger coalescing and deploy/test-mode orchestration

pub mod context;
pub mod engine;
pub mod executor;
pub mod orchestrator;
pub mod scheduler;
pub mod script;
pub mod triggers;

pub use context::ExecutionContext;
pub use engine::FlowEngine;
pub use executor::{ExecutorRegistry, NodeExecutor};
pub use orchestrator::{Orchestrator, TestModeOptions};
pub use script::{ScriptDiagnostic, ScriptSandbox};
pub use triggers::TriggerCoordinator;
