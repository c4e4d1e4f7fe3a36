/// Tagflow: flow execution engine for industrial tag telemetry
///
/// Interprets user-authored node/edge graphs that read industrial tag values,
/// transform them, and optionally write results back. Provides deterministic
/// topological scheduling, a sandboxed script node with genuine timeouts,
/// trigger coalescing, and a deploy/undeploy/test-mode lifecycle.

// Core configuration and setup
pub mod config;

// Engine error taxonomy
pub mod error;

// Flow model layer - definitions, validation, compiled registry, parameters
pub mod flow;

// Runtime execution engine - scheduling, executors, sandbox, orchestration
pub mod runtime;

// Tag data layer - provider trait, in-memory provider, per-flow script state
pub mod tags;

// HTTP API layer - REST endpoints for flow management and execution
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::EngineError;
pub use flow::{Edge, FlowDefinition, FlowRegistry, Node, RunResult};
pub use runtime::{FlowEngine, Orchestrator, TestModeOptions};
pub use server::start_server;
pub use tags::{TagProvider, TagValue};
