/// Per-run execution context
///
/// A fresh context is created for every manual pass and every continuous scan
/// tick, and discarded when the pass completes. Node outputs accumulate here as
/// the pass walks the topological order, so a node can only ever observe values
/// produced earlier in its own pass.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata about the trigger that initiated a pass, if any
#[derive(Debug, Clone)]
pub struct TriggerInfo {
    /// "manual" or "schedule"
    pub kind: String,
    /// Trigger node ids consumed into this pass
    pub node_ids: Vec<String>,
}

/// Mutable per-run store of node outputs, parameters, and run metadata
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub flow_id: String,
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    /// Node id -> last produced output, populated incrementally by the engine
    pub node_outputs: HashMap<String, Value>,
    /// Runtime parameter overrides, keyed "{node_id}.{config_key}"
    pub parameters: HashMap<String, Value>,
    /// Which trigger, if any, initiated this run
    pub trigger: Option<TriggerInfo>,
    /// Test-mode write suppression: tag writes are dropped at the host boundary
    pub suppress_writes: bool,
}

impl ExecutionContext {
    /// Create a fresh context for one pass of the given flow.
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            node_outputs: HashMap::new(),
            parameters: HashMap::new(),
            trigger: None,
            suppress_writes: false,
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_trigger(mut self, kind: &str, node_ids: Vec<String>) -> Self {
        self.trigger = Some(TriggerInfo {
            kind: kind.to_string(),
            node_ids,
        });
        self
    }

    pub fn with_suppressed_writes(mut self, suppress: bool) -> Self {
        self.suppress_writes = suppress;
        self
    }

    /// True when the given trigger node fired into this pass.
    pub fn trigger_fired(&self, node_id: &str) -> bool {
        self.trigger
            .as_ref()
            .map(|t| t.node_ids.iter().any(|id| id == node_id))
            .unwrap_or(false)
    }
}
