/// Tag data layer
///
/// Tags are named industrial data points sourced by external protocol drivers.
/// The engine only sees the `TagProvider` trait: a synchronous-looking read/write
/// surface that may fail or block inside the driver. An in-memory provider is
/// included for local runs and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Quality code conventionally meaning "good".
pub const QUALITY_GOOD: u16 = 0;

/// A tag sample: value, quality code, and the moment it was captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagValue {
    pub value: Value,
    /// Status code accompanying the value (0 = good)
    pub quality: u16,
    pub timestamp: DateTime<Utc>,
}

impl TagValue {
    /// Wrap a raw value as a good-quality sample taken now.
    pub fn good(value: Value) -> Self {
        Self {
            value,
            quality: QUALITY_GOOD,
            timestamp: Utc::now(),
        }
    }
}

/// External tag data source/sink
///
/// Implemented by driver integrations. Reads return the current sample with its
/// quality code; writes push a value down to the device. Both may fail, and the
/// engine treats every failure as node-scoped rather than fatal.
pub trait TagProvider: Send + Sync {
    fn read(&self, name: &str) -> anyhow::Result<TagValue>;
    fn write(&self, name: &str, value: Value) -> anyhow::Result<()>;
}

/// In-memory tag provider for local runs and tests
///
/// Unknown tags read as a null sample with good quality so partially-configured
/// flows stay executable during editing.
#[derive(Debug, Default)]
pub struct InMemoryTagProvider {
    tags: RwLock<HashMap<String, TagValue>>,
}

impl InMemoryTagProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tag value directly (test/setup convenience).
    pub fn set(&self, name: &str, value: Value) {
        let mut tags = self.tags.write().unwrap_or_else(|e| e.into_inner());
        tags.insert(name.to_string(), TagValue::good(value));
    }
}

impl TagProvider for InMemoryTagProvider {
    fn read(&self, name: &str) -> anyhow::Result<TagValue> {
        let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
        Ok(tags
            .get(name)
            .cloned()
            .unwrap_or_else(|| TagValue::good(Value::Null)))
    }

    fn write(&self, name: &str, value: Value) -> anyhow::Result<()> {
        let mut tags = self.tags.write().unwrap_or_else(|e| e.into_inner());
        tags.insert(name.to_string(), TagValue::good(value));
        Ok(())
    }
}

/// Per-flow persistent script state
///
/// Key/value storage scoped to one flow, surviving across scan ticks. This is
/// the only state that carries forward between ticks; execution contexts are
/// rebuilt fresh every pass.
#[derive(Debug, Default)]
pub struct FlowStateStore {
    state: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl FlowStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flow_id: &str, key: &str) -> Option<Value> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.get(flow_id).and_then(|m| m.get(key)).cloned()
    }

    pub fn set(&self, flow_id: &str, key: &str, value: Value) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .entry(flow_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Drop all persistent state for a flow (called on flow deletion).
    pub fn clear_flow(&self, flow_id: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.remove(flow_id);
    }
}
