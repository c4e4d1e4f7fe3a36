/// Exposed-parameter declarations
///
/// A node opts configuration keys into runtime override by listing them under
/// an `expose` array in its configuration. Declarations are derived from the
/// definition on demand; persistence of chosen values lives outside the engine.

use crate::flow::types::FlowDefinition;
use serde::Serialize;
use serde_json::Value;

/// One overridable configuration entry, addressed as "{node_id}.{key}"
#[derive(Debug, Clone, Serialize)]
pub struct ParameterDecl {
    /// Fully-qualified override key
    pub name: String,
    pub node_id: String,
    pub key: String,
    /// Current configured value, used as the default when no override is set
    pub default: Value,
}

/// Collect every exposed parameter a flow's nodes declare.
pub fn exposed_parameters(flow: &FlowDefinition) -> Vec<ParameterDecl> {
    let mut declared = Vec::new();

    for node in &flow.nodes {
        let Some(exposed) = node.config.get("expose").and_then(|v| v.as_array()) else {
            continue;
        };
        for key in exposed.iter().filter_map(|k| k.as_str()) {
            declared.push(ParameterDecl {
                name: format!("{}.{}", node.id, key),
                node_id: node.id.clone(),
                key: key.to_string(),
                default: node.config.get(key).cloned().unwrap_or(Value::Null),
            });
        }
    }

    declared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{ExecutionMode, Node};
    use serde_json::json;

    #[test]
    fn only_listed_keys_are_exposed() {
        let flow = FlowDefinition {
            id: "f1".to_string(),
            name: "params".to_string(),
            nodes: vec![Node {
                id: "limit".to_string(),
                node_type: "comparison".to_string(),
                position: json!(null),
                config: json!({
                    "operation": "greater",
                    "threshold": 80.0,
                    "expose": ["threshold"]
                }),
            }],
            edges: vec![],
            mode: ExecutionMode::Manual,
            scan_interval_ms: 1000,
        };

        let params = exposed_parameters(&flow);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "limit.threshold");
        assert_eq!(params[0].default, json!(80.0));
    }
}
