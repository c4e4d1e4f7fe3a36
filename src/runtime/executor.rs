/// Node executors and the type-tag registry
///
/// Each node type is an entry in the registry: a string tag mapped to an
/// object implementing `NodeExecutor`. New node types are additions to the
/// registry, not edits to a central conditional. Executors read upstream
/// values only through the execution context's node-outputs mapping, resolved
/// via the compiled `(target, input slot) -> source` binding table, and their
/// only context effect is their own declared output (recorded by the engine).

use crate::flow::types::{FailureKind, Node, NodeExecutionResult};
use crate::runtime::context::ExecutionContext;
use crate::runtime::script::{
    bool_of, number_of, FlowScriptHost, ScriptFailure, ScriptSandbox,
};
use crate::tags::{FlowStateStore, TagProvider};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Declared input slot of a node
#[derive(Debug, Clone)]
pub struct SlotSpec {
    pub name: String,
    /// Required slots must be wired for a deploy to validate;
    /// execution still tolerates missing values with documented defaults.
    pub required: bool,
}

impl SlotSpec {
    fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
        }
    }

    fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: false,
        }
    }
}

/// I/O rules of a node, evaluated against its *current* configuration
///
/// Slot counts may depend on config (a script node declares one input per
/// entry in its `inputs` list), so validation always asks the executor.
#[derive(Debug, Clone)]
pub struct IoRules {
    pub inputs: Vec<SlotSpec>,
    pub outputs: usize,
}

/// Shared services and the per-run binding table handed to executors
pub struct ExecEnv<'a> {
    /// (target node id, input slot) -> source node id, resolved once per run
    pub bindings: &'a HashMap<(String, usize), String>,
    pub tags: &'a Arc<dyn TagProvider>,
    pub state: &'a Arc<FlowStateStore>,
    pub sandbox: &'a ScriptSandbox,
}

impl ExecEnv<'_> {
    /// Resolve one input slot to the upstream node's cached output.
    ///
    /// Returns None when the slot is unwired or the upstream node has not
    /// produced a value yet; callers substitute their documented default.
    pub fn input(&self, ctx: &ExecutionContext, node_id: &str, slot: usize) -> Option<Value> {
        let source = self.bindings.get(&(node_id.to_string(), slot))?;
        ctx.node_outputs.get(source).cloned()
    }

    /// Numeric input with the documented default of 0.
    pub fn number_input(&self, ctx: &ExecutionContext, node_id: &str, slot: usize) -> f64 {
        self.input(ctx, node_id, slot)
            .map(|v| number_of(&v))
            .unwrap_or(0.0)
    }

    /// Boolean input with the documented default of false.
    pub fn bool_input(&self, ctx: &ExecutionContext, node_id: &str, slot: usize) -> bool {
        self.input(ctx, node_id, slot)
            .map(|v| bool_of(&v))
            .unwrap_or(false)
    }
}

/// One unit of work in a flow, dispatched by type tag
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// I/O rules under the node's current configuration.
    fn io_rules(&self, node: &Node) -> IoRules;

    /// Execute the node against the current context; never panics, all
    /// failures are folded into the returned result.
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult;
}

/// String-keyed registry mapping a node type tag to its executor
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry preloaded with every built-in node type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("manual_trigger", Arc::new(ManualTriggerExecutor));
        registry.register("schedule_trigger", Arc::new(ScheduleTriggerExecutor));
        registry.register("tag_input", Arc::new(TagInputExecutor));
        registry.register("tag_output", Arc::new(TagOutputExecutor));
        registry.register("arithmetic", Arc::new(ArithmeticExecutor));
        registry.register("comparison", Arc::new(ComparisonExecutor));
        registry.register("logic", Arc::new(LogicExecutor));
        registry.register("debug", Arc::new(DebugExecutor));
        registry.register("script", Arc::new(ScriptExecutor));
        registry
    }

    pub fn register(&mut self, tag: &str, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(tag.to_string(), executor);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(tag).cloned()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Manual trigger entry point: outputs whether a pending firing was consumed
/// into this pass.
pub struct ManualTriggerExecutor;

#[async_trait]
impl NodeExecutor for ManualTriggerExecutor {
    fn io_rules(&self, _node: &Node) -> IoRules {
        IoRules {
            inputs: Vec::new(),
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        NodeExecutionResult::ok(Value::Bool(ctx.trigger_fired(&node.id)))
    }
}

/// Schedule trigger entry point: fired by the orchestrator's cron jobs.
pub struct ScheduleTriggerExecutor;

#[async_trait]
impl NodeExecutor for ScheduleTriggerExecutor {
    fn io_rules(&self, _node: &Node) -> IoRules {
        IoRules {
            inputs: Vec::new(),
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        NodeExecutionResult::ok(Value::Bool(ctx.trigger_fired(&node.id)))
    }
}

/// Reads the current sample of a tag, output = { value, quality, timestamp }.
pub struct TagInputExecutor;

#[async_trait]
impl NodeExecutor for TagInputExecutor {
    fn io_rules(&self, _node: &Node) -> IoRules {
        IoRules {
            inputs: Vec::new(),
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        let Some(tag) = node.config_str(&ctx.parameters, "tag") else {
            return NodeExecutionResult::failure(
                FailureKind::Execution,
                "tag_input node missing 'tag' parameter",
            );
        };

        match env.tags.read(&tag) {
            Ok(sample) => match serde_json::to_value(&sample) {
                Ok(value) => NodeExecutionResult::ok(value),
                Err(e) => NodeExecutionResult::failure(FailureKind::Execution, e.to_string()),
            },
            Err(e) => NodeExecutionResult::failure(
                FailureKind::Execution,
                format!("tag read failed for '{}': {}", tag, e),
            ),
        }
    }
}

/// Writes its input value to a tag. Under test-mode write suppression the node
/// still executes and produces a result, but the write is dropped here at the
/// host boundary.
pub struct TagOutputExecutor;

#[async_trait]
impl NodeExecutor for TagOutputExecutor {
    fn io_rules(&self, _node: &Node) -> IoRules {
        IoRules {
            inputs: vec![SlotSpec::required("value")],
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        let Some(tag) = node.config_str(&ctx.parameters, "tag") else {
            return NodeExecutionResult::failure(
                FailureKind::Execution,
                "tag_output node missing 'tag' parameter",
            );
        };

        let value = env.input(ctx, &node.id, 0).unwrap_or(Value::Null);

        if ctx.suppress_writes {
            tracing::info!(
                flow_id = %ctx.flow_id,
                node_id = %node.id,
                tag = %tag,
                "🧪 Test mode: suppressed tag write"
            );
            return NodeExecutionResult::ok(json!({
                "written": false,
                "suppressed": true,
                "tag": tag,
                "value": value,
            }));
        }

        match env.tags.write(&tag, value.clone()) {
            Ok(()) => NodeExecutionResult::ok(json!({
                "written": true,
                "tag": tag,
                "value": value,
            })),
            Err(e) => NodeExecutionResult::failure(
                FailureKind::Execution,
                format!("tag write failed for '{}': {}", tag, e),
            ),
        }
    }
}

/// Add/subtract/multiply/divide over two numeric inputs.
///
/// Divide is the one arithmetic operation with a defined failure mode: a
/// divisor within machine epsilon of zero yields "Division by zero".
pub struct ArithmeticExecutor;

#[async_trait]
impl NodeExecutor for ArithmeticExecutor {
    fn io_rules(&self, _node: &Node) -> IoRules {
        IoRules {
            inputs: vec![SlotSpec::required("a"), SlotSpec::required("b")],
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        let operation = node
            .config_str(&ctx.parameters, "operation")
            .unwrap_or_else(|| "add".to_string());
        let a = env.number_input(ctx, &node.id, 0);
        let b = env.number_input(ctx, &node.id, 1);

        let result = match operation.as_str() {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b.abs() <= f64::EPSILON {
                    return NodeExecutionResult::failure(
                        FailureKind::Execution,
                        "Division by zero",
                    );
                }
                a / b
            }
            other => {
                return NodeExecutionResult::failure(
                    FailureKind::Execution,
                    format!("unknown arithmetic operation '{}'", other),
                );
            }
        };

        NodeExecutionResult::ok(json!(result))
    }
}

/// equal / greater / less over two numeric inputs, boolean output.
pub struct ComparisonExecutor;

#[async_trait]
impl NodeExecutor for ComparisonExecutor {
    fn io_rules(&self, _node: &Node) -> IoRules {
        IoRules {
            inputs: vec![SlotSpec::required("a"), SlotSpec::required("b")],
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        let operation = node
            .config_str(&ctx.parameters, "operation")
            .unwrap_or_else(|| "equal".to_string());
        let a = env.number_input(ctx, &node.id, 0);
        let b = env.number_input(ctx, &node.id, 1);

        let result = match operation.as_str() {
            "equal" => (a - b).abs() <= f64::EPSILON,
            "greater" => a > b,
            "less" => a < b,
            other => {
                return NodeExecutionResult::failure(
                    FailureKind::Execution,
                    format!("unknown comparison operation '{}'", other),
                );
            }
        };

        NodeExecutionResult::ok(Value::Bool(result))
    }
}

/// and / or / not over boolean inputs. `not` declares a single input slot.
pub struct LogicExecutor;

#[async_trait]
impl NodeExecutor for LogicExecutor {
    fn io_rules(&self, node: &Node) -> IoRules {
        let operation = node
            .config
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("and");
        let inputs = if operation == "not" {
            vec![SlotSpec::required("a")]
        } else {
            vec![SlotSpec::required("a"), SlotSpec::required("b")]
        };
        IoRules { inputs, outputs: 1 }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        let operation = node
            .config_str(&ctx.parameters, "operation")
            .unwrap_or_else(|| "and".to_string());
        let a = env.bool_input(ctx, &node.id, 0);

        let result = match operation.as_str() {
            "and" => a && env.bool_input(ctx, &node.id, 1),
            "or" => a || env.bool_input(ctx, &node.id, 1),
            "not" => !a,
            other => {
                return NodeExecutionResult::failure(
                    FailureKind::Execution,
                    format!("unknown logic operation '{}'", other),
                );
            }
        };

        NodeExecutionResult::ok(Value::Bool(result))
    }
}

/// Debug/log sink: logs its input through the run's event stream and passes
/// the value through unchanged.
pub struct DebugExecutor;

#[async_trait]
impl NodeExecutor for DebugExecutor {
    fn io_rules(&self, _node: &Node) -> IoRules {
        IoRules {
            inputs: vec![SlotSpec::optional("value")],
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        let value = env.input(ctx, &node.id, 0).unwrap_or(Value::Null);
        let label = node
            .config_str(&ctx.parameters, "label")
            .unwrap_or_else(|| node.id.clone());

        tracing::info!(
            flow_id = %ctx.flow_id,
            execution_id = %ctx.execution_id,
            node_id = %node.id,
            "🐛 {}: {}",
            label,
            value
        );

        NodeExecutionResult::ok(value)
    }
}

/// Embedded script node: runs one Lua fragment in the sandbox.
///
/// Declares one input slot per entry in its `inputs` config list; resolved
/// values are exposed to the script under those names.
pub struct ScriptExecutor;

impl ScriptExecutor {
    fn input_names(node: &Node) -> Vec<String> {
        node.config
            .get("inputs")
            .and_then(|v| v.as_array())
            .map(|names| {
                names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| {
                        n.as_str()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| format!("input{}", i))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeExecutor for ScriptExecutor {
    fn io_rules(&self, node: &Node) -> IoRules {
        IoRules {
            inputs: Self::input_names(node)
                .iter()
                .map(|name| SlotSpec::optional(name))
                .collect(),
            outputs: 1,
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        env: &ExecEnv<'_>,
    ) -> NodeExecutionResult {
        let Some(code) = node.config_str(&ctx.parameters, "script") else {
            return NodeExecutionResult::failure(
                FailureKind::Execution,
                "script node missing 'script' parameter",
            );
        };

        let mut inputs = HashMap::new();
        for (slot, name) in Self::input_names(node).into_iter().enumerate() {
            let value = env.input(ctx, &node.id, slot).unwrap_or(Value::Null);
            inputs.insert(name, value);
        }

        let host = Arc::new(FlowScriptHost {
            flow_id: ctx.flow_id.clone(),
            node_id: node.id.clone(),
            tags: Arc::clone(env.tags),
            state: Arc::clone(env.state),
            suppress_writes: ctx.suppress_writes,
        });

        match env.sandbox.execute(&code, inputs, host).await {
            Ok(value) => NodeExecutionResult::ok(value),
            Err(ScriptFailure::Compile(msg)) => NodeExecutionResult::failure(
                FailureKind::ScriptCompile,
                format!("script compile error: {}", msg),
            ),
            Err(ScriptFailure::Runtime(msg)) => NodeExecutionResult::failure(
                FailureKind::ScriptRuntime,
                format!("script runtime error: {}", msg),
            ),
            Err(ScriptFailure::Timeout(limit)) => NodeExecutionResult::failure(
                FailureKind::ScriptTimeout,
                format!("script exceeded its {}ms budget", limit.as_millis()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::InMemoryTagProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        inner: InMemoryTagProvider,
        writes: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: InMemoryTagProvider::new(),
                writes: AtomicUsize::new(0),
            }
        }
    }

    impl TagProvider for CountingProvider {
        fn read(&self, name: &str) -> anyhow::Result<crate::tags::TagValue> {
            self.inner.read(name)
        }
        fn write(&self, name: &str, value: Value) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(name, value)
        }
    }

    struct Fixture {
        bindings: HashMap<(String, usize), String>,
        tags: Arc<dyn TagProvider>,
        state: Arc<FlowStateStore>,
        sandbox: ScriptSandbox,
    }

    impl Fixture {
        fn new(tags: Arc<dyn TagProvider>) -> Self {
            Self {
                bindings: HashMap::new(),
                tags,
                state: Arc::new(FlowStateStore::new()),
                sandbox: ScriptSandbox::default(),
            }
        }

        fn bind(&mut self, target: &str, slot: usize, source: &str) {
            self.bindings
                .insert((target.to_string(), slot), source.to_string());
        }

        fn env(&self) -> ExecEnv<'_> {
            ExecEnv {
                bindings: &self.bindings,
                tags: &self.tags,
                state: &self.state,
                sandbox: &self.sandbox,
            }
        }
    }

    fn node(id: &str, node_type: &str, config: Value) -> Node {
        Node {
            id: id.to_string(),
            node_type: node_type.to_string(),
            position: Value::Null,
            config,
        }
    }

    #[tokio::test]
    async fn divide_by_zero_fails_with_documented_message() {
        let mut fixture = Fixture::new(Arc::new(InMemoryTagProvider::new()));
        fixture.bind("div", 0, "a");
        fixture.bind("div", 1, "b");

        let mut ctx = ExecutionContext::new("flow");
        ctx.node_outputs.insert("a".to_string(), json!(10.0));
        ctx.node_outputs.insert("b".to_string(), json!(0.0));

        let div = node("div", "arithmetic", json!({"operation": "divide"}));
        let result = ArithmeticExecutor.execute(&div, &ctx, &fixture.env()).await;

        assert!(!result.success);
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert_eq!(failure.message, "Division by zero");
    }

    #[tokio::test]
    async fn divide_ten_by_five_is_two() {
        let mut fixture = Fixture::new(Arc::new(InMemoryTagProvider::new()));
        fixture.bind("div", 0, "a");
        fixture.bind("div", 1, "b");

        let mut ctx = ExecutionContext::new("flow");
        ctx.node_outputs.insert("a".to_string(), json!(10.0));
        ctx.node_outputs.insert("b".to_string(), json!(5.0));

        let div = node("div", "arithmetic", json!({"operation": "divide"}));
        let result = ArithmeticExecutor.execute(&div, &ctx, &fixture.env()).await;

        assert!(result.success);
        assert_eq!(number_of(&result.output), 2.0);
    }

    #[tokio::test]
    async fn unwired_inputs_default_to_zero_and_false() {
        let fixture = Fixture::new(Arc::new(InMemoryTagProvider::new()));
        let ctx = ExecutionContext::new("flow");

        let add = node("sum", "arithmetic", json!({"operation": "add"}));
        let result = ArithmeticExecutor.execute(&add, &ctx, &fixture.env()).await;
        assert!(result.success);
        assert_eq!(number_of(&result.output), 0.0);

        let gate = node("gate", "logic", json!({"operation": "or"}));
        let result = LogicExecutor.execute(&gate, &ctx, &fixture.env()).await;
        assert!(result.success);
        assert_eq!(result.output, Value::Bool(false));
    }

    #[tokio::test]
    async fn comparison_and_logic_compose() {
        let mut fixture = Fixture::new(Arc::new(InMemoryTagProvider::new()));
        fixture.bind("cmp", 0, "a");
        fixture.bind("cmp", 1, "b");

        let mut ctx = ExecutionContext::new("flow");
        ctx.node_outputs.insert("a".to_string(), json!(7.0));
        ctx.node_outputs.insert("b".to_string(), json!(3.0));

        let cmp = node("cmp", "comparison", json!({"operation": "greater"}));
        let result = ComparisonExecutor.execute(&cmp, &ctx, &fixture.env()).await;
        assert_eq!(result.output, Value::Bool(true));

        fixture.bind("inv", 0, "cmp");
        ctx.node_outputs.insert("cmp".to_string(), result.output);
        let inv = node("inv", "logic", json!({"operation": "not"}));
        let result = LogicExecutor.execute(&inv, &ctx, &fixture.env()).await;
        assert_eq!(result.output, Value::Bool(false));
    }

    #[tokio::test]
    async fn suppressed_tag_output_executes_without_writing() {
        let provider = Arc::new(CountingProvider::new());
        let tags: Arc<dyn TagProvider> = provider.clone();
        let mut fixture = Fixture::new(tags);
        fixture.bind("out", 0, "src");

        let mut ctx = ExecutionContext::new("flow").with_suppressed_writes(true);
        ctx.node_outputs.insert("src".to_string(), json!(99.0));

        let out = node("out", "tag_output", json!({"tag": "plant/setpoint"}));
        let result = TagOutputExecutor.execute(&out, &ctx, &fixture.env()).await;

        assert!(result.success);
        assert_eq!(result.output["suppressed"], json!(true));
        assert_eq!(provider.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tag_input_reads_sample_with_quality() {
        let provider = Arc::new(InMemoryTagProvider::new());
        provider.set("plant/temp", json!(21.5));
        let fixture = Fixture::new(provider);
        let ctx = ExecutionContext::new("flow");

        let input = node("in", "tag_input", json!({"tag": "plant/temp"}));
        let result = TagInputExecutor.execute(&input, &ctx, &fixture.env()).await;

        assert!(result.success);
        assert_eq!(result.output["value"], json!(21.5));
        assert_eq!(result.output["quality"], json!(0));
    }

    #[tokio::test]
    async fn parameters_override_node_config() {
        let provider = Arc::new(InMemoryTagProvider::new());
        provider.set("plant/alt", json!(5.0));
        let fixture = Fixture::new(provider);

        let mut ctx = ExecutionContext::new("flow");
        ctx.parameters
            .insert("in.tag".to_string(), json!("plant/alt"));

        let input = node("in", "tag_input", json!({"tag": "plant/main"}));
        let result = TagInputExecutor.execute(&input, &ctx, &fixture.env()).await;
        assert_eq!(result.output["value"], json!(5.0));
    }

    #[tokio::test]
    async fn script_node_sees_named_inputs() {
        let mut fixture = Fixture::new(Arc::new(InMemoryTagProvider::new()));
        fixture.bind("calc", 0, "x");
        fixture.bind("calc", 1, "y");

        let mut ctx = ExecutionContext::new("flow");
        ctx.node_outputs.insert("x".to_string(), json!(6.0));
        ctx.node_outputs.insert("y".to_string(), json!(7.0));

        let script = node(
            "calc",
            "script",
            json!({"script": "return inputs.x * inputs.y", "inputs": ["x", "y"]}),
        );
        let result = ScriptExecutor.execute(&script, &ctx, &fixture.env()).await;

        assert!(result.success, "unexpected failure: {:?}", result.error);
        assert_eq!(number_of(&result.output), 42.0);
    }

    #[tokio::test]
    async fn script_compile_error_is_classified() {
        let fixture = Fixture::new(Arc::new(InMemoryTagProvider::new()));
        let ctx = ExecutionContext::new("flow");

        let script = node("bad", "script", json!({"script": "return (1 +"}));
        let result = ScriptExecutor.execute(&script, &ctx, &fixture.env()).await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, FailureKind::ScriptCompile);
    }
}
