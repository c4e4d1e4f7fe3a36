/// Embedded Lua script sandbox
///
/// Executes one user code fragment per script node against a fixed capability
/// surface: tag reads (raw plus typed accessors), tag writes (dropped at this
/// boundary under test-mode write suppression), per-flow persistent state,
/// logging, and UTC time. Lua's math/string/table libraries stay available as
/// general helpers; os/io/debug/package and the load family are stripped.
///
/// Execution is wall-clock bounded and genuinely cancellable: an instruction
/// hook checks the deadline mid-flight and aborts the VM, independent of the
/// outer tokio timeout. Compile failures, runtime failures, and timeouts are
/// distinct outcomes, all surfaced as node-scoped failures rather than faults.

use crate::tags::{FlowStateStore, TagProvider, TagValue};
use chrono::{DateTime, Utc};
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Instruction count between deadline checks.
const HOOK_GRANULARITY: u32 = 2048;

/// Marker threaded through the hook error so a VM abort is recognizable
/// as a timeout rather than a script bug.
const TIMEOUT_MARKER: &str = "__tagflow_script_deadline__";

/// Fixed capability surface exposed to sandboxed scripts
///
/// Host-boundary enforcement lives in the implementation: write suppression is
/// a property of the host, not something script code can bypass.
pub trait ScriptHost: Send + Sync {
    fn read_tag(&self, name: &str) -> anyhow::Result<TagValue>;
    fn write_tag(&self, name: &str, value: Value) -> anyhow::Result<()>;
    fn get_state(&self, key: &str) -> Option<Value>;
    fn set_state(&self, key: &str, value: Value);
    fn log(&self, message: &str);
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Production host bound to one flow's tag provider and persistent state
pub struct FlowScriptHost {
    pub flow_id: String,
    pub node_id: String,
    pub tags: Arc<dyn TagProvider>,
    pub state: Arc<FlowStateStore>,
    /// Test-mode write suppression: writes are logged and dropped here.
    pub suppress_writes: bool,
}

impl ScriptHost for FlowScriptHost {
    fn read_tag(&self, name: &str) -> anyhow::Result<TagValue> {
        self.tags.read(name)
    }

    fn write_tag(&self, name: &str, value: Value) -> anyhow::Result<()> {
        if self.suppress_writes {
            tracing::info!(
                flow_id = %self.flow_id,
                node_id = %self.node_id,
                tag = %name,
                "🧪 Test mode: suppressed script tag write"
            );
            return Ok(());
        }
        self.tags.write(name, value)
    }

    fn get_state(&self, key: &str) -> Option<Value> {
        self.state.get(&self.flow_id, key)
    }

    fn set_state(&self, key: &str, value: Value) {
        self.state.set(&self.flow_id, key, value);
    }

    fn log(&self, message: &str) {
        tracing::info!(
            flow_id = %self.flow_id,
            node_id = %self.node_id,
            "📜 script: {}",
            message
        );
    }
}

/// Inert host used by the compile-only validation path
///
/// Exposes the identical capability surface without ever touching tags or
/// state, so validating a script can never cause side effects.
struct ValidationHost;

impl ScriptHost for ValidationHost {
    fn read_tag(&self, _name: &str) -> anyhow::Result<TagValue> {
        Ok(TagValue::good(Value::Null))
    }
    fn write_tag(&self, _name: &str, _value: Value) -> anyhow::Result<()> {
        Ok(())
    }
    fn get_state(&self, _key: &str) -> Option<Value> {
        None
    }
    fn set_state(&self, _key: &str, _value: Value) {}
    fn log(&self, _message: &str) {}
}

/// How a script execution failed
#[derive(Debug, Clone)]
pub enum ScriptFailure {
    /// The code did not compile (syntax error)
    Compile(String),
    /// The code raised an error while running
    Runtime(String),
    /// The code exceeded its wall-clock budget
    Timeout(Duration),
}

/// Severity of a validation diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

/// One diagnostic from the compile-only validation path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDiagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// Sandbox runner with a fixed wall-clock budget per execution
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    timeout: Duration,
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ScriptSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute one script fragment with the given resolved input bindings.
    ///
    /// The Lua VM runs on a blocking worker so a busy script never stalls the
    /// scan loop; the instruction hook interrupts it once the deadline passes.
    pub async fn execute(
        &self,
        code: &str,
        inputs: HashMap<String, Value>,
        host: Arc<dyn ScriptHost>,
    ) -> Result<Value, ScriptFailure> {
        let code = code.to_string();
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;

        let handle =
            tokio::task::spawn_blocking(move || run_blocking(&code, inputs, host, deadline, timeout));

        // Small grace so the in-VM hook gets to report the timeout itself;
        // the outer timeout only catches scripts stuck inside a host call.
        match tokio::time::timeout(timeout + Duration::from_millis(250), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ScriptFailure::Runtime(format!(
                "script task aborted: {join_err}"
            ))),
            Err(_) => Err(ScriptFailure::Timeout(timeout)),
        }
    }

    /// Compile-only validation against the identical capability surface.
    ///
    /// Never executes the code. Returns an empty list when the script is valid.
    pub fn validate(&self, code: &str) -> Vec<ScriptDiagnostic> {
        let lua = Lua::new();
        if let Err(e) = install_capabilities(&lua, &HashMap::new(), Arc::new(ValidationHost)) {
            return vec![diagnostic_from_message(&e.to_string())];
        }

        match lua.load(code).set_name("flow-script").into_function() {
            Ok(_) => Vec::new(),
            Err(mlua::Error::SyntaxError { message, .. }) => {
                vec![diagnostic_from_message(&message)]
            }
            Err(e) => vec![diagnostic_from_message(&e.to_string())],
        }
    }
}

fn run_blocking(
    code: &str,
    inputs: HashMap<String, Value>,
    host: Arc<dyn ScriptHost>,
    deadline: Instant,
    timeout: Duration,
) -> Result<Value, ScriptFailure> {
    let lua = Lua::new();
    install_capabilities(&lua, &inputs, host)
        .map_err(|e| ScriptFailure::Runtime(format!("failed to set up sandbox: {e}")))?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_GRANULARITY),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError(TIMEOUT_MARKER.to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let func = match lua.load(code).set_name("flow-script").into_function() {
        Ok(f) => f,
        Err(mlua::Error::SyntaxError { message, .. }) => {
            return Err(ScriptFailure::Compile(message));
        }
        Err(e) => return Err(ScriptFailure::Compile(e.to_string())),
    };

    match func.call::<mlua::Value>(()) {
        Ok(value) => lua_to_json(value).map_err(ScriptFailure::Runtime),
        Err(e) => {
            let message = e.to_string();
            if message.contains(TIMEOUT_MARKER) {
                Err(ScriptFailure::Timeout(timeout))
            } else {
                Err(ScriptFailure::Runtime(message))
            }
        }
    }
}

/// Install the capability surface and strip every escape hatch.
fn install_capabilities(
    lua: &Lua,
    inputs: &HashMap<String, Value>,
    host: Arc<dyn ScriptHost>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    // Remove dangerous globals; math/string/table remain as helpers.
    for name in [
        "os",
        "io",
        "debug",
        "package",
        "require",
        "dofile",
        "loadfile",
        "load",
        "loadstring",
        "collectgarbage",
    ] {
        globals.set(name, mlua::Nil)?;
    }

    // Resolved input bindings under their stable names.
    globals.set("inputs", lua.to_value(inputs)?)?;

    let h = Arc::clone(&host);
    globals.set(
        "read_tag",
        lua.create_function(move |lua, name: String| {
            let sample = h.read_tag(&name).map_err(mlua::Error::external)?;
            lua.to_value(&sample)
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "read_double",
        lua.create_function(move |_, name: String| {
            let sample = h.read_tag(&name).map_err(mlua::Error::external)?;
            Ok(number_of(&sample.value))
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "read_int",
        lua.create_function(move |_, name: String| {
            let sample = h.read_tag(&name).map_err(mlua::Error::external)?;
            Ok(number_of(&sample.value) as i64)
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "read_bool",
        lua.create_function(move |_, name: String| {
            let sample = h.read_tag(&name).map_err(mlua::Error::external)?;
            Ok(bool_of(&sample.value))
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "read_string",
        lua.create_function(move |_, name: String| {
            let sample = h.read_tag(&name).map_err(mlua::Error::external)?;
            Ok(string_of(&sample.value))
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "write_tag",
        lua.create_function(move |_, (name, value): (String, mlua::Value)| {
            let json = lua_to_json(value).map_err(mlua::Error::RuntimeError)?;
            h.write_tag(&name, json).map_err(mlua::Error::external)?;
            Ok(())
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "write_tags",
        lua.create_function(move |_, batch: mlua::Table| {
            for pair in batch.pairs::<String, mlua::Value>() {
                let (name, value) = pair?;
                let json = lua_to_json(value).map_err(mlua::Error::RuntimeError)?;
                h.write_tag(&name, json).map_err(mlua::Error::external)?;
            }
            Ok(())
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "get_state",
        lua.create_function(move |lua, key: String| match h.get_state(&key) {
            Some(value) => lua.to_value(&value),
            None => Ok(mlua::Nil),
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "set_state",
        lua.create_function(move |_, (key, value): (String, mlua::Value)| {
            let json = lua_to_json(value).map_err(mlua::Error::RuntimeError)?;
            h.set_state(&key, json);
            Ok(())
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "log",
        lua.create_function(move |_, message: String| {
            h.log(&message);
            Ok(())
        })?,
    )?;

    let h = Arc::clone(&host);
    globals.set(
        "now",
        lua.create_function(move |_, ()| Ok(h.now().to_rfc3339()))?,
    )?;

    Ok(())
}

/// Convert a Lua value into JSON.
///
/// Tables with dense 1..n integer keys become arrays, everything else becomes
/// an object; unsupported value kinds (functions, userdata) become null.
pub fn lua_to_json(value: mlua::Value) -> Result<Value, String> {
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => Ok(Value::String(
            s.to_str().map_err(|e| e.to_string())?.to_string(),
        )),
        mlua::Value::Table(table) => {
            let mut max_index = 0usize;
            let mut count = 0usize;
            let mut is_array = true;
            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| e.to_string())?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => {
                        max_index = max_index.max(i as usize);
                    }
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut arr = Vec::with_capacity(count);
                for i in 1..=max_index {
                    let item: mlua::Value = table.get(i).map_err(|e| e.to_string())?;
                    arr.push(lua_to_json(item)?);
                }
                Ok(Value::Array(arr))
            } else {
                let mut obj = serde_json::Map::new();
                for pair in table.pairs::<mlua::Value, mlua::Value>() {
                    let (key, value) = pair.map_err(|e| e.to_string())?;
                    let key = match key {
                        mlua::Value::String(s) => {
                            s.to_str().map_err(|e| e.to_string())?.to_string()
                        }
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(f) => f.to_string(),
                        _ => continue,
                    };
                    obj.insert(key, lua_to_json(value)?);
                }
                Ok(Value::Object(obj))
            }
        }
        _ => Ok(Value::Null),
    }
}

/// Numeric coercion shared with the arithmetic executors: numbers pass
/// through, booleans map to 0/1, numeric strings parse, tag samples use their
/// "value" field, everything else defaults to 0.
pub fn number_of(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
        Value::Object(obj) => obj.get("value").map(number_of).unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Boolean coercion: booleans pass through, nonzero numbers are true,
/// "true"/"false" strings parse, tag samples use their "value" field.
pub fn bool_of(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Object(obj) => obj.get("value").map(bool_of).unwrap_or(false),
        _ => false,
    }
}

/// String coercion used by the typed tag accessor.
pub fn string_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(obj) => obj.get("value").map(string_of).unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Best-effort extraction of "line N" from a Lua error message like
/// `[string "flow-script"]:2: '=' expected`.
fn diagnostic_from_message(message: &str) -> ScriptDiagnostic {
    let line = message
        .split("]:")
        .nth(1)
        .and_then(|rest| rest.split(':').next())
        .and_then(|n| n.trim().parse::<u32>().ok())
        .unwrap_or(1);

    ScriptDiagnostic {
        severity: DiagnosticSeverity::Error,
        message: message.to_string(),
        start_line: line,
        start_column: 0,
        end_line: line,
        end_column: 0,
    }
}
