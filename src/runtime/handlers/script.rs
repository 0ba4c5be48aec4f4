/// Lua script node
///
/// Expected params: `{ "script": "return { total = inputs.a.n + 1 }" }`
///
/// The script sees `inputs` (direct upstream outputs keyed by node id),
/// `items` (the same outputs in dependency order), `params` (the node config)
/// and `payload`, plus the `date`, `time` and `now` helpers. Only the
/// `table`, `string`, `math` and `utf8` libraries are loaded, and the base
/// library's loaders are removed. Each run gets a fresh interpreter on the
/// blocking pool; a cancelled run aborts the script at the next hook check.

use crate::runtime::handler::{NodeContext, SimpleHandler};
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, VmState};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const MEMORY_LIMIT_BYTES: usize = 32 * 1024 * 1024;
const CANCEL_CHECK_INSTRUCTIONS: u32 = 10_000;

/// Base-library globals that reach the filesystem, the module loader or the
/// collector
const BLOCKED_GLOBALS: [&str; 8] = [
    "require",
    "dofile",
    "loadfile",
    "load",
    "loadstring",
    "collectgarbage",
    "package",
    "debug",
];

#[derive(Debug, Default)]
pub struct ScriptHandler;

#[async_trait]
impl SimpleHandler for ScriptHandler {
    async fn execute(&self, node: &Node, context: &NodeContext) -> Result<Value> {
        let script = context.params().required_str("script")?.to_string();
        let globals = ScriptGlobals {
            inputs: serde_json::to_value(context.inputs())?,
            items: Value::Array(context.items().iter().map(|item| item.json.clone()).collect()),
            params: context.params().raw().clone(),
            payload: context.payload().clone(),
        };

        context.logger().debug(&format!("📝 Lua script for {}: {}", node.id, script));

        let cancellation = context.cancellation().clone();
        let result = tokio::task::spawn_blocking(move || run_script(&script, globals, cancellation))
            .await
            .map_err(|e| anyhow::anyhow!("Lua worker panicked: {}", e))?;
        if result.is_err() && context.cancellation().is_cancelled() {
            context.logger().warn(&format!("🛑 Lua script for {} aborted by cancellation", node.id));
        }
        result
    }
}

struct ScriptGlobals {
    inputs: Value,
    items: Value,
    params: Value,
    payload: Value,
}

fn run_script(script: &str, values: ScriptGlobals, cancellation: CancellationToken) -> Result<Value> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )
    .map_err(|e| anyhow::anyhow!("Failed to create Lua state: {}", e))?;
    lua.set_memory_limit(MEMORY_LIMIT_BYTES)
        .map_err(|e| anyhow::anyhow!("Failed to limit Lua memory: {}", e))?;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(CANCEL_CHECK_INSTRUCTIONS),
        move |_, _| {
            if cancellation.is_cancelled() {
                return Err(mlua::Error::runtime("script cancelled"));
            }
            Ok(VmState::Continue)
        },
    )
    .map_err(|e| anyhow::anyhow!("Failed to install Lua hook: {}", e))?;

    let globals = lua.globals();
    for name in BLOCKED_GLOBALS {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| anyhow::anyhow!("Failed to sandbox '{}': {}", name, e))?;
    }

    let date = lua
        .create_function(|_, format: String| Ok(chrono::Utc::now().format(&format).to_string()))
        .map_err(|e| anyhow::anyhow!("Failed to create date function: {}", e))?;
    let time = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))
        .map_err(|e| anyhow::anyhow!("Failed to create time function: {}", e))?;
    let now = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))
        .map_err(|e| anyhow::anyhow!("Failed to create now function: {}", e))?;
    globals
        .set("date", date)
        .and_then(|_| globals.set("time", time))
        .and_then(|_| globals.set("now", now))
        .map_err(|e| anyhow::anyhow!("Failed to install helpers: {}", e))?;

    for (name, value) in [
        ("inputs", &values.inputs),
        ("items", &values.items),
        ("params", &values.params),
        ("payload", &values.payload),
    ] {
        let lua_value = lua
            .to_value(value)
            .map_err(|e| anyhow::anyhow!("Failed to expose '{}' to Lua: {}", name, e))?;
        globals
            .set(name, lua_value)
            .map_err(|e| anyhow::anyhow!("Failed to set '{}': {}", name, e))?;
    }

    let result: mlua::Value = lua
        .load(script)
        .eval()
        .map_err(|e| anyhow::anyhow!("Lua script execution failed: {}", e))?;

    lua.from_value::<Value>(result)
        .map_err(|e| anyhow::anyhow!("Lua result is not JSON-compatible: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handler::{NodeHelpers, RunContext};
    use serde_json::json;
    use std::collections::HashMap;

    async fn run(script: &str, inputs: HashMap<String, Value>) -> Result<Value> {
        let run = RunContext::new("e", "wf", "u", json!({"who": "ops"}));
        run_in(&run, script, inputs).await
    }

    async fn run_in(run: &RunContext, script: &str, inputs: HashMap<String, Value>) -> Result<Value> {
        let node = Node::new("lua", "script", json!({"script": script, "factor": 3}));
        let mut order: Vec<String> = inputs.keys().cloned().collect();
        order.sort();
        let ctx = NodeContext::new(&node, run, inputs, &order, NodeHelpers::default());
        ScriptHandler.execute(&node, &ctx).await
    }

    #[tokio::test]
    async fn script_reads_inputs_and_params() {
        let inputs = HashMap::from([("a".to_string(), json!({"score": 14}))]);
        let output = run("return { result = inputs.a.score * params.factor }", inputs)
            .await
            .unwrap();
        assert_eq!(output, json!({"result": 42}));
    }

    #[tokio::test]
    async fn script_sees_payload() {
        let output = run("return payload.who", HashMap::new()).await.unwrap();
        assert_eq!(output, json!("ops"));
    }

    #[tokio::test]
    async fn sandbox_removes_os() {
        let err = run("return os.getenv('HOME')", HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("Lua script execution failed"));
    }

    #[tokio::test]
    async fn sandbox_blocks_module_loading() {
        for script in [
            "local o = require('os'); return o.getenv('HOME')",
            "return require('io').open('/etc/hostname'):read('a')",
            "return dofile('/etc/hostname')",
            "return loadfile('/etc/hostname')",
            "return load('return 1')()",
            "return collectgarbage('count')",
        ] {
            assert!(run(script, HashMap::new()).await.is_err(), "{script} should fail");
        }
    }

    #[tokio::test]
    async fn safe_libraries_remain() {
        let output = run(
            "return { m = math.max(2, 9), s = string.upper('ok'), n = #table.pack(1, 2) }",
            HashMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(output, json!({"m": 9, "s": "OK", "n": 2}));
    }

    #[tokio::test]
    async fn cancelled_run_stops_a_busy_script() {
        let run = RunContext::new("e", "wf", "u", json!({}));
        run.cancellation.cancel();
        let started = std::time::Instant::now();
        let err = run_in(&run, "while true do end", HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("script cancelled"));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn syntax_errors_surface() {
        assert!(run("return {", HashMap::new()).await.is_err());
    }
}
