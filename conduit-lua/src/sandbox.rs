//! Lua sandbox creation
//!
//! The sandbox only exposes the TABLE, STRING, MATH and COROUTINE standard
//! libraries. `require`, `dofile` and `loadfile` are removed, so a definition
//! file cannot load other code or reach the host.
//!
//! Two globals are injected:
//! - `params`: the provisioning parameters (`repository_name`, `branch_name`,
//!   `executor_image`)
//! - `pipeline`: helpers used to write definitions

use conduit_core::domain::agent::{AgentInvocation, DEFAULT_OUTPUT_DIR};
use conduit_core::domain::provisioning::ProvisioningParams;
use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Table, Value};

/// Create a restricted Lua sandbox with `params` and `pipeline` registered
///
/// # Example
/// ```no_run
/// use conduit_lua::sandbox::create_sandbox;
/// use conduit_lua::ProvisioningParams;
///
/// let lua = create_sandbox(&ProvisioningParams::default())?;
/// let branch: String = lua.load("return params.branch_name").eval()?;
/// assert_eq!(branch, "main");
/// # Ok::<(), mlua::Error>(())
/// ```
pub fn create_sandbox(params: &ProvisioningParams) -> LuaResult<Lua> {
    // Explicitly exclude: IO, OS, PACKAGE, DEBUG
    let lua = unsafe {
        Lua::unsafe_new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE,
            LuaOptions::default(),
        )
    };

    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;

    register_params(&lua, params)?;
    register_pipeline_module(&lua)?;

    Ok(lua)
}

fn register_params(lua: &Lua, params: &ProvisioningParams) -> LuaResult<()> {
    let table = lua.create_table()?;
    table.set("repository_name", params.repository_name.as_str())?;
    table.set("branch_name", params.branch_name.as_str())?;
    table.set("executor_image", params.executor_image.as_str())?;
    lua.globals().set("params", table)?;
    Ok(())
}

/// Register the `pipeline` module
///
/// - `pipeline.define(def)` returns the definition table as-is
/// - `pipeline.source(cfg)` / `pipeline.build(cfg)` tag a stage table with its type
/// - `pipeline.agent(cfg)` renders the agent command line for a build phase
fn register_pipeline_module(lua: &Lua) -> LuaResult<()> {
    let pipeline = lua.create_table()?;

    let define_fn = lua.create_function(|_, definition: Table| Ok(definition))?;
    pipeline.set("define", define_fn)?;

    let source_fn = lua.create_function(|_, config: Table| {
        config.set("type", "source")?;
        Ok(config)
    })?;
    pipeline.set("source", source_fn)?;

    let build_fn = lua.create_function(|_, config: Table| {
        config.set("type", "build")?;
        Ok(config)
    })?;
    pipeline.set("build", build_fn)?;

    let agent_fn = lua.create_function(|_, config: Table| {
        let invocation = agent_from_table(&config)?;
        Ok(invocation.command_line())
    })?;
    pipeline.set("agent", agent_fn)?;

    lua.globals().set("pipeline", pipeline)?;

    Ok(())
}

fn agent_from_table(config: &Table) -> LuaResult<AgentInvocation> {
    let program: String = config
        .get::<Option<String>>("program")?
        .ok_or_else(|| mlua::Error::RuntimeError("pipeline.agent requires 'program'".to_string()))?;

    let mut invocation = AgentInvocation::new(program);
    if let Some(path) = config.get::<Option<String>>("config")? {
        invocation = invocation.with_config(path);
    }
    if let Some(task) = config.get::<Option<String>>("task")? {
        invocation = invocation.with_task(task);
    }

    match config.get::<Value>("params")? {
        Value::Nil => {}
        value => {
            let json = lua_value_to_json(&value)
                .map_err(|e| mlua::Error::RuntimeError(format!("agent params: {}", e)))?;
            invocation = invocation.with_params(json);
        }
    }

    invocation.output_dir = config
        .get::<Option<String>>("output_dir")?
        .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string());

    Ok(invocation)
}

/// Convert a Lua value to JSON
///
/// Tables whose keys are exactly `1..n` become arrays; any other table
/// becomes an object with string keys.
pub(crate) fn lua_value_to_json(val: &Value) -> anyhow::Result<serde_json::Value> {
    match val {
        Value::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| anyhow::anyhow!("Invalid number value")),
        Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Table(table) => {
            let len = table.raw_len();
            let mut count = 0usize;
            for pair in table.pairs::<Value, Value>() {
                pair?;
                count += 1;
            }

            if len > 0 && len == count {
                let mut items = Vec::with_capacity(len);
                for item in table.sequence_values::<Value>() {
                    items.push(lua_value_to_json(&item?)?);
                }
                return Ok(serde_json::Value::Array(items));
            }

            let mut object = serde_json::Map::new();
            for pair in table.pairs::<Value, Value>() {
                let (key, value) = pair?;
                let key = match key {
                    Value::String(s) => s.to_str()?.to_string(),
                    Value::Integer(i) => i.to_string(),
                    _ => return Err(anyhow::anyhow!("Table keys must be strings or integers")),
                };
                object.insert(key, lua_value_to_json(&value)?);
            }
            Ok(serde_json::Value::Object(object))
        }
        _ => Err(anyhow::anyhow!(
            "Unsupported Lua value type for JSON conversion"
        )),
    }
}
