//! User-defined Lua tools: loading, validation, and execution.
//!
//! Every tool script defines a global `tool` table:
//!
//! ```lua
//! tool = {
//!     name = "ticket_lookup",
//!     description = "Look up a ticket by id",
//!     parameters = {
//!         { name = "id", type = "string", required = true, description = "Ticket id" },
//!     },
//! }
//!
//! function tool.execute(params, context)
//!     return { found = true, id = params.id }
//! end
//! ```
//!
//! Scripts are validated structurally before registration: they must parse,
//! define the `tool` table with `name`, `description`, and `parameters`,
//! and expose a callable `tool.execute`. All offenses are reported
//! together; stylistic gaps (missing parameter descriptions) are warnings
//! and do not block registration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use mlua::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ScriptToolConfig};
use crate::lua_runtime::{json_value_to_lua, lua_value_to_json, register_all_host_apis, toml_table_to_lua};
use crate::tools::{Tool, ToolSpec};

/// Metadata extracted from a loaded tool script.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters_schema: serde_json::Value,
    pub script_path: PathBuf,
    pub script_source: String,
    /// Tool-specific config keys, passed to the script as `context.config`.
    pub config: toml::Table,
    /// Maximum execution time in seconds.
    pub timeout: u64,
}

/// Outcome of structural validation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validate a tool script without registering it.
///
/// Collects every offense rather than stopping at the first, so authors
/// can fix a script in one pass.
pub fn validate_tool_script(source: &str) -> ToolValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let lua = Lua::new();
    if let Err(e) = crate::lua_runtime::sandbox_globals(&lua) {
        errors.push(format!("VM setup failed: {}", e));
        return ToolValidation {
            valid: false,
            errors,
            warnings,
        };
    }

    // Syntax first: a script that does not parse cannot be inspected.
    if let Err(e) = lua.load(source).into_function() {
        errors.push(format!("Syntax error: {}", e));
        return ToolValidation {
            valid: false,
            errors,
            warnings,
        };
    }

    if let Err(e) = lua.load(source).exec() {
        errors.push(format!("Script failed to execute: {}", e));
        return ToolValidation {
            valid: false,
            errors,
            warnings,
        };
    }

    let tool_table = match lua.globals().get::<LuaTable>("tool") {
        Ok(table) => table,
        Err(_) => {
            errors.push("Script must define a global 'tool' table".to_string());
            return ToolValidation {
                valid: false,
                errors,
                warnings,
            };
        }
    };

    match tool_table.get::<String>("name") {
        Ok(name) if !name.trim().is_empty() => {}
        _ => errors.push("Missing required field: 'tool.name'".to_string()),
    }
    if tool_table.get::<String>("description").is_err() {
        errors.push("Missing required field: 'tool.description'".to_string());
    }

    match tool_table.get::<LuaTable>("parameters") {
        Ok(params) => {
            for i in 1..=params.raw_len() {
                match params.raw_get::<LuaTable>(i) {
                    Ok(param) => {
                        if param.get::<String>("name").is_err() {
                            errors.push(format!("Parameter at index {} missing 'name'", i));
                        }
                        if param.get::<String>("description").is_err() {
                            warnings.push(format!(
                                "Parameter at index {} has no description",
                                i
                            ));
                        }
                    }
                    Err(_) => errors.push(format!("Parameter at index {} is not a table", i)),
                }
            }
        }
        Err(_) => errors.push("Missing required field: 'tool.parameters'".to_string()),
    }

    match tool_table.get::<LuaValue>("execute") {
        Ok(LuaValue::Function(_)) => {}
        Ok(_) => errors.push("'tool.execute' must be a function".to_string()),
        Err(_) => errors.push("Missing required callable: 'tool.execute'".to_string()),
    }

    ToolValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Load every `[tools.script.<name>]` entry from config.
///
/// Invalid scripts are rejected with their full offense list.
pub fn load_tool_definitions(config: &Config) -> Result<Vec<ToolDefinition>> {
    let mut tools = Vec::new();
    for (name, tool_config) in &config.tools.script {
        let definition = load_single_tool(name, tool_config)
            .with_context(|| format!("Failed to load tool script '{}'", name))?;
        tools.push(definition);
    }
    Ok(tools)
}

fn load_single_tool(name: &str, tool_config: &ScriptToolConfig) -> Result<ToolDefinition> {
    let source = std::fs::read_to_string(&tool_config.path)
        .with_context(|| format!("Failed to read tool script: {}", tool_config.path.display()))?;

    let validation = validate_tool_script(&source);
    if !validation.valid {
        anyhow::bail!("Tool script invalid: {}", validation.errors.join("; "));
    }
    for warning in &validation.warnings {
        tracing::warn!(tool = name, "{}", warning);
    }

    // Re-load to extract metadata (validation proved this succeeds).
    let lua = Lua::new();
    lua.load(&source)
        .set_name(tool_config.path.to_string_lossy())
        .exec()
        .map_err(|e| anyhow::anyhow!("Failed to execute tool script: {}", e))?;

    let tool_table: LuaTable = lua
        .globals()
        .get::<LuaTable>("tool")
        .map_err(|e| anyhow::anyhow!("Script must define a global 'tool' table: {}", e))?;

    let description: String = tool_table
        .get::<String>("description")
        .unwrap_or_else(|_| format!("Lua tool: {}", name));

    let params_table: LuaTable = tool_table
        .get::<LuaTable>("parameters")
        .unwrap_or_else(|_| lua.create_table().expect("create_table"));
    let schema = lua_params_to_json_schema(&params_table)?;

    Ok(ToolDefinition {
        name: name.to_string(),
        description,
        parameters_schema: schema,
        script_path: tool_config.path.clone(),
        script_source: source,
        config: tool_config.extra.clone(),
        timeout: tool_config.timeout,
    })
}

/// Convert Lua parameter declarations to a JSON Schema object.
fn lua_params_to_json_schema(params: &LuaTable) -> Result<serde_json::Value> {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for i in 1..=params.raw_len() {
        let param: LuaTable = params
            .raw_get(i)
            .map_err(|e| anyhow::anyhow!("Invalid parameter at index {}: {}", i, e))?;

        let name: String = param
            .get::<String>("name")
            .map_err(|e| anyhow::anyhow!("Parameter at index {} missing 'name': {}", i, e))?;
        let param_type: String = param
            .get::<String>("type")
            .unwrap_or_else(|_| "string".to_string());

        let mut prop = serde_json::Map::new();
        prop.insert("type".to_string(), serde_json::json!(param_type));
        if let Ok(description) = param.get::<String>("description") {
            prop.insert("description".to_string(), serde_json::json!(description));
        }

        if param.get::<bool>("required").unwrap_or(false) {
            required.push(serde_json::json!(name));
        }
        properties.insert(name, serde_json::Value::Object(prop));
    }

    Ok(serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    }))
}

// ============ Tool adapter ============

/// A registered Lua tool, invokable through the common [`Tool`] trait.
pub struct LuaTool {
    definition: Arc<ToolDefinition>,
}

impl LuaTool {
    pub fn new(definition: ToolDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
        }
    }
}

#[async_trait]
impl Tool for LuaTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            parameters: self.definition.parameters_schema.clone(),
            builtin: false,
        }
    }

    async fn invoke(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let definition = Arc::clone(&self.definition);
        let arguments = serde_json::Value::Object(arguments.clone());
        let timeout = Duration::from_secs(self.definition.timeout.max(1));

        let handle = tokio::task::spawn_blocking(move || execute_lua(&definition, &arguments));
        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => joined?,
            Err(_) => anyhow::bail!(
                "Tool '{}' timed out after {}s",
                self.definition.name,
                self.definition.timeout
            ),
        }
    }
}

/// Run the script's `tool.execute(params, context)` and serialize the
/// returned value as the tool result string.
fn execute_lua(definition: &ToolDefinition, arguments: &serde_json::Value) -> Result<String> {
    let lua = Lua::new();
    register_all_host_apis(&lua, &definition.name).map_err(|e| anyhow::anyhow!("{}", e))?;

    lua.load(&definition.script_source)
        .set_name(definition.script_path.to_string_lossy())
        .exec()
        .map_err(|e| anyhow::anyhow!("Tool script failed to load: {}", e))?;

    let tool_table: LuaTable = lua
        .globals()
        .get::<LuaTable>("tool")
        .map_err(|e| anyhow::anyhow!("Missing 'tool' table: {}", e))?;
    let execute: LuaFunction = tool_table
        .get::<LuaFunction>("execute")
        .map_err(|e| anyhow::anyhow!("Missing 'tool.execute': {}", e))?;

    let params = json_value_to_lua(&lua, arguments).map_err(|e| anyhow::anyhow!("{}", e))?;
    let context = lua.create_table().map_err(|e| anyhow::anyhow!("{}", e))?;
    context
        .set(
            "config",
            toml_table_to_lua(&lua, &definition.config).map_err(|e| anyhow::anyhow!("{}", e))?,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let result: LuaValue = execute
        .call((params, context))
        .map_err(|e| anyhow::anyhow!("Tool raised: {}", e))?;

    match &result {
        LuaValue::String(s) => Ok(s.to_string_lossy().to_string()),
        LuaValue::Nil => Ok("ok".to_string()),
        other => {
            let json = lua_value_to_json(other).map_err(|e| anyhow::anyhow!("{}", e))?;
            Ok(json.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_SCRIPT: &str = r#"
tool = {
    name = "echo",
    description = "Echo back the input",
    parameters = {
        { name = "text", type = "string", required = true, description = "Text to echo" },
    },
}

function tool.execute(params, context)
    return "echo: " .. params.text
end
"#;

    #[test]
    fn valid_script_passes() {
        let validation = validate_tool_script(VALID_SCRIPT);
        assert!(validation.valid, "errors: {:?}", validation.errors);
        assert!(validation.warnings.is_empty());
    }

    #[test]
    fn syntax_error_is_reported() {
        let validation = validate_tool_script("tool = {");
        assert!(!validation.valid);
        assert!(validation.errors[0].starts_with("Syntax error"));
    }

    #[test]
    fn all_offenses_reported_together() {
        let validation = validate_tool_script("x = 1");
        assert!(!validation.valid);
        assert!(validation
            .errors
            .iter()
            .any(|e| e.contains("'tool' table")));
    }

    #[test]
    fn missing_fields_each_reported() {
        let validation = validate_tool_script("tool = { }");
        assert!(!validation.valid);
        let joined = validation.errors.join("\n");
        assert!(joined.contains("tool.name"));
        assert!(joined.contains("tool.description"));
        assert!(joined.contains("tool.parameters"));
        assert!(joined.contains("tool.execute"));
    }

    #[test]
    fn missing_param_description_is_warning_only() {
        let script = r#"
tool = {
    name = "t",
    description = "d",
    parameters = { { name = "x", type = "string" } },
}
function tool.execute(params, context) return "ok" end
"#;
        let validation = validate_tool_script(script);
        assert!(validation.valid);
        assert_eq!(validation.warnings.len(), 1);
    }

    #[test]
    fn non_callable_execute_rejected() {
        let script = r#"
tool = { name = "t", description = "d", parameters = {}, execute = "nope" }
"#;
        let validation = validate_tool_script(script);
        assert!(!validation.valid);
        assert!(validation
            .errors
            .iter()
            .any(|e| e.contains("must be a function")));
    }

    fn definition(source: &str) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echo".to_string(),
            parameters_schema: serde_json::json!({"type": "object"}),
            script_path: PathBuf::from("echo.lua"),
            script_source: source.to_string(),
            config: toml::Table::new(),
            timeout: 5,
        }
    }

    #[tokio::test]
    async fn invoke_runs_execute() {
        let tool = LuaTool::new(definition(VALID_SCRIPT));
        let mut arguments = serde_json::Map::new();
        arguments.insert("text".to_string(), serde_json::json!("hi"));

        let result = tool.invoke(&arguments).await.unwrap();
        assert_eq!(result, "echo: hi");
    }

    #[tokio::test]
    async fn table_results_serialize_to_json() {
        let script = r#"
tool = { name = "t", description = "d", parameters = {} }
function tool.execute(params, context)
    return { status = "done", count = 3 }
end
"#;
        let tool = LuaTool::new(definition(script));
        let result = tool.invoke(&serde_json::Map::new()).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(value["status"], "done");
        assert_eq!(value["count"], 3);
    }

    #[tokio::test]
    async fn runtime_errors_surface_as_err() {
        let script = r#"
tool = { name = "t", description = "d", parameters = {} }
function tool.execute(params, context)
    error("boom")
end
"#;
        let tool = LuaTool::new(definition(script));
        assert!(tool.invoke(&serde_json::Map::new()).await.is_err());
    }

    #[test]
    fn schema_conversion_collects_required() {
        let lua = Lua::new();
        lua.load(VALID_SCRIPT).exec().unwrap();
        let tool_table: LuaTable = lua.globals().get("tool").unwrap();
        let params: LuaTable = tool_table.get("parameters").unwrap();

        let schema = lua_params_to_json_schema(&params).unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["text"]["type"], "string");
        assert_eq!(schema["required"][0], "text");
    }
}
