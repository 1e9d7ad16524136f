//! Tool registry and built-in tool adapters.
//!
//! Tools expose a name, description, and JSON-Schema parameter description
//! via [`Tool::describe`] and are invoked with a JSON argument map. The
//! built-in set covers file and application management; user-defined Lua
//! tools are registered through [`crate::tool_script`].
//!
//! Domain failures (missing file, refused path) are reported as the tool's
//! result string; `Err` is reserved for unexpected adapter faults.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Serializable description of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// OpenAI function-calling style JSON Schema for the arguments.
    pub parameters: serde_json::Value,
    pub builtin: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn describe(&self) -> ToolSpec;
    async fn invoke(&self, arguments: &serde_json::Map<String, serde_json::Value>)
        -> Result<String>;
}

/// Closed set of built-ins plus validated user tools, keyed by unique name.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Registry preloaded with the built-in tools.
    pub fn with_builtins(system_roots: Vec<String>) -> Self {
        let mut registry = Self::new();
        let roots = Arc::new(system_roots);
        // Names are unique by construction here
        let _ = registry.register(Arc::new(OpenFileTool));
        let _ = registry.register(Arc::new(DeleteFileTool {
            system_roots: Arc::clone(&roots),
        }));
        let _ = registry.register(Arc::new(OpenAppTool));
        let _ = registry.register(Arc::new(CloseAppTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.describe().name;
        if self.tools.contains_key(&name) {
            bail!("Tool name already registered: {}", name);
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.describe()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn string_arg(
    arguments: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    arguments.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn path_schema(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": description }
        },
        "required": ["path"]
    })
}

fn app_schema(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "app_name": { "type": "string", "description": description }
        },
        "required": ["app_name"]
    })
}

// ============ open_file ============

struct OpenFileTool;

#[async_trait]
impl Tool for OpenFileTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: "open_file".to_string(),
            description: "Open a file with the system default application".to_string(),
            parameters: path_schema("Absolute path of the file to open"),
            builtin: true,
        }
    }

    async fn invoke(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let Some(path) = string_arg(arguments, "path") else {
            return Ok("Error: missing required argument 'path'".to_string());
        };
        if !Path::new(&path).exists() {
            return Ok(format!("Error: File not found: {}", path));
        }
        match launch_opener(&path) {
            Ok(()) => Ok(format!("Successfully opened file: {}", path)),
            Err(e) => Ok(format!("Error opening file: {}", e)),
        }
    }
}

#[cfg(target_os = "macos")]
fn launch_opener(target: &str) -> std::io::Result<()> {
    std::process::Command::new("open").arg(target).spawn()?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn launch_opener(target: &str) -> std::io::Result<()> {
    std::process::Command::new("xdg-open").arg(target).spawn()?;
    Ok(())
}

// ============ delete_file ============

struct DeleteFileTool {
    system_roots: Arc<Vec<String>>,
}

impl DeleteFileTool {
    /// Refusal check runs on the canonical path before any side effect.
    fn refuses(&self, canonical: &Path) -> bool {
        self.system_roots
            .iter()
            .any(|root| canonical.starts_with(root))
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: "delete_file".to_string(),
            description: "Delete a file (never directories, never system paths)".to_string(),
            parameters: path_schema("Absolute path of the file to delete"),
            builtin: true,
        }
    }

    async fn invoke(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let Some(path) = string_arg(arguments, "path") else {
            return Ok("Error: missing required argument 'path'".to_string());
        };

        let canonical = match std::fs::canonicalize(&path) {
            Ok(p) => p,
            Err(_) => return Ok(format!("Error: File not found: {}", path)),
        };
        if self.refuses(&canonical) {
            return Ok(format!(
                "Error: Refusing to delete files under protected system paths: {}",
                canonical.display()
            ));
        }
        if canonical.is_dir() {
            return Ok(format!(
                "Error: Path is a directory, not a file: {}",
                canonical.display()
            ));
        }

        match std::fs::remove_file(&canonical) {
            Ok(()) => Ok(format!("Successfully deleted file: {}", canonical.display())),
            Err(e) => Ok(format!("Error deleting file: {}", e)),
        }
    }
}

// ============ open_app / close_app ============

struct OpenAppTool;

#[async_trait]
impl Tool for OpenAppTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: "open_app".to_string(),
            description: "Launch an application by name".to_string(),
            parameters: app_schema("Name of the application to open"),
            builtin: true,
        }
    }

    async fn invoke(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let Some(app_name) = string_arg(arguments, "app_name") else {
            return Ok("Error: missing required argument 'app_name'".to_string());
        };
        match launch_app(&app_name) {
            Ok(()) => Ok(format!("Successfully opened {}", app_name)),
            Err(e) => Ok(format!("Error opening {}: {}", app_name, e)),
        }
    }
}

#[cfg(target_os = "macos")]
fn launch_app(app_name: &str) -> std::io::Result<()> {
    std::process::Command::new("open")
        .arg("-a")
        .arg(app_name)
        .spawn()?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn launch_app(app_name: &str) -> std::io::Result<()> {
    std::process::Command::new(app_name.to_lowercase()).spawn()?;
    Ok(())
}

struct CloseAppTool;

#[async_trait]
impl Tool for CloseAppTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: "close_app".to_string(),
            description: "Quit a running application by name".to_string(),
            parameters: app_schema("Name of the application to close"),
            builtin: true,
        }
    }

    async fn invoke(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let Some(app_name) = string_arg(arguments, "app_name") else {
            return Ok("Error: missing required argument 'app_name'".to_string());
        };
        match close_app(&app_name) {
            Ok(()) => Ok(format!("Successfully closed {}", app_name)),
            Err(e) => Ok(format!("Error closing {}: {}", app_name, e)),
        }
    }
}

#[cfg(target_os = "macos")]
fn close_app(app_name: &str) -> std::io::Result<()> {
    std::process::Command::new("osascript")
        .arg("-e")
        .arg(format!("quit app \"{}\"", app_name))
        .spawn()?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn close_app(app_name: &str) -> std::io::Result<()> {
    std::process::Command::new("pkill")
        .arg("-f")
        .arg(app_name)
        .spawn()?;
    Ok(())
}

// ============ Execution log ============

/// One row of the append-only tool-execution log.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub id: String,
    pub tool_name: String,
    pub arguments: String,
    pub result: String,
    pub created_at: String,
}

pub async fn log_execution(
    pool: &SqlitePool,
    tool_name: &str,
    arguments: &serde_json::Value,
    result: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO tool_executions (id, tool_name, arguments, result, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(tool_name)
    .bind(arguments.to_string())
    .bind(result)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_executions(pool: &SqlitePool, limit: i64) -> Result<Vec<ToolExecution>> {
    let rows = sqlx::query(
        "SELECT id, tool_name, arguments, result, created_at FROM tool_executions ORDER BY created_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| ToolExecution {
            id: row.get("id"),
            tool_name: row.get("tool_name"),
            arguments: row.get("arguments"),
            result: row.get("result"),
            created_at: row.get("created_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn builtin_registry_lists_four_tools() {
        let registry = ToolRegistry::with_builtins(vec!["/etc".to_string()]);
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["close_app", "delete_file", "open_app", "open_file"]);
        assert!(registry.list().iter().all(|t| t.builtin));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut registry = ToolRegistry::with_builtins(vec![]);
        assert!(registry.register(Arc::new(OpenFileTool)).is_err());
    }

    #[tokio::test]
    async fn delete_file_refuses_system_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let victim = tmp.path().join("keep.txt");
        std::fs::write(&victim, "data").unwrap();

        // Protect the temp dir itself to exercise the prefix check
        let tool = DeleteFileTool {
            system_roots: Arc::new(vec![tmp.path().to_string_lossy().to_string()]),
        };
        let result = tool
            .invoke(&args(&[("path", victim.to_str().unwrap())]))
            .await
            .unwrap();

        assert!(result.starts_with("Error: Refusing to delete"));
        // Refusal is total: the file is untouched
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn delete_file_refuses_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let tool = DeleteFileTool {
            system_roots: Arc::new(vec!["/definitely-not-here".to_string()]),
        };
        let result = tool
            .invoke(&args(&[("path", sub.to_str().unwrap())]))
            .await
            .unwrap();

        assert!(result.contains("directory"));
        assert!(sub.exists());
    }

    #[tokio::test]
    async fn delete_file_deletes_plain_files() {
        let tmp = tempfile::tempdir().unwrap();
        let victim = tmp.path().join("gone.txt");
        std::fs::write(&victim, "data").unwrap();

        let tool = DeleteFileTool {
            system_roots: Arc::new(vec!["/definitely-not-here".to_string()]),
        };
        let result = tool
            .invoke(&args(&[("path", victim.to_str().unwrap())]))
            .await
            .unwrap();

        assert!(result.starts_with("Successfully deleted"));
        assert!(!victim.exists());
    }

    #[tokio::test]
    async fn missing_file_reports_not_found() {
        let tool = DeleteFileTool {
            system_roots: Arc::new(vec![]),
        };
        let result = tool
            .invoke(&args(&[("path", "/no/such/file.txt")]))
            .await
            .unwrap();
        assert!(result.starts_with("Error: File not found"));
    }

    #[tokio::test]
    async fn missing_argument_is_reported() {
        let tool = OpenFileTool;
        let result = tool.invoke(&args(&[])).await.unwrap();
        assert!(result.contains("missing required argument"));
    }

    #[tokio::test]
    async fn execution_log_appends() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_catalog_migrations(&pool).await.unwrap();

        log_execution(
            &pool,
            "open_app",
            &serde_json::json!({"app_name": "Slack"}),
            "Successfully opened Slack",
        )
        .await
        .unwrap();

        let log = recent_executions(&pool, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tool_name, "open_app");
        assert!(log[0].arguments.contains("Slack"));
    }
}
