//! Configuration loading and validation.
//!
//! Parley resolves its configuration in three layers: a named preset
//! (`development`, `production`, `testing`) supplies defaults, an optional
//! TOML file overrides the preset, and environment variables override both.
//!
//! # Environment overrides
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `PARLEY_DATABASE_URL` | `db.catalog_path` |
//! | `PARLEY_VECTOR_DB_URL` | `db.vector_path` |
//! | `PARLEY_HOST` | `server.host` |
//! | `PARLEY_PORT` | `server.port` |
//! | `PARLEY_CORS_ORIGINS` | `server.cors_origins` (comma separated) |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        preset_development()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DbConfig {
    /// SQLite file holding the relational catalog (everything but vectors).
    pub catalog_path: PathBuf,
    /// SQLite file holding the vector collection.
    pub vector_path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("./data/parley.sqlite"),
            vector_path: PathBuf::from("./data/vectors.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11434,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the local model runtime (Ollama-compatible API).
    pub runtime_url: String,
    /// Model identifier passed to the runtime. Generation returns a
    /// precondition failure while this is unset.
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            runtime_url: "http://127.0.0.1:11435".to_string(),
            model: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ToolsConfig {
    /// Path prefixes `delete_file` refuses to touch.
    pub system_roots: Vec<String>,
    /// User-defined Lua tool scripts, keyed by tool name.
    pub script: BTreeMap<String, ScriptToolConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            system_roots: default_system_roots(),
            script: BTreeMap::new(),
        }
    }
}

fn default_system_roots() -> Vec<String> {
    ["/System", "/usr", "/bin", "/sbin", "/etc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScriptToolConfig {
    /// Path to the `.lua` script file.
    pub path: PathBuf,
    /// Maximum execution time in seconds.
    #[serde(default = "default_tool_timeout")]
    pub timeout: u64,
    /// Tool-specific configuration keys, passed to the script verbatim.
    #[serde(flatten)]
    pub extra: toml::Table,
}

fn default_tool_timeout() -> u64 {
    30
}

fn preset_development() -> Config {
    Config {
        db: DbConfig::default(),
        server: ServerConfig::default(),
        model: ModelConfig::default(),
        tools: ToolsConfig::default(),
    }
}

fn preset_production() -> Config {
    Config {
        db: DbConfig {
            catalog_path: PathBuf::from("./data/parley.sqlite"),
            vector_path: PathBuf::from("./data/vectors.sqlite"),
        },
        server: ServerConfig {
            host: "0.0.0.0".to_string(),
            cors_origins: Vec::new(),
            ..ServerConfig::default()
        },
        ..preset_development()
    }
}

fn preset_testing() -> Config {
    Config {
        db: DbConfig {
            catalog_path: PathBuf::from(":memory:"),
            vector_path: PathBuf::from(":memory:"),
        },
        ..preset_development()
    }
}

/// Resolve configuration from preset + optional file + environment.
///
/// # Errors
///
/// Returns an error for an unknown preset name, an unreadable or invalid
/// config file, or values that fail validation.
pub fn resolve_config(config_name: &str, file: Option<&Path>) -> Result<Config> {
    let mut config = match config_name {
        "development" => preset_development(),
        "production" => preset_production(),
        "testing" => preset_testing(),
        other => bail!(
            "Unknown config preset: '{}'. Use development, production, or testing.",
            other
        ),
    };

    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    }

    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
        config.db.catalog_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("PARLEY_VECTOR_DB_URL") {
        config.db.vector_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("PARLEY_HOST") {
        config.server.host = v;
    }
    if let Ok(v) = std::env::var("PARLEY_PORT") {
        config.server.port = v
            .parse()
            .with_context(|| format!("PARLEY_PORT is not a valid port: {}", v))?;
    }
    if let Ok(v) = std::env::var("PARLEY_CORS_ORIGINS") {
        config.server.cors_origins = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if config.server.host.trim().is_empty() {
        bail!("server.host must not be empty");
    }
    if config.model.runtime_url.trim().is_empty() {
        bail!("model.runtime_url must not be empty");
    }
    for root in &config.tools.system_roots {
        if !root.starts_with('/') {
            bail!("tools.system_roots entries must be absolute paths: '{}'", root);
        }
    }
    for (name, tool) in &config.tools.script {
        if name.trim().is_empty() {
            bail!("tool script names must not be empty");
        }
        if tool.path.as_os_str().is_empty() {
            bail!("tools.script.{}.path must not be empty", name);
        }
    }
    Ok(())
}
