//! Sandboxed Lua 5.4 VM for user-defined tools.
//!
//! User scripts never run as host-language source; they execute in a Lua VM
//! with the dangerous standard libraries removed and a small set of host
//! APIs registered. The VM runs on a blocking thread, so host functions use
//! synchronous I/O (`reqwest::blocking`, `std::thread::sleep`).
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `http` | `get`, `post` |
//! | `json` | `parse`, `encode` |
//! | `env` | `get` |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `base64` | `encode`, `decode` |
//! | `crypto` | `sha256`, `hmac_sha256` |
//! | `sleep` | `sleep(seconds)` |

use base64::Engine;
use hmac::{Hmac, Mac};
use mlua::prelude::*;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Register every host API on a fresh VM and strip dangerous globals.
pub(crate) fn register_all_host_apis(lua: &Lua, script_name: &str) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_http_api(lua)?;
    register_json_api(lua)?;
    register_env_api(lua)?;
    register_log_api(lua, script_name)?;
    register_base64_api(lua)?;
    register_crypto_api(lua)?;
    register_sleep(lua)?;
    Ok(())
}

/// Remove stdlib entry points that reach the host process.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

// ============ http ============

fn register_http_api(lua: &Lua) -> LuaResult<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(mlua::Error::external)?;

    let http = lua.create_table()?;

    let c = client.clone();
    http.set(
        "get",
        lua.create_function(move |lua, (url, opts): (String, Option<LuaTable>)| {
            do_http_request(lua, &c, "GET", &url, None, opts)
        })?,
    )?;

    let c = client.clone();
    http.set(
        "post",
        lua.create_function(
            move |lua, (url, body, opts): (String, String, Option<LuaTable>)| {
                do_http_request(lua, &c, "POST", &url, Some(&body), opts)
            },
        )?,
    )?;

    lua.globals().set("http", http)?;
    Ok(())
}

fn do_http_request(
    lua: &Lua,
    client: &reqwest::blocking::Client,
    method: &str,
    url: &str,
    body: Option<&str>,
    opts: Option<LuaTable>,
) -> LuaResult<LuaTable> {
    let mut builder = match method {
        "GET" => client.get(url),
        "POST" => client.post(url),
        other => {
            return Err(mlua::Error::external(anyhow::anyhow!(
                "unsupported HTTP method: {}",
                other
            )))
        }
    };

    if let Some(opts) = opts {
        if let Ok(headers) = opts.get::<LuaTable>("headers") {
            for pair in headers.pairs::<String, String>() {
                let (key, value) = pair?;
                builder = builder.header(key, value);
            }
        }
    }
    if let Some(body) = body {
        builder = builder.body(body.to_string());
    }

    let response = builder.send().map_err(mlua::Error::external)?;
    let status = response.status().as_u16();
    let text = response.text().map_err(mlua::Error::external)?;

    let result = lua.create_table()?;
    result.set("status", status)?;
    result.set("body", text)?;
    Ok(result)
}

// ============ json ============

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json = lua.create_table()?;

    json.set(
        "parse",
        lua.create_function(|lua, text: String| {
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json.set(
        "encode",
        lua.create_function(|_, value: LuaValue| {
            let json = lua_value_to_json(&value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;

    lua.globals().set("json", json)?;
    Ok(())
}

// ============ env / log / base64 / crypto / sleep ============

fn register_env_api(lua: &Lua) -> LuaResult<()> {
    let env = lua.create_table()?;
    env.set(
        "get",
        lua.create_function(|_, name: String| Ok(std::env::var(&name).ok()))?,
    )?;
    lua.globals().set("env", env)?;
    Ok(())
}

fn register_log_api(lua: &Lua, script_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;
    for level in ["info", "warn", "error", "debug"] {
        let prefix = script_name.to_string();
        log.set(
            level,
            lua.create_function(move |_, message: String| {
                match level {
                    "warn" => tracing::warn!(script = %prefix, "{}", message),
                    "error" => tracing::error!(script = %prefix, "{}", message),
                    "debug" => tracing::debug!(script = %prefix, "{}", message),
                    _ => tracing::info!(script = %prefix, "{}", message),
                }
                Ok(())
            })?,
        )?;
    }
    lua.globals().set("log", log)?;
    Ok(())
}

fn register_base64_api(lua: &Lua) -> LuaResult<()> {
    let b64 = lua.create_table()?;
    b64.set(
        "encode",
        lua.create_function(|_, data: String| {
            Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
        })?,
    )?;
    b64.set(
        "decode",
        lua.create_function(|_, data: String| {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data.as_bytes())
                .map_err(mlua::Error::external)?;
            String::from_utf8(bytes).map_err(mlua::Error::external)
        })?,
    )?;
    lua.globals().set("base64", b64)?;
    Ok(())
}

fn register_crypto_api(lua: &Lua) -> LuaResult<()> {
    let crypto = lua.create_table()?;
    crypto.set(
        "sha256",
        lua.create_function(|_, data: String| {
            let mut hasher = Sha256::new();
            hasher.update(data.as_bytes());
            Ok(format!("{:x}", hasher.finalize()))
        })?,
    )?;
    crypto.set(
        "hmac_sha256",
        lua.create_function(|_, (key, message): (String, String)| {
            let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                .map_err(mlua::Error::external)?;
            mac.update(message.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        })?,
    )?;
    lua.globals().set("crypto", crypto)?;
    Ok(())
}

fn register_sleep(lua: &Lua) -> LuaResult<()> {
    lua.globals().set(
        "sleep",
        lua.create_function(|_, seconds: f64| {
            std::thread::sleep(Duration::from_secs_f64(seconds.clamp(0.0, 30.0)));
            Ok(())
        })?,
    )?;
    Ok(())
}

// ============ Value conversion ============

pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        serde_json::Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_value_to_lua(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.raw_set(key.as_str(), json_value_to_lua(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

pub(crate) fn lua_value_to_json(value: &LuaValue) -> LuaResult<serde_json::Value> {
    Ok(match value {
        LuaValue::Nil => serde_json::Value::Null,
        LuaValue::Boolean(b) => serde_json::Value::Bool(*b),
        LuaValue::Integer(i) => serde_json::Value::from(*i),
        LuaValue::Number(n) => serde_json::Value::from(*n),
        LuaValue::String(s) => serde_json::Value::String(s.to_string_lossy().to_string()),
        LuaValue::Table(table) => {
            let len = table.raw_len();
            if len > 0 {
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    let item: LuaValue = table.raw_get(i)?;
                    items.push(lua_value_to_json(&item)?);
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for pair in table.clone().pairs::<String, LuaValue>() {
                    let (key, item) = pair?;
                    map.insert(key, lua_value_to_json(&item)?);
                }
                serde_json::Value::Object(map)
            }
        }
        _ => serde_json::Value::Null,
    })
}

/// Expose a TOML table (tool-specific config) to the script.
pub(crate) fn toml_table_to_lua(lua: &Lua, table: &toml::Table) -> LuaResult<LuaTable> {
    let out = lua.create_table()?;
    for (key, value) in table {
        out.set(key.as_str(), toml_value_to_lua(lua, value)?)?;
    }
    Ok(out)
}

fn toml_value_to_lua(lua: &Lua, value: &toml::Value) -> LuaResult<LuaValue> {
    match value {
        toml::Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        toml::Value::Integer(i) => Ok(LuaValue::Integer(*i)),
        toml::Value::Float(f) => Ok(LuaValue::Number(*f)),
        toml::Value::Boolean(b) => Ok(LuaValue::Boolean(*b)),
        toml::Value::Datetime(dt) => Ok(LuaValue::String(lua.create_string(dt.to_string())?)),
        toml::Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, toml_value_to_lua(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        toml::Value::Table(inner) => Ok(LuaValue::Table(toml_table_to_lua(lua, inner)?)),
    }
}
