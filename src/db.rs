//! SQLite connection management.
//!
//! Two pools back the runtime: the catalog pool (directories, files, chunk
//! metadata, conversations, tools) and the vector pool (embedding blobs).
//! Both run in WAL mode with foreign keys enforced.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::config::Config;

pub async fn connect_catalog(config: &Config) -> Result<SqlitePool> {
    open_pool(&config.db.catalog_path).await
}

pub async fn connect_vectors(config: &Config) -> Result<SqlitePool> {
    open_pool(&config.db.vector_path).await
}

async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
