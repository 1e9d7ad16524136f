//! Database schema migrations.
//!
//! Creates all catalog tables (directories, file index, Merkle tree, chunk
//! metadata, conversations, tool-execution log, settings singletons) and the
//! vector collection table. Idempotent; run via `parley init` and on server
//! startup.

use anyhow::Result;
use sqlx::SqlitePool;

/// Default embedding model identifier seeded into `rag_settings`.
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

pub async fn run_catalog_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexed_directories (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1,
            file_patterns TEXT NOT NULL,
            exclude_patterns TEXT NOT NULL,
            index_frequency_minutes INTEGER NOT NULL DEFAULT 60,
            last_indexed_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_index (
            id TEXT PRIMARY KEY,
            directory_id TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            merkle_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            last_modified TEXT NOT NULL,
            is_indexed INTEGER NOT NULL DEFAULT 0,
            indexed_at TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(directory_id, relative_path),
            FOREIGN KEY (directory_id) REFERENCES indexed_directories(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS merkle_tree (
            id TEXT PRIMARY KEY,
            directory_id TEXT NOT NULL,
            node_path TEXT NOT NULL,
            node_hash TEXT NOT NULL,
            is_leaf INTEGER NOT NULL,
            parent_path TEXT,
            depth INTEGER NOT NULL,
            UNIQUE(directory_id, node_path),
            FOREIGN KEY (directory_id) REFERENCES indexed_directories(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_metadata (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            chunk_hash TEXT NOT NULL,
            vector_id TEXT NOT NULL,
            UNIQUE(file_id, chunk_index),
            FOREIGN KEY (file_id) REFERENCES file_index(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            last_updated TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_rag_context (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            directory_id TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE(conversation_id, directory_id),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
            FOREIGN KEY (directory_id) REFERENCES indexed_directories(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tool_executions (
            id TEXT PRIMARY KEY,
            tool_name TEXT NOT NULL,
            arguments TEXT NOT NULL,
            result TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            chunk_size INTEGER NOT NULL,
            chunk_overlap INTEGER NOT NULL,
            embedding_model TEXT NOT NULL,
            top_k INTEGER NOT NULL,
            min_relevance_score REAL NOT NULL,
            max_context_length INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS model_behavior (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            system_prompt TEXT NOT NULL,
            temperature REAL NOT NULL,
            max_tokens INTEGER NOT NULL,
            stop_sequences TEXT NOT NULL,
            context_window INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Seed the settings singletons
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO rag_settings
            (id, chunk_size, chunk_overlap, embedding_model, top_k, min_relevance_score, max_context_length)
        VALUES (1, 1000, 200, ?, 5, 0.3, 4000)
        "#,
    )
    .bind(DEFAULT_EMBEDDING_MODEL)
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO model_behavior
            (id, system_prompt, temperature, max_tokens, stop_sequences, context_window)
        VALUES (1, '', 0.7, 512, '[]', 2048)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_index_directory ON file_index(directory_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_metadata_file ON embedding_metadata(file_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_merkle_tree_directory ON merkle_tree(directory_id)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn run_vector_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_records (
            id TEXT PRIMARY KEY,
            directory_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            payload TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vector_records_directory ON vector_records(directory_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vector_records_file ON vector_records(file_id)")
        .execute(pool)
        .await?;

    Ok(())
}
