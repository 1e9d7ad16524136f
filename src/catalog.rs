//! Index catalog: the relational source of truth for what has been indexed.
//!
//! Holds directories, file rows, chunk metadata, and Merkle nodes. All
//! writes run in transactions; timestamps are stored as RFC 3339 text and
//! pattern lists as JSON arrays.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{ChunkMeta, FileRecord, IndexedDirectory, MerkleNode};
use crate::scanner;

// ============ Directories ============

/// Register a directory for indexing. The path must exist and be a
/// directory; it is canonicalized before storage. Registering an already
/// known path returns the existing row.
pub async fn add_directory(
    pool: &SqlitePool,
    path: &str,
    file_patterns: Option<Vec<String>>,
    exclude_patterns: Option<Vec<String>>,
    index_frequency_minutes: Option<i64>,
) -> Result<IndexedDirectory> {
    let canonical = std::fs::canonicalize(path)
        .with_context(|| format!("Directory does not exist: {}", path))?;
    if !canonical.is_dir() {
        bail!("Path is not a directory: {}", canonical.display());
    }
    let canonical = canonical.to_string_lossy().to_string();

    if let Some(existing) = directory_by_path(pool, &canonical).await? {
        return Ok(existing);
    }

    let directory = IndexedDirectory {
        id: Uuid::new_v4().to_string(),
        path: canonical,
        is_active: true,
        file_patterns: file_patterns.unwrap_or_else(scanner::default_file_patterns),
        exclude_patterns: exclude_patterns.unwrap_or_else(scanner::default_exclude_patterns),
        index_frequency_minutes: index_frequency_minutes.unwrap_or(60),
        last_indexed_at: None,
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO indexed_directories
            (id, path, is_active, file_patterns, exclude_patterns, index_frequency_minutes, created_at)
        VALUES (?, ?, 1, ?, ?, ?, ?)
        "#,
    )
    .bind(&directory.id)
    .bind(&directory.path)
    .bind(serde_json::to_string(&directory.file_patterns)?)
    .bind(serde_json::to_string(&directory.exclude_patterns)?)
    .bind(directory.index_frequency_minutes)
    .bind(directory.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(directory)
}

pub async fn list_directories(pool: &SqlitePool, active_only: bool) -> Result<Vec<IndexedDirectory>> {
    let sql = if active_only {
        "SELECT * FROM indexed_directories WHERE is_active = 1 ORDER BY created_at"
    } else {
        "SELECT * FROM indexed_directories ORDER BY created_at"
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    rows.iter().map(row_to_directory).collect()
}

pub async fn get_directory(pool: &SqlitePool, id: &str) -> Result<Option<IndexedDirectory>> {
    let row = sqlx::query("SELECT * FROM indexed_directories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_directory).transpose()
}

async fn directory_by_path(pool: &SqlitePool, path: &str) -> Result<Option<IndexedDirectory>> {
    let row = sqlx::query("SELECT * FROM indexed_directories WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_directory).transpose()
}

/// Soft delete: the directory stays in the catalog (history preserved) but
/// is skipped by retrieval and the background reindexer.
pub async fn deactivate_directory(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE indexed_directories SET is_active = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_last_indexed(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE indexed_directories SET last_indexed_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_directory(row: &sqlx::sqlite::SqliteRow) -> Result<IndexedDirectory> {
    let file_patterns: String = row.get("file_patterns");
    let exclude_patterns: String = row.get("exclude_patterns");
    let last_indexed_at: Option<String> = row.get("last_indexed_at");
    let created_at: String = row.get("created_at");

    Ok(IndexedDirectory {
        id: row.get("id"),
        path: row.get("path"),
        is_active: row.get::<i64, _>("is_active") != 0,
        file_patterns: serde_json::from_str(&file_patterns)?,
        exclude_patterns: serde_json::from_str(&exclude_patterns)?,
        index_frequency_minutes: row.get("index_frequency_minutes"),
        last_indexed_at: last_indexed_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_at)?,
    })
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid timestamp: {}", text))?
        .with_timezone(&Utc))
}

// ============ Files ============

pub async fn files_for_directory(
    pool: &SqlitePool,
    directory_id: &str,
) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query("SELECT * FROM file_index WHERE directory_id = ? ORDER BY relative_path")
        .bind(directory_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_file).collect()
}

pub async fn get_file(pool: &SqlitePool, file_id: &str) -> Result<Option<FileRecord>> {
    let row = sqlx::query("SELECT * FROM file_index WHERE id = ?")
        .bind(file_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_file).transpose()
}

pub async fn file_by_path(
    pool: &SqlitePool,
    directory_id: &str,
    relative_path: &str,
) -> Result<Option<FileRecord>> {
    let row = sqlx::query("SELECT * FROM file_index WHERE directory_id = ? AND relative_path = ?")
        .bind(directory_id)
        .bind(relative_path)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_file).transpose()
}

pub async fn insert_file(pool: &SqlitePool, file: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO file_index
            (id, directory_id, relative_path, content_hash, merkle_hash, size,
             last_modified, is_indexed, indexed_at, chunk_count)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, 0)
        "#,
    )
    .bind(&file.id)
    .bind(&file.directory_id)
    .bind(&file.relative_path)
    .bind(&file.content_hash)
    .bind(&file.merkle_hash)
    .bind(file.size)
    .bind(file.last_modified.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record new content for a modified file and queue it for re-embedding.
pub async fn update_modified_file(
    pool: &SqlitePool,
    directory_id: &str,
    relative_path: &str,
    content_hash: &str,
    merkle_hash: &str,
    size: i64,
    last_modified: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE file_index
        SET content_hash = ?, merkle_hash = ?, size = ?, last_modified = ?,
            is_indexed = 0, indexed_at = NULL
        WHERE directory_id = ? AND relative_path = ?
        "#,
    )
    .bind(content_hash)
    .bind(merkle_hash)
    .bind(size)
    .bind(last_modified.to_rfc3339())
    .bind(directory_id)
    .bind(relative_path)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_file_row(
    pool: &SqlitePool,
    directory_id: &str,
    relative_path: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM file_index WHERE directory_id = ? AND relative_path = ?")
        .bind(directory_id)
        .bind(relative_path)
        .execute(pool)
        .await?;
    Ok(())
}

/// Files queued for (re)embedding, smallest first so the progress sink gets
/// early feedback.
pub async fn unindexed_files(pool: &SqlitePool, directory_id: &str) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM file_index WHERE directory_id = ? AND is_indexed = 0 ORDER BY size ASC",
    )
    .bind(directory_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_file).collect()
}

pub async fn mark_file_indexed(pool: &SqlitePool, file_id: &str, chunk_count: i64) -> Result<()> {
    sqlx::query(
        "UPDATE file_index SET is_indexed = 1, indexed_at = ?, chunk_count = ? WHERE id = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(chunk_count)
    .bind(file_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reset every file to unindexed; used when the embedding model changes.
pub async fn reset_indexed_flags(pool: &SqlitePool) -> Result<()> {
    sqlx::query("UPDATE file_index SET is_indexed = 0, indexed_at = NULL, chunk_count = 0")
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM embedding_metadata")
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> Result<FileRecord> {
    let last_modified: String = row.get("last_modified");
    let indexed_at: Option<String> = row.get("indexed_at");
    Ok(FileRecord {
        id: row.get("id"),
        directory_id: row.get("directory_id"),
        relative_path: row.get("relative_path"),
        content_hash: row.get("content_hash"),
        merkle_hash: row.get("merkle_hash"),
        size: row.get("size"),
        last_modified: parse_ts(&last_modified)?,
        indexed: row.get::<i64, _>("is_indexed") != 0,
        indexed_at: indexed_at.as_deref().map(parse_ts).transpose()?,
        chunk_count: row.get("chunk_count"),
    })
}

// ============ Chunk metadata ============

pub async fn vector_ids_for_file(pool: &SqlitePool, file_id: &str) -> Result<Vec<String>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT vector_id FROM embedding_metadata WHERE file_id = ?")
            .bind(file_id)
            .fetch_all(pool)
            .await?;
    Ok(ids)
}

pub async fn chunk_hashes_for_file(pool: &SqlitePool, file_id: &str) -> Result<Vec<String>> {
    let hashes: Vec<String> = sqlx::query_scalar(
        "SELECT chunk_hash FROM embedding_metadata WHERE file_id = ? ORDER BY chunk_index",
    )
    .bind(file_id)
    .fetch_all(pool)
    .await?;
    Ok(hashes)
}

/// Replace a file's chunk rows in one transaction.
pub async fn replace_chunk_meta(
    pool: &SqlitePool,
    file_id: &str,
    chunks: &[ChunkMeta],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM embedding_metadata WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO embedding_metadata
                (id, file_id, chunk_index, start_char, end_char, chunk_hash, vector_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.file_id)
        .bind(chunk.chunk_index)
        .bind(chunk.start_char)
        .bind(chunk.end_char)
        .bind(&chunk.chunk_hash)
        .bind(&chunk.vector_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn delete_chunk_meta_for_file(pool: &SqlitePool, file_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM embedding_metadata WHERE file_id = ?")
        .bind(file_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Merkle tree ============

/// Replace a directory's Merkle tree atomically.
pub async fn replace_merkle_tree(
    pool: &SqlitePool,
    directory_id: &str,
    nodes: &[MerkleNode],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM merkle_tree WHERE directory_id = ?")
        .bind(directory_id)
        .execute(&mut *tx)
        .await?;
    for node in nodes {
        sqlx::query(
            r#"
            INSERT INTO merkle_tree
                (id, directory_id, node_path, node_hash, is_leaf, parent_path, depth)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.directory_id)
        .bind(&node.node_path)
        .bind(&node.node_hash)
        .bind(node.is_leaf as i64)
        .bind(&node.parent_path)
        .bind(node.depth)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn merkle_root(pool: &SqlitePool, directory_id: &str) -> Result<Option<String>> {
    let root: Option<String> = sqlx::query_scalar(
        "SELECT node_hash FROM merkle_tree WHERE directory_id = ? AND node_path = ''",
    )
    .bind(directory_id)
    .fetch_optional(pool)
    .await?;
    Ok(root)
}

// ============ Stats & maintenance ============

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryStats {
    pub total_files: i64,
    pub indexed_files: i64,
    pub total_size: i64,
    pub total_chunks: i64,
}

pub async fn directory_stats(pool: &SqlitePool, directory_id: &str) -> Result<DirectoryStats> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total_files,
            COALESCE(SUM(is_indexed), 0) AS indexed_files,
            COALESCE(SUM(size), 0) AS total_size,
            COALESCE(SUM(chunk_count), 0) AS total_chunks
        FROM file_index
        WHERE directory_id = ?
        "#,
    )
    .bind(directory_id)
    .fetch_one(pool)
    .await?;

    Ok(DirectoryStats {
        total_files: row.get("total_files"),
        indexed_files: row.get("indexed_files"),
        total_size: row.get("total_size"),
        total_chunks: row.get("total_chunks"),
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub total_directories: i64,
    pub total_files: i64,
    pub indexed_files: i64,
    pub total_chunks: i64,
}

pub async fn aggregate_stats(pool: &SqlitePool) -> Result<AggregateStats> {
    let total_directories: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM indexed_directories WHERE is_active = 1")
            .fetch_one(pool)
            .await?;
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total_files,
            COALESCE(SUM(is_indexed), 0) AS indexed_files,
            COALESCE(SUM(chunk_count), 0) AS total_chunks
        FROM file_index
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(AggregateStats {
        total_directories,
        total_files: row.get("total_files"),
        indexed_files: row.get("indexed_files"),
        total_chunks: row.get("total_chunks"),
    })
}

/// Wipe all indexed state: file rows, chunk metadata, Merkle nodes, and
/// last-indexed markers. Directory registrations survive.
pub async fn clear_index(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM embedding_metadata")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM merkle_tree").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM file_index").execute(&mut *tx).await?;
    sqlx::query("UPDATE indexed_directories SET last_indexed_at = NULL")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_catalog_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn add_directory_is_idempotent_by_path() {
        let pool = test_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_string_lossy().to_string();

        let first = add_directory(&pool, &path, None, None, None).await.unwrap();
        let second = add_directory(&pool, &path, None, None, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(list_directories(&pool, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_directory_rejects_missing_path() {
        let pool = test_pool().await;
        assert!(add_directory(&pool, "/no/such/dir", None, None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn deactivate_hides_from_active_listing() {
        let pool = test_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let dir = add_directory(&pool, tmp.path().to_str().unwrap(), None, None, None)
            .await
            .unwrap();

        assert!(deactivate_directory(&pool, &dir.id).await.unwrap());
        assert!(list_directories(&pool, true).await.unwrap().is_empty());
        assert_eq!(list_directories(&pool, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_lifecycle_roundtrip() {
        let pool = test_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let dir = add_directory(&pool, tmp.path().to_str().unwrap(), None, None, None)
            .await
            .unwrap();

        let file = FileRecord {
            id: Uuid::new_v4().to_string(),
            directory_id: dir.id.clone(),
            relative_path: "a.md".to_string(),
            content_hash: "h1".to_string(),
            merkle_hash: "m1".to_string(),
            size: 5,
            last_modified: Utc::now(),
            indexed: false,
            indexed_at: None,
            chunk_count: 0,
        };
        insert_file(&pool, &file).await.unwrap();

        let pending = unindexed_files(&pool, &dir.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].relative_path, "a.md");

        mark_file_indexed(&pool, &file.id, 3).await.unwrap();
        assert!(unindexed_files(&pool, &dir.id).await.unwrap().is_empty());

        let stats = directory_stats(&pool, &dir.id).await.unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.indexed_files, 1);
        assert_eq!(stats.total_chunks, 3);
    }

    #[tokio::test]
    async fn unindexed_files_ordered_by_size() {
        let pool = test_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let dir = add_directory(&pool, tmp.path().to_str().unwrap(), None, None, None)
            .await
            .unwrap();

        for (name, size) in [("big.md", 500), ("small.md", 5), ("mid.md", 50)] {
            let file = FileRecord {
                id: Uuid::new_v4().to_string(),
                directory_id: dir.id.clone(),
                relative_path: name.to_string(),
                content_hash: "h".to_string(),
                merkle_hash: "m".to_string(),
                size,
                last_modified: Utc::now(),
                indexed: false,
                indexed_at: None,
                chunk_count: 0,
            };
            insert_file(&pool, &file).await.unwrap();
        }

        let pending = unindexed_files(&pool, &dir.id).await.unwrap();
        let names: Vec<&str> = pending.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["small.md", "mid.md", "big.md"]);
    }

    #[tokio::test]
    async fn replace_chunk_meta_swaps_rows() {
        let pool = test_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let dir = add_directory(&pool, tmp.path().to_str().unwrap(), None, None, None)
            .await
            .unwrap();
        let file = FileRecord {
            id: Uuid::new_v4().to_string(),
            directory_id: dir.id.clone(),
            relative_path: "a.md".to_string(),
            content_hash: "h".to_string(),
            merkle_hash: "m".to_string(),
            size: 1,
            last_modified: Utc::now(),
            indexed: false,
            indexed_at: None,
            chunk_count: 0,
        };
        insert_file(&pool, &file).await.unwrap();

        let meta = |i: i64, vid: &str| ChunkMeta {
            id: Uuid::new_v4().to_string(),
            file_id: file.id.clone(),
            chunk_index: i,
            start_char: 0,
            end_char: 1,
            chunk_hash: format!("ch{}", i),
            vector_id: vid.to_string(),
        };

        replace_chunk_meta(&pool, &file.id, &[meta(0, "v0"), meta(1, "v1")])
            .await
            .unwrap();
        replace_chunk_meta(&pool, &file.id, &[meta(0, "v2")]).await.unwrap();

        let ids = vector_ids_for_file(&pool, &file.id).await.unwrap();
        assert_eq!(ids, vec!["v2"]);
    }
}
