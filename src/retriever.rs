//! Retrieval service: conversation context links, similarity search, and
//! context-block formatting for the generation prompt.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::catalog;
use crate::conversations;
use crate::embedder::SharedEmbedder;
use crate::models::{ConversationContext, RetrievedChunk};
use crate::settings;
use crate::vector_store::VectorStore;

/// Header prepended to a non-empty context block.
const CONTEXT_HEADER: &str =
    "Based on the following relevant information from your indexed files:";

// ============ Conversation context links ============

/// Link a directory to a conversation. Linking twice returns the existing
/// link (and re-activates it if it had been removed).
pub async fn add_conversation_context(
    pool: &SqlitePool,
    conversation_id: &str,
    directory_id: &str,
) -> Result<String> {
    catalog::get_directory(pool, directory_id)
        .await?
        .ok_or_else(|| anyhow!("Directory not found: {}", directory_id))?;
    conversations::get_or_create_conversation(pool, conversation_id).await?;

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM conversation_rag_context WHERE conversation_id = ? AND directory_id = ?",
    )
    .bind(conversation_id)
    .bind(directory_id)
    .fetch_optional(pool)
    .await?;

    if let Some(id) = existing {
        sqlx::query("UPDATE conversation_rag_context SET is_active = 1 WHERE id = ?")
            .bind(&id)
            .execute(pool)
            .await?;
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO conversation_rag_context (id, conversation_id, directory_id, is_active, created_at)
        VALUES (?, ?, ?, 1, ?)
        "#,
    )
    .bind(&id)
    .bind(conversation_id)
    .bind(directory_id)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(id)
}

/// Unlink a directory from a conversation (deactivates the link).
pub async fn remove_conversation_context(
    pool: &SqlitePool,
    conversation_id: &str,
    directory_id: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE conversation_rag_context SET is_active = 0 WHERE conversation_id = ? AND directory_id = ?",
    )
    .bind(conversation_id)
    .bind(directory_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Active directories linked to a conversation.
pub async fn conversation_contexts(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<Vec<ConversationContext>> {
    let rows = sqlx::query(
        r#"
        SELECT crc.id, crc.directory_id, d.path, d.last_indexed_at
        FROM conversation_rag_context crc
        JOIN indexed_directories d ON crc.directory_id = d.id
        WHERE crc.conversation_id = ? AND crc.is_active = 1
        ORDER BY crc.created_at
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let last_indexed_at: Option<String> = row.get("last_indexed_at");
            Ok(ConversationContext {
                id: row.get("id"),
                directory_id: row.get("directory_id"),
                path: row.get("path"),
                last_indexed_at: last_indexed_at
                    .as_deref()
                    .map(|s| {
                        chrono::DateTime::parse_from_rfc3339(s)
                            .map(|dt| dt.with_timezone(&Utc))
                    })
                    .transpose()?,
            })
        })
        .collect()
}

// ============ Retrieval ============

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    pub query: String,
    pub total_chunks_searched: i64,
}

/// Retrieve relevant chunks for a query.
///
/// Directory resolution order: explicit ids → the conversation's active
/// links → empty. An empty directory set yields an empty result, not an
/// error.
pub async fn retrieve(
    pool: &SqlitePool,
    store: &VectorStore,
    embedder: &SharedEmbedder,
    query: &str,
    conversation_id: &str,
    directory_ids: Option<Vec<String>>,
    top_k: Option<i64>,
    min_score: Option<f64>,
) -> Result<RetrievalResult> {
    let directory_ids = match directory_ids {
        Some(ids) if !ids.is_empty() => ids,
        _ => conversation_contexts(pool, conversation_id)
            .await?
            .into_iter()
            .map(|c| c.directory_id)
            .collect(),
    };

    if directory_ids.is_empty() {
        return Ok(RetrievalResult {
            chunks: Vec::new(),
            query: query.to_string(),
            total_chunks_searched: 0,
        });
    }

    let rag = settings::rag_settings(pool).await?;
    let top_k = top_k.unwrap_or(rag.top_k).max(0) as usize;
    let min_score = min_score.unwrap_or(rag.min_relevance_score);

    let query_vector = embedder
        .embed(vec![query.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))?;

    let hits = store.query(&query_vector, top_k, &directory_ids).await?;

    let chunks: Vec<RetrievedChunk> = hits
        .into_iter()
        .filter(|hit| hit.score >= min_score)
        .map(|hit| RetrievedChunk {
            content: hit
                .payload
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            file_path: hit
                .payload
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            chunk_index: hit
                .payload
                .get("chunk_index")
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
            relevance_score: hit.score,
            metadata: hit.payload,
        })
        .collect();

    let mut total_chunks_searched = 0;
    for directory_id in &directory_ids {
        total_chunks_searched += catalog::directory_stats(pool, directory_id)
            .await?
            .total_chunks;
    }

    Ok(RetrievalResult {
        chunks,
        query: query.to_string(),
        total_chunks_searched,
    })
}

// ============ Context formatting ============

/// Greedily format ranked chunks into a bounded context block.
///
/// Chunks are appended in score order, each wrapped with its source line;
/// appending stops before the chunk that would push the accumulated block
/// past `max_context_length`. An empty selection yields an empty string.
pub fn format_context(chunks: &[RetrievedChunk], max_context_length: usize) -> (String, Vec<serde_json::Value>) {
    let mut parts: Vec<String> = Vec::new();
    let mut used_metadata: Vec<serde_json::Value> = Vec::new();
    let mut current_length = 0usize;

    for chunk in chunks {
        let chunk_text = format!(
            "\n---\nSource: {} (chunk {})\n{}\n---",
            chunk.file_path,
            chunk.chunk_index + 1,
            chunk.content
        );
        if current_length + chunk_text.len() > max_context_length {
            break;
        }
        current_length += chunk_text.len();
        parts.push(chunk_text);
        used_metadata.push(serde_json::json!({
            "file_path": chunk.file_path,
            "chunk_index": chunk.chunk_index,
            "relevance_score": chunk.relevance_score,
        }));
    }

    if parts.is_empty() {
        return (String::new(), used_metadata);
    }

    let context = format!("{}\n{}\n\n", CONTEXT_HEADER, parts.join(""));
    (context, used_metadata)
}
