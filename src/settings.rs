//! Runtime settings singletons and user-defined rules.
//!
//! Two singleton rows drive behaviour: `rag_settings` (chunking, embedding
//! model, retrieval tuning) and `model_behavior` (system prompt, sampling,
//! stop sequences). Changing the embedding model invalidates the vector
//! collection and queues every file for re-embedding.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::catalog;
use crate::embedder::SharedEmbedder;
use crate::vector_store::VectorStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSettings {
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub embedding_model: String,
    pub top_k: i64,
    pub min_relevance_score: f64,
    pub max_context_length: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBehavior {
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub stop_sequences: Vec<String>,
    pub context_window: i64,
}

pub async fn rag_settings(pool: &SqlitePool) -> Result<RagSettings> {
    let row = sqlx::query("SELECT * FROM rag_settings WHERE id = 1")
        .fetch_one(pool)
        .await?;
    Ok(RagSettings {
        chunk_size: row.get("chunk_size"),
        chunk_overlap: row.get("chunk_overlap"),
        embedding_model: row.get("embedding_model"),
        top_k: row.get("top_k"),
        min_relevance_score: row.get("min_relevance_score"),
        max_context_length: row.get("max_context_length"),
    })
}

/// Persist new RAG settings. If the embedding model changed, the vector
/// collection is cleared and every file queued for re-embedding before the
/// new model is used.
pub async fn update_rag_settings(
    pool: &SqlitePool,
    store: &VectorStore,
    embedder: &SharedEmbedder,
    new: &RagSettings,
) -> Result<()> {
    let current = rag_settings(pool).await?;

    if current.embedding_model != new.embedding_model {
        tracing::info!(
            from = %current.embedding_model,
            to = %new.embedding_model,
            "embedding model changed, invalidating vector collection"
        );
        store.clear().await?;
        catalog::reset_indexed_flags(pool).await?;
        embedder.reload(&new.embedding_model).await;
    }

    sqlx::query(
        r#"
        UPDATE rag_settings
        SET chunk_size = ?, chunk_overlap = ?, embedding_model = ?,
            top_k = ?, min_relevance_score = ?, max_context_length = ?
        WHERE id = 1
        "#,
    )
    .bind(new.chunk_size)
    .bind(new.chunk_overlap)
    .bind(&new.embedding_model)
    .bind(new.top_k)
    .bind(new.min_relevance_score)
    .bind(new.max_context_length)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn model_behavior(pool: &SqlitePool) -> Result<ModelBehavior> {
    let row = sqlx::query("SELECT * FROM model_behavior WHERE id = 1")
        .fetch_one(pool)
        .await?;
    let stop_sequences: String = row.get("stop_sequences");
    Ok(ModelBehavior {
        system_prompt: row.get("system_prompt"),
        temperature: row.get("temperature"),
        max_tokens: row.get("max_tokens"),
        stop_sequences: serde_json::from_str(&stop_sequences).unwrap_or_default(),
        context_window: row.get("context_window"),
    })
}

pub async fn update_model_behavior(pool: &SqlitePool, behavior: &ModelBehavior) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE model_behavior
        SET system_prompt = ?, temperature = ?, max_tokens = ?,
            stop_sequences = ?, context_window = ?
        WHERE id = 1
        "#,
    )
    .bind(&behavior.system_prompt)
    .bind(behavior.temperature)
    .bind(behavior.max_tokens)
    .bind(serde_json::to_string(&behavior.stop_sequences)?)
    .bind(behavior.context_window)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Rules ============

#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: String,
    pub content: String,
    pub is_enabled: bool,
}

pub async fn add_rule(pool: &SqlitePool, content: &str) -> Result<Rule> {
    let rule = Rule {
        id: Uuid::new_v4().to_string(),
        content: content.to_string(),
        is_enabled: true,
    };
    sqlx::query("INSERT INTO rules (id, content, is_enabled, created_at) VALUES (?, ?, 1, ?)")
        .bind(&rule.id)
        .bind(&rule.content)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    Ok(rule)
}

pub async fn list_rules(pool: &SqlitePool) -> Result<Vec<Rule>> {
    let rows = sqlx::query("SELECT id, content, is_enabled FROM rules ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| Rule {
            id: row.get("id"),
            content: row.get("content"),
            is_enabled: row.get::<i64, _>("is_enabled") != 0,
        })
        .collect())
}

/// The effective system prompt: configured prompt plus enabled rules under
/// a labeled section.
pub async fn system_prompt_with_rules(pool: &SqlitePool) -> Result<String> {
    let behavior = model_behavior(pool).await?;
    let rules = list_rules(pool).await?;

    let enabled: Vec<&Rule> = rules.iter().filter(|r| r.is_enabled).collect();
    if enabled.is_empty() {
        return Ok(behavior.system_prompt);
    }

    let mut prompt = behavior.system_prompt;
    prompt.push_str("\n\nADDITIONAL RULES:\n");
    for rule in enabled {
        prompt.push_str(&format!("- {}\n", rule.content));
    }
    Ok(prompt)
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
    async fn defaults_are_seeded() {
        let pool = test_pool().await;
        let rag = rag_settings(&pool).await.unwrap();
        assert_eq!(rag.chunk_size, 1000);
        assert_eq!(rag.chunk_overlap, 200);
        assert_eq!(rag.top_k, 5);
        assert!((rag.min_relevance_score - 0.3).abs() < 1e-9);

        let behavior = model_behavior(&pool).await.unwrap();
        assert_eq!(behavior.max_tokens, 512);
        assert_eq!(behavior.context_window, 2048);
        assert!(behavior.stop_sequences.is_empty());
    }

    #[tokio::test]
    async fn model_change_clears_collection_and_flags() {
        let pool = test_pool().await;
        let vpool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_vector_migrations(&vpool).await.unwrap();
        let store = VectorStore::new(vpool);
        let embedder = SharedEmbedder::new("hash");

        store
            .upsert(&[crate::vector_store::VectorRecord {
                id: "v1".into(),
                directory_id: "d1".into(),
                file_id: "f1".into(),
                vector: vec![1.0],
                payload: serde_json::json!({}),
            }])
            .await
            .unwrap();

        let mut new = rag_settings(&pool).await.unwrap();
        new.embedding_model = "hash-other".to_string();
        update_rag_settings(&pool, &store, &embedder, &new).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(embedder.model_id().await, "hash-other");
        assert_eq!(
            rag_settings(&pool).await.unwrap().embedding_model,
            "hash-other"
        );
    }

    #[tokio::test]
    async fn rules_append_to_system_prompt() {
        let pool = test_pool().await;
        let mut behavior = model_behavior(&pool).await.unwrap();
        behavior.system_prompt = "You are a helpful assistant.".to_string();
        update_model_behavior(&pool, &behavior).await.unwrap();

        assert_eq!(
            system_prompt_with_rules(&pool).await.unwrap(),
            "You are a helpful assistant."
        );

        add_rule(&pool, "Always answer in French.").await.unwrap();
        let prompt = system_prompt_with_rules(&pool).await.unwrap();
        assert!(prompt.starts_with("You are a helpful assistant."));
        assert!(prompt.contains("ADDITIONAL RULES:"));
        assert!(prompt.contains("- Always answer in French."));
    }
}
