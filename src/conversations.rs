//! Conversation and message persistence.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Conversation, StoredMessage};

/// Roles accepted from producers. History rendering additionally knows how
/// to display stored `system` messages.
const PRODUCER_ROLES: &[&str] = &["user", "assistant"];

pub async fn get_conversation(pool: &SqlitePool, id: &str) -> Result<Option<Conversation>> {
    let row = sqlx::query("SELECT id, title, last_updated FROM conversations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(match row {
        Some(row) => {
            let last_updated: String = row.get("last_updated");
            Some(Conversation {
                id: row.get("id"),
                title: row.get("title"),
                last_updated: chrono::DateTime::parse_from_rfc3339(&last_updated)?
                    .with_timezone(&Utc),
            })
        }
        None => None,
    })
}

/// Fetch a conversation, creating an empty one when the id is unknown.
pub async fn get_or_create_conversation(pool: &SqlitePool, id: &str) -> Result<Conversation> {
    if let Some(existing) = get_conversation(pool, id).await? {
        return Ok(existing);
    }
    let conversation = Conversation {
        id: id.to_string(),
        title: "New conversation".to_string(),
        last_updated: Utc::now(),
    };
    sqlx::query("INSERT INTO conversations (id, title, last_updated) VALUES (?, ?, ?)")
        .bind(&conversation.id)
        .bind(&conversation.title)
        .bind(conversation.last_updated.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(conversation)
}

/// Append a message and touch the conversation's `last_updated`.
pub async fn add_message(
    pool: &SqlitePool,
    conversation_id: &str,
    role: &str,
    content: &str,
) -> Result<String> {
    if !PRODUCER_ROLES.contains(&role) {
        bail!("Unknown role: '{}'. Use user or assistant.", role);
    }

    get_or_create_conversation(pool, conversation_id).await?;

    let message_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&message_id)
    .bind(conversation_id)
    .bind(role)
    .bind(content)
    .bind(&now)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE conversations SET last_updated = ? WHERE id = ?")
        .bind(&now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(message_id)
}

/// The last `limit` messages in chronological order.
pub async fn recent_messages(
    pool: &SqlitePool,
    conversation_id: &str,
    limit: i64,
) -> Result<Vec<StoredMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM (
            SELECT id, conversation_id, role, content, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
        )
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let created_at: String = row.get("created_at");
            Ok(StoredMessage {
                id: row.get("id"),
                conversation_id: row.get("conversation_id"),
                role: row.get("role"),
                content: row.get("content"),
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?
                    .with_timezone(&Utc),
            })
        })
        .collect()
}

/// Delete a conversation; messages and context links cascade.
pub async fn delete_conversation(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
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
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .unwrap();
        migrate::run_catalog_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn add_message_creates_conversation() {
        let pool = test_pool().await;
        let id = add_message(&pool, "conv-1", "user", "hello").await.unwrap();
        assert_eq!(id.len(), 36);

        let conversation = get_conversation(&pool, "conv-1").await.unwrap();
        assert!(conversation.is_some());
    }

    #[tokio::test]
    async fn unknown_role_rejected() {
        let pool = test_pool().await;
        assert!(add_message(&pool, "conv-1", "narrator", "hi").await.is_err());
    }

    #[tokio::test]
    async fn recent_messages_keep_chronological_order() {
        let pool = test_pool().await;
        for i in 0..5 {
            add_message(&pool, "conv-1", "user", &format!("m{}", i))
                .await
                .unwrap();
        }

        let recent = recent_messages(&pool, "conv-1", 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn delete_cascades_to_messages() {
        let pool = test_pool().await;
        add_message(&pool, "conv-1", "user", "hello").await.unwrap();
        assert!(delete_conversation(&pool, "conv-1").await.unwrap());

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
