//! Persistent vector collection.
//!
//! Stores `(id, embedding, payload)` records in a dedicated SQLite file and
//! answers top-k similarity queries with an optional directory filter.
//! Vectors are encoded as little-endian `f32` blobs; similarity queries
//! brute-force cosine distance over the (filtered) candidate set, which is
//! comfortably fast at desktop scale.
//!
//! Scores are mapped to `(0, 1]` via `score = 1 / (1 + distance)` where
//! `distance = 1 − cosine`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::migrate;

/// A record to insert into the collection.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub directory_id: String,
    pub file_id: String,
    pub vector: Vec<f32>,
    /// Chunk payload: `file_path`, `chunk_index`, offsets, extraction
    /// metadata. Returned verbatim from queries.
    pub payload: serde_json::Value,
}

/// A similarity query hit.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub score: f64,
    pub payload: serde_json::Value,
}

/// Per-directory record counts.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryVectorStats {
    pub directory_id: String,
    pub file_count: i64,
    pub chunk_count: i64,
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace records.
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO vector_records (id, directory_id, file_id, embedding, payload)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    directory_id = excluded.directory_id,
                    file_id = excluded.file_id,
                    embedding = excluded.embedding,
                    payload = excluded.payload
                "#,
            )
            .bind(&record.id)
            .bind(&record.directory_id)
            .bind(&record.file_id)
            .bind(vec_to_blob(&record.vector))
            .bind(record.payload.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM vector_records WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Remove every record belonging to a file.
    pub async fn delete_by_file(&self, file_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM vector_records WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Top-k similarity query. When `directory_ids` is non-empty, only
    /// records from those directories are considered.
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        directory_ids: &[String],
    ) -> Result<Vec<QueryHit>> {
        let rows = if directory_ids.is_empty() {
            sqlx::query("SELECT id, embedding, payload FROM vector_records")
                .fetch_all(&self.pool)
                .await?
        } else {
            let placeholders = vec!["?"; directory_ids.len()].join(", ");
            let sql = format!(
                "SELECT id, embedding, payload FROM vector_records WHERE directory_id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in directory_ids {
                query = query.bind(id);
            }
            query.fetch_all(&self.pool).await?
        };

        let mut hits: Vec<QueryHit> = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let candidate = blob_to_vec(&blob);
            let distance = 1.0 - f64::from(cosine_similarity(vector, &candidate));
            let score = 1.0 / (1.0 + distance);

            let payload_text: String = row.get("payload");
            let payload =
                serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null);

            hits.push(QueryHit {
                id: row.get("id"),
                score,
                payload,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Drop and recreate the collection.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS vector_records")
            .execute(&self.pool)
            .await?;
        migrate::run_vector_migrations(&self.pool).await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn directory_stats(&self) -> Result<Vec<DirectoryVectorStats>> {
        let rows = sqlx::query(
            r#"
            SELECT directory_id,
                   COUNT(DISTINCT file_id) AS file_count,
                   COUNT(*) AS chunk_count
            FROM vector_records
            GROUP BY directory_id
            ORDER BY directory_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DirectoryVectorStats {
                directory_id: row.get("directory_id"),
                file_count: row.get("file_count"),
                chunk_count: row.get("chunk_count"),
            })
            .collect())
    }

    /// Dimensionality currently stored in collection metadata, if any.
    pub async fn stored_dims(&self) -> Result<Option<usize>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM collection_meta WHERE key = 'dims'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn set_stored_dims(&self, dims: usize) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_meta (key, value) VALUES ('dims', ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(dims.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a blob back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
