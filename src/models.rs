//! Core data models used throughout Parley.
//!
//! These types represent the directories, files, chunks, Merkle nodes, and
//! conversations that flow through the indexing and generation pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A directory registered for indexing.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedDirectory {
    pub id: String,
    /// Absolute, canonicalized filesystem path.
    pub path: String,
    pub is_active: bool,
    /// Glob patterns matched against file names.
    pub file_patterns: Vec<String>,
    /// Glob patterns matched against file names and path components.
    pub exclude_patterns: Vec<String>,
    pub index_frequency_minutes: i64,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A file yielded by the scanner, before it is compared against the catalog.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Path relative to the directory root, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: i64,
    pub modified: DateTime<Utc>,
    pub content_hash: String,
}

/// A catalog row for one file in an indexed directory.
///
/// `(directory_id, relative_path)` is unique; `merkle_hash` is always
/// derived from `(relative_path, content_hash)`.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub directory_id: String,
    pub relative_path: String,
    pub content_hash: String,
    pub merkle_hash: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub indexed: bool,
    pub indexed_at: Option<DateTime<Utc>>,
    pub chunk_count: i64,
}

/// One node of a directory's Merkle tree. The root has `node_path == ""`.
#[derive(Debug, Clone)]
pub struct MerkleNode {
    pub id: String,
    pub directory_id: String,
    pub node_path: String,
    pub node_hash: String,
    pub is_leaf: bool,
    pub parent_path: Option<String>,
    pub depth: i64,
}

/// A chunk of extracted text, the unit of embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_index: i64,
    pub text: String,
    /// Character offset into the extracted text. Non-decreasing across a
    /// file's chunk sequence.
    pub start_char: i64,
    pub end_char: i64,
    pub chunk_hash: String,
}

/// Catalog row linking a chunk to its vector-store record.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub start_char: i64,
    pub end_char: i64,
    pub chunk_hash: String,
    pub vector_id: String,
}

/// A chunk returned from retrieval, ranked by relevance.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub file_path: String,
    pub chunk_index: i64,
    pub relevance_score: f64,
    pub metadata: serde_json::Value,
}

/// Outcome of scanning a directory against the catalog.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub new: Vec<ScannedFile>,
    pub modified: Vec<ScannedFile>,
    /// Relative paths of files present in the catalog but gone on disk.
    pub deleted: Vec<String>,
    pub unchanged: Vec<ScannedFile>,
}

/// Statistics returned by a full index run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub total_files: i64,
    pub indexed_files: i64,
    pub total_chunks: i64,
    pub errors: Vec<String>,
}

/// Phase of an indexing job, as reported to progress sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Scanning,
    Indexing,
    Finalizing,
    Complete,
    Error,
}

/// A progress event published during an indexing job.
///
/// `progress` is monotonically non-decreasing within one job.
#[derive(Debug, Clone, Serialize)]
pub struct IndexProgress {
    pub status: IndexStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub progress: f64,
    pub message: String,
}

/// A stored conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub last_updated: DateTime<Utc>,
}

/// One message within a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A directory linked to a conversation for retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub id: String,
    pub directory_id: String,
    pub path: String,
    pub last_indexed_at: Option<DateTime<Utc>>,
}
