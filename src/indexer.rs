//! Indexing orchestrator.
//!
//! Drives one directory through the full pipeline: scan → change detection
//! → catalog update → extract/chunk/embed per file → vector upsert → Merkle
//! rebuild. Catalog truth is published before any embedding work so a crash
//! mid-batch leaves a consistent picture, and per-file failures are
//! recorded without aborting the batch.

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use std::path::Path;
use uuid::Uuid;

use crate::catalog;
use crate::chunker;
use crate::embedder::SharedEmbedder;
use crate::extract;
use crate::hash;
use crate::merkle;
use crate::models::{
    ChangeSet, Chunk, ChunkMeta, FileRecord, IndexStats, IndexStatus, IndexedDirectory,
};
use crate::progress::{event, ProgressSink};
use crate::settings;
use crate::vector_store::{VectorRecord, VectorStore};

/// Run change detection for a directory without touching the vector store
/// beyond deleted-file cleanup. Returns the detected set.
pub async fn scan_changes(
    pool: &SqlitePool,
    directory: &IndexedDirectory,
) -> Result<(ChangeSet, Vec<String>)> {
    let (current, errors) = scanner_blocking(directory).await?;

    let previous = catalog::files_for_directory(pool, &directory.id).await?;
    let previous_by_path: std::collections::HashMap<&str, &FileRecord> = previous
        .iter()
        .map(|f| (f.relative_path.as_str(), f))
        .collect();

    let mut changes = ChangeSet::default();
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for file in &current {
        seen.insert(file.relative_path.as_str());
        match previous_by_path.get(file.relative_path.as_str()) {
            None => changes.new.push(file.clone()),
            Some(prev) if prev.content_hash != file.content_hash => {
                changes.modified.push(file.clone())
            }
            Some(_) => changes.unchanged.push(file.clone()),
        }
    }

    for prev in &previous {
        if !seen.contains(prev.relative_path.as_str()) {
            changes.deleted.push(prev.relative_path.clone());
        }
    }

    Ok((changes, errors))
}

/// The scan walks the filesystem and hashes every file; keep it off the
/// async executor.
async fn scanner_blocking(
    directory: &IndexedDirectory,
) -> Result<(Vec<crate::models::ScannedFile>, Vec<String>)> {
    let root = directory.path.clone();
    let include = directory.file_patterns.clone();
    let exclude = directory.exclude_patterns.clone();
    tokio::task::spawn_blocking(move || {
        crate::scanner::scan_directory(Path::new(&root), &include, &exclude)
    })
    .await?
}

/// Publish a change set into the catalog: insert `new`, queue `modified`
/// for re-embedding, and remove `deleted` (catalog rows and vector records
/// as one logical unit).
pub async fn apply_changes(
    pool: &SqlitePool,
    store: &VectorStore,
    directory_id: &str,
    changes: &ChangeSet,
) -> Result<()> {
    for file in &changes.new {
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            directory_id: directory_id.to_string(),
            relative_path: file.relative_path.clone(),
            merkle_hash: hash::merkle_leaf(&file.relative_path, &file.content_hash),
            content_hash: file.content_hash.clone(),
            size: file.size,
            last_modified: file.modified,
            indexed: false,
            indexed_at: None,
            chunk_count: 0,
        };
        catalog::insert_file(pool, &record).await?;
    }

    for file in &changes.modified {
        let merkle_hash = hash::merkle_leaf(&file.relative_path, &file.content_hash);
        catalog::update_modified_file(
            pool,
            directory_id,
            &file.relative_path,
            &file.content_hash,
            &merkle_hash,
            file.size,
            file.modified,
        )
        .await?;
    }

    for relative_path in &changes.deleted {
        if let Some(file) = catalog::file_by_path(pool, directory_id, relative_path).await? {
            store.delete_by_file(&file.id).await?;
            catalog::delete_chunk_meta_for_file(pool, &file.id).await?;
        }
        catalog::delete_file_row(pool, directory_id, relative_path).await?;
    }

    Ok(())
}

/// Index one directory, publishing progress to `sink`.
///
/// Per-file failures are collected into the returned stats; only a missing
/// directory or a broken backing store fails the whole call.
pub async fn index_directory(
    pool: &SqlitePool,
    store: &VectorStore,
    embedder: &SharedEmbedder,
    directory_id: &str,
    sink: &dyn ProgressSink,
) -> Result<IndexStats> {
    let directory = catalog::get_directory(pool, directory_id)
        .await?
        .ok_or_else(|| anyhow!("Directory not found: {}", directory_id))?;

    let mut stats = IndexStats::default();

    sink.emit(event(
        IndexStatus::Scanning,
        None,
        0.0,
        "Scanning directory for changes...",
    ));

    ensure_collection_dims(pool, store, embedder).await?;

    let (changes, scan_errors) = scan_changes(pool, &directory).await?;
    stats.errors.extend(scan_errors);
    apply_changes(pool, store, &directory.id, &changes).await?;

    let rag = settings::rag_settings(pool).await?;
    let work = catalog::unindexed_files(pool, &directory.id).await?;
    stats.total_files = work.len() as i64;

    for (i, file) in work.iter().enumerate() {
        sink.emit(event(
            IndexStatus::Indexing,
            Some(file.relative_path.clone()),
            i as f64 / work.len() as f64,
            format!("Indexing {}...", file.relative_path),
        ));

        match index_file(pool, store, embedder, &directory, file, &rag).await {
            Ok(chunk_count) => {
                stats.indexed_files += 1;
                stats.total_chunks += chunk_count;
            }
            Err(e) => {
                let message = format!("Failed to index {}: {}", file.relative_path, e);
                tracing::warn!(directory = %directory.id, "{}", message);
                stats.errors.push(message);
            }
        }

        tokio::task::yield_now().await;
    }

    sink.emit(event(
        IndexStatus::Finalizing,
        None,
        1.0,
        "Building Merkle tree...",
    ));

    let (snapshot, _) = scanner_blocking(&directory).await?;
    let leaves: Vec<(String, String)> = snapshot
        .iter()
        .map(|f| (f.relative_path.clone(), f.content_hash.clone()))
        .collect();
    let (_, nodes) = merkle::build_tree(&directory.id, &leaves);
    catalog::replace_merkle_tree(pool, &directory.id, &nodes).await?;

    catalog::touch_last_indexed(pool, &directory.id).await?;

    sink.emit(event(
        IndexStatus::Complete,
        None,
        1.0,
        format!(
            "Indexed {} files with {} chunks",
            stats.indexed_files, stats.total_chunks
        ),
    ));

    Ok(stats)
}

/// Extract, chunk, embed, and store one file. Returns its chunk count.
async fn index_file(
    pool: &SqlitePool,
    store: &VectorStore,
    embedder: &SharedEmbedder,
    directory: &IndexedDirectory,
    file: &FileRecord,
    rag: &settings::RagSettings,
) -> Result<i64> {
    let absolute = Path::new(&directory.path).join(&file.relative_path);
    let relative = file.relative_path.clone();
    let (text, meta) = tokio::task::spawn_blocking(move || {
        extract::extract_text(&absolute, &relative)
    })
    .await?;

    let chunks = chunker::chunk_text(
        &text,
        &meta.file_type,
        rag.chunk_size as usize,
        rag.chunk_overlap as usize,
    );

    // Drop any previous embeddings first so re-indexing a modified file is
    // idempotent.
    store.delete_by_file(&file.id).await?;
    catalog::delete_chunk_meta_for_file(pool, &file.id).await?;

    if chunks.is_empty() {
        catalog::mark_file_indexed(pool, &file.id, 0).await?;
        return Ok(0);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed(texts).await?;

    let total_chunks = chunks.len();
    let mut records = Vec::with_capacity(total_chunks);
    let mut meta_rows = Vec::with_capacity(total_chunks);

    for (chunk, vector) in chunks.iter().zip(vectors.into_iter()) {
        let vector_id = Uuid::new_v4().to_string();
        records.push(VectorRecord {
            id: vector_id.clone(),
            directory_id: directory.id.clone(),
            file_id: file.id.clone(),
            vector,
            payload: chunk_payload(directory, file, chunk, total_chunks, &meta),
        });
        meta_rows.push(ChunkMeta {
            id: Uuid::new_v4().to_string(),
            file_id: file.id.clone(),
            chunk_index: chunk.chunk_index,
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            chunk_hash: chunk.chunk_hash.clone(),
            vector_id,
        });
    }

    store.upsert(&records).await?;
    catalog::replace_chunk_meta(pool, &file.id, &meta_rows).await?;
    catalog::mark_file_indexed(pool, &file.id, total_chunks as i64).await?;

    Ok(total_chunks as i64)
}

fn chunk_payload(
    directory: &IndexedDirectory,
    file: &FileRecord,
    chunk: &Chunk,
    total_chunks: usize,
    meta: &extract::ExtractionMeta,
) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "file_id": file.id,
        "directory_id": directory.id,
        "file_path": file.relative_path,
        "chunk_index": chunk.chunk_index,
        "start_char": chunk.start_char,
        "end_char": chunk.end_char,
        "chunk_hash": chunk.chunk_hash,
        "total_chunks": total_chunks,
        "content": chunk.text,
    });
    if let serde_json::Value::Object(extra) =
        serde_json::to_value(meta).unwrap_or(serde_json::Value::Null)
    {
        if let Some(obj) = payload.as_object_mut() {
            for (k, v) in extra {
                obj.insert(k, v);
            }
        }
    }
    payload
}

/// Clear the collection and reset catalog flags when the embedding
/// dimensionality no longer matches what the collection was built with.
async fn ensure_collection_dims(
    pool: &SqlitePool,
    store: &VectorStore,
    embedder: &SharedEmbedder,
) -> Result<()> {
    let dims = embedder.dim().await?;
    match store.stored_dims().await? {
        Some(stored) if stored == dims => Ok(()),
        Some(stored) => {
            tracing::info!(stored, new = dims, "embedding dimensionality changed, clearing collection");
            store.clear().await?;
            catalog::reset_indexed_flags(pool).await?;
            store.set_stored_dims(dims).await?;
            Ok(())
        }
        None => {
            store.set_stored_dims(dims).await?;
            Ok(())
        }
    }
}
