//! End-to-end pipeline tests: register a directory, index it, mutate the
//! tree, reindex, retrieve, and generate with retrieved context. Everything
//! runs in-process against temp directories and in-memory databases with
//! the deterministic hashing embedder.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use sqlx::SqlitePool;
use tempfile::TempDir;

use parley::embedder::SharedEmbedder;
use parley::generation::GenerationService;
use parley::llm::{GenerationLease, ScriptedModel};
use parley::models::IndexedDirectory;
use parley::progress::NullSink;
use parley::vector_store::VectorStore;
use parley::{catalog, conversations, hash, indexer, migrate, retriever};

struct Harness {
    _files: TempDir,
    root: std::path::PathBuf,
    pool: SqlitePool,
    store: VectorStore,
    embedder: Arc<SharedEmbedder>,
}

async fn memory_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

async fn setup() -> Harness {
    let files = TempDir::new().unwrap();
    let root = files.path().to_path_buf();

    let pool = memory_pool().await;
    migrate::run_catalog_migrations(&pool).await.unwrap();
    let vpool = memory_pool().await;
    migrate::run_vector_migrations(&vpool).await.unwrap();

    // Zero overlap keeps the tiny-file scenarios at one chunk per file
    sqlx::query("UPDATE rag_settings SET chunk_overlap = 0, embedding_model = 'hash'")
        .execute(&pool)
        .await
        .unwrap();

    Harness {
        _files: files,
        root,
        pool,
        store: VectorStore::new(vpool),
        embedder: Arc::new(SharedEmbedder::new("hash")),
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

async fn register(h: &Harness) -> IndexedDirectory {
    catalog::add_directory(
        &h.pool,
        h.root.to_str().unwrap(),
        Some(vec!["*.md".into(), "*.py".into(), "*.txt".into()]),
        Some(vec![]),
        None,
    )
    .await
    .unwrap()
}

fn seed_tiny_tree(h: &Harness) {
    write(&h.root, "a.md", "hello");
    write(&h.root, "b.py", "print(1)");
    write(&h.root, "sub/c.txt", "x");
}

#[tokio::test]
async fn index_tiny_tree_end_to_end() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    let stats = indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    assert_eq!(stats.total_files, 3);
    assert_eq!(stats.indexed_files, 3);
    assert_eq!(stats.total_chunks, 3);
    assert!(stats.errors.is_empty());

    let aggregate = catalog::aggregate_stats(&h.pool).await.unwrap();
    assert_eq!(aggregate.total_directories, 1);
    assert_eq!(aggregate.total_files, 3);
    assert_eq!(aggregate.indexed_files, 3);
    assert_eq!(aggregate.total_chunks, 3);

    assert_eq!(h.store.count().await.unwrap(), 3);
    assert!(catalog::merkle_root(&h.pool, &dir.id).await.unwrap().is_some());

    let directory = catalog::get_directory(&h.pool, &dir.id).await.unwrap().unwrap();
    assert!(directory.last_indexed_at.is_some());
}

#[tokio::test]
async fn reindex_unchanged_is_idempotent() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    let root_before = catalog::merkle_root(&h.pool, &dir.id).await.unwrap().unwrap();
    let files_before = catalog::files_for_directory(&h.pool, &dir.id).await.unwrap();
    let mut ids_before: Vec<String> = Vec::new();
    for file in &files_before {
        ids_before.extend(catalog::vector_ids_for_file(&h.pool, &file.id).await.unwrap());
    }
    ids_before.sort();

    let stats = indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();
    assert_eq!(stats.total_files, 0);
    assert_eq!(stats.indexed_files, 0);

    let root_after = catalog::merkle_root(&h.pool, &dir.id).await.unwrap().unwrap();
    assert_eq!(root_before, root_after);

    let mut ids_after: Vec<String> = Vec::new();
    for file in &catalog::files_for_directory(&h.pool, &dir.id).await.unwrap() {
        ids_after.extend(catalog::vector_ids_for_file(&h.pool, &file.id).await.unwrap());
    }
    ids_after.sort();
    assert_eq!(ids_before, ids_after);
    assert_eq!(h.store.count().await.unwrap(), 3);
}

#[tokio::test]
async fn modify_then_reindex_replaces_embeddings() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    write(&h.root, "a.md", "hello world");

    let directory = catalog::get_directory(&h.pool, &dir.id).await.unwrap().unwrap();
    let (changes, _) = indexer::scan_changes(&h.pool, &directory).await.unwrap();
    assert_eq!(changes.new.len(), 0);
    assert_eq!(changes.modified.len(), 1);
    assert_eq!(changes.deleted.len(), 0);
    assert_eq!(changes.unchanged.len(), 2);

    let stats = indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();
    assert_eq!(stats.indexed_files, 1);

    // Still exactly three embeddings, and the surviving one for a.md
    // hashes the new content
    assert_eq!(h.store.count().await.unwrap(), 3);
    let file = catalog::file_by_path(&h.pool, &dir.id, "a.md").await.unwrap().unwrap();
    let hashes = catalog::chunk_hashes_for_file(&h.pool, &file.id).await.unwrap();
    assert_eq!(hashes, vec![hash::sha256_text("hello world")]);
    assert!(!hashes.contains(&hash::sha256_text("hello")));
}

#[tokio::test]
async fn deleted_files_are_removed_everywhere() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    fs::remove_file(h.root.join("b.py")).unwrap();

    let stats = indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();
    assert!(stats.errors.is_empty());

    assert_eq!(h.store.count().await.unwrap(), 2);
    assert!(catalog::file_by_path(&h.pool, &dir.id, "b.py")
        .await
        .unwrap()
        .is_none());
    let aggregate = catalog::aggregate_stats(&h.pool).await.unwrap();
    assert_eq!(aggregate.total_files, 2);
}

#[tokio::test]
async fn rename_shows_as_delete_plus_new() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    fs::rename(h.root.join("a.md"), h.root.join("renamed.md")).unwrap();

    let directory = catalog::get_directory(&h.pool, &dir.id).await.unwrap().unwrap();
    let (changes, _) = indexer::scan_changes(&h.pool, &directory).await.unwrap();
    assert_eq!(changes.new.len(), 1);
    assert_eq!(changes.new[0].relative_path, "renamed.md");
    assert_eq!(changes.deleted, vec!["a.md".to_string()]);
    assert_eq!(changes.modified.len(), 0);
}

#[tokio::test]
async fn retrieval_ranks_matching_file_first() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    let result = retriever::retrieve(
        &h.pool,
        &h.store,
        &h.embedder,
        "print",
        "conv-x",
        Some(vec![dir.id.clone()]),
        Some(2),
        Some(0.0),
    )
    .await
    .unwrap();

    assert!(!result.chunks.is_empty());
    assert!(result.chunks[0].file_path.ends_with("b.py"));
    assert_eq!(result.total_chunks_searched, 3);
    // Scores descend
    for pair in result.chunks.windows(2) {
        assert!(pair[0].relevance_score >= pair[1].relevance_score);
    }
}

#[tokio::test]
async fn retrieval_without_links_is_empty_not_error() {
    let h = setup().await;

    let result = retriever::retrieve(
        &h.pool,
        &h.store,
        &h.embedder,
        "anything",
        "conv-without-links",
        None,
        None,
        None,
    )
    .await
    .unwrap();

    assert!(result.chunks.is_empty());
    assert_eq!(result.total_chunks_searched, 0);
}

#[tokio::test]
async fn min_score_filter_is_exact() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    let all = retriever::retrieve(
        &h.pool,
        &h.store,
        &h.embedder,
        "print",
        "conv-x",
        Some(vec![dir.id.clone()]),
        Some(10),
        Some(0.0),
    )
    .await
    .unwrap();

    let threshold = all.chunks[0].relevance_score;
    let filtered = retriever::retrieve(
        &h.pool,
        &h.store,
        &h.embedder,
        "print",
        "conv-x",
        Some(vec![dir.id.clone()]),
        Some(10),
        Some(threshold),
    )
    .await
    .unwrap();

    assert!(filtered.chunks.iter().all(|c| c.relevance_score >= threshold));
    let expected = all
        .chunks
        .iter()
        .filter(|c| c.relevance_score >= threshold)
        .count();
    assert_eq!(filtered.chunks.len(), expected);
}

#[tokio::test]
async fn generate_with_linked_directory_reports_context() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    indexer::index_directory(&h.pool, &h.store, &h.embedder, &dir.id, &NullSink)
        .await
        .unwrap();

    retriever::add_conversation_context(&h.pool, "conv-1", &dir.id)
        .await
        .unwrap();

    let service = Arc::new(GenerationService {
        pool: h.pool.clone(),
        store: h.store.clone(),
        embedder: Arc::clone(&h.embedder),
        model: Arc::new(ScriptedModel::new(vec!["Sure".into(), "!".into()])),
        lease: GenerationLease::new(),
    });

    let mut stream =
        service.generate_stream("print".to_string(), Some("conv-1".to_string()), true);
    let mut lines = Vec::new();
    while let Some(line) = stream.next().await {
        lines.push(line);
    }

    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    let info = first.get("context_info").expect("context_info first");
    assert!(info["rag_chunks"].as_i64().unwrap() >= 1);
    assert_eq!(info["conversation_history"], 0);
    assert!(!info["sources"].as_array().unwrap().is_empty());

    let tokens: String = lines
        .iter()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter_map(|v| v.get("token").and_then(|t| t.as_str()).map(String::from))
        .collect();
    assert_eq!(tokens, "Sure!");
    assert!(lines.last().unwrap().contains("done"));
}

#[tokio::test]
async fn context_link_is_idempotent() {
    let h = setup().await;
    seed_tiny_tree(&h);
    let dir = register(&h).await;

    let first = retriever::add_conversation_context(&h.pool, "conv-1", &dir.id)
        .await
        .unwrap();
    let second = retriever::add_conversation_context(&h.pool, "conv-1", &dir.id)
        .await
        .unwrap();
    assert_eq!(first, second);

    let contexts = retriever::conversation_contexts(&h.pool, "conv-1").await.unwrap();
    assert_eq!(contexts.len(), 1);

    assert!(
        retriever::remove_conversation_context(&h.pool, "conv-1", &dir.id)
            .await
            .unwrap()
    );
    assert!(retriever::conversation_contexts(&h.pool, "conv-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn conversation_history_feeds_generation() {
    let h = setup().await;

    conversations::add_message(&h.pool, "conv-2", "user", "remember me")
        .await
        .unwrap();
    conversations::add_message(&h.pool, "conv-2", "assistant", "noted")
        .await
        .unwrap();

    let service = Arc::new(GenerationService {
        pool: h.pool.clone(),
        store: h.store.clone(),
        embedder: Arc::clone(&h.embedder),
        model: Arc::new(ScriptedModel::new(vec!["ok".into()])),
        lease: GenerationLease::new(),
    });

    let mut stream =
        service.generate_stream("again".to_string(), Some("conv-2".to_string()), true);
    let first = stream.next().await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(value["context_info"]["conversation_history"], 2);
}
