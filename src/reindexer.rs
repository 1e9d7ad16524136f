//! Background reindexer.
//!
//! A single long-lived task that wakes every five minutes, finds active
//! directories whose last index run is older than their configured cadence,
//! and reindexes them. Errors are logged and the loop backs off for a
//! minute. Shutdown is honored between directories, never mid-file.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::catalog;
use crate::embedder::SharedEmbedder;
use crate::indexer;
use crate::models::IndexedDirectory;
use crate::progress::LogSink;
use crate::vector_store::VectorStore;

const POLL_INTERVAL: Duration = Duration::from_secs(300);
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Run the reindex loop until `shutdown` flips to `true`.
pub async fn run(
    pool: SqlitePool,
    store: VectorStore,
    embedder: Arc<SharedEmbedder>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("background reindexer started");

    loop {
        let sleep = match reindex_pass(&pool, &store, &embedder, &shutdown).await {
            Ok(()) => POLL_INTERVAL,
            Err(e) => {
                tracing::error!("background indexing pass failed: {}", e);
                ERROR_BACKOFF
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
    }

    tracing::info!("background reindexer stopped");
}

async fn reindex_pass(
    pool: &SqlitePool,
    store: &VectorStore,
    embedder: &Arc<SharedEmbedder>,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let directories = catalog::list_directories(pool, true).await?;

    for directory in directories {
        if *shutdown.borrow() {
            return Ok(());
        }
        if !is_stale(&directory) {
            continue;
        }

        tracing::info!(path = %directory.path, "background indexing");
        match indexer::index_directory(pool, store, embedder, &directory.id, &LogSink).await {
            Ok(stats) => {
                if !stats.errors.is_empty() {
                    tracing::warn!(
                        path = %directory.path,
                        errors = stats.errors.len(),
                        "background indexing finished with errors"
                    );
                }
            }
            Err(e) => {
                tracing::error!(path = %directory.path, "background indexing failed: {}", e);
            }
        }

        tokio::task::yield_now().await;
    }

    Ok(())
}

fn is_stale(directory: &IndexedDirectory) -> bool {
    match directory.last_indexed_at {
        None => true,
        Some(last) => {
            let minutes = Utc::now().signed_duration_since(last).num_minutes();
            minutes >= directory.index_frequency_minutes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn directory(last_indexed_at: Option<chrono::DateTime<Utc>>, cadence: i64) -> IndexedDirectory {
        IndexedDirectory {
            id: "d1".to_string(),
            path: "/tmp".to_string(),
            is_active: true,
            file_patterns: vec![],
            exclude_patterns: vec![],
            index_frequency_minutes: cadence,
            last_indexed_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn never_indexed_is_stale() {
        assert!(is_stale(&directory(None, 60)));
    }

    #[test]
    fn fresh_directory_is_not_stale() {
        let last = Utc::now() - ChronoDuration::minutes(5);
        assert!(!is_stale(&directory(Some(last), 60)));
    }

    #[test]
    fn old_directory_is_stale() {
        let last = Utc::now() - ChronoDuration::minutes(120);
        assert!(is_stale(&directory(Some(last), 60)));
    }
}
