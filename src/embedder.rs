//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and two backends:
//!
//! - **[`HashEmbedder`]** — deterministic feature-hashing embeddings with no
//!   model download. Useful for tests and minimal installs; token overlap
//!   still produces meaningful cosine similarity.
//! - **`FastembedEmbedder`** — local ONNX sentence embeddings via the
//!   `fastembed` crate (feature `local-embeddings-fastembed`, default on).
//!
//! [`SharedEmbedder`] is the process-wide handle: lazily loaded, shared
//! under a lock, and reloadable when the configured model identifier
//! changes. Batches are capped at [`MAX_BATCH`] texts.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maximum number of texts submitted to a backend in one batch.
pub const MAX_BATCH: usize = 32;

/// Dimensionality of the hashing embedder.
const HASH_DIMS: usize = 384;

/// A deterministic text-to-vector backend.
///
/// Implementations must return identical vectors for identical inputs.
pub trait Embedder: Send + Sync {
    /// The model identifier this backend was loaded for.
    fn model_id(&self) -> &str;
    /// Embedding dimensionality.
    fn dim(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate a backend for a model identifier.
///
/// Identifiers starting with `hash` select the hashing backend; anything
/// else is resolved as a fastembed model name.
pub fn create_embedder(model_id: &str) -> Result<Arc<dyn Embedder>> {
    if model_id.starts_with("hash") {
        return Ok(Arc::new(HashEmbedder::new(model_id)));
    }
    #[cfg(feature = "local-embeddings-fastembed")]
    {
        Ok(Arc::new(fastembed_backend::FastembedEmbedder::new(
            model_id,
        )?))
    }
    #[cfg(not(feature = "local-embeddings-fastembed"))]
    {
        anyhow::bail!(
            "Embedding model '{}' requires the local-embeddings-fastembed feature; \
             use a 'hash' model identifier instead",
            model_id
        )
    }
}

// ============ Hashing backend ============

/// Feature-hashing embedder: each lower-cased alphanumeric token is hashed
/// into one of [`HASH_DIMS`] buckets and the vector is L2-normalized.
pub struct HashEmbedder {
    model_id: String,
}

impl HashEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }

    fn bucket(token: &str) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) % HASH_DIMS as u64) as usize
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; HASH_DIMS];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[Self::bucket(token)] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        HASH_DIMS
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

// ============ Fastembed backend ============

#[cfg(feature = "local-embeddings-fastembed")]
mod fastembed_backend {
    use super::Embedder;
    use anyhow::{bail, Context, Result};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Mutex;

    pub struct FastembedEmbedder {
        model_id: String,
        dim: usize,
        // fastembed's embed() needs &mut; the forward pass is fast enough
        // to share under a plain mutex.
        model: Mutex<TextEmbedding>,
    }

    impl FastembedEmbedder {
        pub fn new(model_id: &str) -> Result<Self> {
            let (model_kind, dim) = resolve_model(model_id)?;
            let model = TextEmbedding::try_new(
                InitOptions::new(model_kind).with_show_download_progress(false),
            )
            .with_context(|| format!("Failed to load embedding model '{}'", model_id))?;

            Ok(Self {
                model_id: model_id.to_string(),
                dim,
                model: Mutex::new(model),
            })
        }
    }

    fn resolve_model(model_id: &str) -> Result<(EmbeddingModel, usize)> {
        match model_id {
            "all-MiniLM-L6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
            "bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
            "multilingual-e5-small" => Ok((EmbeddingModel::MultilingualE5Small, 384)),
            other => bail!("Unknown embedding model: '{}'", other),
        }
    }

    impl Embedder for FastembedEmbedder {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow::anyhow!("embedding model lock poisoned"))?;
            let vectors = model.embed(texts.to_vec(), None)?;
            Ok(vectors)
        }
    }
}

// ============ Shared handle ============

/// Process-wide embedding handle: lazily loaded, reloadable on model change.
pub struct SharedEmbedder {
    state: RwLock<EmbedderState>,
}

struct EmbedderState {
    model_id: String,
    backend: Option<Arc<dyn Embedder>>,
}

impl SharedEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            state: RwLock::new(EmbedderState {
                model_id: model_id.to_string(),
                backend: None,
            }),
        }
    }

    pub async fn model_id(&self) -> String {
        self.state.read().await.model_id.clone()
    }

    /// Swap the configured model. The old backend is dropped; the new one
    /// loads on next use.
    pub async fn reload(&self, model_id: &str) {
        let mut state = self.state.write().await;
        state.model_id = model_id.to_string();
        state.backend = None;
    }

    async fn backend(&self) -> Result<Arc<dyn Embedder>> {
        {
            let state = self.state.read().await;
            if let Some(backend) = &state.backend {
                return Ok(Arc::clone(backend));
            }
        }
        let mut state = self.state.write().await;
        match &state.backend {
            Some(backend) => Ok(Arc::clone(backend)),
            None => {
                tracing::info!(model = %state.model_id, "loading embedding model");
                let backend = create_embedder(&state.model_id)?;
                state.backend = Some(Arc::clone(&backend));
                Ok(backend)
            }
        }
    }

    pub async fn dim(&self) -> Result<usize> {
        Ok(self.backend().await?.dim())
    }

    /// Embed texts, splitting into batches of at most [`MAX_BATCH`]. The
    /// forward pass runs on a blocking thread so the I/O loop never stalls.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let backend = self.backend().await?;
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            let backend = Arc::clone(&backend);
            let batch = batch.to_vec();
            let vectors =
                tokio::task::spawn_blocking(move || backend.embed(&batch)).await??;
            out.extend(vectors);
        }
        Ok(out)
    }
}
