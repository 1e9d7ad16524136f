//! Language-model backend.
//!
//! [`LanguageModel`] is the seam between the runtime and whatever hosts the
//! weights. The default backend speaks the Ollama-compatible JSON-lines
//! protocol of a local model runtime over HTTP; [`ScriptedModel`] replays a
//! fixed token sequence for tests and offline runs.
//!
//! The loaded model is a single process-wide resource: generation holds an
//! exclusive [`GenerationLease`] for the duration of a stream, so
//! concurrent requests queue rather than interleave.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ModelConfig;

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: i64,
    pub stop: Vec<String>,
}

/// A finite stream of token texts.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Whether a model is configured and worth attempting to call.
    fn is_available(&self) -> bool;

    /// Start one streaming completion. Dropping the returned stream cancels
    /// the underlying generation at the next token boundary.
    async fn stream(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream>;
}

/// Exclusive lease over the process-wide model handle.
#[derive(Clone)]
pub struct GenerationLease {
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl GenerationLease {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Wait for the model to become free and hold it until the guard drops.
    pub async fn acquire(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }
}

impl Default for GenerationLease {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Local runtime backend ============

/// Client for an Ollama-compatible local model runtime.
pub struct LocalRuntimeModel {
    client: reqwest::Client,
    base_url: String,
    model: Option<String>,
}

impl LocalRuntimeModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        // No overall request timeout: generation is bounded by max_tokens,
        // not wall clock.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.runtime_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl LanguageModel for LocalRuntimeModel {
    fn is_available(&self) -> bool {
        self.model.is_some()
    }

    async fn stream(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream> {
        let model = match &self.model {
            Some(m) => m.clone(),
            None => bail!("No model is configured"),
        };

        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": true,
            "options": {
                "temperature": params.temperature,
                "num_predict": params.max_tokens,
                "stop": params.stop,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .with_context(|| "Model runtime is unreachable")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Model runtime error {}: {}", status, text);
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(pump_response(response, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Forward runtime JSON lines into the token channel. Ends when the
/// runtime reports `done`, the body ends, or the receiver is dropped.
async fn pump_response(response: reqwest::Response, tx: mpsc::Sender<Result<String>>) {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(piece) = body.next().await {
        let piece = match piece {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&piece));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_runtime_line(line) {
                Ok(RuntimeEvent::Token(token)) => {
                    if tx.send(Ok(token)).await.is_err() {
                        // Receiver gone: client disconnected, stop pulling.
                        return;
                    }
                }
                Ok(RuntimeEvent::Done) => return,
                Ok(RuntimeEvent::Empty) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}

enum RuntimeEvent {
    Token(String),
    Done,
    Empty,
}

fn parse_runtime_line(line: &str) -> Result<RuntimeEvent> {
    let value: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("Malformed runtime line: {}", line))?;

    if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
        bail!("Model runtime error: {}", error);
    }

    let token = value
        .get("response")
        .and_then(|r| r.as_str())
        .unwrap_or_default();
    let done = value.get("done").and_then(|d| d.as_bool()).unwrap_or(false);

    if !token.is_empty() {
        Ok(RuntimeEvent::Token(token.to_string()))
    } else if done {
        Ok(RuntimeEvent::Done)
    } else {
        Ok(RuntimeEvent::Empty)
    }
}

// ============ Scripted backend ============

/// Deterministic model that replays configured token sequences. The reply
/// is chosen by substring match on the prompt; `fallback` covers the rest.
pub struct ScriptedModel {
    replies: Vec<(String, Vec<String>)>,
    fallback: Vec<String>,
}

impl ScriptedModel {
    pub fn new(fallback: Vec<String>) -> Self {
        Self {
            replies: Vec::new(),
            fallback,
        }
    }

    /// Reply with `tokens` whenever the prompt contains `needle`.
    pub fn with_reply(mut self, needle: &str, tokens: Vec<String>) -> Self {
        self.replies.push((needle.to_string(), tokens));
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn is_available(&self) -> bool {
        true
    }

    async fn stream(&self, prompt: &str, _params: &GenerationParams) -> Result<TokenStream> {
        let tokens = self
            .replies
            .iter()
            .find(|(needle, _)| prompt.contains(needle))
            .map(|(_, tokens)| tokens.clone())
            .unwrap_or_else(|| self.fallback.clone());

        Ok(Box::pin(futures_util::stream::iter(
            tokens.into_iter().map(Ok),
        )))
    }
}
