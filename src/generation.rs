//! Generation service.
//!
//! Composes the full prompt for a user turn (system policy, retrieved
//! context, recent history, current query), computes the token budget, and
//! streams newline-delimited JSON events back to the caller:
//!
//! - `{"context_info": {...}}` — once, first, iff any context was used
//! - `{"token": "<text>"}` — incremental assistant text
//! - `{"done": true}` — terminal marker
//! - `{"error": "<string>"}` — fatal for the stream
//!
//! The model handle is exclusive: each stream holds the generation lease
//! until it finishes or the client disconnects.

use anyhow::Result;
use futures_util::StreamExt;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::conversations;
use crate::embedder::SharedEmbedder;
use crate::llm::{GenerationLease, GenerationParams, LanguageModel};
use crate::models::StoredMessage;
use crate::retriever;
use crate::settings;
use crate::vector_store::VectorStore;

/// Stop sequences always passed to the model, unioned with the user's.
pub const DEFAULT_STOPS: &[&str] = &["</s>", "<|endoftext|>", "\nUser:"];

/// Messages of history included in the prompt.
const HISTORY_WINDOW: i64 = 10;

/// Floor for the computed output budget.
const MIN_OUTPUT_TOKENS: i64 = 64;

/// Rough token estimate: `0.75 × word count`.
pub fn estimate_token_count(text: &str) -> i64 {
    (text.split_whitespace().count() as f64 * 0.75) as i64
}

/// Output budget: what fits in the context window after the prompt,
/// clamped to `[MIN_OUTPUT_TOKENS, max_out]`.
pub fn smart_max_tokens(prompt: &str, context_window: i64, max_out: i64) -> i64 {
    let available = context_window - estimate_token_count(prompt);
    available.min(max_out).max(MIN_OUTPUT_TOKENS)
}

/// Assemble the final LLM prompt. Section order is fixed: system policy,
/// RAG block (iff present), history (iff present), current query, and the
/// assistant positioning token.
pub fn build_prompt(
    system_prompt: &str,
    rag_context: &str,
    history: &[StoredMessage],
    current_prompt: &str,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !system_prompt.is_empty() {
        parts.push(system_prompt.to_string());
    }

    if !rag_context.is_empty() {
        parts.push("\n[File/Document Context (RAG)]".to_string());
        parts.push(
            "Relevant file/document content and metadata retrieved for this query:".to_string(),
        );
        parts.push("---".to_string());
        parts.push(rag_context.to_string());
        parts.push("---".to_string());
    }

    if !history.is_empty() {
        parts.push("\n[Conversation History]".to_string());
        parts.push("Previous conversation context:".to_string());
        for message in history {
            match message.role.as_str() {
                "user" => parts.push(format!("Human: {}", message.content)),
                "assistant" => parts.push(format!("Assistant: {}", message.content)),
                "system" => parts.push(format!("System: {}", message.content)),
                _ => {}
            }
        }
    }

    parts.push("\n[Current Query]".to_string());
    parts.push(format!("Human: {}", current_prompt));
    parts.push("\nAssistant:".to_string());

    parts.join("\n")
}

/// Owns the model handle and everything needed to answer a user turn.
pub struct GenerationService {
    pub pool: SqlitePool,
    pub store: VectorStore,
    pub embedder: Arc<SharedEmbedder>,
    pub model: Arc<dyn LanguageModel>,
    pub lease: GenerationLease,
}

impl GenerationService {
    /// Start one generation stream. Returns immediately; events arrive on
    /// the stream as the lease is granted and tokens are produced.
    ///
    /// With `use_enhanced_memory` the prompt is augmented with retrieved
    /// context and recent history; otherwise the raw prompt goes to the
    /// model under the system policy alone.
    pub fn generate_stream(
        self: Arc<Self>,
        prompt: String,
        conversation_id: Option<String>,
        use_enhanced_memory: bool,
    ) -> ReceiverStream<String> {
        let (tx, rx) = mpsc::channel::<String>(32);
        tokio::spawn(async move {
            self.run_stream(prompt, conversation_id, use_enhanced_memory, tx)
                .await;
        });
        ReceiverStream::new(rx)
    }

    async fn run_stream(
        &self,
        prompt: String,
        conversation_id: Option<String>,
        use_enhanced_memory: bool,
        tx: mpsc::Sender<String>,
    ) {
        if let Err(e) = self
            .stream_inner(&prompt, conversation_id.as_deref(), use_enhanced_memory, &tx)
            .await
        {
            let _ = tx.send(error_line(&e.to_string())).await;
        }
    }

    async fn stream_inner(
        &self,
        prompt: &str,
        conversation_id: Option<&str>,
        use_enhanced_memory: bool,
        tx: &mpsc::Sender<String>,
    ) -> Result<()> {
        let behavior = settings::model_behavior(&self.pool).await?;
        let system_prompt = settings::system_prompt_with_rules(&self.pool).await?;

        let mut history: Vec<StoredMessage> = Vec::new();
        let mut rag_context = String::new();
        let mut rag_sources: Vec<String> = Vec::new();
        let mut rag_chunk_count = 0usize;

        if use_enhanced_memory {
            if let Some(conversation_id) = conversation_id {
                history =
                    conversations::recent_messages(&self.pool, conversation_id, HISTORY_WINDOW)
                        .await
                        .unwrap_or_default();

                match self.retrieve_context(prompt, conversation_id).await {
                    Ok((context, sources)) => {
                        rag_chunk_count = sources.len();
                        rag_sources = sources;
                        rag_context = context;
                    }
                    Err(e) => {
                        // Retrieval failure degrades to a plain answer.
                        tracing::warn!("context retrieval failed: {}", e);
                    }
                }
            }
        }

        let full_prompt = if use_enhanced_memory {
            build_prompt(&system_prompt, &rag_context, &history, prompt)
        } else {
            build_prompt(&system_prompt, "", &[], prompt)
        };

        let mut stop = DEFAULT_STOPS
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        stop.extend(behavior.stop_sequences.iter().cloned());

        let params = GenerationParams {
            temperature: behavior.temperature,
            max_tokens: smart_max_tokens(&full_prompt, behavior.context_window, behavior.max_tokens),
            stop,
        };

        // Serialize access to the model; the guard lives for the whole
        // stream.
        let _guard = self.lease.acquire().await;

        let mut token_stream = self.model.stream(&full_prompt, &params).await?;

        if rag_chunk_count > 0 || !history.is_empty() {
            let info = serde_json::json!({
                "context_info": {
                    "rag_chunks": rag_chunk_count,
                    "conversation_history": history.len(),
                    "sources": rag_sources,
                }
            });
            if tx.send(format!("{}\n", info)).await.is_err() {
                return Ok(());
            }
        }

        while let Some(token) = token_stream.next().await {
            let token = token?;
            let line = format!("{}\n", serde_json::json!({ "token": token }));
            if tx.send(line).await.is_err() {
                // Client disconnected; dropping the stream cancels the
                // model at the next token boundary.
                return Ok(());
            }
            tokio::task::yield_now().await;
        }

        let _ = tx.send("{\"done\": true}\n".to_string()).await;
        Ok(())
    }

    async fn retrieve_context(
        &self,
        prompt: &str,
        conversation_id: &str,
    ) -> Result<(String, Vec<String>)> {
        let contexts = retriever::conversation_contexts(&self.pool, conversation_id).await?;
        if contexts.is_empty() {
            return Ok((String::new(), Vec::new()));
        }

        let rag = settings::rag_settings(&self.pool).await?;
        let result = retriever::retrieve(
            &self.pool,
            &self.store,
            &self.embedder,
            prompt,
            conversation_id,
            None,
            None,
            None,
        )
        .await?;

        let (context, used) =
            retriever::format_context(&result.chunks, rag.max_context_length as usize);
        let sources = used
            .iter()
            .filter_map(|m| m.get("file_path").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .collect();
        Ok((context, sources))
    }

    /// Run one non-streaming completion (used by the tool state machine).
    pub async fn complete_prompt(&self, prompt: &str) -> Result<String> {
        let behavior = settings::model_behavior(&self.pool).await?;
        let mut stop = DEFAULT_STOPS
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        stop.extend(behavior.stop_sequences.iter().cloned());

        let params = GenerationParams {
            temperature: behavior.temperature,
            max_tokens: smart_max_tokens(prompt, behavior.context_window, behavior.max_tokens),
            stop,
        };

        let _guard = self.lease.acquire().await;
        let mut stream = self.model.stream(prompt, &params).await?;
        let mut output = String::new();
        while let Some(token) = stream.next().await {
            output.push_str(&token?);
        }
        Ok(output)
    }
}

fn error_line(message: &str) -> String {
    format!("{}\n", serde_json::json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::migrate;
    use chrono::Utc;

    fn message(role: &str, content: &str) -> StoredMessage {
        StoredMessage {
            id: "m".to_string(),
            conversation_id: "c".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn token_estimate_uses_three_quarters_of_words() {
        assert_eq!(estimate_token_count("one two three four"), 3);
        assert_eq!(estimate_token_count(""), 0);
    }

    #[test]
    fn max_tokens_clamps_to_floor_and_ceiling() {
        // Plenty of room: capped by max_out
        assert_eq!(smart_max_tokens("short prompt", 2048, 512), 512);
        // No room left: floored
        let long_prompt = "word ".repeat(4000);
        assert_eq!(smart_max_tokens(&long_prompt, 2048, 512), MIN_OUTPUT_TOKENS);
    }

    #[test]
    fn prompt_sections_appear_in_order() {
        let history = vec![message("user", "hi"), message("assistant", "hello")];
        let prompt = build_prompt("SYSTEM POLICY", "the context block", &history, "what now?");

        let sys = prompt.find("SYSTEM POLICY").unwrap();
        let rag = prompt.find("[File/Document Context (RAG)]").unwrap();
        let hist = prompt.find("[Conversation History]").unwrap();
        let query = prompt.find("[Current Query]").unwrap();
        assert!(sys < rag && rag < hist && hist < query);

        assert!(prompt.contains("Human: hi"));
        assert!(prompt.contains("Assistant: hello"));
        assert!(prompt.contains("Human: what now?"));
        assert!(prompt.ends_with("\nAssistant:"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let prompt = build_prompt("SYS", "", &[], "question");
        assert!(!prompt.contains("[File/Document Context (RAG)]"));
        assert!(!prompt.contains("[Conversation History]"));
        assert!(prompt.contains("[Current Query]"));
        // Each marker appears at most once
        assert_eq!(prompt.matches("[Current Query]").count(), 1);
    }

    async fn test_service(model: ScriptedModel) -> Arc<GenerationService> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_catalog_migrations(&pool).await.unwrap();
        let vpool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_vector_migrations(&vpool).await.unwrap();

        Arc::new(GenerationService {
            pool,
            store: VectorStore::new(vpool),
            embedder: Arc::new(SharedEmbedder::new("hash")),
            model: Arc::new(model),
            lease: GenerationLease::new(),
        })
    }

    #[tokio::test]
    async fn stream_without_context_has_tokens_then_done() {
        let service =
            test_service(ScriptedModel::new(vec!["Hel".into(), "lo".into()])).await;
        let mut stream = service.generate_stream("hi".to_string(), None, true);

        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            lines.push(line);
        }

        assert!(lines.iter().all(|l| !l.contains("context_info")));
        let tokens: String = lines
            .iter()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter_map(|v| v.get("token").and_then(|t| t.as_str()).map(String::from))
            .collect();
        assert_eq!(tokens, "Hello");
        assert_eq!(lines.last().unwrap().trim(), "{\"done\": true}");
    }

    #[tokio::test]
    async fn history_triggers_context_info_first() {
        let service = test_service(ScriptedModel::new(vec!["ok".into()])).await;
        conversations::add_message(&service.pool, "c1", "user", "earlier")
            .await
            .unwrap();

        let mut stream =
            service.generate_stream("again".to_string(), Some("c1".to_string()), true);
        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            lines.push(line);
        }

        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        let info = first.get("context_info").expect("context_info first");
        assert_eq!(info.get("conversation_history").unwrap(), 1);
        assert_eq!(info.get("rag_chunks").unwrap(), 0);
        assert!(lines.last().unwrap().contains("done"));
    }

    #[tokio::test]
    async fn complete_prompt_collects_tokens() {
        let service =
            test_service(ScriptedModel::new(vec!["a".into(), "b".into(), "c".into()])).await;
        assert_eq!(service.complete_prompt("anything").await.unwrap(), "abc");
    }
}
