//! Tool-calling state machine.
//!
//! A two-node graph drives each tool-enabled turn:
//!
//! ```text
//! start ─► LLM ─► (tool_call present?) ──yes──► TOOL ─► END
//!                      │
//!                      └──no──► END
//! ```
//!
//! The LLM node prompts the model with the system policy, any retrieved
//! context, the registered tool schemas, and few-shot examples. The
//! transition predicate inspects the last model message for a structured
//! tool call; the TOOL node dispatches it, records the execution, and the
//! machine terminates (one tool round trip per user turn). Transitions
//! happen only at message boundaries and no lock is held across model
//! calls.

use anyhow::Result;
use serde::Serialize;

use crate::generation::GenerationService;
use crate::retriever;
use crate::settings;
use crate::tools::{self, ToolRegistry};

/// A parsed tool invocation from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// One message in the machine's transcript.
#[derive(Debug, Clone, Serialize)]
pub struct GraphMessage {
    pub role: String,
    pub content: String,
}

/// Result of one run through the graph.
#[derive(Debug, Clone, Serialize)]
pub struct ToolGraphResult {
    pub response: String,
    pub tools_called: Vec<String>,
    pub messages: Vec<GraphMessage>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum Node {
    Llm,
    Tool(ToolCall),
    End,
}

/// Locate and parse the first `{"tool_call": ...}` object in model output.
///
/// The object is extracted by brace counting (string- and escape-aware) so
/// surrounding prose and nested argument objects are handled. Anything
/// that fails to parse is treated as a plain answer.
pub fn parse_tool_call(output: &str) -> Option<ToolCall> {
    let start = output.find(r#"{"tool_call""#)?;
    let candidate = &output[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (i, c) in candidate.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    end = Some(i + 1);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end?;
    let value: serde_json::Value = serde_json::from_str(&candidate[..end]).ok()?;
    let call = value.get("tool_call")?;
    let name = call.get("name")?.as_str()?.to_string();
    let arguments = call
        .get("arguments")
        .and_then(|a| a.as_object())
        .cloned()
        .unwrap_or_default();

    Some(ToolCall { name, arguments })
}

/// Format tool schemas and few-shot examples for the LLM node prompt.
fn format_tool_instructions(registry: &ToolRegistry) -> String {
    let mut out = String::from(
        "You can call tools. When (and only when) a tool is needed, respond with a \
         single JSON object of the form:\n\
         {\"tool_call\": {\"name\": \"<tool_name>\", \"arguments\": {\"<param>\": \"<value>\"}}}\n\
         Otherwise answer normally.\n\nAvailable tools:\n",
    );
    for spec in registry.list() {
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            spec.name, spec.description, spec.parameters
        ));
    }
    out.push_str(
        "\nExamples:\n\
         User: Can you open Slack for me?\n\
         Assistant: {\"tool_call\": {\"name\": \"open_app\", \"arguments\": {\"app_name\": \"Slack\"}}}\n\
         User: Delete the file /tmp/old.txt\n\
         Assistant: {\"tool_call\": {\"name\": \"delete_file\", \"arguments\": {\"path\": \"/tmp/old.txt\"}}}\n\
         User: What's the capital of France?\n\
         Assistant: Paris is the capital of France.\n",
    );
    out
}

/// Run the state machine for one user turn.
pub async fn run_tool_graph(
    service: &GenerationService,
    registry: &ToolRegistry,
    input: &str,
    conversation_id: Option<&str>,
) -> Result<ToolGraphResult> {
    run_tool_graph_with_events(service, registry, input, conversation_id, None).await
}

/// As [`run_tool_graph`], additionally publishing one JSON event per node
/// transition to `events` (used by the streaming endpoint). Event delivery
/// is best-effort; a gone receiver does not stop the machine.
pub async fn run_tool_graph_with_events(
    service: &GenerationService,
    registry: &ToolRegistry,
    input: &str,
    conversation_id: Option<&str>,
    events: Option<&tokio::sync::mpsc::Sender<serde_json::Value>>,
) -> Result<ToolGraphResult> {
    let emit = |value: serde_json::Value| {
        if let Some(tx) = events {
            let _ = tx.try_send(value);
        }
    };

    let mut messages: Vec<GraphMessage> = Vec::new();
    let mut tools_called: Vec<String> = Vec::new();

    messages.push(GraphMessage {
        role: "user".to_string(),
        content: input.to_string(),
    });

    let mut node = Node::Llm;
    loop {
        node = match node {
            Node::Llm => {
                emit(serde_json::json!({"node": "llm"}));
                let prompt = build_llm_prompt(service, registry, &messages, conversation_id).await?;
                // The model call happens outside any shared lock except the
                // generation lease itself.
                let output = service.complete_prompt(&prompt).await?;
                messages.push(GraphMessage {
                    role: "assistant".to_string(),
                    content: output.clone(),
                });

                match parse_tool_call(&output) {
                    Some(call) => Node::Tool(call),
                    None => Node::End,
                }
            }
            Node::Tool(call) => {
                emit(serde_json::json!({
                    "node": "tool",
                    "tool": call.name,
                    "arguments": serde_json::Value::Object(call.arguments.clone()),
                }));
                let arguments_value = serde_json::Value::Object(call.arguments.clone());
                let result = match registry.get(&call.name) {
                    Some(tool) => match tool.invoke(&call.arguments).await {
                        Ok(result) => result,
                        Err(e) => format!("Tool execution error: {}", e),
                    },
                    None => format!("Tool execution error: unknown tool '{}'", call.name),
                };

                tools::log_execution(&service.pool, &call.name, &arguments_value, &result)
                    .await?;
                tools_called.push(call.name.clone());
                emit(serde_json::json!({"tool_result": result}));
                messages.push(GraphMessage {
                    role: "tool".to_string(),
                    content: result,
                });

                // Single tool round trip per turn.
                Node::End
            }
            Node::End => break,
        };
    }

    let response = messages
        .iter()
        .rev()
        .find(|m| m.role != "system")
        .map(|m| m.content.clone())
        .unwrap_or_default();

    Ok(ToolGraphResult {
        response,
        tools_called,
        messages,
        success: true,
        error: None,
    })
}

async fn build_llm_prompt(
    service: &GenerationService,
    registry: &ToolRegistry,
    messages: &[GraphMessage],
    conversation_id: Option<&str>,
) -> Result<String> {
    let system_prompt = settings::system_prompt_with_rules(&service.pool).await?;

    let mut parts: Vec<String> = Vec::new();
    if !system_prompt.is_empty() {
        parts.push(system_prompt);
    }

    if let Some(conversation_id) = conversation_id {
        if let Ok(result) = retriever::retrieve(
            &service.pool,
            &service.store,
            &service.embedder,
            &messages
                .iter()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            conversation_id,
            None,
            None,
            None,
        )
        .await
        {
            let rag = settings::rag_settings(&service.pool).await?;
            let (context, _) =
                retriever::format_context(&result.chunks, rag.max_context_length as usize);
            if !context.is_empty() {
                parts.push(context);
            }
        }
    }

    parts.push(format_tool_instructions(registry));

    for message in messages {
        match message.role.as_str() {
            "user" => parts.push(format!("User: {}", message.content)),
            "assistant" => parts.push(format!("Assistant: {}", message.content)),
            "tool" => parts.push(format!("Tool result: {}", message.content)),
            _ => {}
        }
    }
    parts.push("Assistant:".to_string());

    Ok(parts.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::SharedEmbedder;
    use crate::llm::{GenerationLease, ScriptedModel};
    use crate::migrate;
    use crate::tools::{Tool, ToolSpec};
    use crate::vector_store::VectorStore;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[test]
    fn parses_bare_call() {
        let call = parse_tool_call(
            r#"{"tool_call": {"name": "open_app", "arguments": {"app_name": "Slack"}}}"#,
        )
        .unwrap();
        assert_eq!(call.name, "open_app");
        assert_eq!(call.arguments["app_name"], "Slack");
    }

    #[test]
    fn parses_call_embedded_in_prose() {
        let output = r#"Sure, I'll do that now.
{"tool_call": {"name": "delete_file", "arguments": {"path": "/tmp/x.txt"}}}
Let me know if you need anything else."#;
        let call = parse_tool_call(output).unwrap();
        assert_eq!(call.name, "delete_file");
        assert_eq!(call.arguments["path"], "/tmp/x.txt");
    }

    #[test]
    fn handles_nested_braces_and_escapes() {
        let output = r#"{"tool_call": {"name": "t", "arguments": {"q": "say \"{hi}\" twice", "opts": {"deep": {"x": 1}}}}}"#;
        let call = parse_tool_call(output).unwrap();
        assert_eq!(call.arguments["q"], "say \"{hi}\" twice");
        assert_eq!(call.arguments["opts"]["deep"]["x"], 1);
    }

    #[test]
    fn absent_marker_is_no_call() {
        assert!(parse_tool_call("Paris is the capital of France.").is_none());
        assert!(parse_tool_call("{\"not_a_tool_call\": 1}").is_none());
    }

    #[test]
    fn malformed_json_is_plain_answer() {
        assert!(parse_tool_call(r#"{"tool_call": {"name": }"#).is_none());
        assert!(parse_tool_call(r#"{"tool_call" unbalanced"#).is_none());
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn describe(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo".to_string(),
                parameters: serde_json::json!({"type": "object"}),
                builtin: false,
            }
        }

        async fn invoke(
            &self,
            arguments: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<String> {
            Ok(format!(
                "Echoed: {}",
                arguments.get("text").and_then(|v| v.as_str()).unwrap_or("")
            ))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn describe(&self) -> ToolSpec {
            ToolSpec {
                name: "failing".to_string(),
                description: "Always fails".to_string(),
                parameters: serde_json::json!({"type": "object"}),
                builtin: false,
            }
        }

        async fn invoke(
            &self,
            _arguments: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<String> {
            anyhow::bail!("adapter exploded")
        }
    }

    async fn test_service(model: ScriptedModel) -> GenerationService {
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

        GenerationService {
            pool,
            store: VectorStore::new(vpool),
            embedder: Arc::new(SharedEmbedder::new("hash")),
            model: Arc::new(model),
            lease: GenerationLease::new(),
        }
    }

    #[tokio::test]
    async fn plain_answer_ends_without_tools() {
        let service =
            test_service(ScriptedModel::new(vec!["Just an answer.".to_string()])).await;
        let registry = ToolRegistry::new();

        let result = run_tool_graph(&service, &registry, "hello", None)
            .await
            .unwrap();
        assert_eq!(result.response, "Just an answer.");
        assert!(result.tools_called.is_empty());
        assert!(result.success);
        assert_eq!(result.messages.len(), 2);
    }

    #[tokio::test]
    async fn tool_call_dispatches_and_logs() {
        let service = test_service(ScriptedModel::new(vec![
            r#"{"tool_call": {"name": "echo", "arguments": {"text": "hi"}}}"#.to_string(),
        ]))
        .await;
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();

        let result = run_tool_graph(&service, &registry, "echo hi please", None)
            .await
            .unwrap();

        assert_eq!(result.tools_called, vec!["echo"]);
        assert_eq!(result.response, "Echoed: hi");
        assert_eq!(result.messages.last().unwrap().role, "tool");

        let log = tools::recent_executions(&service.pool, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tool_name, "echo");
        assert_eq!(log[0].result, "Echoed: hi");
    }

    #[tokio::test]
    async fn adapter_errors_become_result_strings() {
        let service = test_service(ScriptedModel::new(vec![
            r#"{"tool_call": {"name": "failing", "arguments": {}}}"#.to_string(),
        ]))
        .await;
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool)).unwrap();

        let result = run_tool_graph(&service, &registry, "try it", None)
            .await
            .unwrap();
        assert!(result
            .response
            .starts_with("Tool execution error: adapter exploded"));
        assert_eq!(result.tools_called, vec!["failing"]);
        // The machine still reached END
        assert!(result.success);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let service = test_service(ScriptedModel::new(vec![
            r#"{"tool_call": {"name": "missing", "arguments": {}}}"#.to_string(),
        ]))
        .await;
        let registry = ToolRegistry::new();

        let result = run_tool_graph(&service, &registry, "go", None).await.unwrap();
        assert!(result.response.contains("unknown tool 'missing'"));
    }

    #[tokio::test]
    async fn single_round_trip_even_if_tool_result_looks_like_call() {
        let service = test_service(ScriptedModel::new(vec![
            r#"{"tool_call": {"name": "echo", "arguments": {"text": "{\"tool_call\": {\"name\": \"echo\"}}"}}}"#.to_string(),
        ]))
        .await;
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();

        let result = run_tool_graph(&service, &registry, "go", None).await.unwrap();
        assert_eq!(result.tools_called.len(), 1);
    }
}
