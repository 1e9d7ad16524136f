//! Streaming HTTP/WebSocket surface.
//!
//! Translates client payloads into calls on the retrieval, generation, and
//! tool subsystems and back-pressures token streams to the client.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/generate` | Stream assistant output as JSON lines |
//! | `POST` | `/generate-sse` | Same content in SSE framing |
//! | `POST` | `/save-message` | Append a message to a conversation |
//! | `POST` | `/tools/execute` | Run the tool state machine |
//! | `POST` | `/tools/stream` | Stream the state machine's node events |
//! | `GET`  | `/tools` | List registered tools with schemas |
//! | `POST` | `/rag/directories` | Register a directory for indexing |
//! | `GET`  | `/rag/directories` | List directories with stats |
//! | `DELETE` | `/rag/directories/{id}` | Soft-delete a directory |
//! | `POST` | `/rag/directories/{id}/scan` | Change detection only |
//! | `POST` | `/rag/directories/{id}/index` | Full index run |
//! | `WS`   | `/rag/directories/{id}/index-stream` | Progress over WebSocket |
//! | `POST` | `/rag/conversations/{cid}/context` | Link a directory |
//! | `GET`  | `/rag/conversations/{cid}/context` | List linked directories |
//! | `DELETE` | `/rag/conversations/{cid}/context/{did}` | Unlink |
//! | `POST` | `/rag/retrieve` | Ranked chunk retrieval |
//! | `POST` | `/rag/clear-index` | Wipe all indexed state |
//! | `GET`  | `/rag/index-stats` | Aggregate counts |
//! | `GET`  | `/health` | Liveness and version |
//!
//! All errors are `{"error": "<string>"}` with an appropriate status.

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::catalog;
use crate::config::Config;
use crate::conversations;
use crate::embedder::SharedEmbedder;
use crate::generation::GenerationService;
use crate::indexer;
use crate::models::{IndexProgress, IndexStatus};
use crate::progress::ChannelSink;
use crate::retriever;
use crate::tool_graph;
use crate::tools::ToolRegistry;
use crate::vector_store::VectorStore;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub store: VectorStore,
    pub embedder: Arc<SharedEmbedder>,
    pub generation: Arc<GenerationService>,
    pub registry: Arc<ToolRegistry>,
}

/// Build the application router.
pub fn router(state: AppState, config: &Config) -> Router {
    let cors = if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/generate", post(handle_generate))
        .route("/generate-sse", post(handle_generate_sse))
        .route("/save-message", post(handle_save_message))
        .route("/tools/execute", post(handle_tools_execute))
        .route("/tools/stream", post(handle_tools_stream))
        .route("/tools", get(handle_tools_list))
        .route(
            "/rag/directories",
            post(handle_add_directory).get(handle_list_directories),
        )
        .route("/rag/directories/{id}", delete(handle_remove_directory))
        .route("/rag/directories/{id}/scan", post(handle_scan_directory))
        .route("/rag/directories/{id}/index", post(handle_index_directory))
        .route(
            "/rag/directories/{id}/index-stream",
            get(handle_index_stream),
        )
        .route(
            "/rag/conversations/{cid}/context",
            post(handle_add_context).get(handle_list_contexts),
        )
        .route(
            "/rag/conversations/{cid}/context/{did}",
            delete(handle_remove_context),
        )
        .route("/rag/retrieve", post(handle_retrieve))
        .route("/rag/clear-index", post(handle_clear_index))
        .route("/rag/index-stats", get(handle_index_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn run_server(
    state: AppState,
    config: &Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app = router(state, config);

    tracing::info!("listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Errors ============

/// Request-level error carrying the HTTP status for its kind.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn input_invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn precondition_failed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Map a service error onto the closest HTTP kind by inspecting its
    /// message.
    fn from_service(error: anyhow::Error) -> Self {
        let message = error.to_string();
        if message.contains("not found") || message.contains("Not found") {
            Self::not_found(message)
        } else if message.contains("does not exist")
            || message.contains("Unknown role")
            || message.contains("must not be empty")
        {
            Self::input_invalid(message)
        } else {
            Self::internal(message)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// ============ Generation ============

#[derive(Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default = "default_true")]
    use_enhanced_memory: bool,
}

fn default_true() -> bool {
    true
}

fn streaming_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::TRANSFER_ENCODING,
        HeaderValue::from_static("chunked"),
    );
}

async fn handle_generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::input_invalid("Empty prompt provided"));
    }
    if !state.generation.model.is_available() {
        return Err(ApiError::precondition_failed(
            "No LLM model available. Configure model.runtime_url and model.model.",
        ));
    }

    let stream = Arc::clone(&state.generation).generate_stream(
        request.prompt,
        request.conversation_id,
        request.use_enhanced_memory,
    );
    let body = Body::from_stream(
        stream.map(|line| Ok::<_, std::convert::Infallible>(Bytes::from(line))),
    );

    let mut response = body.into_response();
    streaming_headers(&mut response);
    Ok(response)
}

async fn handle_generate_sse(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::input_invalid("Empty prompt provided"));
    }
    if !state.generation.model.is_available() {
        return Err(ApiError::precondition_failed(
            "No LLM model available. Configure model.runtime_url and model.model.",
        ));
    }

    let inner = Arc::clone(&state.generation).generate_stream(
        request.prompt,
        request.conversation_id,
        request.use_enhanced_memory,
    );

    let framed = futures_util::stream::once(async { "event: start\ndata: {}\n\n".to_string() })
        .chain(inner.map(|line| {
            if line.contains("\"error\"") {
                format!("event: error\ndata: {}\n", line)
            } else {
                format!("data: {}\n", line)
            }
        }))
        .chain(futures_util::stream::once(async {
            "event: done\ndata: {}\n\n".to_string()
        }));

    let body =
        Body::from_stream(framed.map(|line| Ok::<_, std::convert::Infallible>(Bytes::from(line))));
    let mut response = body.into_response();
    streaming_headers(&mut response);
    Ok(response)
}

// ============ Messages ============

#[derive(Deserialize)]
struct SaveMessageRequest {
    conversation_id: String,
    role: String,
    content: String,
}

async fn handle_save_message(
    State(state): State<AppState>,
    Json(request): Json<SaveMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.conversation_id.trim().is_empty() {
        return Err(ApiError::input_invalid("conversation_id must not be empty"));
    }
    let message_id = conversations::add_message(
        &state.pool,
        &request.conversation_id,
        &request.role,
        &request.content,
    )
    .await
    .map_err(ApiError::from_service)?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "message_id": message_id,
    })))
}

// ============ Tools ============

#[derive(Deserialize)]
struct ToolsExecuteRequest {
    #[serde(default)]
    input: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

async fn handle_tools_execute(
    State(state): State<AppState>,
    Json(request): Json<ToolsExecuteRequest>,
) -> Result<Json<tool_graph::ToolGraphResult>, ApiError> {
    if request.input.trim().is_empty() {
        return Err(ApiError::input_invalid("input must not be empty"));
    }
    if !state.generation.model.is_available() {
        return Err(ApiError::precondition_failed(
            "No LLM model available. Configure model.runtime_url and model.model.",
        ));
    }

    let result = tool_graph::run_tool_graph(
        &state.generation,
        &state.registry,
        &request.input,
        request.conversation_id.as_deref(),
    )
    .await
    .map_err(ApiError::from_service)?;

    Ok(Json(result))
}

async fn handle_tools_stream(
    State(state): State<AppState>,
    Json(request): Json<ToolsExecuteRequest>,
) -> Result<Response, ApiError> {
    if request.input.trim().is_empty() {
        return Err(ApiError::input_invalid("input must not be empty"));
    }
    if !state.generation.model.is_available() {
        return Err(ApiError::precondition_failed(
            "No LLM model available. Configure model.runtime_url and model.model.",
        ));
    }

    let (tx, rx) = mpsc::channel::<serde_json::Value>(32);
    let generation = Arc::clone(&state.generation);
    let registry = Arc::clone(&state.registry);

    tokio::spawn(async move {
        let result = tool_graph::run_tool_graph_with_events(
            &generation,
            &registry,
            &request.input,
            request.conversation_id.as_deref(),
            Some(&tx),
        )
        .await;

        let terminal = match result {
            Ok(result) => {
                serde_json::to_value(&result).unwrap_or(serde_json::json!({"error": "serialization failed"}))
            }
            Err(e) => serde_json::json!({"error": e.to_string()}),
        };
        let _ = tx.send(terminal).await;
        let _ = tx.send(serde_json::json!({"done": true})).await;
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(|value| Ok::<_, std::convert::Infallible>(Bytes::from(format!("{}\n", value))));

    let mut response = Body::from_stream(stream).into_response();
    streaming_headers(&mut response);
    Ok(response)
}

async fn handle_tools_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tools": state.registry.list() }))
}

// ============ Directories ============

#[derive(Deserialize)]
struct AddDirectoryRequest {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    file_patterns: Option<Vec<String>>,
    #[serde(default)]
    exclude_patterns: Option<Vec<String>>,
    #[serde(default)]
    index_frequency_minutes: Option<i64>,
}

async fn handle_add_directory(
    State(state): State<AppState>,
    Json(request): Json<AddDirectoryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(path) = request.path.filter(|p| !p.trim().is_empty()) else {
        return Err(ApiError::input_invalid("path is required"));
    };

    let directory = catalog::add_directory(
        &state.pool,
        &path,
        request.file_patterns,
        request.exclude_patterns,
        request.index_frequency_minutes,
    )
    .await
    .map_err(ApiError::from_service)?;

    Ok(Json(serde_json::json!({ "directory": directory })))
}

async fn handle_list_directories(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let directories = catalog::list_directories(&state.pool, true)
        .await
        .map_err(ApiError::from_service)?;

    let mut out = Vec::with_capacity(directories.len());
    for directory in directories {
        let stats = catalog::directory_stats(&state.pool, &directory.id)
            .await
            .map_err(ApiError::from_service)?;
        out.push(serde_json::json!({ "directory": directory, "stats": stats }));
    }
    Ok(Json(serde_json::json!({ "directories": out })))
}

async fn handle_remove_directory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = catalog::deactivate_directory(&state.pool, &id)
        .await
        .map_err(ApiError::from_service)?;
    if !removed {
        return Err(ApiError::not_found(format!("Directory not found: {}", id)));
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn handle_scan_directory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let directory = catalog::get_directory(&state.pool, &id)
        .await
        .map_err(ApiError::from_service)?
        .ok_or_else(|| ApiError::not_found(format!("Directory not found: {}", id)))?;

    let (changes, errors) = indexer::scan_changes(&state.pool, &directory)
        .await
        .map_err(ApiError::from_service)?;

    Ok(Json(serde_json::json!({
        "new": changes.new.len(),
        "modified": changes.modified.len(),
        "deleted": changes.deleted.len(),
        "unchanged": changes.unchanged.len(),
        "errors": errors,
    })))
}

async fn handle_index_directory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = indexer::index_directory(
        &state.pool,
        &state.store,
        &state.embedder,
        &id,
        &crate::progress::LogSink,
    )
    .await
    .map_err(ApiError::from_service)?;

    Ok(Json(serde_json::json!({ "stats": stats })))
}

async fn handle_index_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| index_stream_socket(state, id, socket))
}

/// Push one JSON message per progress event, then a final
/// `{"status": "complete", "stats": {...}}`, then close.
async fn index_stream_socket(state: AppState, directory_id: String, mut socket: WebSocket) {
    let (tx, mut rx) = mpsc::channel::<IndexProgress>(64);
    let sink = ChannelSink::new(tx);

    let pool = state.pool.clone();
    let store = state.store.clone();
    let embedder = Arc::clone(&state.embedder);
    let id = directory_id.clone();
    let job = tokio::spawn(async move {
        indexer::index_directory(&pool, &store, &embedder, &id, &sink).await
    });

    while let Some(event) = rx.recv().await {
        // Terminal events are reported below from the job result, with
        // stats attached.
        if matches!(event.status, IndexStatus::Complete) {
            continue;
        }
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if socket.send(Message::Text(payload.into())).await.is_err() {
            // Client went away; the indexing job continues to completion.
            break;
        }
    }

    let final_message = match job.await {
        Ok(Ok(stats)) => serde_json::json!({ "status": "complete", "stats": stats }),
        Ok(Err(e)) => serde_json::json!({ "status": "error", "message": e.to_string() }),
        Err(e) => serde_json::json!({ "status": "error", "message": e.to_string() }),
    };
    let _ = socket
        .send(Message::Text(final_message.to_string().into()))
        .await;
    let _ = socket.close().await;
}

// ============ Conversation context ============

#[derive(Deserialize)]
struct AddContextRequest {
    #[serde(default)]
    directory_id: Option<String>,
}

async fn handle_add_context(
    State(state): State<AppState>,
    Path(cid): Path<String>,
    Json(request): Json<AddContextRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(directory_id) = request.directory_id.filter(|d| !d.trim().is_empty()) else {
        return Err(ApiError::input_invalid("directory_id is required"));
    };

    let context_id = retriever::add_conversation_context(&state.pool, &cid, &directory_id)
        .await
        .map_err(ApiError::from_service)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "context_id": context_id,
    })))
}

async fn handle_list_contexts(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let contexts = retriever::conversation_contexts(&state.pool, &cid)
        .await
        .map_err(ApiError::from_service)?;
    Ok(Json(serde_json::json!({ "contexts": contexts })))
}

async fn handle_remove_context(
    State(state): State<AppState>,
    Path((cid, did)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = retriever::remove_conversation_context(&state.pool, &cid, &did)
        .await
        .map_err(ApiError::from_service)?;
    if !removed {
        return Err(ApiError::not_found(format!(
            "No context link between {} and {}",
            cid, did
        )));
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ============ Retrieval ============

#[derive(Deserialize)]
struct RetrieveRequest {
    #[serde(default)]
    query: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    directory_ids: Option<Vec<String>>,
    #[serde(default)]
    top_k: Option<i64>,
    #[serde(default)]
    min_score: Option<f64>,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<retriever::RetrievalResult>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::input_invalid("query must not be empty"));
    }

    let result = retriever::retrieve(
        &state.pool,
        &state.store,
        &state.embedder,
        &request.query,
        request.conversation_id.as_deref().unwrap_or_default(),
        request.directory_ids,
        request.top_k,
        request.min_score,
    )
    .await
    .map_err(ApiError::from_service)?;

    Ok(Json(result))
}

// ============ Maintenance ============

async fn handle_clear_index(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .clear()
        .await
        .map_err(ApiError::from_service)?;
    catalog::clear_index(&state.pool)
        .await
        .map_err(ApiError::from_service)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn handle_index_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let aggregate = catalog::aggregate_stats(&state.pool)
        .await
        .map_err(ApiError::from_service)?;
    let total_embeddings = state
        .store
        .count()
        .await
        .map_err(ApiError::from_service)?;
    let per_directory = state
        .store
        .directory_stats()
        .await
        .map_err(ApiError::from_service)?;

    Ok(Json(serde_json::json!({
        "total_directories": aggregate.total_directories,
        "total_files": aggregate.total_files,
        "indexed_files": aggregate.indexed_files,
        "total_chunks": aggregate.total_chunks,
        "total_embeddings": total_embeddings,
        "directories": per_directory,
    })))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
