//! HTTP handlers for conversations, messages and the event stream.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::conversations::{Conversation, ConversationError};
use crate::library::{FolderUpdate, LibraryEvent};
use crate::scanner::FileDescriptor;
use crate::store::{Message, StoreError};
use crate::AppState;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("{0}")]
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Conversation(ConversationError::Store(e))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conversation(e) => match e {
                ConversationError::NotFound(_) => StatusCode::NOT_FOUND,
                ConversationError::NameTaken(_) => StatusCode::CONFLICT,
                ConversationError::InvalidName(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ConversationError::Store(StoreError::MessageNotFound(_)) => StatusCode::NOT_FOUND,
                ConversationError::Store(StoreError::InvalidPatch { .. })
                | ConversationError::Store(StoreError::Parse { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    conversations: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        conversations: state.library.len(),
    })
}

// ============================================================================
// SSE stream
// ============================================================================

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    Connected { conversations: usize },
    Heartbeat { timestamp: i64 },
}

fn event_name(event: &LibraryEvent) -> &'static str {
    match event {
        LibraryEvent::FoldersUpdated { .. } => "folders_updated",
        LibraryEvent::MessagesChanged { .. } => "messages_changed",
        LibraryEvent::Reconciled { .. } => "reconciled",
    }
}

fn sse_event(name: &str, seq: u64, payload: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .id(seq.to_string())
        .data(serde_json::to_string(payload).unwrap_or_default())
}

pub async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.library.subscribe();

    let heartbeat_state = state.clone();
    let heartbeat = stream::unfold((), move |()| {
        let s = heartbeat_state.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let payload = StreamMessage::Heartbeat {
                timestamp: s.library.clock().now().timestamp(),
            };
            Some((Ok(sse_event("heartbeat", s.next_seq(), &payload)), ()))
        }
    });

    let event_state = state.clone();
    let changes = stream::unfold(rx, move |mut rx| {
        let s = event_state.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let sse = sse_event(event_name(&event), s.next_seq(), &event);
                        return Some((Ok(sse), rx));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("SSE client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    });

    let connected = StreamMessage::Connected {
        conversations: state.library.len(),
    };
    let init_seq = state.next_seq();
    let init_event = stream::once(async move { Ok(sse_event("connected", init_seq, &connected)) });

    let merged = futures::StreamExt::chain(init_event, tokio_stream::StreamExt::merge(heartbeat, changes));
    Sse::new(merged).keep_alive(KeepAlive::default())
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Serialize)]
pub struct ConversationsResponse {
    conversations: Vec<Conversation>,
}

pub async fn list_conversations(State(state): State<Arc<AppState>>) -> Json<ConversationsResponse> {
    Json(ConversationsResponse {
        conversations: state.library.list(),
    })
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let conv = state.library.create().await?;
    info!("Created conversation {} ({})", conv.name, conv.id);
    Ok((StatusCode::CREATED, Json(conv)))
}

pub async fn update_folders(State(state): State<Arc<AppState>>) -> ApiResult<FolderUpdate> {
    Ok(Json(state.library.update_folders().await?))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    name: String,
}

pub async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Conversation> {
    let conv = state.library.rename(&id, &req.name).await?;
    info!("Renamed conversation {} to {}", id, conv.name);
    Ok(Json(conv))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Conversation> {
    let conv = state.library.delete(&id).await?;
    info!("Moved conversation {} to the recycle bin", conv.name);
    Ok(Json(conv))
}

#[derive(Serialize)]
pub struct FilesResponse {
    files: Vec<FileDescriptor>,
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<FilesResponse> {
    Ok(Json(FilesResponse {
        files: state.library.files(&id).await?,
    }))
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Serialize)]
pub struct MessagesResponse {
    messages: Vec<Message>,
}

impl From<Vec<Message>> for MessagesResponse {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<MessagesResponse> {
    Ok(Json(state.library.messages(&id).await?.into()))
}

/// Build a message from a request body. Id and timestamp are assigned by
/// the library, whatever the client sent.
pub fn message_from_body(mut body: Map<String, Value>) -> Result<Message, ApiError> {
    body.insert("id".to_string(), Value::String(String::new()));
    body.insert("timestamp".to_string(), Value::String(String::new()));
    serde_json::from_value(Value::Object(body)).map_err(|e| ApiError::BadRequest(format!("invalid message: {}", e)))
}

pub async fn append_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Result<(StatusCode, Json<MessagesResponse>), ApiError> {
    let messages = state.library.append_message(&id, message_from_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(messages.into())))
}

pub async fn update_message(
    State(state): State<Arc<AppState>>,
    Path((id, message_id)): Path<(String, String)>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<MessagesResponse> {
    Ok(Json(state.library.update_message(&id, &message_id, patch).await?.into()))
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<MessagesResponse> {
    Ok(Json(state.library.delete_message(&id, &message_id).await?.into()))
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    order: Vec<String>,
}

pub async fn reorder_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<MessagesResponse> {
    Ok(Json(state.library.reorder_messages(&id, req.order).await?.into()))
}

#[derive(Serialize)]
pub struct ReconcileResponse {
    scanned: usize,
    orphans: usize,
    imported: Vec<Message>,
}

pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ReconcileResponse> {
    let outcome = state.library.reconcile(&id).await?;
    Ok(Json(ReconcileResponse {
        scanned: outcome.scanned,
        orphans: outcome.orphans,
        imported: outcome.imported,
    }))
}

// ============================================================================
// Upload
// ============================================================================

#[derive(Deserialize, Default)]
pub struct UploadQuery {
    #[serde(default)]
    content: Option<String>,
}

/// Keep letters, digits and `.-_ `; never empty
pub fn sanitize_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_start_matches('.').trim().to_string();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// Store the request body as a file of the conversation and append a user
/// message that references it. The file name comes from `x-filename`.
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<MessagesResponse>), ApiError> {
    let original_name = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| urlencoding::decode(s).ok())
        .map(|s| s.into_owned())
        .ok_or_else(|| ApiError::BadRequest("missing x-filename header".to_string()))?;
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty upload".to_string()));
    }

    let name = sanitize_file_name(&original_name);
    let messages = state.library.attach_file(&id, &name, &body, query.content).await?;
    info!("Uploaded {} ({} bytes) to {}", name, body.len(), id);
    Ok((StatusCode::CREATED, Json(messages.into())))
}
