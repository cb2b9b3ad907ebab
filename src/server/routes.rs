//! HTTP route handlers for the chat relay API.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::chat::core::{AttachmentError, ChatError, SessionId, Turn};
use crate::chat::{AttachmentPreview, ExchangeResult, ExchangeState, Session, Upload};

use super::state::AppState;

/// Error response shape shared by all handlers.
pub type ApiError = (StatusCode, String);

/// JSON and base64 overhead on top of the decoded upload limit.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    // base64 inflates by 4/3
    let body_limit = state.max_upload_bytes / 3 * 4 + BODY_OVERHEAD_BYTES;
    let static_files = ServeDir::new(&state.static_dir);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/info", get(info))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/messages", post(post_message))
        .route("/api/sessions/{id}/attachments", post(post_attachment))
        .route("/api/attachments/preview", post(preview_attachment))
        .fallback_service(static_files)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Map a chat error to a status code and message.
#[must_use]
pub fn error_response(err: ChatError) -> ApiError {
    let status = match &err {
        ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::SessionBusy(_) => StatusCode::CONFLICT,
        ChatError::SessionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::EmptyMessage | ChatError::Attachment(AttachmentError::Base64(_)) => {
            StatusCode::BAD_REQUEST
        }
        ChatError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ChatError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ChatError::Attachment(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ChatError::Endpoint(_) => StatusCode::BAD_GATEWAY,
        ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("request failed: {err}");
    }
    (status, err.to_string())
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Static page information.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    /// Page title.
    pub title: String,
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Whether images can be sent.
    pub vision: bool,
    /// Greeting shown in new sessions.
    pub greeting: String,
}

async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        title: state.title.clone(),
        provider: state.provider.to_string(),
        model: state.controller.model().to_string(),
        vision: state.controller.supports_vision(),
        greeting: state.controller.prompts().greeting.clone(),
    })
}

/// A session as rendered: the system turn is never included.
#[derive(Debug, Serialize)]
pub struct SessionView {
    /// Session identifier.
    pub session_id: SessionId,
    /// Current exchange state.
    pub state: ExchangeState,
    /// Visible turns.
    pub turns: Vec<Turn>,
}

impl SessionView {
    fn of(session: &Session) -> Self {
        Self {
            session_id: session.id,
            state: session.state,
            turns: session.transcript.visible().to_vec(),
        }
    }
}

async fn create_session(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let session = state.controller.new_session();
    let view = SessionView::of(&session);
    state.sessions.insert(session).map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionView>, ApiError> {
    // Never wait behind an in-flight exchange.
    let session = state.sessions.acquire(id).map_err(error_response)?;
    Ok(Json(SessionView::of(&session)))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    state.sessions.destroy(id).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Plain text message.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    /// The user's message.
    pub message: String,
}

/// Upload with an optional message.
#[derive(Debug, Deserialize)]
pub struct AttachmentRequest {
    /// Declared MIME type.
    pub mime_type: String,
    /// Base64 file content.
    pub data: String,
    /// Optional accompanying message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Upload to preview.
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    /// Declared MIME type.
    pub mime_type: String,
    /// Base64 file content.
    pub data: String,
}

/// Exchange result plus the updated visible transcript.
#[derive(Debug, Serialize)]
pub struct ExchangeResponse {
    /// Outcome, reply, error and notices.
    #[serde(flatten)]
    pub result: ExchangeResult,
    /// Visible turns after the exchange.
    pub turns: Vec<Turn>,
}

impl ExchangeResponse {
    fn new(result: ExchangeResult, session: &Session) -> Self {
        Self {
            result,
            turns: session.transcript.visible().to_vec(),
        }
    }
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    let mut session = state.sessions.acquire(id).map_err(error_response)?;
    let result = state
        .controller
        .send_text(&mut session, &request.message)
        .await
        .map_err(error_response)?;
    Ok(Json(ExchangeResponse::new(result, &session)))
}

async fn post_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(request): Json<AttachmentRequest>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    let upload = Upload::from_base64(request.mime_type, &request.data)
        .map_err(|e| error_response(e.into()))?;
    let mut session = state.sessions.acquire(id).map_err(error_response)?;
    let result = state
        .controller
        .send_attachment(&mut session, upload, request.message.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(ExchangeResponse::new(result, &session)))
}

async fn preview_attachment(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<AttachmentPreview>, ApiError> {
    let upload = Upload::from_base64(request.mime_type, &request.data)
        .map_err(|e| error_response(e.into()))?;
    let processor = state.controller.attachments().clone();
    let preview = tokio::task::spawn_blocking(move || processor.preview(&upload))
        .await
        .map_err(|e| error_response(e.into()))?
        .map_err(error_response)?;
    Ok(Json(preview))
}
