//! Route handler functions for all API endpoints.
//!
//! `/api/chat` streams the answer as a plain-text body; the session
//! endpoints return JSON.

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use docent_chat::SessionSummary;
use docent_core::types::Message;

use crate::error::ApiError;
use crate::state::AppState;

/// Response header carrying the session an answer belongs to.
pub const SESSION_HEADER: &str = "x-session-id";

/// Longest accepted session id.
const MAX_SESSION_ID_LEN: usize = 128;

// =============================================================================
// Request and response types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionDetail {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: String,
    pub pdf_attached: bool,
    pub chunk_count: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub live_sessions: usize,
    pub stored_sessions: usize,
}

/// Fields of a `/api/chat` multipart form.
#[derive(Debug, Default)]
struct ChatForm {
    text: Option<String>,
    file: Option<Bytes>,
    session_id: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Session ids are opaque but must be safe to echo in a header.
fn validate_session_id(id: &str) -> Result<(), ApiError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid session id: {:?}", id)))
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

async fn read_chat_form(mut multipart: Multipart) -> Result<ChatForm, ApiError> {
    let mut form = ChatForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("text") => form.text = Some(field.text().await.map_err(multipart_error)?),
            Some("session_id") => {
                form.session_id = Some(field.text().await.map_err(multipart_error)?)
            }
            Some("file") => {
                let bytes = field.bytes().await.map_err(multipart_error)?;
                // Browsers send an empty part when no file is chosen.
                if !bytes.is_empty() {
                    form.file = Some(bytes);
                }
            }
            other => debug!(field = ?other, "Ignoring unknown form field"),
        }
    }
    Ok(form)
}

// =============================================================================
// Handler functions
// =============================================================================

/// POST /api/chat - ask a question, optionally uploading a document.
///
/// The answer streams back as `text/plain`. A generation failure after the
/// response has started aborts the body.
pub async fn chat(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_chat_form(multipart).await?;

    let session_id = form
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| state.config.chat.default_session_id.clone());
    validate_session_id(&session_id)?;

    let text = form
        .text
        .ok_or_else(|| ApiError::BadRequest("missing form field: text".to_string()))?;

    info!(
        session_id = %session_id,
        prompt_chars = text.chars().count(),
        document_bytes = form.file.as_ref().map(|f| f.len()).unwrap_or(0),
        "Chat request"
    );

    let answer = state
        .coordinator
        .ask(&session_id, &text, form.file.as_deref())
        .await?;

    let session_header = HeaderValue::from_str(&session_id)
        .map_err(|e| ApiError::BadRequest(format!("invalid session id: {}", e)))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(SESSION_HEADER, session_header)
        .body(Body::from_stream(answer))
        .map_err(|e| ApiError::Internal(format!("Failed to build response: {}", e)))
}

/// POST /api/sessions - create a session, optionally with a chosen id.
pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionSummary>), ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    if let Some(id) = &request.id {
        validate_session_id(id)?;
    }
    let summary = state.registry.create(request.id).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// GET /api/sessions - stored sessions, most recently updated first.
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.list(),
    })
}

/// GET /api/sessions/{id} - full history of one session.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    let snapshot = state.registry.lookup(&id).await?;
    Ok(Json(SessionDetail {
        id: snapshot.id,
        title: snapshot.title,
        created_at: snapshot.created_at,
        updated_at: snapshot.updated_at,
        phase: snapshot.phase,
        pdf_attached: snapshot.document_attached,
        chunk_count: snapshot.chunks.len(),
        messages: snapshot.messages,
    }))
}

/// POST /api/sessions/{id}/reset - clear history and document.
pub async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.reset(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/sessions/{id} - remove a session entirely.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health - health check.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        live_sessions: state.registry.live_count(),
        stored_sessions: state.registry.store().len(),
    })
}
