//! Route definitions for the Parley server.
//!
//! Session identity rides in an opaque `parley_session` cookie; it is
//! never accepted from the query string or body. Streaming responses use
//! server-sent events with a `[END]` terminal frame and in-band
//! `[ERROR: ...]` frames, matching what the client shell expects.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use parley_common::Error;
use parley_core::{ChatEvent, ImageCache, Orchestrator, ResolvedSession, SessionStore};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

/// Cookie carrying the opaque session identifier.
pub const SESSION_COOKIE: &str = "parley_session";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub images: Arc<ImageCache>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

/// Upload response.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub image_id: String,
    pub filename: String,
}

/// Single-shot chat response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

/// Generic status response.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatParams {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
}

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/upload-image", post(upload_image))
        .route("/chat", get(chat))
        .route("/new_chat", get(new_chat))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .with_state(state)
}

/// Serve the embedded client shell.
async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "parley-server".to_string(),
    })
}

/// Accept a multipart image upload into the cache.
///
/// Requires an active session; the first file part is validated and
/// stored, and the fresh identifier is returned for a later `/chat` call.
async fn upload_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, Json<ErrorResponse>)> {
    let token = session_cookie(&headers).ok_or_else(|| error_response(&Error::SessionRequired))?;
    if state.sessions.get(&token).await.is_none() {
        return Err(error_response(&Error::SessionRequired));
    }

    let bad_body =
        |e: axum::extract::multipart::MultipartError| -> (StatusCode, Json<ErrorResponse>) {
            error_response(&Error::InvalidInput(format!("malformed upload body: {e}")))
        };

    while let Some(field) = multipart.next_field().await.map_err(bad_body)? {
        let is_file = field.file_name().is_some()
            || matches!(field.name(), Some("file") | Some("image"));
        if !is_file {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(bad_body)?;

        let image_id = state
            .images
            .store(bytes.to_vec(), &content_type)
            .await
            .map_err(|e| error_response(&e))?;
        state.sessions.touch(&token).await;
        tracing::info!(session = %token, image = %image_id, %filename, "Image uploaded");
        return Ok(Json(UploadResponse { image_id, filename }));
    }

    Err(error_response(&Error::InvalidInput(
        "no file part in upload".to_string(),
    )))
}

/// Run one chat exchange.
///
/// Text-only requests stream over SSE; requests referencing an uploaded
/// image run single-shot and return JSON. A fresh session sets the
/// session cookie on the way out.
async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ChatParams>,
) -> Response {
    let message = params.message.as_deref().unwrap_or("").trim().to_string();
    if message.is_empty() && params.image_id.is_none() {
        return error_response(&Error::InvalidInput(
            "message or image_id is required".to_string(),
        ))
        .into_response();
    }

    let token = session_cookie(&headers);
    let resolved = state.sessions.resolve_or_create(token.as_deref()).await;
    let fresh_cookie = resolved.created.then(|| session_cookie_value(&resolved.id));

    if params.image_id.is_none() && message.eq_ignore_ascii_case("exit") {
        state.sessions.destroy(&resolved.id).await;
        let mut response = Json(ChatResponse {
            response: "Goodbye!".to_string(),
        })
        .into_response();
        append_cookie(&mut response, &clear_cookie_value());
        return response;
    }

    let mut response = match &params.image_id {
        Some(image_id) => chat_with_image(&state, &resolved, &message, image_id).await,
        None => chat_streaming(&state, resolved.clone(), message),
    };
    if let Some(cookie) = fresh_cookie {
        append_cookie(&mut response, &cookie);
    }
    response
}

async fn chat_with_image(
    state: &AppState,
    resolved: &ResolvedSession,
    message: &str,
    image_id: &str,
) -> Response {
    let Some(image) = state.images.fetch(image_id).await else {
        return error_response(&Error::NotFound(format!("unknown image: {image_id}")))
            .into_response();
    };

    match state
        .orchestrator
        .chat_once(resolved, message, image.into_attachment())
        .await
    {
        Ok(text) => {
            state.images.consume(image_id).await;
            Json(ChatResponse { response: text }).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

fn chat_streaming(state: &AppState, resolved: ResolvedSession, message: String) -> Response {
    let rx = state.orchestrator.chat_stream(resolved, message);
    let frames = ReceiverStream::new(rx).map(|event| {
        let data = match event {
            ChatEvent::Fragment(text) => text,
            ChatEvent::Done => "[END]".to_string(),
            ChatEvent::Error(detail) => format!("[ERROR: {detail}]"),
        };
        // Carriage returns are not representable in an SSE data field.
        Ok::<Event, Infallible>(Event::default().data(data.replace('\r', "")))
    });

    Sse::new(frames)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// Destroy the caller's session and clear the cookie.
async fn new_chat(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_cookie(&headers) {
        state.sessions.destroy(&token).await;
    }
    let mut response = Json(StatusResponse {
        status: "success".to_string(),
    })
    .into_response();
    append_cookie(&mut response, &clear_cookie_value());
    response
}

// ────────────────────────────────────────────────────────────────────────
// Cookie and error plumbing
// ────────────────────────────────────────────────────────────────────────

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
    })
}

fn session_cookie_value(id: &str) -> String {
    format!("{SESSION_COOKIE}={id}; HttpOnly; SameSite=Lax; Path=/")
}

fn clear_cookie_value() -> String {
    format!("{SESSION_COOKIE}=; Max-Age=0; HttpOnly; SameSite=Lax; Path=/")
}

fn append_cookie(response: &mut Response, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

/// Map a domain error onto the wire: status from the error, stable code,
/// and a message that is sanitized for anything not client-safe.
fn error_response(err: &Error) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if err.is_client_safe() {
        err.to_string()
    } else {
        tracing::error!(error = %err, "Internal error");
        "Internal server error".to_string()
    };
    (
        status,
        Json(ErrorResponse {
            error: message,
            code: err.code().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(raw).unwrap());
        headers
    }

    #[test]
    fn test_session_cookie_extraction() {
        let headers = headers_with_cookie("other=1; parley_session=abc123; theme=dark");
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_missing_or_empty_cookie_is_none() {
        assert_eq!(session_cookie(&HeaderMap::new()), None);
        let headers = headers_with_cookie("parley_session=");
        assert_eq!(session_cookie(&headers), None);
    }

    #[test]
    fn test_cookie_attributes() {
        let cookie = session_cookie_value("abc");
        assert!(cookie.starts_with("parley_session=abc"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));

        let cleared = clear_cookie_value();
        assert!(cleared.contains("Max-Age=0"));
    }

    #[test]
    fn test_error_response_mapping() {
        let (status, Json(body)) = error_response(&Error::SessionRequired);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, "SESSION_REQUIRED");

        let (status, Json(body)) = error_response(&Error::PayloadTooLarge { limit: 4096 });
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body.error.contains("4096"));
    }

    #[test]
    fn test_internal_errors_are_sanitized() {
        let (status, Json(body)) = error_response(&Error::Internal("secret detail".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal server error");
        assert!(!body.error.contains("secret"));
    }
}
