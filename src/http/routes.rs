//! REST and event-stream route handlers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::http::AppState;
use crate::models::event::EventKind;
use crate::models::session::SessionSnapshot;
use crate::session::CleanupReport;
use crate::{AppError, Result};

/// Body for `POST /api/session/create`. Both fields are optional; an
/// omitted id is generated server-side.
#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    session_id: Option<String>,
    #[serde(default)]
    config: BTreeMap<String, Value>,
}

/// Body for `POST /api/chat/message/{id}`.
#[derive(Debug, Deserialize)]
struct MessageRequest {
    message: String,
}

/// Build the full API router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/session/create", post(create_session))
        .route("/api/session/list", get(list_sessions))
        .route("/api/session/{id}", get(get_session).delete(delete_session))
        .route("/api/session/{id}/heartbeat", post(heartbeat))
        .route("/api/session/{id}/config", post(update_config))
        .route("/api/chat/stream/{id}", get(stream_events))
        .route("/api/chat/message/{id}", post(post_message))
        .route("/api/chat/history/{id}", get(history))
        .route("/api/system/stats", get(system_stats))
        .route("/api/system/cleanup", post(force_cleanup))
        .with_state(state)
}

/// Handler for `GET /health`: returns 200 OK with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

/// Create a session, or touch it if the requested id already exists.
/// Client origin details ride along as reserved metadata keys.
async fn create_session(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Option<Json<CreateSessionRequest>>,
) -> Json<Value> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();

    let mut overrides = request.config;
    overrides.insert(
        "client_ip".into(),
        Value::String(addr.ip().to_string()),
    );
    if let Some(agent) = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        overrides.insert("user_agent".into(), Value::String(agent.to_owned()));
    }

    let id = state.manager.create(request.session_id, Some(overrides)).await;
    state
        .broadcaster
        .broadcast(
            &id,
            EventKind::SessionCreated,
            serde_json::json!({"message": "session created"}),
        )
        .await;

    Json(serde_json::json!({"session_id": id, "status": "created"}))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions = state.manager.list();
    Json(serde_json::json!({"count": sessions.len(), "sessions": sessions}))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>> {
    state
        .manager
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))
}

/// Delete a session, aborting its in-flight turn first so the engine
/// handle is not returned to a record that no longer exists.
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let turn_cancelled = state.turns.cancel(&id);
    if state.manager.delete(&id).await {
        Ok(Json(serde_json::json!({
            "status": "deleted",
            "session_id": id,
            "turn_cancelled": turn_cancelled,
        })))
    } else {
        Err(AppError::NotFound(format!("session {id}")))
    }
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    if state.manager.heartbeat(&id) {
        Ok(Json(serde_json::json!({"status": "ok", "session_id": id})))
    } else {
        Err(AppError::NotFound(format!("session {id}")))
    }
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<BTreeMap<String, Value>>,
) -> Result<Json<Value>> {
    if state.manager.update_config(&id, patch).await {
        Ok(Json(serde_json::json!({"status": "updated", "session_id": id})))
    } else {
        Err(AppError::NotFound(format!("session {id}")))
    }
}

/// Attach to a session's event feed as a Server-Sent Events response.
/// The session is created on the spot when it does not exist yet, so a
/// client may open its stream before its first message.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response> {
    if state.manager.get_or_create(&id, None).await.is_none() {
        return Err(AppError::NotFound(format!("session {id}")));
    }

    let stream = state.broadcaster.attach(&id).await;
    debug!(session_id = id, subscriber_id = stream.subscriber_id(), "event stream opened");

    let frames = futures_util::stream::unfold(stream, |mut stream| async move {
        let frame = stream.next_frame().await?;
        Some((Ok::<Bytes, std::convert::Infallible>(Bytes::from(frame)), stream))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames))
        .map_err(|err| AppError::Config(format!("stream response: {err}")))
}

/// Accept a chat message and schedule its turn. Responds 202 before the
/// turn runs; results arrive on the session's event stream.
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    if request.message.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"detail": "message must not be empty"})),
        ));
    }
    if state.manager.get_or_create(&id, None).await.is_none() {
        return Err(AppError::NotFound(format!("session {id}")));
    }

    state.turns.submit(&id, request.message)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted", "session_id": id})),
    ))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let messages = state
        .manager
        .history(&id)
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
    Ok(Json(serde_json::json!({
        "session_id": id,
        "count": messages.len(),
        "messages": messages,
    })))
}

async fn system_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions = state.manager.stats();
    let events = state.broadcaster.stats().await;
    Json(serde_json::json!({
        "session_manager": sessions,
        "event_broadcaster": events,
        "active_turns": state.turns.active_turns(),
    }))
}

async fn force_cleanup(State(state): State<Arc<AppState>>) -> Json<CleanupReport> {
    Json(state.manager.force_memory_cleanup().await)
}
