//! HTTP transport.
//!
//! Mounts the REST and event-stream routes behind an axum router and
//! serves them until the cancellation token fires.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::EventBroadcaster;
use crate::config::GlobalConfig;
use crate::session::SessionManager;
use crate::turn::TurnRunner;
use crate::{AppError, Result};

pub mod routes;

/// Shared state handed to every request handler.
pub struct AppState {
    /// Immutable service configuration.
    pub config: Arc<GlobalConfig>,
    /// Session registry.
    pub manager: Arc<SessionManager>,
    /// Event fan-out.
    pub broadcaster: Arc<EventBroadcaster>,
    /// Turn executor.
    pub turns: Arc<TurnRunner>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Turn(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::PathViolation(_) => StatusCode::BAD_REQUEST,
            Self::Engine(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({"detail": self.to_string()}));
        (status, body).into_response()
    }
}

/// Serve the HTTP API on `config.http_port` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails to bind or exits with
/// a transport error.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let port = state.config.http_port;
    let bind = SocketAddr::from(([0, 0, 0, 0], port));

    let router = routes::router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "starting HTTP transport");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        ct.cancelled().await;
    })
    .await
    .map_err(|err| AppError::Config(format!("HTTP server error: {err}")))?;

    info!("HTTP transport shut down");
    Ok(())
}
