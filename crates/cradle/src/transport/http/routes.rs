//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};

use crate::service::{HealthSnapshot, RelayService};
use crate::transport::ws;

async fn health_check(State(service): State<Arc<RelayService>>) -> Json<HealthSnapshot> {
    Json(service.health())
}

/// Upgrade to a WebSocket and hand the connection to a fresh supervisor.
async fn main_socket(
    State(service): State<Arc<RelayService>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if service.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "server is shutting down"})),
        )
            .into_response();
    }

    match upgrade {
        Ok(upgrade) => upgrade
            .on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
            .on_upgrade(move |socket| handle_socket(socket, service)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, service: Arc<RelayService>) {
    let _active = service.track_connection();
    let supervisor = service.supervisor();
    tracing::debug!(id = %supervisor.id(), "Accepted connection");

    let (sender, receiver) = ws::split(socket);
    let report = supervisor.serve(sender, receiver).await;

    if let Some(error) = &report.handshake_error {
        tracing::info!(id = %report.id, %error, "Connection ended during handshake");
    }
}

async fn shutdown(State(service): State<Arc<RelayService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<RelayService>) -> Router {
    Router::new()
        .route("/main", get(main_socket))
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
