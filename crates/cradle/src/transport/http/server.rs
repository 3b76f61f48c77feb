//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::RelayService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long live connections get to close after shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 38000,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Bind `host:port` and serve until SIGINT, SIGTERM or `/shutdown`.
pub async fn serve(config: ServerConfig, service: Arc<RelayService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, service, config.shutdown_grace).await
}

/// Serve on an already-bound listener.
///
/// On shutdown every live connection is terminated and closed; upgraded
/// sockets are not tracked by axum, so this waits up to `shutdown_grace`
/// for them before returning.
pub async fn serve_on(
    listener: TcpListener,
    service: Arc<RelayService>,
    shutdown_grace: Duration,
) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(Arc::clone(&service));

    info!("Starting cradle server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    // SIGINT/SIGTERM land here without the flag being set
    service.trigger_shutdown();
    if !service.wait_for_idle(shutdown_grace).await {
        tracing::warn!(
            active_connections = service.active_connections(),
            "Connections still open after shutdown grace period"
        );
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or an explicit shutdown request.
///
/// A signal handler that cannot be installed is logged and never fires.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}
