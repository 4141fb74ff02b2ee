//! HTTP server implementation.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::service::BridgeService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Bind `config.host:config.port` and serve until shutdown.
pub async fn serve(config: ServerConfig, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    serve_listener(listener, service).await
}

/// Serve on an already bound listener. On shutdown the worker is stopped
/// through the bridge once in-flight HTTP requests have finished.
pub async fn serve_listener(
    listener: TcpListener,
    service: Arc<BridgeService>,
) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    info!("Starting synthbridge server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}

/// Resolves on SIGINT, SIGTERM, or [`BridgeService::trigger_shutdown`].
/// A signal that cannot be watched is logged and left out.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot watch for SIGINT");
            std::future::pending::<()>().await;
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
                warn!(error = %e, "Cannot watch for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let requested = async {
        let triggered = shutdown_rx.wait_for(|stop| *stop).await.is_ok();
        if !triggered {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => info!(signal = "SIGINT", "Stopping server"),
        _ = terminate => info!(signal = "SIGTERM", "Stopping server"),
        _ = requested => info!("Shutdown requested, stopping server"),
    }
}
