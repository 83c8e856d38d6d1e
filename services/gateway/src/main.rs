use std::env;
use std::sync::Arc;

use gateway::collaborators::defaults::{InMemoryStateSyncHandler, LoggingMessageHandler};
use gateway::{auth::JwtAuthValidator, build_router, spawn_background_tasks, GatewayConfig, GatewayManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let config = GatewayConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    let jwt_secret = env::var("GATEWAY_JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("GATEWAY_JWT_SECRET not set; falling back to an insecure development default");
        "development-secret".to_owned()
    });

    let manager = GatewayManager::new(
        config,
        Arc::new(JwtAuthValidator::new(jwt_secret)),
        Arc::new(LoggingMessageHandler),
        Arc::new(InMemoryStateSyncHandler::default()),
    );

    spawn_background_tasks(manager.clone());

    let router = build_router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .expect("server error");
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C, then drives the fabric's five-phase
/// graceful shutdown before returning control to `axum::serve`.
async fn shutdown_signal(manager: Arc<GatewayManager>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    let report = manager.shutdown().await;
    info!(
        notified = report.notified,
        drained_gracefully = report.drained_gracefully,
        force_closed = report.force_closed,
        messages_preserved = report.messages_preserved,
        messages_lost = report.messages_lost,
        "drain complete"
    );
}
