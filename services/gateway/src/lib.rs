pub mod auth;
pub mod broadcast;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod manager;
pub mod queue;
pub mod rate_limit;
pub mod reconnect;
pub mod registry;
pub mod sender;
pub mod shutdown;
pub mod telemetry;
pub mod validation;
pub mod writer;
pub mod ws;

pub use config::GatewayConfig;
pub use manager::GatewayManager;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

/// Assembles the fabric's HTTP surface: the WebSocket upgrade endpoint, a
/// telemetry snapshot for operators, and a liveness probe. There is no
/// dashboard or REST API here — those belong to whatever application embeds
/// this fabric, not to the fabric itself.
pub fn build_router(manager: Arc<GatewayManager>) -> Router {
    Router::new()
        .route("/ws", get(ws::upgrade_handler))
        .route("/stats", get(http::stats::get_stats))
        .route("/healthz", get(http::stats::healthz))
        .with_state(manager)
}

/// Spawns the fabric's two periodic background loops: the heartbeat
/// supervisor's tick (gated off once shutdown reaches the
/// stop-heartbeat-tickers phase) and the reconnection ledger's sweep of
/// expired entries. Both run for the lifetime of the process.
pub fn spawn_background_tasks(manager: Arc<GatewayManager>) {
    let heartbeat_manager = manager.clone();
    tokio::spawn(async move {
        let mut heartbeats_active = heartbeat_manager.shutdown.heartbeats_active_receiver();
        let mut ticker = tokio::time::interval(heartbeat_manager.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            if !*heartbeats_active.borrow() {
                debug!("heartbeat ticker stopping: shutdown disabled further heartbeats");
                break;
            }
            heartbeat_manager.heartbeat.tick().await;
        }
    });

    let reconnection_manager = manager;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let swept = reconnection_manager.reconnection.sweep_expired().await;
            if swept > 0 {
                info!(swept, "reconnection ledger swept expired entries");
            }
        }
    });
}
