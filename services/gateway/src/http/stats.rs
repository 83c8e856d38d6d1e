use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::manager::GatewayManager;
use crate::telemetry::{HeartbeatStats, TelemetrySnapshot};

#[derive(Debug, Serialize)]
pub struct StatsBody {
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_connections: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub heartbeat: HeartbeatStatsBody,
    pub health_score: f64,
    pub health_band: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatStatsBody {
    pub sent: u64,
    pub received: u64,
    pub missed: u64,
    pub avg_rtt_ms: f64,
    pub zombie_count: u64,
}

impl From<HeartbeatStats> for HeartbeatStatsBody {
    fn from(stats: HeartbeatStats) -> Self {
        Self {
            sent: stats.sent,
            received: stats.received,
            missed: stats.missed,
            avg_rtt_ms: stats.avg_rtt_ms,
            zombie_count: stats.zombie_count,
        }
    }
}

impl From<TelemetrySnapshot> for StatsBody {
    fn from(snapshot: TelemetrySnapshot) -> Self {
        Self {
            uptime_seconds: snapshot.uptime.as_secs(),
            active_connections: snapshot.active_connections,
            peak_connections: snapshot.peak_connections,
            total_messages_sent: snapshot.total_messages_sent,
            total_messages_received: snapshot.total_messages_received,
            total_connections: snapshot.connection_stats.total_connections,
            successful_connections: snapshot.connection_stats.successful_connections,
            failed_connections: snapshot.connection_stats.failed_connections,
            heartbeat: snapshot.heartbeat.into(),
            health_score: snapshot.health_score,
            health_band: snapshot.health_band.as_str(),
        }
    }
}

/// `GET /stats`: the telemetry snapshot as JSON, used by operators and by
/// the seed integration tests rather than a dashboard.
pub async fn get_stats(State(manager): State<Arc<GatewayManager>>) -> Json<StatsBody> {
    Json(manager.get_stats().await.into())
}

/// `GET /healthz`: a trivial liveness probe distinct from `/stats`'s
/// richer health score — this only answers "is the process accepting
/// connections", which a load balancer can poll cheaply.
pub async fn healthz(State(manager): State<Arc<GatewayManager>>) -> &'static str {
    if manager.is_accepting() {
        "ok"
    } else {
        "draining"
    }
}
