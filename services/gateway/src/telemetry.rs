use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::connection::ConnectionState;
use crate::registry::{ConnectionStatsSnapshot, Registry};

const PERFORMANCE_HISTORY_CAPACITY: usize = 1000;
const PERFORMANCE_TREND_WINDOW: usize = 10;
/// Keeps `healthy / (total + epsilon)` finite and close to 1.0 for a small
/// or empty registry instead of dividing by zero.
const HEALTH_SCORE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBand {
    Excellent,
    Good,
    Degraded,
    Poor,
}

impl HealthBand {
    /// Fixed thresholds: `>= 0.9` excellent, `>= 0.7` good, `>= 0.4`
    /// degraded, else poor.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            HealthBand::Excellent
        } else if score >= 0.7 {
            HealthBand::Good
        } else if score >= 0.4 {
            HealthBand::Degraded
        } else {
            HealthBand::Poor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthBand::Excellent => "excellent",
            HealthBand::Good => "good",
            HealthBand::Degraded => "degraded",
            HealthBand::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PerformanceSample {
    pub active_connections: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatStats {
    pub sent: u64,
    pub received: u64,
    pub missed: u64,
    pub avg_rtt_ms: f64,
    pub zombie_count: u64,
}

#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    pub uptime: std::time::Duration,
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub connection_stats: ConnectionStatsSnapshot,
    pub heartbeat: HeartbeatStats,
    pub health_score: f64,
    pub health_band: HealthBand,
    pub recent_samples: Vec<PerformanceSample>,
    pub rate_limited_total: u64,
}

/// Aggregates the registry's per-connection counters into a single
/// health-scored snapshot, plus a rolling window of recent samples for
/// trend reporting.
pub struct TelemetryCollector {
    registry: Arc<Registry>,
    started_at: Instant,
    peak_connections: std::sync::atomic::AtomicUsize,
    performance_history: Mutex<VecDeque<PerformanceSample>>,
    rate_limited_total: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
            peak_connections: std::sync::atomic::AtomicUsize::new(0),
            performance_history: Mutex::new(VecDeque::with_capacity(PERFORMANCE_HISTORY_CAPACITY)),
            rate_limited_total: AtomicU64::new(0),
        }
    }

    /// Records that one inbound message was rejected by the per-connection
    /// rate limiter, so a rate-limit decision is observable in telemetry.
    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// `health_score = (healthy / (total + eps) + response_rate) / 2`: one
    /// factor for how many of the currently-registered connections are
    /// actually `ACTIVE` (as opposed to zombied, draining, or failed), one
    /// for how reliably pings are getting answered. An empty registry
    /// reports perfect health on both factors.
    fn health_score(connections: &[Arc<crate::connection::ConnectionRecord>], heartbeat: &HeartbeatStats) -> f64 {
        let total = connections.len() as f64;
        let healthy = connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Active)
            .count() as f64;
        let healthy_ratio = if total == 0.0 { 1.0 } else { healthy / (total + HEALTH_SCORE_EPSILON) };

        let response_rate = if heartbeat.sent == 0 {
            1.0
        } else {
            (heartbeat.received as f64 / heartbeat.sent as f64).min(1.0)
        };

        (healthy_ratio + response_rate) / 2.0
    }

    fn heartbeat_stats(connections: &[Arc<crate::connection::ConnectionRecord>]) -> HeartbeatStats {
        let mut sent = 0u64;
        let mut received = 0u64;
        let mut missed = 0u64;
        let mut rtt_total = 0u64;
        let mut rtt_samples = 0u64;
        let mut zombie_count = 0u64;

        for record in connections {
            sent += u64::from(record.heartbeats_sent.load(Ordering::Relaxed));
            received += u64::from(record.heartbeats_received.load(Ordering::Relaxed));
            missed += u64::from(record.missed_pong_count.load(Ordering::Relaxed));
            if record.state() == ConnectionState::Zombie {
                zombie_count += 1;
            }
            let rtt = record.rtt_ms.load(Ordering::Relaxed);
            if rtt > 0 {
                rtt_total += rtt;
                rtt_samples += 1;
            }
        }

        HeartbeatStats {
            sent,
            received,
            missed,
            avg_rtt_ms: if rtt_samples == 0 { 0.0 } else { rtt_total as f64 / rtt_samples as f64 },
            zombie_count,
        }
    }

    pub async fn record_sample(&self) -> PerformanceSample {
        let connections = self.registry.all().await;
        let active_connections = connections.len();
        self.peak_connections.fetch_max(active_connections, Ordering::AcqRel);

        let mut messages_sent = 0u64;
        let mut messages_received = 0u64;
        for record in &connections {
            messages_sent += u64::from(record.messages_sent.load(Ordering::Relaxed));
            messages_received += u64::from(record.messages_received.load(Ordering::Relaxed));
        }

        let sample = PerformanceSample {
            active_connections,
            messages_sent,
            messages_received,
        };

        let mut history = self.performance_history.lock().await;
        if history.len() == PERFORMANCE_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(sample);
        sample
    }

    pub async fn get_stats(&self) -> TelemetrySnapshot {
        let connections = self.registry.all().await;
        let sample = self.record_sample().await;
        let connection_stats = self.registry.stats().snapshot();
        let heartbeat = Self::heartbeat_stats(&connections);
        let health_score = Self::health_score(&connections, &heartbeat);

        let history = self.performance_history.lock().await;
        let recent_samples = history
            .iter()
            .rev()
            .take(PERFORMANCE_TREND_WINDOW)
            .rev()
            .copied()
            .collect();

        TelemetrySnapshot {
            uptime: self.started_at.elapsed(),
            active_connections: sample.active_connections,
            peak_connections: self.peak_connections.load(Ordering::Acquire),
            total_messages_sent: sample.messages_sent,
            total_messages_received: sample.messages_received,
            connection_stats,
            heartbeat,
            health_score,
            health_band: HealthBand::from_score(health_score),
            recent_samples,
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
        }
    }
}
