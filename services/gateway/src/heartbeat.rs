use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fabric_protocol::{message_types, Envelope, HeartbeatPing};
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::connection::ConnectionRecord;
use crate::registry::{OutboundItem, Registry};

/// Tracks the outbound ping sequence for one connection.
pub struct HeartbeatTracker {
    sequence: AtomicU64,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_ping(&self, connection_id: &str) -> HeartbeatPing {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        HeartbeatPing::new(connection_id, Utc::now(), sequence)
    }
}

/// Adapts the next ping interval to the connection's measured RTT and recent
/// pong losses (§4.6): a slow or lossy link is pinged more often so zombie
/// detection stays timely; a fast, healthy link is pinged less often to save
/// bandwidth. Always clamped to `[10s, 120s]`.
pub fn next_interval(current: Duration, rtt_ms: u64, missed_pong_count: u32) -> Duration {
    let mut secs = current.as_secs_f64();
    if rtt_ms > 1000 {
        secs *= 1.5;
    } else if rtt_ms > 0 && rtt_ms < 50 {
        secs *= 0.8;
    }
    if missed_pong_count > 0 {
        secs *= 0.7;
    }
    Duration::from_secs_f64(secs.clamp(10.0, 120.0))
}

/// The zombie predicate (§4.6): too many unanswered pings, or simply too
/// long since the last pong was seen, regardless of ping count.
pub fn is_zombie(record: &ConnectionRecord, config: &GatewayConfig) -> bool {
    record.is_active()
        && (record.missed_pong_count.load(Ordering::Acquire) >= config.max_missed_pongs
            || record.time_since_last_pong() > config.zombie_detect)
}

/// Runs the periodic ping tick for one connection: returns `true` while the
/// connection should keep receiving pings (it is still active and not yet a
/// zombie).
pub fn should_continue_pinging(record: &Arc<ConnectionRecord>, config: &GatewayConfig) -> bool {
    record.is_active() && !is_zombie(record, config)
}

fn ping_envelope(ping: &HeartbeatPing) -> Envelope {
    Envelope::new(
        message_types::HEARTBEAT_PING,
        serde_json::json!({
            "connection_id": ping.connection_id,
            "sequence": ping.sequence,
        }),
        ping.timestamp,
    )
    .system()
}

/// Drives ping/pong supervision for every connection in the registry.
///
/// One [`HeartbeatSupervisor::tick`] call is a single sweep: connections past
/// the zombie predicate are transitioned to `ZOMBIE` and scheduled for
/// cleanup after `zombie_grace`; everything else still active gets a fresh
/// ping if its adaptive interval has elapsed.
pub struct HeartbeatSupervisor {
    registry: Arc<Registry>,
    config: GatewayConfig,
    trackers: Mutex<HashMap<String, Arc<HeartbeatTracker>>>,
    intervals: Mutex<HashMap<String, Duration>>,
}

impl HeartbeatSupervisor {
    pub fn new(registry: Arc<Registry>, config: GatewayConfig) -> Self {
        Self {
            registry,
            config,
            trackers: Mutex::new(HashMap::new()),
            intervals: Mutex::new(HashMap::new()),
        }
    }

    async fn tracker_for(&self, connection_id: &str) -> Arc<HeartbeatTracker> {
        let mut trackers = self.trackers.lock().await;
        trackers
            .entry(connection_id.to_owned())
            .or_insert_with(|| Arc::new(HeartbeatTracker::new()))
            .clone()
    }

    async fn interval_for(&self, connection_id: &str, record: &ConnectionRecord) -> Duration {
        let mut intervals = self.intervals.lock().await;
        let current = intervals
            .get(connection_id)
            .copied()
            .unwrap_or(self.config.heartbeat_interval);
        let updated = next_interval(
            current,
            record.rtt_ms.load(Ordering::Acquire),
            record.missed_pong_count.load(Ordering::Acquire),
        );
        intervals.insert(connection_id.to_owned(), updated);
        updated
    }

    /// One supervision sweep over every registered connection. The caller
    /// (the top-level manager) is expected to invoke this on a fixed, short
    /// period — each connection's own adaptive interval gates how often it
    /// actually receives a ping within that finer-grained sweep.
    pub async fn tick(&self) {
        for record in self.registry.all().await {
            if !record.is_active() {
                continue;
            }

            if is_zombie(&record, &self.config) {
                if record.transition_to_zombie() {
                    tracing::warn!(connection_id = %record.connection_id, "connection marked zombie");
                    self.schedule_zombie_cleanup(record.clone());
                }
                continue;
            }

            if record.missed_pong_count.load(Ordering::Acquire) > 0 {
                // A ping is already outstanding; let the next-pong-or-missed
                // accounting resolve before issuing another one.
                continue;
            }

            let interval = self.interval_for(&record.connection_id, &record).await;
            if record.idle_for() < interval {
                continue;
            }

            self.send_ping(&record).await;
        }
    }

    async fn send_ping(&self, record: &Arc<ConnectionRecord>) {
        let Some(sender) = self.registry.outbound_sender(&record.connection_id).await else {
            return;
        };
        let tracker = self.tracker_for(&record.connection_id).await;
        let ping = tracker.next_ping(&record.connection_id);
        let sent_at = record.record_ping_sent();
        if sender.send(OutboundItem::Direct(ping_envelope(&ping))).await.is_err() {
            tracing::debug!(connection_id = %record.connection_id, "ping channel closed");
            return;
        }
        self.schedule_pong_timeout(record.clone(), sent_at);
    }

    /// Spawns the watchdog for one outstanding ping: if no pong has landed
    /// by `pong_timeout`, the ping counts as missed (§4.6). A connection that
    /// already moved on (closed, or answered by a pong) is a no-op.
    fn schedule_pong_timeout(&self, record: Arc<ConnectionRecord>, sent_at: std::time::Instant) {
        let pong_timeout = self.config.pong_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(pong_timeout).await;
            if record.is_active() && !record.pong_received_since(sent_at) {
                record.record_missed_pong();
            }
        });
    }

    /// Records a received pong: resets the missed-pong count and updates the
    /// smoothed RTT on the connection record.
    pub fn handle_pong(&self, record: &ConnectionRecord) {
        record.record_pong_received();
    }

    fn schedule_zombie_cleanup(&self, record: Arc<ConnectionRecord>) {
        let grace = self.config.zombie_grace;
        let registry = self.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if record.transition_to_closing() {
                registry.remove(&record.connection_id).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_sequence_increments_monotonically() {
        let tracker = HeartbeatTracker::new();
        let first = tracker.next_ping("conn-1");
        let second = tracker.next_ping("conn-1");
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn fresh_connection_is_not_a_zombie() {
        let record = ConnectionRecord::new("conn-1", "user-1");
        let config = GatewayConfig::default();
        assert!(!is_zombie(&record, &config));
    }

    #[test]
    fn missed_pongs_past_the_bound_mark_a_connection_zombie() {
        let record = ConnectionRecord::new("conn-1", "user-1");
        let config = GatewayConfig::default();
        for _ in 0..config.max_missed_pongs {
            record.record_missed_pong();
        }
        assert!(is_zombie(&record, &config));
    }

    #[test]
    fn closing_connection_is_never_classified_as_a_zombie() {
        let record = ConnectionRecord::new("conn-1", "user-1");
        record.transition_to_closing();
        let mut config = GatewayConfig::default();
        config.zombie_detect = Duration::from_secs(0);
        assert!(!is_zombie(&record, &config));
    }

    #[test]
    fn adaptive_interval_slows_down_for_high_rtt_and_speeds_up_for_low_rtt() {
        let base = Duration::from_secs(30);
        let slow = next_interval(base, 1500, 0);
        let fast = next_interval(base, 20, 0);
        assert!(slow > base);
        assert!(fast < base);
    }

    #[test]
    fn adaptive_interval_speeds_up_further_after_a_missed_pong() {
        let base = Duration::from_secs(30);
        let healthy = next_interval(base, 200, 0);
        let lossy = next_interval(base, 200, 1);
        assert!(lossy < healthy);
    }

    #[test]
    fn adaptive_interval_is_clamped_to_ten_and_one_hundred_twenty_seconds() {
        let tiny = next_interval(Duration::from_secs(1), 10, 1);
        assert_eq!(tiny, Duration::from_secs(10));

        let huge = next_interval(Duration::from_secs(200), 2000, 0);
        assert_eq!(huge, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn an_unanswered_ping_marks_a_missed_pong_once_its_timeout_elapses() {
        let registry = Arc::new(Registry::new());
        let record = ConnectionRecord::new("conn-1", "user-1");
        registry.insert(record.clone()).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        registry.register_outbound("conn-1", tx).await;

        let mut config = GatewayConfig::default();
        config.pong_timeout = Duration::from_millis(20);

        let supervisor = HeartbeatSupervisor::new(registry.clone(), config);
        supervisor.send_ping(&record).await;
        assert_eq!(record.missed_pong_count.load(Ordering::Acquire), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(record.missed_pong_count.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn a_pong_received_before_the_timeout_prevents_a_missed_pong() {
        let registry = Arc::new(Registry::new());
        let record = ConnectionRecord::new("conn-1", "user-1");
        registry.insert(record.clone()).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        registry.register_outbound("conn-1", tx).await;

        let mut config = GatewayConfig::default();
        config.pong_timeout = Duration::from_millis(40);

        let supervisor = HeartbeatSupervisor::new(registry.clone(), config);
        supervisor.send_ping(&record).await;
        record.record_pong_received();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(record.missed_pong_count.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn tick_marks_an_unresponsive_connection_zombie_and_schedules_cleanup() {
        let registry = Arc::new(Registry::new());
        let record = ConnectionRecord::new("conn-1", "user-1");
        registry.insert(record.clone()).await;

        let mut config = GatewayConfig::default();
        config.zombie_detect = Duration::from_secs(0);
        config.zombie_grace = Duration::from_millis(10);

        let supervisor = HeartbeatSupervisor::new(registry.clone(), config);
        supervisor.tick().await;

        assert_eq!(
            record.state() as u8,
            crate::connection::ConnectionState::Zombie as u8
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get("conn-1").await.is_none());
    }
}
