use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;

static CONNECTION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A stable connection id: a monotonic sequence number plus a random suffix,
/// so ids are both ordered (useful for debugging/log correlation) and
/// unguessable (spec §3).
pub fn generate_connection_id() -> String {
    let sequence = CONNECTION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let suffix: u32 = rand::thread_rng().gen();
    format!("conn-{sequence:x}-{suffix:08x}")
}

/// Lifecycle states of a single WebSocket connection (spec §4.1's DAG).
///
/// The normal path is `CONNECTING -> ACTIVE -> CLOSING -> CLOSED`. From
/// `ACTIVE` a connection can also be asked to `DRAINING` (server shutdown)
/// or found unresponsive and marked `ZOMBIE` by the heartbeat supervisor;
/// both paths rejoin at `CLOSING`. A connection that fails mid-close moves
/// to `FAILED` and is retried (up to
/// [`ConnectionRecord::MAX_CLOSE_RETRIES`]) before being forced to `CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Draining = 2,
    Zombie = 3,
    Closing = 4,
    Failed = 5,
    Closed = 6,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Draining,
            3 => ConnectionState::Zombie,
            4 => ConnectionState::Closing,
            5 => ConnectionState::Failed,
            _ => ConnectionState::Closed,
        }
    }

    /// The allowed-transitions table. `CLOSED` is terminal.
    fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::{Active, Closed, Closing, Connecting, Draining, Failed, Zombie};
        matches!(
            (self, to),
            (Connecting, Active)
                | (Active, Draining)
                | (Active, Zombie)
                | (Active, Closing)
                | (Active, Failed)
                | (Draining, Closing)
                | (Draining, Failed)
                | (Zombie, Closing)
                | (Zombie, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
                | (Failed, Closing)
                | (Failed, Closed)
        )
    }
}

/// The connection record the registry owns. Lifecycle state lives in an
/// `AtomicU8` so a reader can check "is this still active?" without taking
/// any lock, and a writer can compare-and-swap the transition instead of
/// racing a read-then-write under a `Mutex`.
pub struct ConnectionRecord {
    pub connection_id: String,
    pub user_id: String,
    state: AtomicU8,
    close_attempts: AtomicU32,
    pub connected_at: DateTime<Utc>,
    last_activity: std::sync::Mutex<Instant>,
    closing_since: std::sync::Mutex<Option<Instant>>,

    // Liveness, maintained by the heartbeat supervisor (§3, §4.6).
    last_ping_sent: std::sync::Mutex<Option<Instant>>,
    last_pong_received: std::sync::Mutex<Option<Instant>>,
    pub missed_pong_count: AtomicU32,
    /// Smoothed round-trip time, in milliseconds.
    pub rtt_ms: AtomicU64,
    pub heartbeats_sent: AtomicU32,
    pub heartbeats_received: AtomicU32,

    // Counters (§3).
    pub messages_sent: AtomicU32,
    pub messages_received: AtomicU32,
    pub error_count: AtomicU32,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,

    pub subprotocol: Option<String>,
}

impl ConnectionRecord {
    pub const MAX_CLOSE_RETRIES: u32 = 3;

    pub fn new(connection_id: impl Into<String>, user_id: impl Into<String>) -> Arc<Self> {
        Self::new_with_subprotocol(connection_id, user_id, None)
    }

    pub fn new_with_subprotocol(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        subprotocol: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            state: AtomicU8::new(ConnectionState::Active as u8),
            close_attempts: AtomicU32::new(0),
            connected_at: Utc::now(),
            last_activity: std::sync::Mutex::new(Instant::now()),
            closing_since: std::sync::Mutex::new(None),
            last_ping_sent: std::sync::Mutex::new(None),
            last_pong_received: std::sync::Mutex::new(None),
            missed_pong_count: AtomicU32::new(0),
            rtt_ms: AtomicU64::new(0),
            heartbeats_sent: AtomicU32::new(0),
            heartbeats_received: AtomicU32::new(0),
            messages_sent: AtomicU32::new(0),
            messages_received: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            subprotocol,
        })
    }

    /// A record in `CONNECTING` rather than `ACTIVE` — used by the
    /// handshake while the auth/registration sequence is still running.
    pub fn connecting(connection_id: impl Into<String>, user_id: impl Into<String>) -> Arc<Self> {
        let record = Self::new(connection_id, user_id);
        record.state.store(ConnectionState::Connecting as u8, Ordering::Release);
        record
    }

    /// A fresh `ACTIVE` record that carries over the counters of a
    /// connection it is resuming after a reconnect within the reconnection
    /// window (§4.10). The new record still gets its own id — only the
    /// counters are inherited, not the identity.
    pub fn resumed_with_subprotocol(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        subprotocol: Option<String>,
        messages_sent: u32,
        messages_received: u32,
        error_count: u32,
    ) -> Arc<Self> {
        let record = Self::new_with_subprotocol(connection_id, user_id, subprotocol);
        record.messages_sent.store(messages_sent, Ordering::Relaxed);
        record.messages_received.store(messages_received, Ordering::Relaxed);
        record.error_count.store(error_count, Ordering::Relaxed);
        record
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Mirrors the `is_closing` flag of spec §3: true once the record has
    /// started its way out, whether via drain, zombie detection, or a
    /// direct close.
    pub fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Draining
                | ConnectionState::Zombie
                | ConnectionState::Closing
                | ConnectionState::Failed
                | ConnectionState::Closed
        )
    }

    /// Attempt the transition via compare-and-swap. Returns `false` if the
    /// transition is not in the allowed-transitions table, or if another
    /// writer already moved the state out from under this one.
    pub fn try_transition(&self, to: ConnectionState) -> bool {
        let current = self.state();
        if !current.can_transition(to) {
            return false;
        }
        let ok = self
            .state
            .compare_exchange(current as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok && to == ConnectionState::Closing {
            *self.closing_since.lock().expect("closing_since mutex poisoned") = Some(Instant::now());
        }
        ok
    }

    pub fn transition_to_active(&self) -> bool {
        self.try_transition(ConnectionState::Active)
    }

    pub fn transition_to_draining(&self) -> bool {
        self.try_transition(ConnectionState::Draining)
    }

    pub fn transition_to_zombie(&self) -> bool {
        self.try_transition(ConnectionState::Zombie)
    }

    pub fn transition_to_closing(&self) -> bool {
        self.try_transition(ConnectionState::Closing)
    }

    pub fn transition_to_failed(&self) -> bool {
        self.try_transition(ConnectionState::Failed)
    }

    pub fn transition_to_closed(&self) -> bool {
        self.try_transition(ConnectionState::Closed)
    }

    /// Unconditionally moves the record to `CLOSED`, bypassing the
    /// allowed-transitions table. Used only by the shutdown coordinator's
    /// final force-close phase, where a connection that never finished its
    /// own close handshake still has to be torn down.
    pub fn force_close(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock().expect("last_activity mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .expect("last_activity mutex poisoned")
            .elapsed()
    }

    /// Stamps the outstanding-ping clock and returns the instant it was
    /// sent, so a caller can later check whether a pong arrived after this
    /// particular ping (rather than just "ever").
    pub fn record_ping_sent(&self) -> Instant {
        let now = Instant::now();
        *self.last_ping_sent.lock().expect("last_ping_sent mutex poisoned") = Some(now);
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        now
    }

    /// Records a pong and updates the smoothed RTT (`rtt = rtt*0.7 +
    /// sample*0.3`). Resets `missed_pong_count` to zero, since any pong is
    /// evidence of life regardless of how many prior pings went unanswered.
    pub fn record_pong_received(&self) {
        let now = Instant::now();
        let sample_ms = {
            let sent = self.last_ping_sent.lock().expect("last_ping_sent mutex poisoned");
            sent.map(|s| now.saturating_duration_since(s).as_millis() as u64)
        };
        *self.last_pong_received.lock().expect("last_pong_received mutex poisoned") = Some(now);
        self.missed_pong_count.store(0, Ordering::Release);
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
        self.touch_activity();

        if let Some(sample_ms) = sample_ms {
            let previous = self.rtt_ms.load(Ordering::Acquire);
            let smoothed = if previous == 0 {
                sample_ms
            } else {
                ((previous as f64) * 0.7 + (sample_ms as f64) * 0.3).round() as u64
            };
            self.rtt_ms.store(smoothed, Ordering::Release);
        }
    }

    pub fn record_missed_pong(&self) -> u32 {
        self.missed_pong_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether a pong has been observed at or after `sent_at` — used by a
    /// ping's timeout task to tell a genuinely unanswered ping apart from one
    /// whose pong simply hasn't been processed by the caller yet.
    pub fn pong_received_since(&self, sent_at: Instant) -> bool {
        self.last_pong_received
            .lock()
            .expect("last_pong_received mutex poisoned")
            .is_some_and(|received_at| received_at >= sent_at)
    }

    pub fn time_since_last_pong(&self) -> std::time::Duration {
        self.last_pong_received
            .lock()
            .expect("last_pong_received mutex poisoned")
            .map_or_else(|| self.idle_for(), |since| since.elapsed())
    }

    /// A connection is a "ghost" once it has sat in `CLOSING` past the
    /// stale-closing threshold without completing its close handshake.
    pub fn is_ghost_connection(&self, stale_closing_threshold: std::time::Duration) -> bool {
        if self.state() != ConnectionState::Closing {
            return false;
        }
        self.closing_since
            .lock()
            .expect("closing_since mutex poisoned")
            .is_some_and(|since| since.elapsed() >= stale_closing_threshold)
    }

    /// `FAILED` records get up to [`Self::MAX_CLOSE_RETRIES`] retried close
    /// attempts before being forced to `CLOSED`.
    pub fn should_retry_closure(&self) -> bool {
        self.state() == ConnectionState::Failed
            && self.close_attempts.load(Ordering::Acquire) < Self::MAX_CLOSE_RETRIES
    }

    pub fn record_close_attempt(&self) -> u32 {
        self.close_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn can_be_cleaned_up(&self) -> bool {
        self.state() == ConnectionState::Closed
            || (self.state() == ConnectionState::Failed && !self.should_retry_closure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_connection_ids_are_unique_and_sequence_monotonically() {
        let first = generate_connection_id();
        let second = generate_connection_id();
        assert_ne!(first, second);
        assert!(first.starts_with("conn-"));
    }

    #[test]
    fn connecting_record_becomes_active_then_follows_the_normal_close_path() {
        let conn = ConnectionRecord::connecting("conn-1", "user-1");
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.transition_to_active());
        assert!(conn.is_active());
        assert!(conn.transition_to_closing());
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.transition_to_closed());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn active_connection_may_drain_or_become_a_zombie_before_closing() {
        let draining = ConnectionRecord::new("conn-1", "user-1");
        assert!(draining.transition_to_draining());
        assert!(draining.is_closing());
        assert!(draining.transition_to_closing());

        let zombie = ConnectionRecord::new("conn-2", "user-1");
        assert!(zombie.transition_to_zombie());
        assert!(zombie.is_closing());
        assert!(zombie.transition_to_closing());
    }

    #[test]
    fn draining_and_zombie_states_cannot_transition_directly_into_each_other() {
        let conn = ConnectionRecord::new("conn-1", "user-1");
        conn.transition_to_draining();
        assert!(!conn.transition_to_zombie());
        assert!(!conn.transition_to_active());
    }

    #[test]
    fn closed_is_terminal_and_rejects_further_transitions() {
        let conn = ConnectionRecord::new("conn-1", "user-1");
        conn.transition_to_closing();
        conn.transition_to_closed();
        assert!(!conn.transition_to_closing());
        assert!(!conn.transition_to_failed());
    }

    #[test]
    fn failed_connection_is_retried_up_to_the_bound_then_stops() {
        let conn = ConnectionRecord::new("conn-1", "user-1");
        conn.transition_to_failed();
        for _ in 0..ConnectionRecord::MAX_CLOSE_RETRIES {
            assert!(conn.should_retry_closure());
            conn.record_close_attempt();
        }
        assert!(!conn.should_retry_closure());
        assert!(conn.can_be_cleaned_up());
    }

    #[test]
    fn closing_connection_becomes_a_ghost_past_the_stale_threshold() {
        let conn = ConnectionRecord::new("conn-1", "user-1");
        conn.transition_to_closing();
        assert!(!conn.is_ghost_connection(std::time::Duration::from_secs(60)));
        assert!(conn.is_ghost_connection(std::time::Duration::from_secs(0)));
    }

    #[test]
    fn active_connection_is_never_a_ghost_regardless_of_elapsed_time() {
        let conn = ConnectionRecord::new("conn-1", "user-1");
        assert!(!conn.is_ghost_connection(std::time::Duration::from_secs(0)));
    }

    #[test]
    fn force_close_moves_an_active_connection_straight_to_closed() {
        let conn = ConnectionRecord::new("conn-1", "user-1");
        assert!(conn.is_active());
        conn.force_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn pong_resets_missed_count_and_smooths_rtt() {
        let conn = ConnectionRecord::new("conn-1", "user-1");
        conn.record_missed_pong();
        conn.record_missed_pong();
        assert_eq!(conn.missed_pong_count.load(Ordering::Acquire), 2);

        conn.record_ping_sent();
        std::thread::sleep(std::time::Duration::from_millis(5));
        conn.record_pong_received();

        assert_eq!(conn.missed_pong_count.load(Ordering::Acquire), 0);
        assert!(conn.rtt_ms.load(Ordering::Acquire) > 0);
    }
}
