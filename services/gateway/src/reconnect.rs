use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// A preserved-state ledger entry for a connection that disconnected and may
/// reconnect within the reconnection window. `attempts` is incremented on
/// every [`ReconnectionLedger::attempt`] call; once it exceeds
/// `max_attempts` the entry is rejected and swept on the next
/// [`ReconnectionLedger::sweep_expired`] pass.
#[derive(Debug, Clone)]
pub struct ReconnectionEntry {
    pub user_id: String,
    pub original_connection_id: String,
    pub last_activity: Instant,
    pub attempts: u32,
    /// Counters snapshotted from the original connection at disconnect time,
    /// carried over to the resumed connection on acceptance.
    pub messages_sent: u32,
    pub messages_received: u32,
    pub error_count: u32,
}

pub enum AttemptOutcome {
    Accepted(ReconnectionEntry),
    WindowExpired,
    AttemptsExhausted,
    NotFound,
}

/// Tracks reconnection tokens issued to disconnected connections so a
/// reconnecting client can resume with its prior identity, within a bounded
/// time window and a bounded number of attempts.
pub struct ReconnectionLedger {
    entries: RwLock<HashMap<String, ReconnectionEntry>>,
    window: Duration,
    max_attempts: u32,
}

impl ReconnectionLedger {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
            max_attempts,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn prepare(
        &self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
        messages_sent: u32,
        messages_received: u32,
        error_count: u32,
    ) {
        let entry = ReconnectionEntry {
            user_id: user_id.into(),
            original_connection_id: connection_id.into(),
            last_activity: Instant::now(),
            attempts: 0,
            messages_sent,
            messages_received,
            error_count,
        };
        self.entries.write().await.insert(token.into(), entry);
    }

    /// Records one reconnection attempt against `token`, rejecting it if the
    /// window has lapsed or the attempt budget is exhausted.
    pub async fn attempt(&self, token: &str) -> AttemptOutcome {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(token) else {
            return AttemptOutcome::NotFound;
        };

        if entry.last_activity.elapsed() > self.window {
            entries.remove(token);
            return AttemptOutcome::WindowExpired;
        }

        if entry.attempts >= self.max_attempts {
            entries.remove(token);
            return AttemptOutcome::AttemptsExhausted;
        }

        entry.attempts += 1;
        AttemptOutcome::Accepted(entry.clone())
    }

    pub async fn cleanup(&self, token: &str) {
        self.entries.write().await.remove(token);
    }

    /// Sweeps every entry whose window has lapsed. Returns the count swept.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_activity.elapsed() <= self.window);
        before - entries.len()
    }

    pub async fn active_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_attempts_within_the_window_and_budget() {
        let ledger = ReconnectionLedger::new(Duration::from_secs(300), 5);
        ledger.prepare("token-1", "user-1", "conn-1", 0, 0, 0).await;

        match ledger.attempt("token-1").await {
            AttemptOutcome::Accepted(entry) => assert_eq!(entry.attempts, 1),
            _ => panic!("expected acceptance"),
        }
    }

    #[tokio::test]
    async fn rejects_once_the_attempt_budget_is_exhausted() {
        let ledger = ReconnectionLedger::new(Duration::from_secs(300), 2);
        ledger.prepare("token-1", "user-1", "conn-1", 0, 0, 0).await;
        ledger.attempt("token-1").await;
        ledger.attempt("token-1").await;

        assert!(matches!(
            ledger.attempt("token-1").await,
            AttemptOutcome::AttemptsExhausted
        ));
    }

    #[tokio::test]
    async fn rejects_attempts_after_the_window_has_lapsed() {
        let ledger = ReconnectionLedger::new(Duration::from_secs(0), 5);
        ledger.prepare("token-1", "user-1", "conn-1", 0, 0, 0).await;

        assert!(matches!(
            ledger.attempt("token-1").await,
            AttemptOutcome::WindowExpired
        ));
        assert_eq!(ledger.active_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_token_is_reported_as_not_found() {
        let ledger = ReconnectionLedger::new(Duration::from_secs(300), 5);
        assert!(matches!(ledger.attempt("missing").await, AttemptOutcome::NotFound));
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_lapsed_entries() {
        let ledger = ReconnectionLedger::new(Duration::from_secs(0), 5);
        ledger.prepare("token-1", "user-1", "conn-1", 0, 0, 0).await;
        assert_eq!(ledger.sweep_expired().await, 1);
        assert_eq!(ledger.active_count().await, 0);
    }

    #[tokio::test]
    async fn accepted_entry_carries_over_the_counters_it_was_prepared_with() {
        let ledger = ReconnectionLedger::new(Duration::from_secs(300), 5);
        ledger.prepare("token-1", "user-1", "conn-1", 42, 17, 2).await;

        match ledger.attempt("token-1").await {
            AttemptOutcome::Accepted(entry) => {
                assert_eq!(entry.messages_sent, 42);
                assert_eq!(entry.messages_received, 17);
                assert_eq!(entry.error_count, 2);
            }
            _ => panic!("expected acceptance"),
        }
    }
}
