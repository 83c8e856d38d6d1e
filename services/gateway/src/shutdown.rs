use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fabric_protocol::{message_types, ShutdownNotice};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broadcast::BroadcastHub;
use crate::error::GatewayError;
use crate::registry::Registry;

/// A cleanup action registered against a connection id, run in phase 5 if
/// that connection is still present when the drain timeout elapses.
pub type CleanupCallback = Box<dyn FnOnce() -> Result<(), GatewayError> + Send>;

/// Drives the five-phase graceful shutdown: stop accepting new connections,
/// notify live connections and ask them to drain, wait out the drain
/// timeout, stop the heartbeat tickers, then run cleanup callbacks and
/// force-close whatever is left.
pub struct ShutdownCoordinator {
    accepting: Arc<AtomicBool>,
    heartbeats_active_tx: watch::Sender<bool>,
    registry: Arc<Registry>,
    broadcast: Arc<BroadcastHub>,
    drain_timeout: Duration,
    cleanup_callbacks: Mutex<Vec<(String, CleanupCallback)>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub notified: usize,
    pub drained_gracefully: usize,
    pub force_closed: usize,
    /// Envelopes every per-user queue confirmed delivered to at least one
    /// live connection, summed across all users (§4.11's `preserved_messages`).
    pub messages_preserved: u64,
    /// Envelopes dropped from a per-user queue to capacity eviction, summed
    /// across all users (§4.11's `lost_messages`).
    pub messages_lost: u64,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<Registry>, broadcast: Arc<BroadcastHub>, drain_timeout: Duration) -> Self {
        let (heartbeats_active_tx, _rx) = watch::channel(true);
        Self {
            accepting: Arc::new(AtomicBool::new(true)),
            heartbeats_active_tx,
            registry,
            broadcast,
            drain_timeout,
            cleanup_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn heartbeats_active_receiver(&self) -> watch::Receiver<bool> {
        self.heartbeats_active_tx.subscribe()
    }

    /// Registers a callback to run during phase 5 if `connection_id` is
    /// still present in the registry once the drain timeout elapses. A
    /// connection that closes on its own during phase 3 never has its
    /// callback invoked.
    pub fn register_cleanup_callback(&self, connection_id: impl Into<String>, callback: CleanupCallback) {
        self.cleanup_callbacks
            .lock()
            .expect("cleanup_callbacks mutex poisoned")
            .push((connection_id.into(), callback));
    }

    pub async fn run(&self) -> ShutdownReport {
        // Phase 1: stop accepting new connections.
        self.accepting.store(false, Ordering::Release);
        info!("shutdown phase 1: no longer accepting new connections");

        // Phase 2: notify every live connection, then move it to DRAINING.
        // Broadcast first: `fan_out` only delivers to records still ACTIVE,
        // so the transition has to happen after the send goes out, not before.
        let notice = ShutdownNotice::new(self.drain_timeout.as_secs(), Utc::now());
        let envelope = fabric_protocol::Envelope::new(
            message_types::SERVER_SHUTDOWN,
            serde_json::to_value(&notice).unwrap_or(serde_json::Value::Null),
            Utc::now(),
        );
        let notified = self.broadcast.broadcast_all(&envelope).await;
        for record in self.registry.all().await {
            record.transition_to_draining();
        }
        info!(notified, "shutdown phase 2: notified connections to drain");

        // Phase 3: wait for connections to close themselves, up to the drain timeout.
        let before = self.registry.len().await;
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while tokio::time::Instant::now() < deadline && self.registry.len().await > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let drained_gracefully = before.saturating_sub(self.registry.len().await);
        info!(drained_gracefully, "shutdown phase 3: drain wait complete");

        // Phase 4: stop heartbeat tickers; nothing left to keep alive for.
        let _ = self.heartbeats_active_tx.send(false);
        info!("shutdown phase 4: heartbeat tickers stopped");

        // Phase 5: run cleanup callbacks for connections that never drained,
        // then force-close whatever remains.
        let remaining = self.registry.all().await;
        let remaining_ids: HashSet<&str> = remaining.iter().map(|r| r.connection_id.as_str()).collect();
        let due_callbacks = {
            let mut callbacks = self.cleanup_callbacks.lock().expect("cleanup_callbacks mutex poisoned");
            let (due, pending): (Vec<_>, Vec<_>) = callbacks
                .drain(..)
                .partition(|(connection_id, _)| remaining_ids.contains(connection_id.as_str()));
            *callbacks = pending;
            due
        };
        for (connection_id, error) in run_cleanup_callbacks(due_callbacks) {
            warn!(connection_id, %error, "shutdown phase 5: cleanup callback failed");
        }

        for record in &remaining {
            record.force_close();
            self.registry.remove(&record.connection_id).await;
        }
        let force_closed = remaining.len();
        if force_closed > 0 {
            warn!(force_closed, "shutdown phase 5: force-closed connections that did not drain in time");
        }

        ShutdownReport {
            notified,
            drained_gracefully,
            force_closed,
            messages_preserved: 0,
            messages_lost: 0,
        }
    }
}

/// Runs every registered cleanup callback, collecting failures rather than
/// aborting the phase on the first one — a callback that panics or errors
/// only marks its own connection as failed, the rest of the drain proceeds.
pub fn run_cleanup_callbacks(callbacks: Vec<(String, CleanupCallback)>) -> Vec<(String, GatewayError)> {
    let mut failures = Vec::new();
    for (connection_id, callback) in callbacks {
        if let Err(err) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
            let message = err
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| err.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "cleanup callback panicked".to_owned());
            failures.push((connection_id, GatewayError::CriticalCallbackFailure(message)));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRecord;

    #[tokio::test]
    async fn run_stops_accepting_and_force_closes_connections_that_never_drain() {
        let registry = Arc::new(Registry::new());
        registry.insert(ConnectionRecord::new("conn-1", "user-1")).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        registry.register_outbound("conn-1", tx).await;

        let broadcast = Arc::new(BroadcastHub::new(registry.clone()));
        let coordinator = ShutdownCoordinator::new(registry.clone(), broadcast, Duration::from_millis(50));

        assert!(coordinator.is_accepting());
        let report = coordinator.run().await;

        assert!(!coordinator.is_accepting());
        assert_eq!(report.notified, 1);
        assert_eq!(report.force_closed, 1);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn run_invokes_the_cleanup_callback_of_a_connection_that_never_drained() {
        let registry = Arc::new(Registry::new());
        registry.insert(ConnectionRecord::new("conn-1", "user-1")).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        registry.register_outbound("conn-1", tx).await;

        let broadcast = Arc::new(BroadcastHub::new(registry.clone()));
        let coordinator = ShutdownCoordinator::new(registry.clone(), broadcast, Duration::from_millis(50));

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        coordinator.register_cleanup_callback(
            "conn-1",
            Box::new(move || {
                ran_clone.store(true, Ordering::Release);
                Ok(())
            }),
        );

        coordinator.run().await;
        assert!(ran.load(Ordering::Acquire), "cleanup callback for a non-draining connection should run in phase 5");
    }

    #[tokio::test]
    async fn run_skips_the_cleanup_callback_of_a_connection_that_drained_on_its_own() {
        let registry = Arc::new(Registry::new());
        registry.insert(ConnectionRecord::new("conn-1", "user-1")).await;
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        registry.register_outbound("conn-1", tx).await;

        let broadcast = Arc::new(BroadcastHub::new(registry.clone()));
        let coordinator = ShutdownCoordinator::new(registry.clone(), broadcast, Duration::from_millis(200));

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        coordinator.register_cleanup_callback(
            "conn-1",
            Box::new(move || {
                ran_clone.store(true, Ordering::Release);
                Ok(())
            }),
        );

        let registry_for_drain = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(rx);
            registry_for_drain.remove("conn-1").await;
        });

        coordinator.run().await;
        assert!(!ran.load(Ordering::Acquire), "a connection that drained on its own should not run its callback");
    }

    #[test]
    fn cleanup_callbacks_collect_panics_and_continue_past_them() {
        let callbacks: Vec<(String, Box<dyn FnOnce() -> Result<(), GatewayError> + Send>)> = vec![
            ("conn-1".to_owned(), Box::new(|| Ok(()))),
            ("conn-2".to_owned(), Box::new(|| panic!("cleanup exploded"))),
            ("conn-3".to_owned(), Box::new(|| Ok(()))),
        ];
        let failures = run_cleanup_callbacks(callbacks);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "conn-2");
    }
}
