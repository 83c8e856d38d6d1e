use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use fabric_protocol::{is_state_sync_type, message_types, Envelope, ErrorPayload, HeartbeatPong, ValidationError};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::broadcast::BroadcastHub;
use crate::collaborators::{AuthValidator, MessageHandler, StateSyncHandler};
use crate::config::GatewayConfig;
use crate::connection::{generate_connection_id, ConnectionRecord};
use crate::error::{GatewayError, GatewayResult};
use crate::heartbeat::HeartbeatSupervisor;
use crate::queue::{PriorityClass, UserQueue};
use crate::reconnect::{AttemptOutcome, ReconnectionLedger};
use crate::registry::{OutboundSender, Registry};
use crate::sender::UserSender;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::telemetry::{TelemetryCollector, TelemetrySnapshot};
use crate::validation::{self, InboundOutcome, ValidationMode};

/// `type` values the validator accepts outright (spec §4.3 step 2); anything
/// else is rewritten into the lenient fallback envelope or rejected in
/// strict mode. `heartbeat_ping` is server-originated only and deliberately
/// absent: a client that echoes it back is an unrecognized inbound type.
const KNOWN_INBOUND_TYPES: &[&str] = &[
    message_types::HEARTBEAT_PONG,
    message_types::HEARTBEAT_RESPONSE,
    message_types::GET_CURRENT_STATE,
    message_types::STATE_UPDATE,
    message_types::PARTIAL_STATE_UPDATE,
    message_types::CLIENT_STATE_UPDATE,
    "chat",
    "command",
];

/// What the caller (the per-socket reader loop) should do after handing a
/// raw inbound frame to [`GatewayManager::handle_incoming`].
pub enum InboundDecision {
    /// A heartbeat pong, state-sync request, or validation failure — the
    /// fabric already answered (or silently accepted) it internally.
    HandledInternally,
    /// The frame's `type` was unrecognized (lenient mode); this is the
    /// fallback envelope to deliver back to the submitting connection.
    Fallback(Envelope),
    /// The frame passed validation and is not one of the fabric's own
    /// message types; it has been forwarded to the external
    /// [`MessageHandler`] collaborator.
    Forwarded,
}

/// The top-level composition root (C14). Wires the registry, per-user
/// queueing, broadcaster, heartbeat supervisor, shutdown coordinator,
/// reconnection ledger, and telemetry collector together, and exposes the
/// single surface callers (chiefly the WebSocket handler) drive the fabric
/// through. Contains no socket I/O of its own — that lives in [`crate::ws`].
pub struct GatewayManager {
    pub config: GatewayConfig,
    pub registry: Arc<Registry>,
    pub broadcast: Arc<BroadcastHub>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub heartbeat: Arc<HeartbeatSupervisor>,
    pub reconnection: Arc<ReconnectionLedger>,
    pub telemetry: Arc<TelemetryCollector>,
    pub auth: Arc<dyn AuthValidator>,
    pub message_handler: Arc<dyn MessageHandler>,
    pub state_sync: Arc<dyn StateSyncHandler>,
    user_queues: RwLock<HashMap<String, Arc<UserQueue>>>,
    user_sender_shutdown: watch::Sender<bool>,
}

impl GatewayManager {
    pub fn new(
        config: GatewayConfig,
        auth: Arc<dyn AuthValidator>,
        message_handler: Arc<dyn MessageHandler>,
        state_sync: Arc<dyn StateSyncHandler>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let broadcast = Arc::new(BroadcastHub::new(registry.clone()));
        let shutdown = Arc::new(ShutdownCoordinator::new(
            registry.clone(),
            broadcast.clone(),
            config.drain_timeout,
        ));
        let heartbeat = Arc::new(HeartbeatSupervisor::new(registry.clone(), config.clone()));
        let reconnection = Arc::new(ReconnectionLedger::new(
            config.reconnection_window,
            config.reconnection_max_attempts,
        ));
        let telemetry = Arc::new(TelemetryCollector::new(registry.clone()));
        let (user_sender_shutdown, _rx) = watch::channel(false);

        Arc::new(Self {
            config,
            registry,
            broadcast,
            shutdown,
            heartbeat,
            reconnection,
            telemetry,
            auth,
            message_handler,
            state_sync,
            user_queues: RwLock::new(HashMap::new()),
            user_sender_shutdown,
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.shutdown.is_accepting()
    }

    /// Registers a newly-authenticated connection, enforcing the per-user
    /// and total connection limits (§4.12) before admitting it. If
    /// `reconnect_token` is presented and still resolves in the
    /// [`ReconnectionLedger`] (within its window and attempt budget), the new
    /// record's counters are seeded from the session it resumes (§4.10);
    /// otherwise it falls back to a fresh connect exactly as if no token had
    /// been presented at all.
    pub async fn connect(
        &self,
        user_id: &str,
        subprotocol: Option<String>,
        reconnect_token: Option<&str>,
    ) -> GatewayResult<Arc<ConnectionRecord>> {
        if !self.is_accepting() {
            return Err(GatewayError::ShutdownInProgress);
        }
        if self.registry.connection_count_for_user(user_id).await >= self.config.max_connections_per_user {
            return Err(GatewayError::ConnectionLimitExceeded(format!(
                "user {user_id} already has the maximum of {} connections open",
                self.config.max_connections_per_user
            )));
        }
        if self.registry.len().await >= self.config.max_total_connections {
            return Err(GatewayError::ConnectionLimitExceeded(
                "total connection limit reached".to_owned(),
            ));
        }

        let record = match reconnect_token {
            Some(token) => match self.reconnection.attempt(token).await {
                AttemptOutcome::Accepted(entry) => {
                    info!(token, user_id, original_connection_id = %entry.original_connection_id, "resuming connection from reconnection token");
                    ConnectionRecord::resumed_with_subprotocol(
                        generate_connection_id(),
                        user_id,
                        subprotocol,
                        entry.messages_sent,
                        entry.messages_received,
                        entry.error_count,
                    )
                }
                AttemptOutcome::WindowExpired | AttemptOutcome::AttemptsExhausted | AttemptOutcome::NotFound => {
                    ConnectionRecord::new_with_subprotocol(generate_connection_id(), user_id, subprotocol)
                }
            },
            None => ConnectionRecord::new_with_subprotocol(generate_connection_id(), user_id, subprotocol),
        };
        if !self.registry.insert(record.clone()).await {
            return Err(GatewayError::Unexpected(format!(
                "generated connection id {} collided with a live connection",
                record.connection_id
            )));
        }
        self.ensure_user_sender(user_id).await;
        info!(connection_id = %record.connection_id, user_id, "connection registered");
        Ok(record)
    }

    pub async fn register_outbound(&self, connection_id: &str, sender: OutboundSender) {
        self.registry.register_outbound(connection_id, sender).await;
    }

    /// Registers a cleanup callback for `connection_id`, run during shutdown
    /// phase 5 if the connection is still present once the drain timeout
    /// elapses (§4.11). Exposed for collaborators that hold per-connection
    /// resources (e.g. the application's [`MessageHandler`]) needing a
    /// guaranteed teardown hook even for connections that never close
    /// themselves.
    pub fn register_cleanup_callback(&self, connection_id: impl Into<String>, callback: crate::shutdown::CleanupCallback) {
        self.shutdown.register_cleanup_callback(connection_id, callback);
    }

    /// Tears down a connection. The user's per-user sender task is left
    /// running even once its last connection disconnects — it idles on an
    /// empty queue rather than being torn down, since a reconnect may land
    /// within the reconnection window and start filling the queue again.
    ///
    /// The connection's own id doubles as its reconnection token: a client
    /// that already knows its `connection_id` (from the `connection_ack`
    /// sent at handshake time) needs no extra round trip to learn what to
    /// present on a future reconnect.
    pub async fn disconnect(&self, connection_id: &str, reason: &str) {
        if let Some(record) = self.registry.get(connection_id).await {
            record.transition_to_closing();
            self.reconnection
                .prepare(
                    connection_id,
                    record.user_id.clone(),
                    connection_id,
                    record.messages_sent.load(Ordering::Relaxed),
                    record.messages_received.load(Ordering::Relaxed),
                    record.error_count.load(Ordering::Relaxed),
                )
                .await;
            info!(connection_id, reason, "disconnecting connection");
        }
        self.registry.remove(connection_id).await;
    }

    async fn ensure_user_sender(&self, user_id: &str) {
        {
            if self.user_queues.read().await.contains_key(user_id) {
                return;
            }
        }
        let mut queues = self.user_queues.write().await;
        if queues.contains_key(user_id) {
            return;
        }
        let queue = Arc::new(UserQueue::new(self.config.queue_capacity_per_user));
        queues.insert(user_id.to_owned(), queue.clone());
        drop(queues);

        let sender = UserSender::new(user_id.to_owned(), queue, self.registry.clone());
        let shutdown_rx = self.user_sender_shutdown.subscribe();
        tokio::spawn(async move { sender.run(shutdown_rx).await });
    }

    async fn user_queue(&self, user_id: &str) -> Arc<UserQueue> {
        if let Some(queue) = self.user_queues.read().await.get(user_id) {
            return queue.clone();
        }
        self.ensure_user_sender(user_id).await;
        self.user_queues
            .read()
            .await
            .get(user_id)
            .cloned()
            .expect("ensure_user_sender just inserted this user's queue")
    }

    /// Queues `envelope` for delivery to every live connection of `user_id`.
    /// Envelopes at or above `priority_threshold` skip the per-user queue
    /// entirely and are delivered direct through the broadcaster, trading
    /// queue ordering for latency (§4.9's priority routing rule).
    pub async fn send_to_user(&self, user_id: &str, envelope: Envelope, priority: i32) {
        if priority >= self.config.priority_threshold {
            self.broadcast.broadcast_to_user(user_id, &envelope).await;
            return;
        }
        let class = if priority > 0 {
            PriorityClass::Priority
        } else {
            PriorityClass::Normal
        };
        self.user_queue(user_id).await.enqueue(class, envelope).await;
    }

    /// Sends a structured error envelope to every live connection of
    /// `user_id`. Always delivered direct (bypassing the queue): a client
    /// waiting on an error response shouldn't queue behind unrelated
    /// traffic.
    pub async fn send_error(&self, user_id: &str, error_type: &str, message: impl Into<String>, field: Option<String>) {
        let payload = ErrorPayload {
            error: message.into(),
            error_type: error_type.to_owned(),
            code: None,
            field,
            timestamp: Utc::now(),
            recoverable: Some(true),
            details: None,
        };
        let envelope = Envelope::new(
            message_types::ERROR,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
            Utc::now(),
        )
        .system();
        self.broadcast.broadcast_to_user(user_id, &envelope).await;
    }

    pub async fn send_log(&self, user_id: &str, payload: Value) {
        self.send_to_user(user_id, Envelope::new(message_types::LOG, payload, Utc::now()), 0)
            .await;
    }

    pub async fn send_tool_call(&self, user_id: &str, payload: Value) {
        self.send_to_user(
            user_id,
            Envelope::new(message_types::TOOL_CALL, payload, Utc::now()).displayed_to_user(true),
            0,
        )
        .await;
    }

    pub async fn send_tool_result(&self, user_id: &str, payload: Value) {
        self.send_to_user(
            user_id,
            Envelope::new(message_types::TOOL_RESULT, payload, Utc::now()).displayed_to_user(true),
            0,
        )
        .await;
    }

    pub async fn send_sub_agent_update(&self, user_id: &str, payload: Value) {
        self.send_to_user(user_id, Envelope::new(message_types::SUB_AGENT_UPDATE, payload, Utc::now()), 0)
            .await;
    }

    pub async fn broadcast_all(&self, envelope: &Envelope) -> usize {
        self.broadcast.broadcast_all(envelope).await
    }

    pub async fn broadcast_user(&self, user_id: &str, envelope: &Envelope) -> usize {
        self.broadcast.broadcast_to_user(user_id, envelope).await
    }

    pub async fn broadcast_room(&self, room_id: &str, envelope: &Envelope) -> usize {
        self.broadcast.broadcast_room(room_id, envelope).await
    }

    pub fn handle_pong(&self, record: &ConnectionRecord) {
        self.heartbeat.handle_pong(record);
    }

    pub async fn get_stats(&self) -> TelemetrySnapshot {
        self.telemetry.get_stats().await
    }

    /// Validates and routes one already-deserialized inbound frame (§4.3,
    /// §6). Heartbeat pongs and state-sync requests are handled internally
    /// and never reach the external [`MessageHandler`]; everything else
    /// that passes validation is forwarded to it.
    pub async fn handle_incoming(
        &self,
        connection_id: &str,
        user_id: &str,
        raw: Value,
        raw_len: usize,
    ) -> GatewayResult<InboundDecision> {
        let mode = ValidationMode::from_strict_flag(self.config.strict_validation);
        let outcome = validation::validate_inbound(
            &raw,
            raw_len,
            KNOWN_INBOUND_TYPES,
            mode,
            self.config.max_text_chars,
            self.config.max_message_bytes,
        );

        let raw = match outcome {
            Ok(InboundOutcome::Fallback(envelope)) => return Ok(InboundDecision::Fallback(envelope)),
            Ok(InboundOutcome::Accept) => raw,
            Err(validation_error) => {
                self.report_validation_error(user_id, &validation_error).await;
                return Ok(InboundDecision::HandledInternally);
            }
        };

        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .expect("validate_inbound already confirmed a string \"type\" field")
            .to_owned();

        if HeartbeatPong::is_pong_kind(&kind) {
            if let Some(record) = self.registry.get(connection_id).await {
                self.handle_pong(&record);
            }
            return Ok(InboundDecision::HandledInternally);
        }

        if is_state_sync_type(&kind) {
            self.handle_state_sync(user_id, &kind, &raw).await?;
            return Ok(InboundDecision::HandledInternally);
        }

        let sanitized = validation::sanitize_message(raw);
        let payload = sanitized.get("payload").cloned().unwrap_or(Value::Null);
        let envelope = Envelope::new(kind, payload, Utc::now());
        self.message_handler.handle(connection_id, user_id, envelope).await?;
        Ok(InboundDecision::Forwarded)
    }

    async fn report_validation_error(&self, user_id: &str, error: &ValidationError) {
        self.send_error(user_id, &error.error_type, error.message.clone(), error.field.clone())
            .await;
    }

    async fn handle_state_sync(&self, user_id: &str, kind: &str, raw: &Value) -> GatewayResult<()> {
        if kind == message_types::GET_CURRENT_STATE {
            let state = self.state_sync.current_state(user_id).await?;
            let envelope = Envelope::new(message_types::STATE_UPDATE, state, Utc::now());
            self.send_to_user(user_id, envelope, self.config.priority_threshold).await;
            return Ok(());
        }

        let patch = raw.get("payload").cloned().unwrap_or(Value::Null);
        self.state_sync.apply_partial_update(user_id, patch).await
    }

    /// Runs the five-phase graceful shutdown (§4.11), then stops every
    /// per-user sender task now that nothing remains to deliver to. The
    /// report's `messages_preserved`/`messages_lost` are aggregated across
    /// every user's queue after the drain completes, since the coordinator
    /// itself has no visibility into per-user queueing.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = self.shutdown.run().await;
        let _ = self.user_sender_shutdown.send(true);

        let queues = self.user_queues.read().await;
        report.messages_preserved = queues.values().map(|q| q.delivered_count()).sum();
        report.messages_lost = queues.values().map(|q| q.messages_lost()).sum();
        report
    }
}
