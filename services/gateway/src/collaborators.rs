use async_trait::async_trait;
use fabric_protocol::Envelope;

use crate::error::GatewayResult;

/// Verifies a bearer or subprotocol-carried token and resolves it to a user
/// id. The production implementation checks a JWT signature (see
/// [`crate::auth`]); tests substitute a stub that accepts or rejects by
/// table lookup, with no cryptography involved.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, token: &str) -> GatewayResult<String>;
}

/// Receives every inbound envelope once it has passed validation and
/// sanitization, after the fabric's own message types
/// (heartbeats, chunks, state sync) have already been handled internally.
/// The fabric has no opinion on what this does with a chat message or a
/// tool call; it only guarantees the envelope reached here clean.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, connection_id: &str, user_id: &str, envelope: Envelope) -> GatewayResult<()>;
}

/// Answers `get_current_state`/`state_update` requests with whatever the
/// application considers canonical. The fabric only recognizes the message
/// shape (see [`fabric_protocol::message_types::is_state_sync_type`]) and
/// delegates the actual state to this collaborator.
#[async_trait]
pub trait StateSyncHandler: Send + Sync {
    async fn current_state(&self, user_id: &str) -> GatewayResult<serde_json::Value>;
    async fn apply_partial_update(&self, user_id: &str, patch: serde_json::Value) -> GatewayResult<()>;
}

/// Durable side of reconnection support: persists whatever a disconnected
/// connection needs to resume with on reconnect. The fabric's
/// [`crate::reconnect::ReconnectionLedger`] only tracks the reconnection
/// window and attempt budget, not the payload being preserved.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_session(&self, user_id: &str, connection_id: &str, payload: serde_json::Value) -> GatewayResult<()>;
    async fn load_session(&self, user_id: &str, connection_id: &str) -> GatewayResult<Option<serde_json::Value>>;
}

/// Default collaborator implementations usable by the standalone binary
/// when no embedding application supplies its own. Not test-only: a
/// `GatewayManager` built without an external message-processing backend
/// still needs somewhere to send state-sync answers and log what it would
/// have forwarded.
pub mod defaults {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;
    use tracing::info;

    /// Logs every envelope it receives and otherwise does nothing with it.
    /// Stands in for a real application backend until one is wired up.
    #[derive(Default)]
    pub struct LoggingMessageHandler;

    #[async_trait]
    impl MessageHandler for LoggingMessageHandler {
        async fn handle(&self, connection_id: &str, user_id: &str, envelope: Envelope) -> GatewayResult<()> {
            info!(connection_id, user_id, kind = %envelope.kind, "no application message handler configured; logging and dropping");
            Ok(())
        }
    }

    /// Keeps per-user state as an opaque JSON blob in memory. Adequate for a
    /// single-process deployment; a durable deployment supplies its own
    /// [`StateSyncHandler`] backed by [`PersistenceStore`].
    #[derive(Default)]
    pub struct InMemoryStateSyncHandler {
        pub state: RwLock<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl StateSyncHandler for InMemoryStateSyncHandler {
        async fn current_state(&self, user_id: &str) -> GatewayResult<serde_json::Value> {
            Ok(self
                .state
                .read()
                .await
                .get(user_id)
                .cloned()
                .unwrap_or(serde_json::Value::Null))
        }

        async fn apply_partial_update(&self, user_id: &str, patch: serde_json::Value) -> GatewayResult<()> {
            self.state.write().await.insert(user_id.to_owned(), patch);
            Ok(())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::stubs::*;
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn stub_auth_validator_resolves_known_tokens_and_rejects_unknown_ones() {
        let validator = StubAuthValidator {
            tokens: [("tok-1".to_owned(), "user-1".to_owned())].into_iter().collect(),
        };
        assert_eq!(validator.validate("tok-1").await.unwrap(), "user-1");
        assert!(validator.validate("tok-missing").await.is_err());
    }

    #[tokio::test]
    async fn recording_message_handler_captures_every_handled_envelope() {
        let handler = RecordingMessageHandler::default();
        let envelope = Envelope::new("chat", json!({"text": "hi"}), Utc::now());
        handler.handle("conn-1", "user-1", envelope).await.unwrap();

        let received = handler.received.read().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "conn-1");
    }

    #[tokio::test]
    async fn in_memory_state_sync_handler_round_trips_partial_updates() {
        let handler = InMemoryStateSyncHandler::default();
        handler.apply_partial_update("user-1", json!({"count": 1})).await.unwrap();
        assert_eq!(handler.current_state("user-1").await.unwrap(), json!({"count": 1}));
        assert_eq!(handler.current_state("user-2").await.unwrap(), serde_json::Value::Null);
    }
}
