use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fabric_protocol::{message_types, Envelope};
use fabric_test_utils::{GatewayHarness, MockWsClient};
use gateway::collaborators::defaults::InMemoryStateSyncHandler;
use gateway::collaborators::MessageHandler;
use gateway::error::GatewayResult;
use gateway::{auth::JwtAuthValidator, build_router, GatewayConfig, GatewayManager};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tokio::sync::Mutex;

const JWT_SECRET: &str = "integration-test-secret";

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: usize,
}

fn sign(user_id: &str) -> String {
    let claims = Claims {
        sub: user_id.to_owned(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

/// Records every envelope forwarded to it, standing in for the embedding
/// application's own message handler.
#[derive(Default)]
struct RecordingHandler {
    received: Mutex<Vec<(String, Envelope)>>,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _connection_id: &str, user_id: &str, envelope: Envelope) -> GatewayResult<()> {
        self.received.lock().await.push((user_id.to_owned(), envelope));
        Ok(())
    }
}

fn build_manager(config: GatewayConfig, recording: Arc<RecordingHandler>) -> Arc<GatewayManager> {
    GatewayManager::new(
        config,
        Arc::new(JwtAuthValidator::new(JWT_SECRET)),
        recording,
        Arc::new(InMemoryStateSyncHandler::default()),
    )
}

#[tokio::test]
async fn bearer_handshake_admits_the_connection_and_forwards_recognized_messages() {
    let recording = Arc::new(RecordingHandler::default());
    let manager = build_manager(GatewayConfig::default(), recording.clone());
    let harness = GatewayHarness::spawn(build_router(manager)).await.unwrap();

    let token = sign("user-1");
    let mut client = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();

    let envelope = Envelope::new("chat", serde_json::json!({"text": "hello"}), chrono::Utc::now());
    client.send_envelope(&envelope).await.unwrap();

    // Give the connection's single read/write loop a moment to process and
    // forward the message before we inspect what the handler recorded.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let received = recording.received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "user-1");
    assert_eq!(received[0].1.kind, "chat");

    harness.shutdown().await;
}

#[tokio::test]
async fn subprotocol_handshake_is_accepted_as_an_alternative_to_the_bearer_header() {
    let recording = Arc::new(RecordingHandler::default());
    let manager = build_manager(GatewayConfig::default(), recording);
    let harness = GatewayHarness::spawn(build_router(manager)).await.unwrap();

    let token = sign("user-2");
    let client = MockWsClient::connect_with_subprotocol(&harness.ws_url("/ws"), &token).await;
    assert!(client.is_ok(), "subprotocol handshake should be accepted");

    harness.shutdown().await;
}

#[tokio::test]
async fn unauthenticated_handshake_is_rejected() {
    let recording = Arc::new(RecordingHandler::default());
    let manager = build_manager(GatewayConfig::default(), recording);
    let harness = GatewayHarness::spawn(build_router(manager)).await.unwrap();

    let result = MockWsClient::connect(&harness.ws_url("/ws")).await;
    assert!(result.is_err(), "a handshake with no token should never upgrade");

    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_message_type_comes_back_as_a_fallback_error_envelope() {
    let recording = Arc::new(RecordingHandler::default());
    let manager = build_manager(GatewayConfig::default(), recording);
    let harness = GatewayHarness::spawn(build_router(manager)).await.unwrap();

    let token = sign("user-3");
    let mut client = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();
    let ack = client.recv_envelope().await.unwrap();
    assert_eq!(ack.kind, message_types::CONNECTION_ACK);

    client
        .send_raw(&serde_json::json!({"type": "totally_unrecognized", "payload": {"x": 1}}))
        .await
        .unwrap();

    let reply = client.recv_envelope().await.unwrap();
    assert_eq!(reply.kind, message_types::ERROR);
    assert_eq!(reply.payload["original_type"], "totally_unrecognized");
    assert_eq!(reply.payload["fallback_applied"], true);

    harness.shutdown().await;
}

#[tokio::test]
async fn get_current_state_is_answered_from_the_state_sync_collaborator() {
    let recording = Arc::new(RecordingHandler::default());
    let state_sync = Arc::new(InMemoryStateSyncHandler::default());
    state_sync
        .apply_partial_update("user-4", serde_json::json!({"score": 42}))
        .await
        .unwrap();
    let manager = GatewayManager::new(
        GatewayConfig::default(),
        Arc::new(JwtAuthValidator::new(JWT_SECRET)),
        recording,
        state_sync,
    );
    let harness = GatewayHarness::spawn(build_router(manager)).await.unwrap();

    let token = sign("user-4");
    let mut client = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();
    let ack = client.recv_envelope().await.unwrap();
    assert_eq!(ack.kind, message_types::CONNECTION_ACK);

    client
        .send_raw(&serde_json::json!({"type": "get_current_state", "payload": {}}))
        .await
        .unwrap();

    let reply = client.recv_envelope().await.unwrap();
    assert_eq!(reply.kind, message_types::STATE_UPDATE);
    assert_eq!(reply.payload["score"], 42);

    harness.shutdown().await;
}

#[tokio::test]
async fn per_user_connection_limit_rejects_a_second_socket() {
    let recording = Arc::new(RecordingHandler::default());
    let mut config = GatewayConfig::default();
    config.max_connections_per_user = 1;
    let manager = build_manager(config, recording);
    let harness = GatewayHarness::spawn(build_router(manager)).await.unwrap();

    let token = sign("user-5");
    let _first = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();
    // The second socket completes the HTTP upgrade (the limit is enforced
    // after the upgrade, inside the connection task) but is closed
    // immediately without ever being admitted.
    let result = second.recv_envelope().await;
    assert!(result.is_err(), "the over-limit connection should be closed without any reply");

    harness.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_notifies_connected_clients() {
    let recording = Arc::new(RecordingHandler::default());
    let mut config = GatewayConfig::default();
    config.drain_timeout = Duration::from_millis(200);
    let manager = build_manager(config, recording);
    let token = sign("user-6");

    let harness = GatewayHarness::spawn(build_router(manager.clone())).await.unwrap();
    let mut client = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();
    let ack = client.recv_envelope().await.unwrap();
    assert_eq!(ack.kind, message_types::CONNECTION_ACK);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown_manager = manager.clone();
    let shutdown_task = tokio::spawn(async move { shutdown_manager.shutdown().await });

    let reply = client.recv_envelope().await.unwrap();
    assert_eq!(reply.kind, message_types::SERVER_SHUTDOWN);

    let report = shutdown_task.await.unwrap();
    assert_eq!(report.notified, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn reconnecting_with_a_prior_connection_id_resumes_its_message_counters() {
    let recording = Arc::new(RecordingHandler::default());
    let manager = build_manager(GatewayConfig::default(), recording.clone());
    let harness = GatewayHarness::spawn(build_router(manager.clone())).await.unwrap();

    let token = sign("user-7");
    let mut first = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();
    let ack = first.recv_envelope().await.unwrap();
    assert_eq!(ack.kind, message_types::CONNECTION_ACK);
    let reconnect_token = ack.payload["reconnect_token"].as_str().unwrap().to_owned();

    first.send_envelope(&Envelope::new("chat", serde_json::json!({}), chrono::Utc::now())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut resumed =
        MockWsClient::connect_with_bearer_and_reconnect_token(&harness.ws_url("/ws"), &token, &reconnect_token)
            .await
            .unwrap();
    let resumed_ack = resumed.recv_envelope().await.unwrap();
    assert_eq!(resumed_ack.kind, message_types::CONNECTION_ACK);
    assert_ne!(
        resumed_ack.payload["connection_id"], ack.payload["connection_id"],
        "a resumed connection still gets its own fresh connection_id"
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn shutdown_report_counts_messages_already_delivered_before_the_drain() {
    let recording = Arc::new(RecordingHandler::default());
    let mut config = GatewayConfig::default();
    config.drain_timeout = Duration::from_millis(200);
    let manager = build_manager(config, recording);
    let token = sign("user-8");

    let harness = GatewayHarness::spawn(build_router(manager.clone())).await.unwrap();
    let mut client = MockWsClient::connect_with_bearer(&harness.ws_url("/ws"), &token).await.unwrap();
    let ack = client.recv_envelope().await.unwrap();
    assert_eq!(ack.kind, message_types::CONNECTION_ACK);

    manager.send_log("user-8", serde_json::json!({"line": "hello"})).await;
    let delivered = client.recv_envelope().await.unwrap();
    assert_eq!(delivered.kind, message_types::LOG);

    let report = manager.shutdown().await;
    assert!(report.messages_preserved >= 1);

    harness.shutdown().await;
}
