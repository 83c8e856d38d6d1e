// fabric-protocol: wire envelope types for the WebSocket connection fabric.
//
// Messages are JSON objects discriminated by a top-level `type` field. Most
// server-originated control frames (heartbeat, shutdown, chunk, error) have
// their own flat shape; everything else rides inside the generic `Envelope`
// with an opaque `payload`. Client-originated frames are validated as raw
// `serde_json::Value` upstream (see the gateway's validator) rather than
// deserialized straight into a Rust type, since unknown `type` values must
// be accepted (lenient mode) or rejected (strict mode) without a parse
// failure either way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frozen `type` discriminants used by the core itself.
pub mod message_types {
    pub const HEARTBEAT_PING: &str = "heartbeat_ping";
    pub const HEARTBEAT_PONG: &str = "heartbeat_pong";
    pub const HEARTBEAT_RESPONSE: &str = "heartbeat_response";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
    pub const CHUNK: &str = "chunk";
    pub const ERROR: &str = "error";
    pub const UPLOAD_PROGRESS: &str = "upload_progress";
    pub const GET_CURRENT_STATE: &str = "get_current_state";
    pub const STATE_UPDATE: &str = "state_update";
    pub const PARTIAL_STATE_UPDATE: &str = "partial_state_update";
    pub const CLIENT_STATE_UPDATE: &str = "client_state_update";
    pub const CONNECTION_ACK: &str = "connection_ack";

    /// Convenience envelope kinds the top-level manager exposes
    /// (`send_log`/`send_tool_call`/...) for the agent-backend consumers
    /// this fabric is built for (spec §2, C14). These carry no frozen shape
    /// of their own — they ride inside the generic [`super::Envelope`].
    pub const LOG: &str = "log";
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const SUB_AGENT_UPDATE: &str = "sub_agent_update";
}

/// State-sync message types handled internally rather than forwarded to the
/// application message handler.
#[must_use]
pub fn is_state_sync_type(kind: &str) -> bool {
    matches!(
        kind,
        message_types::GET_CURRENT_STATE
            | message_types::STATE_UPDATE
            | message_types::PARTIAL_STATE_UPDATE
            | message_types::CLIENT_STATE_UPDATE
    )
}

/// Close codes used by the core.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const AUTH_FAILED: u16 = 4401;
    pub const RATE_LIMITED: u16 = 4429;
}

/// Frozen validation/runtime error-type tags carried in [`ErrorPayload::error_type`].
pub mod error_types {
    pub const VALIDATION: &str = "validation_error";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const UNKNOWN_TYPE: &str = "unknown_message_type";
    pub const INTERNAL: &str = "internal_error";
}

/// Generic outbound server envelope.
///
/// `kind` serializes as `type`; everything the core doesn't have a frozen
/// shape for (chat messages, tool calls/results, log lines, sub-agent
/// updates) rides here with an opaque `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayed_to_user: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<bool>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp,
            displayed_to_user: None,
            sender: None,
            system: None,
        }
    }

    #[must_use]
    pub fn system(mut self) -> Self {
        self.system = Some(true);
        self
    }

    #[must_use]
    pub fn displayed_to_user(mut self, displayed: bool) -> Self {
        self.displayed_to_user = Some(displayed);
        self
    }

    #[must_use]
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// `{type:"heartbeat_ping", connection_id, timestamp, sequence}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPing {
    #[serde(rename = "type")]
    pub kind: String,
    pub connection_id: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl HeartbeatPing {
    pub fn new(connection_id: impl Into<String>, timestamp: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            kind: message_types::HEARTBEAT_PING.to_owned(),
            connection_id: connection_id.into(),
            timestamp,
            sequence,
        }
    }
}

/// `{type:"heartbeat_pong"|"heartbeat_response", connection_id, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPong {
    #[serde(rename = "type")]
    pub kind: String,
    pub connection_id: String,
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatPong {
    #[must_use]
    pub fn is_pong_kind(kind: &str) -> bool {
        kind == message_types::HEARTBEAT_PONG || kind == message_types::HEARTBEAT_RESPONSE
    }
}

/// `{type:"server_shutdown", message, close_code:1001, drain_timeout, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownNotice {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub close_code: u16,
    pub drain_timeout: u64,
    pub timestamp: DateTime<Utc>,
}

impl ShutdownNotice {
    pub fn new(drain_timeout_s: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: message_types::SERVER_SHUTDOWN.to_owned(),
            message: "Server is shutting down".to_owned(),
            close_code: close_codes::GOING_AWAY,
            drain_timeout: drain_timeout_s,
            timestamp,
        }
    }
}

/// `{type:"connection_ack", connection_id, reconnect_token, timestamp}`, sent
/// once right after a handshake succeeds. `reconnect_token` is what the
/// client presents on a future handshake to resume this session's counters
/// within the reconnection window (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionAck {
    #[serde(rename = "type")]
    pub kind: String,
    pub connection_id: String,
    pub reconnect_token: String,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionAck {
    pub fn new(connection_id: impl Into<String>, reconnect_token: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: message_types::CONNECTION_ACK.to_owned(),
            connection_id: connection_id.into(),
            reconnect_token: reconnect_token.into(),
            timestamp,
        }
    }
}

/// Negotiated/declared compression codec for large-message transfer.
///
/// `NONE` is always an accepted fallback; a client preference list that
/// names no supported codec (or is empty) negotiates to `NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompressionCodec {
    None,
    Gzip,
    Lz4,
}

impl CompressionCodec {
    #[must_use]
    pub fn negotiate(client_preference: &[CompressionCodec], supported: &[CompressionCodec]) -> Self {
        client_preference
            .iter()
            .find(|c| supported.contains(c))
            .copied()
            .unwrap_or(CompressionCodec::None)
    }
}

/// `{type:"chunk", message_type, transfer_id, chunk_index, total_chunks, codec, body}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_type: String,
    pub transfer_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub codec: CompressionCodec,
    /// Base64-encoded chunk bytes.
    pub body: String,
}

impl ChunkFrame {
    pub fn new(
        message_type: impl Into<String>,
        transfer_id: impl Into<String>,
        chunk_index: u32,
        total_chunks: u32,
        codec: CompressionCodec,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind: message_types::CHUNK.to_owned(),
            message_type: message_type.into(),
            transfer_id: transfer_id.into(),
            chunk_index,
            total_chunks,
            codec,
            body: body.into(),
        }
    }
}

/// `upload_progress` frame emitted periodically during a multi-chunk inbound transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadProgress {
    #[serde(rename = "type")]
    pub kind: String,
    pub transfer_id: String,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub timestamp: DateTime<Utc>,
}

impl UploadProgress {
    pub fn new(transfer_id: impl Into<String>, received_chunks: u32, total_chunks: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: message_types::UPLOAD_PROGRESS.to_owned(),
            transfer_id: transfer_id.into(),
            received_chunks,
            total_chunks,
            timestamp,
        }
    }
}

/// Nested `payload` of an `error` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// `{type:"error", payload:{...}, system?:true}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: ErrorPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<bool>,
}

impl ErrorEnvelope {
    pub fn new(payload: ErrorPayload) -> Self {
        Self {
            kind: message_types::ERROR.to_owned(),
            payload,
            system: Some(true),
        }
    }
}

/// The local-side record of a validation failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_type_field_and_omits_absent_optionals() {
        let env = Envelope::new("log", serde_json::json!({"line": "hi"}), Utc::now());
        let value = serde_json::to_value(&env).expect("envelope should serialize");
        assert_eq!(value["type"], "log");
        assert!(value.get("sender").is_none());
        assert!(value.get("system").is_none());
    }

    #[test]
    fn envelope_builder_methods_set_optional_fields() {
        let env = Envelope::new("chat", serde_json::json!({}), Utc::now())
            .system()
            .displayed_to_user(true)
            .from_sender("agent-1");
        assert_eq!(env.system, Some(true));
        assert_eq!(env.displayed_to_user, Some(true));
        assert_eq!(env.sender, Some("agent-1".to_owned()));
    }

    #[test]
    fn heartbeat_pong_recognizes_both_accepted_kinds() {
        assert!(HeartbeatPong::is_pong_kind("heartbeat_pong"));
        assert!(HeartbeatPong::is_pong_kind("heartbeat_response"));
        assert!(!HeartbeatPong::is_pong_kind("heartbeat_ping"));
    }

    #[test]
    fn compression_negotiates_first_mutually_supported_codec() {
        let supported = [CompressionCodec::None, CompressionCodec::Gzip, CompressionCodec::Lz4];
        let preference = [CompressionCodec::Lz4, CompressionCodec::Gzip];
        assert_eq!(
            CompressionCodec::negotiate(&preference, &supported),
            CompressionCodec::Lz4
        );
    }

    #[test]
    fn compression_falls_back_to_none_when_nothing_matches() {
        let supported = [CompressionCodec::None, CompressionCodec::Gzip];
        let preference: [CompressionCodec; 0] = [];
        assert_eq!(
            CompressionCodec::negotiate(&preference, &supported),
            CompressionCodec::None
        );
    }

    #[test]
    fn state_sync_types_are_recognized_and_others_are_not() {
        assert!(is_state_sync_type(message_types::GET_CURRENT_STATE));
        assert!(is_state_sync_type(message_types::CLIENT_STATE_UPDATE));
        assert!(!is_state_sync_type("tool_call"));
    }

    #[test]
    fn connection_ack_serializes_type_field() {
        let ack = ConnectionAck::new("conn-1", "token-1", Utc::now());
        let value = serde_json::to_value(&ack).expect("ack should serialize");
        assert_eq!(value["type"], "connection_ack");
        assert_eq!(value["reconnect_token"], "token-1");
    }

    #[test]
    fn shutdown_notice_carries_frozen_close_code() {
        let notice = ShutdownNotice::new(30, Utc::now());
        assert_eq!(notice.close_code, close_codes::GOING_AWAY);
        assert_eq!(notice.kind, message_types::SERVER_SHUTDOWN);
    }
}
