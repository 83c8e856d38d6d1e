use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use fabric_protocol::{CompressionCodec, Envelope};
use futures_util::SinkExt;
use tracing::{debug, error, warn};

use crate::codec;
use crate::connection::ConnectionRecord;

/// Classification of a write failure observed on a connection's socket
/// (§4.8's frozen table), kept as a string match against the underlying
/// error's display text rather than the error type itself — some of these
/// distinctions (the benign close race in particular) only ever show up as
/// text, never as a distinguishable variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorClass {
    BenignCloseRace,
    ConnectionClosed,
    Transient,
    Unexpected,
}

/// Outcome of one [`SocketWriter::send`] call, reported back to the caller
/// so a queue-backed send can revert on anything short of `Delivered`
/// instead of treating channel hand-off as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Transient,
    Closed,
}

impl SendOutcome {
    /// Whether the connection's read/write loop should keep running.
    pub fn should_continue(self) -> bool {
        !matches!(self, SendOutcome::Closed)
    }
}

pub fn classify_send_error(message: &str) -> SendErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("cannot call send once a close message has been sent") {
        SendErrorClass::BenignCloseRace
    } else if lower.contains("close") || lower.contains("disconnect") {
        SendErrorClass::ConnectionClosed
    } else if lower.contains("broken pipe")
        || lower.contains("connection reset")
        || lower.contains("timed out")
        || lower.contains("would block")
    {
        SendErrorClass::Transient
    } else {
        SendErrorClass::Unexpected
    }
}

/// The single writer for one socket. Every outbound envelope for a
/// connection passes through here, one at a time, so there is at most one
/// outstanding write per socket (§4.8's single-writer discipline).
pub struct SocketWriter {
    socket: WebSocket,
    record: Arc<ConnectionRecord>,
    chunk_size_bytes: usize,
    codec: CompressionCodec,
}

impl SocketWriter {
    pub fn new(socket: WebSocket, record: Arc<ConnectionRecord>, chunk_size_bytes: usize, codec: CompressionCodec) -> Self {
        Self {
            socket,
            record,
            chunk_size_bytes,
            codec,
        }
    }

    /// Gates on the record's lifecycle state, serializes the envelope, and
    /// writes the frame. A serialized envelope past `chunk_size_bytes` is
    /// compressed and split into `chunk` frames first (§4.4's outbound half
    /// of chunking) rather than written as a single oversized WS message.
    /// Returns the outcome the caller should act on: stop the read/write
    /// loop on `Closed`, or revert a queue-backed send on anything other
    /// than `Delivered`.
    pub async fn send(&mut self, envelope: &Envelope) -> SendOutcome {
        if self.record.is_closing() {
            debug!(connection_id = %self.record.connection_id, "skipped send: record is closing");
            return SendOutcome::Closed;
        }

        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                error!(connection_id = %self.record.connection_id, error = %err, "failed to serialize outbound envelope");
                self.record.error_count.fetch_add(1, Ordering::Relaxed);
                return SendOutcome::Transient;
            }
        };

        if text.len() > self.chunk_size_bytes {
            return self.send_chunked(envelope, &text).await;
        }

        match self.socket.send(Message::Text(text.clone())).await {
            Ok(()) => {
                self.record.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.record
                    .bytes_out
                    .fetch_add(text.len() as u64, Ordering::Relaxed);
                SendOutcome::Delivered
            }
            Err(err) => self.handle_send_error(&err.to_string()),
        }
    }

    /// Compresses `text` and writes it as a sequence of `chunk` frames
    /// instead of one oversized WS message. A write failure partway through
    /// the sequence is reported through the same [`SendOutcome`] the caller
    /// already knows how to act on; the receiving [`crate::codec::ChunkAssembler`]
    /// discards a transfer that never completes once its reassembly timeout
    /// elapses.
    async fn send_chunked(&mut self, envelope: &Envelope, text: &str) -> SendOutcome {
        let compressed = match codec::compress(text.as_bytes(), self.codec) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(connection_id = %self.record.connection_id, error = %err, "failed to compress outbound envelope");
                self.record.error_count.fetch_add(1, Ordering::Relaxed);
                return SendOutcome::Transient;
            }
        };

        let transfer_id = codec::generate_transfer_id();
        let chunks = codec::split_into_chunks(&envelope.kind, &transfer_id, &compressed, self.codec, self.chunk_size_bytes);

        for chunk in &chunks {
            let chunk_text = match serde_json::to_string(chunk) {
                Ok(chunk_text) => chunk_text,
                Err(err) => {
                    error!(connection_id = %self.record.connection_id, error = %err, "failed to serialize outbound chunk");
                    self.record.error_count.fetch_add(1, Ordering::Relaxed);
                    return SendOutcome::Transient;
                }
            };
            match self.socket.send(Message::Text(chunk_text.clone())).await {
                Ok(()) => {
                    self.record
                        .bytes_out
                        .fetch_add(chunk_text.len() as u64, Ordering::Relaxed);
                }
                Err(err) => return self.handle_send_error(&err.to_string()),
            }
        }

        self.record.messages_sent.fetch_add(1, Ordering::Relaxed);
        SendOutcome::Delivered
    }

    /// Passthrough to the owned socket's read half, so a single task can
    /// drive both directions of the connection through one `tokio::select!`
    /// (§4.8's single-writer discipline is trivially satisfied when the
    /// writer and reader are the same task).
    pub async fn recv(&mut self) -> Option<Result<Message, axum::Error>> {
        self.socket.recv().await
    }

    pub async fn close(&mut self, code: u16, reason: impl Into<String>) {
        let _ = self
            .socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code,
                reason: reason.into().into(),
            })))
            .await;
    }

    fn handle_send_error(&self, message: &str) -> SendOutcome {
        match classify_send_error(message) {
            SendErrorClass::BenignCloseRace => {
                debug!(connection_id = %self.record.connection_id, "benign close race on send");
                self.record.transition_to_closing();
                SendOutcome::Closed
            }
            SendErrorClass::ConnectionClosed => {
                debug!(connection_id = %self.record.connection_id, "connection closed on send");
                self.record.transition_to_closing();
                SendOutcome::Closed
            }
            SendErrorClass::Transient => {
                warn!(connection_id = %self.record.connection_id, error = message, "transient send error");
                self.record.error_count.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Transient
            }
            SendErrorClass::Unexpected => {
                error!(connection_id = %self.record.connection_id, error = message, "unexpected send error");
                self.record.error_count.fetch_add(1, Ordering::Relaxed);
                self.record.transition_to_failed();
                SendOutcome::Closed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_benign_close_race_string_first() {
        assert_eq!(
            classify_send_error("Cannot call send once a close message has been sent."),
            SendErrorClass::BenignCloseRace
        );
    }

    #[test]
    fn classifies_any_close_or_disconnect_substring_as_connection_closed() {
        assert_eq!(classify_send_error("socket disconnect"), SendErrorClass::ConnectionClosed);
        assert_eq!(classify_send_error("peer closed the connection"), SendErrorClass::ConnectionClosed);
    }

    #[test]
    fn classifies_io_style_failures_as_transient() {
        assert_eq!(classify_send_error("Broken pipe (os error 32)"), SendErrorClass::Transient);
        assert_eq!(classify_send_error("Connection reset by peer"), SendErrorClass::Transient);
    }

    #[test]
    fn falls_back_to_unexpected_for_anything_else() {
        assert_eq!(classify_send_error("invalid utf-8 sequence"), SendErrorClass::Unexpected);
    }
}
