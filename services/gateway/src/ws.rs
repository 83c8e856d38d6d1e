use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::Utc;
use fabric_protocol::{close_codes, error_types, message_types, ChunkFrame, ConnectionAck, Envelope, UploadProgress};
use tracing::{debug, info, warn};

use crate::codec::ChunkAssembler;
use crate::connection::ConnectionRecord;
use crate::http::response;
use crate::manager::{GatewayManager, InboundDecision};
use crate::rate_limit::{self, SharedRateLimiter};
use crate::registry::OutboundItem;
use crate::writer::SocketWriter;

/// Negotiates the handshake (§4.2): pulls a token from the `Authorization`
/// header or the `jwt-auth, jwt.<token>` subprotocol, validates it through
/// the configured [`crate::collaborators::AuthValidator`], and only then
/// upgrades. A subprotocol offer is always echoed back so the client's
/// handshake completes even if it authenticated via the header instead.
pub async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<GatewayManager>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !manager.is_accepting() {
        return response::service_unavailable("gateway is draining").into_response();
    }

    let token = match crate::auth::extract_token(&headers) {
        Ok(token) => token,
        Err(err) => return response::unauthorized(err.to_string()).into_response(),
    };

    let user_id = match manager.auth.validate(&token).await {
        Ok(user_id) => user_id,
        Err(err) => return response::unauthorized(err.to_string()).into_response(),
    };

    let subprotocol = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let reconnect_token = headers
        .get("x-reconnect-token")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let mut upgrade = ws;
    if subprotocol.is_some() {
        upgrade = upgrade.protocols(["jwt-auth"]);
    }

    upgrade.on_upgrade(move |socket| handle_socket(socket, manager, user_id, subprotocol, reconnect_token))
}

/// The per-connection task: a single combined read/write loop (the
/// teacher's `ws_forwarder` idiom), so the socket never has more than one
/// outstanding write in flight. Drives inbound validation, chunk
/// reassembly, and dispatch on one side, and drains the connection's
/// outbound channel (fed by the per-user sender and by broadcasts) on the
/// other.
async fn handle_socket(
    socket: WebSocket,
    manager: Arc<GatewayManager>,
    user_id: String,
    subprotocol: Option<String>,
    reconnect_token: Option<String>,
) {
    let record = match manager.connect(&user_id, subprotocol, reconnect_token.as_deref()).await {
        Ok(record) => record,
        Err(err) => {
            warn!(user_id = %user_id, error = %err, "connection rejected at handshake");
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<OutboundItem>(64);
    manager.register_outbound(&record.connection_id, outbound_tx.clone()).await;

    let ack = ConnectionAck::new(record.connection_id.clone(), record.connection_id.clone(), Utc::now());
    let ack_envelope = Envelope::new(message_types::CONNECTION_ACK, serde_json::to_value(&ack).unwrap_or(serde_json::Value::Null), Utc::now()).system();
    let _ = outbound_tx.send(OutboundItem::Direct(ack_envelope)).await;

    let mut writer = SocketWriter::new(
        socket,
        record.clone(),
        manager.config.chunk_size_bytes,
        crate::codec::parse_codec(&manager.config.compression_preference),
    );
    let limiter: SharedRateLimiter = rate_limit::shared(manager.config.rate_limit_per_second, manager.config.rate_limit_burst);
    let mut chunk_transfers: HashMap<String, ChunkAssembler> = HashMap::new();
    let idle_timeout = manager.config.idle_timeout;

    info!(connection_id = %record.connection_id, user_id = %user_id, "connection established");

    loop {
        tokio::select! {
            frame = tokio::time::timeout(idle_timeout, writer.recv()) => {
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if !limiter.check() {
                            manager.telemetry.record_rate_limited();
                            manager
                                .send_error(&user_id, error_types::RATE_LIMITED, "rate limit exceeded", None)
                                .await;
                            continue;
                        }
                        record.touch_activity();
                        record.messages_received.fetch_add(1, Ordering::Relaxed);
                        record.bytes_in.fetch_add(text.len() as u64, Ordering::Relaxed);
                        handle_inbound_text(&manager, &record, &user_id, &mut chunk_transfers, &text).await;
                    }
                    Ok(Some(Ok(Message::Ping(_)))) => record.touch_activity(),
                    Ok(Some(Ok(Message::Pong(_)))) => manager.handle_pong(&record),
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        info!(connection_id = %record.connection_id, "client closed the connection");
                        break;
                    }
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        debug!(connection_id = %record.connection_id, "ignoring unsupported binary frame");
                    }
                    Ok(Some(Err(err))) => {
                        warn!(connection_id = %record.connection_id, error = %err, "websocket read error");
                        break;
                    }
                    Err(_) => {
                        info!(connection_id = %record.connection_id, "connection idle past timeout");
                        break;
                    }
                }
            }
            item = outbound_rx.recv() => {
                let Some(item) = item else { break; };
                let (envelope, ack) = item.into_parts();
                let outcome = writer.send(&envelope).await;
                if let Some(ack) = ack {
                    let _ = ack.send(outcome);
                }
                if !outcome.should_continue() {
                    break;
                }
            }
        }

        if record.is_closing() {
            break;
        }
    }

    writer.close(close_codes::NORMAL, "connection closed").await;
    manager.disconnect(&record.connection_id, "socket loop ended").await;
}

/// Parses one inbound text frame and routes it: chunk frames feed the
/// reassembler, everything else goes straight to
/// [`GatewayManager::handle_incoming`].
async fn handle_inbound_text(
    manager: &Arc<GatewayManager>,
    record: &Arc<ConnectionRecord>,
    user_id: &str,
    chunk_transfers: &mut HashMap<String, ChunkAssembler>,
    text: &str,
) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            manager
                .send_error(user_id, error_types::VALIDATION, format!("invalid JSON: {err}"), None)
                .await;
            return;
        }
    };

    if raw.get("type").and_then(serde_json::Value::as_str) == Some(message_types::CHUNK) {
        handle_chunk_frame(manager, record, user_id, chunk_transfers, raw).await;
        return;
    }

    match manager.handle_incoming(&record.connection_id, user_id, raw, text.len()).await {
        Ok(InboundDecision::Fallback(envelope)) => {
            manager.broadcast_user(user_id, &envelope).await;
        }
        Ok(InboundDecision::HandledInternally | InboundDecision::Forwarded) => {}
        Err(err) => {
            warn!(connection_id = %record.connection_id, error = %err, "message handler returned an error");
        }
    }
}

/// Accepts one chunk of a multi-part transfer, emitting `upload_progress`
/// on every chunk, and once the transfer completes decompresses and
/// reassembles it into a single frame that is then routed exactly like any
/// other inbound message (§4.4).
async fn handle_chunk_frame(
    manager: &Arc<GatewayManager>,
    record: &Arc<ConnectionRecord>,
    user_id: &str,
    chunk_transfers: &mut HashMap<String, ChunkAssembler>,
    raw: serde_json::Value,
) {
    let frame: ChunkFrame = match serde_json::from_value(raw) {
        Ok(frame) => frame,
        Err(err) => {
            manager
                .send_error(user_id, error_types::VALIDATION, format!("malformed chunk frame: {err}"), None)
                .await;
            return;
        }
    };

    if chunk_transfers
        .get(&frame.transfer_id)
        .is_some_and(|existing| existing.is_expired(manager.config.chunk_reassembly_timeout))
    {
        chunk_transfers.remove(&frame.transfer_id);
        manager
            .send_error(
                user_id,
                error_types::VALIDATION,
                format!("transfer \"{}\" expired before it completed and was discarded", frame.transfer_id),
                None,
            )
            .await;
    }

    let assembler = chunk_transfers
        .entry(frame.transfer_id.clone())
        .or_insert_with(|| ChunkAssembler::new(frame.total_chunks, frame.codec));

    if let Err(err) = assembler.accept(&frame) {
        chunk_transfers.remove(&frame.transfer_id);
        manager.send_error(user_id, error_types::VALIDATION, err.to_string(), None).await;
        return;
    }

    let progress = UploadProgress::new(
        frame.transfer_id.clone(),
        assembler.received_count(),
        assembler.total_chunks(),
        Utc::now(),
    );
    manager
        .send_to_user(
            user_id,
            Envelope::new(message_types::UPLOAD_PROGRESS, serde_json::to_value(&progress).unwrap_or(serde_json::Value::Null), Utc::now()).system(),
            manager.config.priority_threshold,
        )
        .await;

    if !assembler.is_complete() {
        return;
    }
    let Some(assembler) = chunk_transfers.remove(&frame.transfer_id) else {
        return;
    };

    let message_type = frame.message_type.clone();
    let bytes = match assembler.finish() {
        Ok(bytes) => bytes,
        Err(err) => {
            manager.send_error(user_id, error_types::VALIDATION, err.to_string(), None).await;
            return;
        }
    };

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(reassembled) => {
            let raw_len = bytes.len();
            if let Ok(InboundDecision::Fallback(envelope)) =
                manager.handle_incoming(&record.connection_id, user_id, reassembled, raw_len).await
            {
                manager.broadcast_user(user_id, &envelope).await;
            }
        }
        Err(err) => {
            manager
                .send_error(
                    user_id,
                    error_types::VALIDATION,
                    format!("reassembled transfer for \"{message_type}\" was not valid JSON: {err}"),
                    None,
                )
                .await;
        }
    }
}
