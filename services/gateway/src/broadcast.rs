use std::sync::Arc;

use fabric_protocol::Envelope;
use tracing::warn;

use crate::registry::{OutboundItem, Registry};

const BROADCAST_DISCONNECT_REASON: &str = "Connection lost during broadcast";

/// Global/topic fan-out, distinct from the per-user queue a single sender
/// drains (see [`crate::sender`]): used for server-wide frames like the
/// shutdown notice, where every live connection gets the same envelope with
/// no per-user queueing or retry semantics.
///
/// Each broadcast takes a registry snapshot, releases any lock, then
/// iterates sending per-connection (§4.9). A dead outbound channel found
/// during the sweep is not retried — it is collected and, once the sweep
/// completes, disconnected through the normal teardown path in a single
/// internal cleanup pass.
pub struct BroadcastHub {
    registry: Arc<Registry>,
}

impl BroadcastHub {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Sends `envelope` to every currently-registered connection. Returns
    /// the number of connections it was actually handed to.
    pub async fn broadcast_all(&self, envelope: &Envelope) -> usize {
        let snapshot = self.registry.all().await;
        self.fan_out(snapshot.into_iter(), envelope).await
    }

    /// Sends `envelope` to every live connection belonging to `user_id`.
    pub async fn broadcast_to_user(&self, user_id: &str, envelope: &Envelope) -> usize {
        let snapshot = self.registry.connections_for_user(user_id).await;
        self.fan_out(snapshot.into_iter(), envelope).await
    }

    /// Resolves `room_id` via the Room Index and sends `envelope` to every
    /// member. Connection ids the index still carries that no longer
    /// resolve to a live connection count as failed and are swept from the
    /// room's membership.
    pub async fn broadcast_room(&self, room_id: &str, envelope: &Envelope) -> usize {
        let snapshot = self.registry.room_members(room_id).await;
        self.fan_out(snapshot.into_iter(), envelope).await
    }

    async fn fan_out(&self, records: impl Iterator<Item = Arc<crate::connection::ConnectionRecord>>, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for record in records {
            if !record.is_active() {
                continue;
            }
            let Some(sender) = self.registry.outbound_sender(&record.connection_id).await else {
                dead.push(record);
                continue;
            };
            if sender.send(OutboundItem::Direct(envelope.clone())).await.is_ok() {
                delivered += 1;
            } else {
                warn!(connection_id = %record.connection_id, "broadcast found a dead outbound channel");
                dead.push(record);
            }
        }

        for record in dead {
            record.transition_to_closing();
            self.registry.remove(&record.connection_id).await;
            warn!(connection_id = %record.connection_id, reason = BROADCAST_DISCONNECT_REASON, "disconnected dead record found during broadcast");
        }

        delivered
    }
}
