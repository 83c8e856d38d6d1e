use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fabric_protocol::Envelope;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::connection::ConnectionRecord;
use crate::writer::SendOutcome;

/// The write end of a connection's outbound channel. The socket task on the
/// other end is the connection's single writer, so both the per-user
/// `Sender` and ad-hoc broadcasts deliver through this handle rather than
/// touching the socket directly.
pub type OutboundSender = mpsc::Sender<OutboundItem>;

/// One item handed to a connection's outbound channel.
///
/// `Direct` sends (broadcasts, heartbeat pings, the handshake's
/// `connection_ack`) are fire-and-forget. `Queued` sends carry a `oneshot`
/// back to the per-user queue, so a [`SendOutcome`] that isn't `Delivered`
/// can revert the envelope to `failed_retry` instead of the queue treating
/// channel hand-off as delivery (§4.7/§4.8's transactional send slot).
pub enum OutboundItem {
    Direct(Envelope),
    Queued {
        envelope: Envelope,
        ack: oneshot::Sender<SendOutcome>,
    },
}

impl OutboundItem {
    pub fn envelope(&self) -> &Envelope {
        match self {
            OutboundItem::Direct(envelope) | OutboundItem::Queued { envelope, .. } => envelope,
        }
    }

    pub fn into_parts(self) -> (Envelope, Option<oneshot::Sender<SendOutcome>>) {
        match self {
            OutboundItem::Direct(envelope) => (envelope, None),
            OutboundItem::Queued { envelope, ack } => (envelope, Some(ack)),
        }
    }
}

/// Aggregate counters surfaced by telemetry's `get_stats`. These accumulate
/// across the process lifetime; `connections_by_user` reflects only
/// currently-registered connections.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub total_connections: AtomicU64,
    pub successful_connections: AtomicU64,
    pub failed_connections: AtomicU64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub total_connections: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
}

/// The process-wide table of live connections, indexed by connection id and
/// mirrored by a per-user index for fan-out lookups.
///
/// Mirrors the teacher's `AppState` broadcast-registry shape: a
/// double-checked read-then-write lock pattern on `get_or_create`-style
/// operations, so the common "already exists" path never blocks on the
/// write lock.
pub struct Registry {
    connections: RwLock<HashMap<String, Arc<ConnectionRecord>>>,
    by_user: RwLock<HashMap<String, Vec<String>>>,
    outbound: RwLock<HashMap<String, OutboundSender>>,
    stats: ConnectionStats,
    rooms: RwLock<HashMap<String, std::collections::HashSet<String>>>,
    connection_rooms: RwLock<HashMap<String, std::collections::HashSet<String>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
            stats: ConnectionStats::default(),
            rooms: RwLock::new(HashMap::new()),
            connection_rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_outbound(&self, connection_id: &str, sender: OutboundSender) {
        self.outbound.write().await.insert(connection_id.to_owned(), sender);
    }

    pub async fn outbound_sender(&self, connection_id: &str) -> Option<OutboundSender> {
        self.outbound.read().await.get(connection_id).cloned()
    }

    /// Registers a new connection record. Returns `false` without mutating
    /// anything if `record.connection_id` already names a live connection —
    /// ids are expected to be generated unique, so a caller seeing `false`
    /// back is observing a collision that must not happen, not a routine
    /// retry path.
    pub async fn insert(&self, record: Arc<ConnectionRecord>) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&record.connection_id) {
            return false;
        }
        connections.insert(record.connection_id.clone(), record.clone());
        drop(connections);

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.successful_connections.fetch_add(1, Ordering::Relaxed);

        let mut by_user = self.by_user.write().await;
        by_user
            .entry(record.user_id.clone())
            .or_default()
            .push(record.connection_id.clone());
        true
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<ConnectionRecord>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Live connections of a user in registry-snapshot order. Fan-out to
    /// multiple connections of the same user delivers in this order and is
    /// not further coordinated across connections.
    pub async fn connections_for_user(&self, user_id: &str) -> Vec<Arc<ConnectionRecord>> {
        let by_user = self.by_user.read().await;
        let Some(ids) = by_user.get(user_id) else {
            return Vec::new();
        };
        let connections = self.connections.read().await;
        ids.iter().filter_map(|id| connections.get(id).cloned()).collect()
    }

    pub async fn connection_count_for_user(&self, user_id: &str) -> usize {
        self.by_user
            .read()
            .await
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn remove(&self, connection_id: &str) {
        self.outbound.write().await.remove(connection_id);
        let record = self.connections.write().await.remove(connection_id);
        let Some(record) = record else { return };
        if !record.can_be_cleaned_up() {
            self.stats.failed_connections.fetch_add(1, Ordering::Relaxed);
        }
        let mut by_user = self.by_user.write().await;
        if let Some(ids) = by_user.get_mut(&record.user_id) {
            ids.retain(|id| id != connection_id);
            if ids.is_empty() {
                by_user.remove(&record.user_id);
            }
        }
        drop(by_user);
        self.leave_all_rooms(connection_id).await;
    }

    /// Adds a connection to a room, creating the room if it doesn't exist
    /// yet. Maintains the bidirectional room_id<->connection_id index used
    /// by `broadcast_room`.
    pub async fn join_room(&self, room_id: &str, connection_id: &str) {
        self.rooms
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .insert(connection_id.to_owned());
        self.connection_rooms
            .write()
            .await
            .entry(connection_id.to_owned())
            .or_default()
            .insert(room_id.to_owned());
    }

    /// Removes a connection from a room. The room entry is dropped once it
    /// has no members left.
    pub async fn leave_room(&self, room_id: &str, connection_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(connection_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
        drop(rooms);
        if let Some(joined) = self.connection_rooms.write().await.get_mut(connection_id) {
            joined.remove(room_id);
        }
    }

    /// Removes a connection from every room it had joined. Called when the
    /// connection is torn down.
    pub async fn leave_all_rooms(&self, connection_id: &str) {
        let Some(joined) = self.connection_rooms.write().await.remove(connection_id) else {
            return;
        };
        let mut rooms = self.rooms.write().await;
        for room_id in joined {
            if let Some(members) = rooms.get_mut(&room_id) {
                members.remove(connection_id);
                if members.is_empty() {
                    rooms.remove(&room_id);
                }
            }
        }
    }

    /// Live connection records currently joined to a room.
    pub async fn room_members(&self, room_id: &str) -> Vec<Arc<ConnectionRecord>> {
        let Some(ids) = self.rooms.read().await.get(room_id).cloned() else {
            return Vec::new();
        };
        let connections = self.connections.read().await;
        ids.iter().filter_map(|id| connections.get(id).cloned()).collect()
    }

    pub async fn rooms_for_connection(&self, connection_id: &str) -> Vec<String> {
        self.connection_rooms
            .read()
            .await
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<Arc<ConnectionRecord>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
