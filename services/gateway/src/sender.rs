use std::sync::Arc;

use tracing::{debug, warn};

use crate::queue::{DrainPhase, UserQueue};
use crate::registry::{OutboundItem, Registry};
use crate::writer::SendOutcome;

const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Owns the exclusive right to dequeue one user's outbound queue and deliver
/// it to every live connection that user currently has open.
///
/// A dequeued envelope is the queue's transactional "in flight" slot: it is
/// handed to every live connection of the user (registry-snapshot order,
/// uncoordinated across connections) before the next envelope is dequeued.
/// If none of the user's connections are reachable the envelope reverts to
/// the head of `failed_retry` rather than being dropped, up to
/// [`MAX_DELIVERY_ATTEMPTS`].
pub struct UserSender {
    user_id: String,
    queue: Arc<UserQueue>,
    registry: Arc<Registry>,
}

impl UserSender {
    pub fn new(user_id: impl Into<String>, queue: Arc<UserQueue>, registry: Arc<Registry>) -> Self {
        Self {
            user_id: user_id.into(),
            queue,
            registry,
        }
    }

    /// Runs until `shutdown` resolves. Intended to be spawned as its own
    /// task, one per user with at least one live connection.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut phase = DrainPhase::Priority;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let Some(item) = self.queue.dequeue_next(&mut phase).await else {
                tokio::select! {
                    () = self.queue.wait_for_work() => continue,
                    _ = shutdown.changed() => return,
                }
            };

            let connections = self.registry.connections_for_user(&self.user_id).await;
            if connections.is_empty() {
                if item.attempts < MAX_DELIVERY_ATTEMPTS {
                    self.queue.revert_to_failed_retry(item).await;
                } else {
                    warn!(user_id = %self.user_id, "dropping envelope after exhausting delivery attempts");
                }
                continue;
            }

            let mut any_delivered = false;
            for record in &connections {
                if record.is_closing() {
                    debug!(connection_id = %record.connection_id, "skipping send: connection is closing");
                    continue;
                }
                let Some(sender) = self.registry.outbound_sender(&record.connection_id).await else {
                    continue;
                };
                let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                let queued = OutboundItem::Queued {
                    envelope: item.envelope.clone(),
                    ack: ack_tx,
                };
                if sender.send(queued).await.is_err() {
                    debug!(connection_id = %record.connection_id, "outbound channel closed mid-fan-out");
                    continue;
                }
                match ack_rx.await {
                    Ok(SendOutcome::Delivered) => any_delivered = true,
                    Ok(SendOutcome::Transient | SendOutcome::Closed) => {
                        debug!(connection_id = %record.connection_id, "socket write did not confirm delivery");
                    }
                    Err(_) => debug!(connection_id = %record.connection_id, "connection task ended before acking the send"),
                }
            }

            // Only a real socket-write confirmation from `writer.rs` counts
            // as delivered; a channel hand-off that never confirms (a
            // Transient write failure, or the writer dropping the ack) still
            // reverts the envelope, preserving the transactional send slot.
            if any_delivered {
                self.queue.mark_delivered();
            } else if item.attempts < MAX_DELIVERY_ATTEMPTS {
                self.queue.revert_to_failed_retry(item).await;
            } else {
                warn!(user_id = %self.user_id, "dropping envelope after exhausting delivery attempts");
            }
        }
    }
}
