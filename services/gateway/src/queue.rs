use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use fabric_protocol::Envelope;
use tokio::sync::{Mutex, Notify};

/// The lane an outbound envelope is enqueued into. `FailedRetry` is never a
/// caller-visible enqueue target — entries land there only via
/// [`UserQueue::revert_to_failed_retry`] after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Priority,
    Normal,
}

#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    pub envelope: Envelope,
    pub attempts: u32,
}

impl QueuedEnvelope {
    pub(crate) fn fresh(envelope: Envelope) -> Self {
        Self { envelope, attempts: 0 }
    }
}

/// Which lane the per-user writer is currently draining. The writer drains
/// `Priority` fully, then `Normal` fully, then `FailedRetry` fully, before
/// looping back to `Priority` — so an entry reverted into `FailedRetry`
/// mid-drain is serviced on the *next* pass, never preempting whichever lane
/// is currently being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    Priority,
    Normal,
    FailedRetry,
}

impl DrainPhase {
    fn next(self) -> Self {
        match self {
            DrainPhase::Priority => DrainPhase::Normal,
            DrainPhase::Normal => DrainPhase::FailedRetry,
            DrainPhase::FailedRetry => DrainPhase::Priority,
        }
    }
}

/// The three-lane outbound queue for one user. A single writer (the
/// per-user `Sender`) owns the exclusive right to dequeue: it is expected to
/// hold at most one envelope "in flight" at a time, delivering it to every
/// live connection of the user before dequeuing the next. That
/// at-most-one-in-flight invariant is enforced by the caller serializing
/// through [`UserQueue::notify`] rather than by a lock here, since the
/// in-flight step also fans out to the registry and that shouldn't happen
/// while holding a queue lock.
pub struct UserQueue {
    priority: Mutex<VecDeque<QueuedEnvelope>>,
    normal: Mutex<VecDeque<QueuedEnvelope>>,
    failed_retry: Mutex<VecDeque<QueuedEnvelope>>,
    capacity: usize,
    notify: Notify,
    messages_lost: AtomicU64,
    delivered: AtomicU64,
}

impl UserQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            priority: Mutex::new(VecDeque::new()),
            normal: Mutex::new(VecDeque::new()),
            failed_retry: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            messages_lost: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Enqueues `envelope` into the given lane. A full `normal` lane drops
    /// its own oldest entry to make room. A full `priority` lane instead
    /// drops the oldest `normal` entry first — a lower-priority message is
    /// sacrificed before a higher-priority one — falling back to dropping
    /// its own oldest entry only if `normal` is empty. The currently
    /// in-flight `SENDING` item never lives in these deques, so it is never
    /// at risk of being the one dropped.
    pub async fn enqueue(&self, class: PriorityClass, envelope: Envelope) {
        match class {
            PriorityClass::Priority => {
                let mut priority_guard = self.priority.lock().await;
                if priority_guard.len() >= self.capacity {
                    let mut normal_guard = self.normal.lock().await;
                    if normal_guard.pop_front().is_some() {
                        self.messages_lost.fetch_add(1, Ordering::Relaxed);
                    } else {
                        priority_guard.pop_front();
                        self.messages_lost.fetch_add(1, Ordering::Relaxed);
                    }
                }
                priority_guard.push_back(QueuedEnvelope::fresh(envelope));
            }
            PriorityClass::Normal => {
                let mut guard = self.normal.lock().await;
                if guard.len() >= self.capacity {
                    guard.pop_front();
                    self.messages_lost.fetch_add(1, Ordering::Relaxed);
                }
                guard.push_back(QueuedEnvelope::fresh(envelope));
            }
        }
        self.notify.notify_one();
    }

    pub fn messages_lost(&self) -> u64 {
        self.messages_lost.load(Ordering::Relaxed)
    }

    /// Marks one envelope as successfully handed off to at least one live
    /// connection. Fed into the shutdown report's `messages_preserved`
    /// count.
    pub fn mark_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Reverts a failed delivery attempt to the head of `failed_retry`.
    pub async fn revert_to_failed_retry(&self, mut item: QueuedEnvelope) {
        item.attempts += 1;
        self.failed_retry.lock().await.push_front(item);
        self.notify.notify_one();
    }

    /// Dequeues the next envelope to attempt, advancing through
    /// [`DrainPhase`]s that are empty rather than stalling on them.
    pub async fn dequeue_next(&self, phase: &mut DrainPhase) -> Option<QueuedEnvelope> {
        for _ in 0..3 {
            let lane = match phase {
                DrainPhase::Priority => &self.priority,
                DrainPhase::Normal => &self.normal,
                DrainPhase::FailedRetry => &self.failed_retry,
            };
            let mut guard = lane.lock().await;
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            drop(guard);
            *phase = phase.next();
        }
        None
    }

    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub async fn is_empty(&self) -> bool {
        self.priority.lock().await.is_empty()
            && self.normal.lock().await.is_empty()
            && self.failed_retry.lock().await.is_empty()
    }
}
