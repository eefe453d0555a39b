//! Outbound buffering and acknowledgment tracking.
//!
//! A [`Message`] lives in the pending FIFO until transmitted, then in the
//! unconfirmed map until the remote echoes its id back, and is dropped from
//! both once confirmed or once its retry budget is exhausted (the latter is
//! reported, never silent).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default retransmission budget per message.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unit of application data tracked by the queue.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique within a process run; assigned at enqueue time, immutable
    pub id: String,
    /// Type tag used for routing (`"heartbeat"`, `"heartbeat_ack"`, or application-defined)
    pub message_type: String,
    /// Opaque application payload
    pub content: Value,
    /// Last (re)transmission time, used to detect staleness
    pub sent_at: Instant,
    /// Retransmissions performed so far
    pub retry_count: u32,
    /// Retransmission budget
    pub max_retries: u32,
    /// True only once remote confirmation is observed
    pub acknowledged: bool,
}

impl Message {
    /// Build the wire envelope for this message, stamped with the current time.
    #[must_use]
    pub fn envelope(&self) -> Envelope {
        Envelope {
            id: self.id.clone(),
            message_type: self.message_type.clone(),
            content: self.content.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// JSON wire envelope: `{"id", "type", "content", "timestamp"}`.
///
/// `timestamp` is epoch milliseconds. Compression is signaled by the gzip
/// magic bytes of the raw frame, not by any envelope field.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    #[must_use]
    pub fn new<I: Into<String>, T: Into<String>>(id: I, message_type: T, content: Value) -> Self {
        Self {
            id: id.into(),
            message_type: message_type.into(),
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Owns the three collections behind the at-least-once contract: the pending
/// FIFO, the transmitted-but-unconfirmed map, and the inbound de-duplication
/// set. Mutated only by the owning [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug)]
pub struct MessageQueue {
    pending: VecDeque<Message>,
    unconfirmed: HashMap<String, Message>,
    received: HashSet<String>,
    received_order: VecDeque<String>,
    pending_capacity: usize,
    received_capacity: usize,
    id_counter: u64,
}

impl MessageQueue {
    #[must_use]
    pub fn new(pending_capacity: usize, received_capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            unconfirmed: HashMap::new(),
            received: HashSet::new(),
            received_order: VecDeque::new(),
            pending_capacity,
            received_capacity,
            id_counter: 0,
        }
    }

    /// Allocate a process-unique message id (monotonic counter + timestamp).
    ///
    /// Also used for control frames (heartbeats) that never enter the queue.
    pub fn allocate_id(&mut self) -> String {
        let id = format!(
            "msg_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            self.id_counter
        );
        self.id_counter += 1;
        id
    }

    /// Append a new message to the pending FIFO and return its id.
    ///
    /// Non-blocking and valid in any connection state. The oldest pending
    /// message is evicted when the queue is full.
    pub fn enqueue<S: Into<String>>(
        &mut self,
        message_type: S,
        content: Value,
        max_retries: u32,
    ) -> String {
        let id = self.allocate_id();

        if self.pending.len() >= self.pending_capacity
            && let Some(evicted) = self.pending.pop_front()
        {
            tracing::warn!(id = %evicted.id, "pending queue full, dropping oldest message");
        }

        self.pending.push_back(Message {
            id: id.clone(),
            message_type: message_type.into(),
            content,
            sent_at: Instant::now(),
            retry_count: 0,
            max_retries,
            acknowledged: false,
        });

        id
    }

    /// Snapshot of all pending messages in FIFO order, without removal.
    ///
    /// The flush path transmits each and removes it individually via
    /// [`mark_sent`](Self::mark_sent) once it actually went out.
    #[must_use]
    pub fn pending_snapshot(&self) -> Vec<Message> {
        self.pending.iter().cloned().collect()
    }

    /// Look up a pending message by id.
    #[must_use]
    pub fn pending_message(&self, id: &str) -> Option<Message> {
        self.pending.iter().find(|m| m.id == id).cloned()
    }

    /// Move a message from pending to the unconfirmed map.
    ///
    /// This marks "transmitted", not "acknowledged": the message stays
    /// re-sendable until [`mark_received`](Self::mark_received) observes a
    /// confirmation for its id.
    pub fn mark_sent(&mut self, id: &str) {
        if let Some(pos) = self.pending.iter().position(|m| m.id == id)
            && let Some(mut message) = self.pending.remove(pos)
        {
            message.sent_at = Instant::now();
            self.unconfirmed.insert(message.id.clone(), message);
        }
    }

    /// Record an inbound message id.
    ///
    /// Returns `true` when the id was not seen before (the caller may dispatch
    /// handlers), `false` for a re-delivered duplicate. A matching entry in
    /// the unconfirmed map is treated as the remote's confirmation and removed,
    /// completing the at-least-once contract for that message.
    pub fn mark_received(&mut self, id: &str) -> bool {
        if self.unconfirmed.remove(id).is_some() {
            tracing::debug!(%id, "message confirmed by remote");
        }

        if self.received.contains(id) {
            return false;
        }

        if self.received.len() >= self.received_capacity
            && let Some(oldest) = self.received_order.pop_front()
        {
            self.received.remove(&oldest);
        }
        self.received.insert(id.to_owned());
        self.received_order.push_back(id.to_owned());
        true
    }

    /// Move stale unconfirmed messages back into the pending queue.
    ///
    /// Messages older than `stale_after` with budget left get their retry
    /// counter bumped and timestamp reset; messages over budget are removed
    /// and returned so the caller can surface the delivery failure.
    pub fn retry_stale(&mut self, stale_after: Duration) -> (usize, Vec<Message>) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .unconfirmed
            .values()
            .filter(|m| now.duration_since(m.sent_at) >= stale_after)
            .map(|m| m.id.clone())
            .collect();

        let mut requeued = 0;
        let mut failed = Vec::new();

        for id in stale {
            let Some(mut message) = self.unconfirmed.remove(&id) else {
                continue;
            };
            if message.retry_count < message.max_retries {
                message.retry_count += 1;
                message.sent_at = now;
                self.pending.push_back(message);
                requeued += 1;
            } else {
                failed.push(message);
            }
        }

        (requeued, failed)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed.len()
    }
}
