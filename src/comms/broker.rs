//! Message broker: per-recipient priority queues with pub/sub fan-out
//!
//! The broker owns every queued message until the consumer acknowledges it.
//! Delivery order within one recipient queue is priority-descending, then
//! insertion order. Expired messages are diverted to the dead-letter queue
//! at publish time and silently discarded at dequeue time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::comms::message::Message;
use crate::domain_types::{AgentId, MessageId, QueueBound};

/// Error type subscribers may surface; the broker logs and moves on
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Callback interface invoked once per message delivered to a recipient
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    /// Handles one inbound message.
    ///
    /// A returned error is logged by the broker and never interrupts
    /// delivery to other subscribers.
    async fn on_message(&self, message: Message) -> Result<(), SubscriberError>;
}

/// Transport contract between the communication manager and a queue backend
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Opens backend resources, if any
    async fn connect(&self) {}

    /// Releases backend resources, if any
    async fn disconnect(&self) {}

    /// Enqueues a message for its recipient and fans it out to subscribers.
    ///
    /// Returns `false` when the message is already expired (it is routed to
    /// the dead-letter queue) or when the recipient queue cannot accept it.
    /// Never blocks indefinitely and never raises to the caller.
    async fn publish(&self, message: Message) -> bool;

    /// Registers a subscriber invoked once per message delivered to
    /// `recipient`; multiple subscribers fan out.
    async fn subscribe(&self, recipient: &AgentId, subscriber: Arc<dyn MessageSubscriber>);

    /// Pops the next message for `recipient`.
    ///
    /// `timeout` of zero polls without blocking; `None` waits indefinitely.
    /// A returned message moves into the pending-ack set until
    /// [`MessageBroker::acknowledge`] is called for it.
    async fn get_message(&self, recipient: &AgentId, timeout: Option<Duration>) -> Option<Message>;

    /// Removes a message from the pending-ack set.
    ///
    /// Idempotent; returns whether an entry was removed.
    async fn acknowledge(&self, message_id: &MessageId) -> bool;

    /// Current depth of the recipient's queue
    async fn queue_size(&self, recipient: &AgentId) -> usize;

    /// Snapshot of dead-lettered messages, oldest first
    async fn dead_letters(&self) -> Vec<Message>;

    /// Requeues pending-ack messages dequeued more than `older_than` ago.
    ///
    /// Returns the number of messages moved back onto their queues. Expired
    /// stragglers are dead-lettered instead of requeued.
    async fn redeliver_unacknowledged(&self, older_than: Duration) -> usize;
}

/// Queue entry; the sequence number realizes insertion order within a
/// priority level.
struct QueuedMessage {
    seq: u64,
    message: Message,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, earlier enqueue breaks ties.
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct RecipientQueue {
    heap: Mutex<BinaryHeap<QueuedMessage>>,
    notify: Notify,
}

impl RecipientQueue {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }
}

struct PendingAck {
    message: Message,
    dequeued_at: SystemTime,
}

/// In-process broker backed by per-recipient binary heaps.
///
/// Subscriber callbacks run synchronously on the publisher's task; an error
/// in one subscriber is logged and does not block delivery to the others.
pub struct InMemoryMessageBroker {
    queues: DashMap<AgentId, Arc<RecipientQueue>>,
    subscribers: DashMap<AgentId, Vec<Arc<dyn MessageSubscriber>>>,
    pending_acks: DashMap<MessageId, PendingAck>,
    dead_letter: Mutex<Vec<Message>>,
    seq: AtomicU64,
    bound: Option<QueueBound>,
}

impl InMemoryMessageBroker {
    /// Creates an unbounded broker
    #[must_use]
    pub fn new() -> Self {
        Self::with_bound(None)
    }

    /// Creates a broker whose recipient queues reject messages at `bound`
    #[must_use]
    pub fn with_bound(bound: Option<QueueBound>) -> Self {
        Self {
            queues: DashMap::new(),
            subscribers: DashMap::new(),
            pending_acks: DashMap::new(),
            dead_letter: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            bound,
        }
    }

    fn queue(&self, recipient: &AgentId) -> Arc<RecipientQueue> {
        self.queues
            .entry(recipient.clone())
            .or_insert_with(|| Arc::new(RecipientQueue::new()))
            .clone()
    }

    fn dead_letter_message(&self, message: Message) {
        let mut dead = self.dead_letter.lock().unwrap_or_else(|e| e.into_inner());
        dead.push(message);
    }

    fn enqueue(&self, queue: &RecipientQueue, message: Message) -> bool {
        let mut heap = queue.heap.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bound) = self.bound {
            if heap.len() >= bound.as_usize() {
                return false;
            }
        }
        heap.push(QueuedMessage {
            seq: self.seq.fetch_add(1, atomic::Ordering::Relaxed),
            message,
        });
        true
    }

    async fn notify_subscribers(&self, message: &Message) {
        let subscribers = self
            .subscribers
            .get(&message.recipient)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for subscriber in subscribers {
            if let Err(err) = subscriber.on_message(message.clone()).await {
                error!(
                    recipient = %message.recipient,
                    message_id = %message.message_id,
                    error = %err,
                    "subscriber callback failed"
                );
            }
        }
    }
}

impl Default for InMemoryMessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryMessageBroker {
    async fn publish(&self, message: Message) -> bool {
        if message.is_expired() {
            warn!(message_id = %message.message_id, "message expired before publish");
            self.dead_letter_message(message);
            return false;
        }

        let queue = self.queue(&message.recipient);
        if !self.enqueue(&queue, message.clone()) {
            warn!(
                recipient = %message.recipient,
                message_id = %message.message_id,
                "recipient queue full, rejecting message"
            );
            return false;
        }
        queue.notify.notify_one();

        self.notify_subscribers(&message).await;

        debug!(
            message_id = %message.message_id,
            sender = %message.sender,
            recipient = %message.recipient,
            "published message"
        );
        true
    }

    async fn subscribe(&self, recipient: &AgentId, subscriber: Arc<dyn MessageSubscriber>) {
        self.subscribers
            .entry(recipient.clone())
            .or_default()
            .push(subscriber);
        debug!(recipient = %recipient, "subscriber registered");
    }

    async fn get_message(&self, recipient: &AgentId, timeout: Option<Duration>) -> Option<Message> {
        let queue = self.queue(recipient);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let popped = {
                let mut heap = queue.heap.lock().unwrap_or_else(|e| e.into_inner());
                let mut next = None;
                while let Some(entry) = heap.pop() {
                    if entry.message.is_expired() {
                        debug!(
                            message_id = %entry.message.message_id,
                            "discarding expired message on dequeue"
                        );
                        continue;
                    }
                    next = Some(entry.message);
                    break;
                }
                next
            };

            if let Some(message) = popped {
                self.pending_acks.insert(
                    message.message_id,
                    PendingAck {
                        message: message.clone(),
                        dequeued_at: SystemTime::now(),
                    },
                );
                return Some(message);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let _ = tokio::time::timeout_at(deadline, queue.notify.notified()).await;
                }
                None => queue.notify.notified().await,
            }
        }
    }

    async fn acknowledge(&self, message_id: &MessageId) -> bool {
        let removed = self.pending_acks.remove(message_id).is_some();
        if removed {
            debug!(message_id = %message_id, "message acknowledged");
        }
        removed
    }

    async fn queue_size(&self, recipient: &AgentId) -> usize {
        self.queues
            .get(recipient)
            .map(|queue| queue.heap.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    async fn dead_letters(&self) -> Vec<Message> {
        self.dead_letter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn redeliver_unacknowledged(&self, older_than: Duration) -> usize {
        let cutoff = SystemTime::now() - older_than;
        let stale: Vec<MessageId> = self
            .pending_acks
            .iter()
            .filter(|entry| entry.dequeued_at <= cutoff)
            .map(|entry| *entry.key())
            .collect();

        let mut moved = 0;
        for message_id in stale {
            let Some((_, pending)) = self.pending_acks.remove(&message_id) else {
                continue;
            };
            if pending.message.is_expired() {
                self.dead_letter_message(pending.message);
                continue;
            }
            let queue = self.queue(&pending.message.recipient);
            if self.enqueue(&queue, pending.message) {
                queue.notify.notify_one();
                moved += 1;
            }
        }
        if moved > 0 {
            warn!(count = moved, "redelivered unacknowledged messages");
        }
        moved
    }
}
