//! Durable broker backed by an embedded ordered keyspace
//!
//! Queue entries live in one `sled` tree per recipient, keyed so that
//! lexicographic order is priority-descending then enqueue-time-ascending:
//! `[0xFF - priority][enqueue_micros BE][seq BE]`. The pending-ack set and
//! the dead-letter queue are separate trees, so unacknowledged and
//! undeliverable messages survive a process restart.
//!
//! Subscriber dispatch stays in-process: a single orchestrator instance
//! owns each workflow, so cross-process notification is not needed here.

use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::Tree;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::comms::broker::{MessageBroker, MessageSubscriber};
use crate::comms::message::Message;
use crate::domain_types::{AgentId, MessageId};

const PENDING_TREE: &str = "pending_acks";
const DEAD_LETTER_TREE: &str = "dead_letter";

/// Pending-ack record persisted alongside the message
#[derive(Debug, Serialize, Deserialize)]
struct PendingRecord {
    message: Message,
    dequeued_at_micros: u64,
}

struct RecipientState {
    pop_lock: Mutex<()>,
    notify: Notify,
}

/// Broker persisting queues, pending acks, and dead letters to disk.
///
/// Interchangeable with [`crate::comms::broker::InMemoryMessageBroker`]
/// behind the [`MessageBroker`] contract.
pub struct SledMessageBroker {
    db: sled::Db,
    pending: Tree,
    dead_letter: Tree,
    recipients: DashMap<AgentId, Arc<RecipientState>>,
    subscribers: DashMap<AgentId, Vec<Arc<dyn MessageSubscriber>>>,
    seq: AtomicU64,
}

impl SledMessageBroker {
    /// Opens (or creates) a broker database at `path`
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        let pending = db.open_tree(PENDING_TREE)?;
        let dead_letter = db.open_tree(DEAD_LETTER_TREE)?;
        Ok(Self {
            db,
            pending,
            dead_letter,
            recipients: DashMap::new(),
            subscribers: DashMap::new(),
            seq: AtomicU64::new(0),
        })
    }

    fn queue_tree(&self, recipient: &AgentId) -> Result<Tree, sled::Error> {
        self.db.open_tree(format!("queue:{recipient}"))
    }

    fn recipient_state(&self, recipient: &AgentId) -> Arc<RecipientState> {
        self.recipients
            .entry(recipient.clone())
            .or_insert_with(|| {
                Arc::new(RecipientState {
                    pop_lock: Mutex::new(()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Composite ordering key: priority desc, enqueue time asc, then a
    /// process-local sequence for sub-microsecond ties.
    fn queue_key(&self, message: &Message, micros: u64) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[0] = 0xFF - u8::from(message.priority);
        key[1..9].copy_from_slice(&micros.to_be_bytes());
        key[9..17].copy_from_slice(
            &self
                .seq
                .fetch_add(1, atomic::Ordering::Relaxed)
                .to_be_bytes(),
        );
        key
    }

    fn dead_letter_message(&self, message: &Message) {
        let mut key = [0u8; 24];
        key[0..8].copy_from_slice(&Self::now_micros().to_be_bytes());
        key[8..24].copy_from_slice(uuid::Uuid::from(message.message_id).as_bytes());
        match serde_json::to_vec(message) {
            Ok(bytes) => {
                if let Err(err) = self.dead_letter.insert(key, bytes) {
                    error!(error = %err, "failed to persist dead letter");
                }
            }
            Err(err) => error!(error = %err, "failed to encode dead letter"),
        }
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

    fn pop_next(&self, tree: &Tree) -> Option<Message> {
        loop {
            let (key, value) = match tree.first() {
                Ok(Some(entry)) => entry,
                Ok(None) => return None,
                Err(err) => {
                    error!(error = %err, "queue read failed");
                    return None;
                }
            };
            if let Err(err) = tree.remove(&key) {
                error!(error = %err, "queue remove failed");
                return None;
            }
            match serde_json::from_slice::<Message>(&value) {
                Ok(message) if message.is_expired() => {
                    debug!(
                        message_id = %message.message_id,
                        "discarding expired message on dequeue"
                    );
                }
                Ok(message) => return Some(message),
                Err(err) => {
                    error!(error = %err, "dropping undecodable queue entry");
                }
            }
        }
    }
}

#[async_trait]
impl MessageBroker for SledMessageBroker {
    async fn disconnect(&self) {
        if let Err(err) = self.db.flush() {
            error!(error = %err, "failed to flush broker database");
        }
    }

    async fn publish(&self, message: Message) -> bool {
        if message.is_expired() {
            warn!(message_id = %message.message_id, "message expired before publish");
            self.dead_letter_message(&message);
            return false;
        }

        let tree = match self.queue_tree(&message.recipient) {
            Ok(tree) => tree,
            Err(err) => {
                error!(error = %err, recipient = %message.recipient, "queue open failed");
                return false;
            }
        };
        let bytes = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "failed to encode message");
                return false;
            }
        };
        let key = self.queue_key(&message, Self::now_micros());
        if let Err(err) = tree.insert(key, bytes) {
            error!(error = %err, recipient = %message.recipient, "queue insert failed");
            return false;
        }

        self.recipient_state(&message.recipient).notify.notify_one();
        self.notify_subscribers(&message).await;

        debug!(
            message_id = %message.message_id,
            recipient = %message.recipient,
            "published message to durable queue"
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
        let tree = match self.queue_tree(recipient) {
            Ok(tree) => tree,
            Err(err) => {
                error!(error = %err, recipient = %recipient, "queue open failed");
                return None;
            }
        };
        let state = self.recipient_state(recipient);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let popped = {
                let _guard = state.pop_lock.lock().await;
                self.pop_next(&tree)
            };

            if let Some(message) = popped {
                let record = PendingRecord {
                    dequeued_at_micros: Self::now_micros(),
                    message: message.clone(),
                };
                match serde_json::to_vec(&record) {
                    Ok(bytes) => {
                        let key = uuid::Uuid::from(message.message_id);
                        if let Err(err) = self.pending.insert(key.as_bytes(), bytes) {
                            error!(error = %err, "failed to persist pending ack");
                        }
                    }
                    Err(err) => error!(error = %err, "failed to encode pending ack"),
                }
                return Some(message);
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    let _ = tokio::time::timeout_at(deadline, state.notify.notified()).await;
                }
                None => state.notify.notified().await,
            }
        }
    }

    async fn acknowledge(&self, message_id: &MessageId) -> bool {
        let key = uuid::Uuid::from(*message_id);
        match self.pending.remove(key.as_bytes()) {
            Ok(Some(_)) => {
                debug!(message_id = %message_id, "message acknowledged");
                true
            }
            Ok(None) => false,
            Err(err) => {
                error!(error = %err, "pending ack remove failed");
                false
            }
        }
    }

    async fn queue_size(&self, recipient: &AgentId) -> usize {
        self.queue_tree(recipient)
            .map(|tree| tree.len())
            .unwrap_or(0)
    }

    async fn dead_letters(&self) -> Vec<Message> {
        self.dead_letter
            .iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
            .collect()
    }

    async fn redeliver_unacknowledged(&self, older_than: Duration) -> usize {
        let cutoff = Self::now_micros().saturating_sub(
            u64::try_from(older_than.as_micros()).unwrap_or(u64::MAX),
        );

        let stale: Vec<(sled::IVec, PendingRecord)> = self
            .pending
            .iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|(key, value)| {
                serde_json::from_slice::<PendingRecord>(&value)
                    .ok()
                    .map(|record| (key, record))
            })
            .filter(|(_, record)| record.dequeued_at_micros <= cutoff)
            .collect();

        let mut moved = 0;
        for (key, record) in stale {
            if let Err(err) = self.pending.remove(&key) {
                error!(error = %err, "pending ack remove failed");
                continue;
            }
            if record.message.is_expired() {
                self.dead_letter_message(&record.message);
                continue;
            }
            let recipient = record.message.recipient.clone();
            let Ok(tree) = self.queue_tree(&recipient) else {
                continue;
            };
            let Ok(bytes) = serde_json::to_vec(&record.message) else {
                continue;
            };
            let queue_key = self.queue_key(&record.message, Self::now_micros());
            if tree.insert(queue_key, bytes).is_ok() {
                self.recipient_state(&recipient).notify.notify_one();
                moved += 1;
            }
        }
        if moved > 0 {
            warn!(count = moved, "redelivered unacknowledged messages");
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message::{MessagePriority, MessageType};
    use serde_json::json;

    fn broker() -> SledMessageBroker {
        let dir = tempfile::tempdir().expect("tempdir");
        // Keep the directory alive for the duration of the test process.
        let path = dir.keep();
        SledMessageBroker::open(path).expect("open broker")
    }

    fn message_to(recipient: &str, priority: MessagePriority) -> Message {
        Message::new(
            AgentId::from("sender"),
            AgentId::from(recipient),
            MessageType::Notification,
            json!({"k": "v"}),
        )
        .with_priority(priority)
    }

    #[tokio::test]
    async fn priority_then_insertion_order() {
        let broker = broker();
        let recipient = AgentId::from("worker");

        let low = message_to("worker", MessagePriority::Low);
        let urgent = message_to("worker", MessagePriority::Urgent);
        let normal_a = message_to("worker", MessagePriority::Normal);
        let normal_b = message_to("worker", MessagePriority::Normal);
        let expected = vec![
            urgent.message_id,
            normal_a.message_id,
            normal_b.message_id,
            low.message_id,
        ];

        for message in [low, urgent, normal_a, normal_b] {
            assert!(broker.publish(message).await);
        }

        let mut order = Vec::new();
        while let Some(message) = broker.get_message(&recipient, Some(Duration::ZERO)).await {
            order.push(message.message_id);
        }
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn pending_ack_round_trip() {
        let broker = broker();
        let recipient = AgentId::from("worker");
        broker.publish(message_to("worker", MessagePriority::Normal)).await;

        let message = broker
            .get_message(&recipient, Some(Duration::ZERO))
            .await
            .expect("message");
        assert!(broker.acknowledge(&message.message_id).await);
        assert!(!broker.acknowledge(&message.message_id).await);
    }

    #[tokio::test]
    async fn expired_publish_is_dead_lettered() {
        let broker = broker();
        let mut message = message_to("worker", MessagePriority::Normal);
        message.expiry = Some(SystemTime::now() - Duration::from_secs(1));

        assert!(!broker.publish(message).await);
        assert_eq!(broker.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn unacknowledged_messages_can_be_redelivered() {
        let broker = broker();
        let recipient = AgentId::from("worker");
        broker.publish(message_to("worker", MessagePriority::Normal)).await;

        let first = broker
            .get_message(&recipient, Some(Duration::ZERO))
            .await
            .expect("message");
        assert!(broker.get_message(&recipient, Some(Duration::ZERO)).await.is_none());

        assert_eq!(broker.redeliver_unacknowledged(Duration::ZERO).await, 1);
        let second = broker
            .get_message(&recipient, Some(Duration::ZERO))
            .await
            .expect("redelivered");
        assert_eq!(second.message_id, first.message_id);
    }
}
