//! Broker contract tests: ordering, acknowledgement, expiry, fan-out

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use proptest::prelude::*;
use serde_json::json;
use tenderflow::comms::broker::{MessageSubscriber, SubscriberError};
use tenderflow::comms::{InMemoryMessageBroker, Message, MessageBroker, MessagePriority, MessageType};
use tenderflow::domain_types::AgentId;

fn message_with_priority(recipient: &str, priority: MessagePriority) -> Message {
    Message::new(
        AgentId::from("sender"),
        AgentId::from(recipient),
        MessageType::Notification,
        json!({"priority": u8::from(priority)}),
    )
    .with_priority(priority)
}

#[tokio::test]
async fn urgent_normal_low_dequeue_in_priority_order() {
    let broker = InMemoryMessageBroker::new();
    let recipient = AgentId::from("worker");

    // Published low, urgent, normal; dequeued urgent, normal, low.
    for priority in [
        MessagePriority::Low,
        MessagePriority::Urgent,
        MessagePriority::Normal,
    ] {
        assert!(broker.publish(message_with_priority("worker", priority)).await);
    }

    let mut order = Vec::new();
    while let Some(message) = broker.get_message(&recipient, Some(Duration::ZERO)).await {
        order.push(message.priority);
    }
    assert_eq!(
        order,
        vec![
            MessagePriority::Urgent,
            MessagePriority::Normal,
            MessagePriority::Low
        ]
    );
}

#[tokio::test]
async fn blocking_get_message_wakes_on_publish() {
    let broker = Arc::new(InMemoryMessageBroker::new());
    let recipient = AgentId::from("worker");

    let waiter = {
        let broker = Arc::clone(&broker);
        let recipient = recipient.clone();
        tokio::spawn(async move {
            broker
                .get_message(&recipient, Some(Duration::from_secs(2)))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(
        broker
            .publish(message_with_priority("worker", MessagePriority::Normal))
            .await
    );

    let message = waiter.await.expect("join").expect("message delivered");
    assert_eq!(message.recipient, recipient);
}

#[tokio::test]
async fn dequeued_message_sits_in_pending_ack_until_acknowledged() {
    let broker = InMemoryMessageBroker::new();
    let recipient = AgentId::from("worker");
    broker
        .publish(message_with_priority("worker", MessagePriority::Normal))
        .await;

    let message = broker
        .get_message(&recipient, Some(Duration::ZERO))
        .await
        .expect("message");

    // Not yet acknowledged: redelivery would find it.
    assert!(broker.acknowledge(&message.message_id).await);
    // Second acknowledge is a no-op.
    assert!(!broker.acknowledge(&message.message_id).await);
    // Acknowledged: nothing left to redeliver.
    assert_eq!(broker.redeliver_unacknowledged(Duration::ZERO).await, 0);
}

#[tokio::test]
async fn expired_on_dequeue_is_discarded_and_next_returned() {
    let broker = InMemoryMessageBroker::new();
    let recipient = AgentId::from("worker");

    let mut doomed = message_with_priority("worker", MessagePriority::Urgent);
    doomed.expiry = Some(SystemTime::now() + Duration::from_millis(20));
    let survivor = message_with_priority("worker", MessagePriority::Normal);
    let survivor_id = survivor.message_id;

    assert!(broker.publish(doomed).await);
    assert!(broker.publish(survivor).await);

    tokio::time::sleep(Duration::from_millis(40)).await;

    let message = broker
        .get_message(&recipient, Some(Duration::ZERO))
        .await
        .expect("survivor delivered");
    assert_eq!(message.message_id, survivor_id);
    assert!(broker.get_message(&recipient, Some(Duration::ZERO)).await.is_none());
}

struct Recorder {
    seen: tokio::sync::Mutex<Vec<Message>>,
    fail: bool,
}

#[async_trait::async_trait]
impl MessageSubscriber for Recorder {
    async fn on_message(&self, message: Message) -> Result<(), SubscriberError> {
        if self.fail {
            return Err("subscriber exploded".into());
        }
        self.seen.lock().await.push(message);
        Ok(())
    }
}

#[tokio::test]
async fn subscriber_errors_do_not_block_other_subscribers() {
    let broker = InMemoryMessageBroker::new();
    let recipient = AgentId::from("worker");

    let failing = Arc::new(Recorder {
        seen: tokio::sync::Mutex::new(Vec::new()),
        fail: true,
    });
    let healthy = Arc::new(Recorder {
        seen: tokio::sync::Mutex::new(Vec::new()),
        fail: false,
    });
    broker.subscribe(&recipient, failing.clone()).await;
    broker.subscribe(&recipient, healthy.clone()).await;

    assert!(
        broker
            .publish(message_with_priority("worker", MessagePriority::Normal))
            .await
    );

    assert_eq!(healthy.seen.lock().await.len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// For any publish order, dequeue order is priority-descending and
    /// insertion-ordered within each priority level.
    #[test]
    fn dequeue_order_is_priority_desc_then_fifo(raw in prop::collection::vec(1u8..=4, 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let broker = InMemoryMessageBroker::new();
            let recipient = AgentId::from("worker");

            let mut expected: Vec<(u8, usize)> = Vec::new();
            for (index, level) in raw.iter().enumerate() {
                let priority = MessagePriority::try_from(*level).expect("valid priority");
                let mut message = message_with_priority("worker", priority);
                message.metadata.insert("index".to_owned(), json!(index));
                expected.push((*level, index));
                assert!(broker.publish(message).await);
            }
            // Priority descending, then insertion order ascending.
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            let mut actual = Vec::new();
            while let Some(message) = broker.get_message(&recipient, Some(Duration::ZERO)).await {
                let index = message.metadata["index"].as_u64().expect("index") as usize;
                actual.push((u8::from(message.priority), index));
            }
            assert_eq!(actual, expected);
        });
    }
}
