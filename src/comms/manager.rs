//! High-level send/request/broadcast/register API over the broker
//!
//! The communication manager is the only surface the orchestrator talks to.
//! It composes the broker, state store, retry handler, and monitoring into
//! one façade: fire-and-forget sends, correlated request/response with
//! pending futures, broadcasts to registered agents, and per-agent state
//! helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::comms::broker::{MessageBroker, MessageSubscriber, SubscriberError};
use crate::comms::config::CommsConfig;
use crate::comms::message::{Message, MessagePriority, MessageType};
use crate::comms::monitoring::{
    MessageAnalytics, MessageTrace, MessageTracer, MetricsSummary, PerformanceMetrics,
    QueueMonitor, QueueStats,
};
use crate::comms::retry::{CircuitBreaker, RetryHandler};
use crate::comms::state::{StateCategory, StateStore};
use crate::domain_types::{AgentId, CorrelationId};

/// Per-type inbound message handler installed by an agent
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one inbound message addressed to the owning agent
    async fn handle(&self, message: Message);
}

struct FnMessageHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnMessageHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, message: Message) {
        (self.0)(message).await;
    }
}

/// Wraps an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(FnMessageHandler(f))
}

/// Registration metadata for a participant
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentInfo {
    /// The agent's bus address
    pub agent_id: AgentId,
    /// Free-form type tag used for broadcast filtering
    pub agent_type: String,
    /// Capability labels, informational
    pub capabilities: Vec<String>,
    /// When the agent registered
    pub registered_at: std::time::SystemTime,
}

struct AgentRegistration {
    info: AgentInfo,
    active: Arc<AtomicBool>,
}

/// Outbound message before it is stamped into an envelope
#[derive(Debug, Clone)]
pub struct AgentMessage {
    /// Originating agent
    pub sender: AgentId,
    /// Destination agent
    pub recipient: AgentId,
    /// Envelope kind
    pub message_type: MessageType,
    /// Structured payload
    pub payload: Value,
    /// Delivery priority
    pub priority: MessagePriority,
    /// Correlation id for request/response pairing
    pub correlation_id: Option<CorrelationId>,
    /// Address responses should go to
    pub reply_to: Option<AgentId>,
    /// Expiry TTL stamped onto the envelope
    pub timeout: Option<Duration>,
}

impl AgentMessage {
    /// A plain notification with default priority
    #[must_use]
    pub fn notification(sender: AgentId, recipient: AgentId, payload: Value) -> Self {
        Self {
            sender,
            recipient,
            message_type: MessageType::Notification,
            payload,
            priority: MessagePriority::default(),
            correlation_id: None,
            reply_to: None,
            timeout: None,
        }
    }

    fn into_envelope(self) -> Message {
        let mut message = Message::new(
            self.sender,
            self.recipient,
            self.message_type,
            self.payload,
        )
        .with_priority(self.priority);
        if let Some(correlation_id) = self.correlation_id {
            message = message.with_correlation(correlation_id);
        }
        if let Some(reply_to) = self.reply_to {
            message = message.with_reply_to(reply_to);
        }
        if let Some(timeout) = self.timeout {
            message = message.expires_in(timeout);
        }
        message
    }
}

#[derive(Debug, Error)]
#[error("broker rejected publish")]
struct PublishRejected;

type PendingRequests = Arc<DashMap<CorrelationId, oneshot::Sender<Value>>>;
type HandlerMap = Arc<DashMap<(AgentId, MessageType), Arc<dyn MessageHandler>>>;

/// Routes one recipient's inbound messages to pending futures or handlers
struct InboundDispatcher {
    recipient: AgentId,
    active: Arc<AtomicBool>,
    pending: PendingRequests,
    handlers: HandlerMap,
    tracer: Arc<MessageTracer>,
    queue_monitor: Arc<QueueMonitor>,
    metrics: Arc<PerformanceMetrics>,
}

#[async_trait]
impl MessageSubscriber for InboundDispatcher {
    async fn on_message(&self, message: Message) -> Result<(), SubscriberError> {
        if !self.active.load(Ordering::Acquire) {
            return Ok(());
        }
        let started = Instant::now();
        let message_id = message.message_id;
        self.queue_monitor.record_dequeue(&self.recipient);
        self.tracer
            .record_hop(&message_id, format!("dispatched_to_{}", self.recipient));

        // A correlated response resolves exactly one pending future and
        // bypasses handler fan-out.
        if message.message_type == MessageType::Response {
            if let Some(correlation_id) = message.correlation_id {
                if let Some((_, waiter)) = self.pending.remove(&correlation_id) {
                    self.tracer.mark_acknowledged(&message_id);
                    let elapsed = started.elapsed();
                    self.tracer
                        .record_processing_time(&message_id, "dispatch", elapsed);
                    self.metrics.record_processing_time(elapsed);
                    let _ = waiter.send(message.payload);
                    return Ok(());
                }
            }
        }

        let handler = self
            .handlers
            .get(&(self.recipient.clone(), message.message_type))
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => {
                handler.handle(message).await;
                let elapsed = started.elapsed();
                self.tracer
                    .record_processing_time(&message_id, "dispatch", elapsed);
                self.metrics.record_processing_time(elapsed);
            }
            None => {
                warn!(
                    agent = %self.recipient,
                    message_type = ?message.message_type,
                    message_id = %message_id,
                    "no handler for message type, dropping"
                );
            }
        }
        Ok(())
    }
}

/// High-level API for inter-agent communication
pub struct CommunicationManager {
    broker: Arc<dyn MessageBroker>,
    state: Arc<dyn StateStore>,
    retry: RetryHandler,
    tracer: Arc<MessageTracer>,
    queue_monitor: Arc<QueueMonitor>,
    metrics: Arc<PerformanceMetrics>,
    agents: DashMap<AgentId, AgentRegistration>,
    handlers: HandlerMap,
    pending: PendingRequests,
    default_request_timeout: Duration,
}

impl CommunicationManager {
    /// Creates a manager over the given broker and state store
    #[must_use]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        state: Arc<dyn StateStore>,
        config: &CommsConfig,
    ) -> Self {
        let metrics = Arc::new(PerformanceMetrics::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let retry = RetryHandler::new(config.retry_policy.clone(), breaker)
            .with_metrics(Arc::clone(&metrics));
        Self {
            broker,
            state,
            retry,
            tracer: Arc::new(MessageTracer::new(config.max_traces)),
            queue_monitor: Arc::new(QueueMonitor::new()),
            metrics,
            agents: DashMap::new(),
            handlers: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            default_request_timeout: config.default_request_timeout,
        }
    }

    /// Convenience constructor wiring the in-memory broker and state store
    #[must_use]
    pub fn in_memory(config: &CommsConfig) -> Self {
        let broker = Arc::new(crate::comms::broker::InMemoryMessageBroker::with_bound(
            config.queue_bound,
        ));
        let state = Arc::new(crate::comms::state::InMemoryStateStore::new());
        Self::new(broker, state, config)
    }

    /// Opens the underlying broker and state store
    pub async fn connect(&self) {
        self.broker.connect().await;
        self.state.connect().await;
        info!("communication manager connected");
    }

    /// Closes the underlying broker and state store
    pub async fn disconnect(&self) {
        self.state.disconnect().await;
        self.broker.disconnect().await;
        info!("communication manager disconnected");
    }

    /// Registers an agent: subscribes its inbound queue and mirrors its
    /// metadata into the state store.
    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
    ) {
        let info = AgentInfo {
            agent_id: agent_id.clone(),
            agent_type: agent_type.into(),
            capabilities,
            registered_at: std::time::SystemTime::now(),
        };

        let active = Arc::new(AtomicBool::new(true));
        let already_registered = self.agents.contains_key(&agent_id);
        self.agents.insert(
            agent_id.clone(),
            AgentRegistration {
                info: info.clone(),
                active: Arc::clone(&active),
            },
        );

        // An earlier dispatcher may still sit in the broker's subscriber
        // list after a register/unregister cycle; it was deactivated, so a
        // fresh one is always installed here.
        if !already_registered {
            let dispatcher = Arc::new(InboundDispatcher {
                recipient: agent_id.clone(),
                active,
                pending: Arc::clone(&self.pending),
                handlers: Arc::clone(&self.handlers),
                tracer: Arc::clone(&self.tracer),
                queue_monitor: Arc::clone(&self.queue_monitor),
                metrics: Arc::clone(&self.metrics),
            });
            self.broker.subscribe(&agent_id, dispatcher).await;
        }

        let state_value = serde_json::to_value(&info).unwrap_or(Value::Null);
        self.state
            .set(
                &format!("agent:{agent_id}:info"),
                state_value,
                StateCategory::Agent,
                None,
            )
            .await;

        info!(agent_id = %agent_id, agent_type = %info.agent_type, "agent registered");
    }

    /// Unregisters an agent, deactivating its subscription and removing its
    /// state. A second call for the same agent is a no-op.
    pub async fn unregister_agent(&self, agent_id: &AgentId) {
        if let Some((_, registration)) = self.agents.remove(agent_id) {
            registration.active.store(false, Ordering::Release);
            self.state.delete(&format!("agent:{agent_id}:info")).await;
            info!(agent_id = %agent_id, "agent unregistered");
        }
    }

    /// Installs a per-type handler for an agent's inbound messages.
    ///
    /// Registering a second handler for the same (agent, type) replaces the
    /// first; the replacement is logged.
    pub fn register_handler(
        &self,
        agent_id: AgentId,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) {
        let replaced = self
            .handlers
            .insert((agent_id.clone(), message_type), handler)
            .is_some();
        if replaced {
            warn!(
                agent_id = %agent_id,
                message_type = ?message_type,
                "handler replaced, last registration wins"
            );
        } else {
            debug!(agent_id = %agent_id, message_type = ?message_type, "handler registered");
        }
    }

    /// Fire-and-forget send; returns delivery success.
    ///
    /// The publish goes through the retry handler and circuit breaker; the
    /// message is traced and the recipient's queue gauge updated.
    pub async fn send_message(&self, message: AgentMessage) -> bool {
        let started = Instant::now();
        let envelope = message.into_envelope();
        let message_id = envelope.message_id;

        self.tracer.start_trace(
            message_id,
            &envelope.sender,
            &envelope.recipient,
            envelope.message_type,
            envelope.correlation_id,
        );
        self.queue_monitor.record_enqueue(&envelope.recipient);
        self.tracer
            .record_hop(&message_id, format!("queued_for_{}", envelope.recipient));

        let broker = Arc::clone(&self.broker);
        let result = self
            .retry
            .execute(|| {
                let broker = Arc::clone(&broker);
                let envelope = envelope.clone();
                async move {
                    if broker.publish(envelope).await {
                        Ok(())
                    } else {
                        Err(PublishRejected)
                    }
                }
            })
            .await;

        self.metrics.record_latency(started.elapsed());

        match result {
            Ok(()) => {
                self.tracer.mark_delivered(&message_id);
                debug!(
                    message_id = %message_id,
                    recipient = %envelope.recipient,
                    "message sent"
                );
                true
            }
            Err(err) => {
                self.tracer.mark_failed(&message_id, err.to_string());
                self.metrics.record_error();
                warn!(message_id = %message_id, error = %err, "message send failed");
                false
            }
        }
    }

    /// Sends a request and waits up to `timeout` for the correlated
    /// response.
    ///
    /// Returns `None` on publish failure or timeout. On timeout the pending
    /// future is removed before returning, so a late response for the same
    /// correlation id is dropped.
    pub async fn send_request(
        &self,
        sender: &AgentId,
        recipient: &AgentId,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let timeout = timeout.unwrap_or(self.default_request_timeout);
        let correlation_id = CorrelationId::generate();
        let (waiter, response) = oneshot::channel();
        self.pending.insert(correlation_id, waiter);

        let message = AgentMessage {
            sender: sender.clone(),
            recipient: recipient.clone(),
            message_type: MessageType::Request,
            payload,
            priority: MessagePriority::default(),
            correlation_id: Some(correlation_id),
            reply_to: Some(sender.clone()),
            timeout: Some(timeout),
        };

        if !self.send_message(message).await {
            self.pending.remove(&correlation_id);
            return None;
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(payload)) => Some(payload),
            Ok(Err(_closed)) => None,
            Err(_elapsed) => {
                // Remove before returning: the delivery path must never be
                // able to resolve this correlation id afterwards.
                self.pending.remove(&correlation_id);
                self.metrics.record_timeout();
                warn!(
                    correlation_id = %correlation_id,
                    recipient = %recipient,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                None
            }
        }
    }

    /// Sends a response to a request, addressed to its reply-to and
    /// carrying its correlation id. Logs and drops when either is missing.
    pub async fn send_response(&self, request: &Message, payload: Value) -> bool {
        let (Some(reply_to), Some(correlation_id)) =
            (request.reply_to.clone(), request.correlation_id)
        else {
            warn!(
                message_id = %request.message_id,
                "cannot respond: request has no reply_to or correlation_id"
            );
            return false;
        };

        self.send_message(AgentMessage {
            sender: request.recipient.clone(),
            recipient: reply_to,
            message_type: MessageType::Response,
            payload,
            priority: MessagePriority::default(),
            correlation_id: Some(correlation_id),
            reply_to: None,
            timeout: None,
        })
        .await
    }

    /// Sends a notification to every currently-registered agent except the
    /// sender, optionally filtered by agent type. Returns how many were
    /// sent.
    pub async fn broadcast(
        &self,
        sender: &AgentId,
        payload: Value,
        agent_type: Option<&str>,
    ) -> usize {
        let recipients: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|entry| entry.key() != sender)
            .filter(|entry| {
                agent_type
                    .map(|t| entry.info.agent_type == t)
                    .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut sent = 0;
        for recipient in recipients {
            if self
                .send_message(AgentMessage::notification(
                    sender.clone(),
                    recipient,
                    payload.clone(),
                ))
                .await
            {
                sent += 1;
            }
        }
        info!(sender = %sender, recipients = sent, "broadcast sent");
        sent
    }

    /// Writes a namespaced state value for an agent
    pub async fn set_agent_state(
        &self,
        agent_id: &AgentId,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> bool {
        self.state
            .set(
                &format!("agent:{agent_id}:{key}"),
                value,
                StateCategory::Agent,
                ttl,
            )
            .await
    }

    /// Reads a namespaced state value for an agent
    pub async fn get_agent_state(&self, agent_id: &AgentId, key: &str) -> Option<Value> {
        self.state.get(&format!("agent:{agent_id}:{key}")).await
    }

    /// Registration metadata for one agent
    #[must_use]
    pub fn get_agent_info(&self, agent_id: &AgentId) -> Option<AgentInfo> {
        self.agents.get(agent_id).map(|entry| entry.info.clone())
    }

    /// Snapshot of all currently-registered agents
    #[must_use]
    pub fn get_all_agents(&self) -> Vec<AgentInfo> {
        self.agents
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Current depth of an agent's queue, from the broker
    pub async fn get_queue_size(&self, agent_id: &AgentId) -> usize {
        self.broker.queue_size(agent_id).await
    }

    /// Rolling latency and failure counters
    #[must_use]
    pub fn performance_metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Aggregate message analytics from the tracer
    #[must_use]
    pub fn message_analytics(&self) -> MessageAnalytics {
        self.tracer.analytics()
    }

    /// Gauge statistics for one agent's queue
    #[must_use]
    pub fn queue_stats(&self, agent_id: &AgentId) -> QueueStats {
        self.queue_monitor.queue_stats(agent_id)
    }

    /// Gauge statistics for every tracked queue
    #[must_use]
    pub fn all_queue_stats(&self) -> HashMap<AgentId, QueueStats> {
        self.queue_monitor.all_queue_stats()
    }

    /// Lifecycle trace for one message
    #[must_use]
    pub fn message_trace(&self, message_id: &crate::domain_types::MessageId) -> Option<MessageTrace> {
        self.tracer.get_trace(message_id)
    }

    /// Most recent failed traces
    #[must_use]
    pub fn failed_messages(&self, limit: usize) -> Vec<MessageTrace> {
        self.tracer.failed_traces(limit)
    }

    /// Number of pending request futures; used by tests and monitoring
    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> Arc<CommunicationManager> {
        Arc::new(CommunicationManager::in_memory(&CommsConfig::testing()))
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let manager = manager();
        let orchestrator = AgentId::from("orchestrator");
        let worker = AgentId::from("worker");
        manager.register_agent(orchestrator.clone(), "orchestrator", vec![]).await;
        manager.register_agent(worker.clone(), "worker", vec![]).await;

        let responder = Arc::clone(&manager);
        manager.register_handler(
            worker.clone(),
            MessageType::Request,
            handler_fn(move |message| {
                let responder = Arc::clone(&responder);
                async move {
                    let echo = message.payload.clone();
                    responder
                        .send_response(&message, json!({"status": "success", "echo": echo}))
                        .await;
                }
            }),
        );

        let response = manager
            .send_request(
                &orchestrator,
                &worker,
                json!({"ping": 1}),
                Some(Duration::from_secs(1)),
            )
            .await
            .expect("response");
        assert_eq!(response["status"], "success");
        assert_eq!(manager.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_records_hops_and_processing_time() {
        let manager = manager();
        let orchestrator = AgentId::from("orchestrator");
        let worker = AgentId::from("worker");
        manager.register_agent(orchestrator.clone(), "orchestrator", vec![]).await;
        manager.register_agent(worker.clone(), "worker", vec![]).await;

        let responder = Arc::clone(&manager);
        manager.register_handler(
            worker.clone(),
            MessageType::Request,
            handler_fn(move |message| {
                let responder = Arc::clone(&responder);
                async move {
                    responder
                        .send_response(&message, json!({"status": "success"}))
                        .await;
                }
            }),
        );

        manager
            .send_request(
                &orchestrator,
                &worker,
                json!({"ping": 1}),
                Some(Duration::from_secs(1)),
            )
            .await
            .expect("response");

        let traces = manager.tracer.recent_traces(10);
        let request_trace = traces
            .iter()
            .find(|t| t.message_type == MessageType::Request)
            .expect("request trace");
        assert!(request_trace
            .route
            .iter()
            .any(|hop| hop == "queued_for_worker"));
        assert!(request_trace
            .route
            .iter()
            .any(|hop| hop == "dispatched_to_worker"));
        assert!(request_trace.processing_times.contains_key("dispatch"));

        let summary = manager.performance_metrics();
        assert!(summary.avg_processing_time_ms > 0.0);
        assert!(manager.message_analytics().avg_processing_time > 0.0);
    }

    #[tokio::test]
    async fn request_times_out_and_removes_pending_future() {
        let manager = manager();
        let orchestrator = AgentId::from("orchestrator");
        let silent = AgentId::from("silent_agent");
        manager.register_agent(orchestrator.clone(), "orchestrator", vec![]).await;
        manager.register_agent(silent.clone(), "worker", vec![]).await;

        let response = manager
            .send_request(
                &orchestrator,
                &silent,
                json!({}),
                Some(Duration::from_millis(30)),
            )
            .await;
        assert!(response.is_none());
        assert_eq!(manager.pending_request_count(), 0);
        assert_eq!(manager.performance_metrics().timeout_count, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_agents_except_sender() {
        let manager = manager();
        let sender = AgentId::from("orchestrator");
        manager.register_agent(sender.clone(), "orchestrator", vec![]).await;
        manager.register_agent(AgentId::from("a"), "worker", vec![]).await;
        manager.register_agent(AgentId::from("b"), "worker", vec![]).await;
        manager.register_agent(AgentId::from("c"), "observer", vec![]).await;

        let sent = manager.broadcast(&sender, json!({"event": "hello"}), None).await;
        assert_eq!(sent, 3);

        let workers_only = manager
            .broadcast(&sender, json!({"event": "hello"}), Some("worker"))
            .await;
        assert_eq!(workers_only, 2);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_stops_delivery() {
        let manager = manager();
        let agent = AgentId::from("ephemeral");
        manager.register_agent(agent.clone(), "worker", vec![]).await;
        assert!(manager.get_agent_info(&agent).is_some());

        manager.unregister_agent(&agent).await;
        manager.unregister_agent(&agent).await;
        assert!(manager.get_agent_info(&agent).is_none());
        assert!(manager.get_agent_state(&agent, "info").await.is_none());
    }

    #[tokio::test]
    async fn agent_state_helpers_are_namespaced() {
        let manager = manager();
        let agent = AgentId::from("stateful");
        assert!(
            manager
                .set_agent_state(&agent, "current_stage", json!("parsing"), None)
                .await
        );
        assert_eq!(
            manager.get_agent_state(&agent, "current_stage").await,
            Some(json!("parsing"))
        );
        assert!(manager.get_agent_state(&agent, "other").await.is_none());
    }
}
