//! Inter-agent communication core
//!
//! Layered bottom-up: the [`message::Message`] envelope, the
//! [`broker::MessageBroker`] transport (in-process and durable variants),
//! the [`state::StateStore`], the [`retry`] reliability layer, the
//! [`monitoring`] observability layer, and the [`manager::CommunicationManager`]
//! façade that the workflow orchestrator talks to.

pub mod broker;
pub mod config;
pub mod durable;
pub mod manager;
pub mod message;
pub mod monitoring;
pub mod retry;
pub mod state;

pub use broker::{InMemoryMessageBroker, MessageBroker, MessageSubscriber};
pub use config::CommsConfig;
pub use durable::SledMessageBroker;
pub use manager::{handler_fn, AgentInfo, AgentMessage, CommunicationManager, MessageHandler};
pub use message::{Message, MessagePriority, MessageType};
pub use monitoring::{
    MessageAnalytics, MessageTrace, MessageTracer, MetricsSummary, PerformanceMetrics,
    QueueHealth, QueueMonitor, QueueStats, TraceStatus,
};
pub use retry::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryError, RetryHandler, RetryPolicy,
    RetryStrategy,
};
pub use state::{InMemoryStateStore, StateCategory, StateEntry, StateStore};
