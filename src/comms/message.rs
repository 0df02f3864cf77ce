//! Message envelope carried between participants
//!
//! The envelope is payload-agnostic: the broker moves a `serde_json::Value`
//! plus the routing and lifecycle fields defined here. Typed stage payloads
//! are (de)serialized at the orchestrator/agent boundary.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain_types::{AgentId, CorrelationId, MessageId};

/// Closed set of message kinds understood by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Asks the recipient to do work and reply with a correlated response
    Request,
    /// Carries the result of a request, matched by correlation id
    Response,
    /// One-way informational message (broadcasts use this)
    Notification,
    /// Imperative instruction with no reply expected
    Command,
    /// Something happened; subscribers decide whether they care
    Event,
    /// Error report from a participant
    Error,
}

/// Delivery priority; higher values dequeue first.
///
/// Encoded on the wire as the integer 1–4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessagePriority {
    /// Background traffic
    Low = 1,
    /// Default for all messages
    Normal = 2,
    /// Ahead of normal traffic
    High = 3,
    /// Jumps every other level
    Urgent = 4,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl From<MessagePriority> for u8 {
    fn from(priority: MessagePriority) -> Self {
        priority as u8
    }
}

/// Error raised when decoding an out-of-range priority byte
#[derive(Debug, Error)]
#[error("invalid message priority: {0} (expected 1-4)")]
pub struct InvalidPriority(u8);

impl TryFrom<u8> for MessagePriority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Urgent),
            other => Err(InvalidPriority(other)),
        }
    }
}

/// Envelope for a single message between two participants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique for the lifetime of the message
    pub message_id: MessageId,
    /// Originating participant
    pub sender: AgentId,
    /// Destination queue
    pub recipient: AgentId,
    /// Kind tag used for handler dispatch
    pub message_type: MessageType,
    /// Opaque structured payload
    pub payload: Value,
    /// Delivery priority
    #[serde(default)]
    pub priority: MessagePriority,
    /// Ties a response back to its request
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    /// Where the response to this message should be addressed
    #[serde(default)]
    pub reply_to: Option<AgentId>,
    /// Creation time
    pub timestamp: SystemTime,
    /// Absolute point after which the message must not be delivered
    #[serde(default)]
    pub expiry: Option<SystemTime>,
    /// Free-form annotations
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    /// Creates a message with a fresh id, the current timestamp, and
    /// defaults for every optional field.
    pub fn new(
        sender: AgentId,
        recipient: AgentId,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            sender,
            recipient,
            message_type,
            payload,
            priority: MessagePriority::default(),
            correlation_id: None,
            reply_to: None,
            timestamp: SystemTime::now(),
            expiry: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the delivery priority
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the correlation id
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the reply-to address
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: AgentId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Sets an absolute expiry `ttl` from now
    #[must_use]
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expiry = Some(SystemTime::now() + ttl);
        self
    }

    /// Whether the expiry deadline has passed.
    ///
    /// Messages without an expiry never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(deadline) => SystemTime::now() > deadline,
            None => false,
        }
    }

    /// Serializes the envelope to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes an envelope from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        Message::new(
            AgentId::from("orchestrator"),
            AgentId::from("pricing_agent"),
            MessageType::Request,
            json!({"workflow_id": "wf-1", "line_items": []}),
        )
        .with_priority(MessagePriority::High)
        .with_correlation(CorrelationId::generate())
        .with_reply_to(AgentId::from("orchestrator"))
        .expires_in(Duration::from_secs(30))
    }

    #[test]
    fn json_round_trip_preserves_every_field() {
        let original = sample();
        let encoded = original.to_json().expect("serialize");
        let decoded = Message::from_json(&encoded).expect("deserialize");

        assert_eq!(decoded.message_id, original.message_id);
        assert_eq!(decoded.sender, original.sender);
        assert_eq!(decoded.recipient, original.recipient);
        assert_eq!(decoded.message_type, original.message_type);
        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.priority, original.priority);
        assert_eq!(decoded.correlation_id, original.correlation_id);
        assert_eq!(decoded.reply_to, original.reply_to);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.expiry, original.expiry);
        assert_eq!(decoded.metadata, original.metadata);
    }

    #[test]
    fn priority_encodes_as_integer() {
        let encoded = serde_json::to_value(MessagePriority::Urgent).expect("serialize");
        assert_eq!(encoded, json!(4));
        let decoded: MessagePriority = serde_json::from_value(json!(1)).expect("deserialize");
        assert_eq!(decoded, MessagePriority::Low);
        assert!(serde_json::from_value::<MessagePriority>(json!(9)).is_err());
    }

    #[test]
    fn expiry_is_checked_against_wall_clock() {
        let mut message = sample();
        assert!(!message.is_expired());
        message.expiry = Some(SystemTime::now() - Duration::from_secs(1));
        assert!(message.is_expired());
        message.expiry = None;
        assert!(!message.is_expired());
    }

    #[test]
    fn priority_levels_order_naturally() {
        assert!(MessagePriority::Urgent > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
    }
}
