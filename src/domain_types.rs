//! Strongly-typed domain identifiers and bounded values
//!
//! Newtypes for every identifier that crosses a component boundary, so a
//! workflow id can never be handed to an API expecting a message id.

use nutype::nutype;
use uuid::Uuid;

/// Identifier of a participant on the message bus.
///
/// Agents are addressed by well-known names (`"pricing_agent"`), not
/// generated identifiers, so this wraps a free-form string.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct AgentId(String);

/// Unique identifier for a single workflow execution
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Creates a new random workflow ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a message envelope
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Token copied from a request into its response so a waiter can match them
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Customer-facing identifier of the RFP document being processed
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct RfpId(String);

/// Identifier of the customer that issued the RFP
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct CustomerId(String);

/// Identifier of a workflow template
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct TemplateId(String);

/// Identifier of an approval gate, derived from workflow and stage
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct ApprovalId(String);

/// Upper bound on retained message traces
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct MaxTraces(usize);

impl MaxTraces {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Capacity bound for a recipient queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct QueueBound(usize);

impl QueueBound {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ids_compare_by_name() {
        let a = AgentId::from("pricing_agent");
        let b = AgentId::from("pricing_agent");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "pricing_agent");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(WorkflowId::generate(), WorkflowId::generate());
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn bounded_values_reject_out_of_range() {
        assert!(MaxTraces::try_new(10).is_err());
        assert!(MaxTraces::try_new(500).is_ok());
        assert!(QueueBound::try_new(0).is_err());
    }
}
