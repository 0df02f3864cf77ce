//! Inbound RFP snapshot
//!
//! The fields below drive template selection and stage skipping; the
//! document body itself is opaque to the core and handed to the parsing
//! agent untouched.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain_types::{CustomerId, RfpId};

/// Request priority as declared by the customer or intake channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfpPriority {
    /// No urgency
    Low,
    /// Default
    #[default]
    Normal,
    /// Expedite where possible
    High,
    /// Jump the queue
    Urgent,
}

/// Rough complexity classification from intake triage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfpComplexity {
    /// Catalog products, no engineering review
    Simple,
    /// Default
    #[default]
    Standard,
    /// Custom specifications or large scope
    Complex,
}

/// Everything the core needs to know about an inbound RFP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfpData {
    /// Customer-facing RFP identifier
    pub rfp_id: RfpId,
    /// Issuing customer
    pub customer_id: CustomerId,
    /// Raw document content, opaque to the core
    #[serde(default)]
    pub document: String,
    /// Document format hint forwarded to the parsing agent
    #[serde(default)]
    pub document_type: Option<String>,
    /// Response deadline, forwarded verbatim to the response generator
    #[serde(default)]
    pub deadline: Option<String>,
    /// Declared priority
    #[serde(default)]
    pub priority: RfpPriority,
    /// Triage complexity
    #[serde(default)]
    pub complexity: RfpComplexity,
    /// Estimated contract value
    #[serde(default)]
    pub estimated_value: Decimal,
    /// Whether the request covers standard catalog products only
    #[serde(default)]
    pub is_standard_product: bool,
}

impl RfpData {
    /// Document type, defaulting to `pdf` like the intake channel does
    #[must_use]
    pub fn document_type(&self) -> &str {
        self.document_type.as_deref().unwrap_or("pdf")
    }
}
