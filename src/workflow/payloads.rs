//! Typed request and response payloads for each pipeline stage
//!
//! One request/response pair per agent stage. The envelopes on the bus
//! carry plain JSON; these types are the orchestrator/agent boundary, so a
//! malformed agent reply surfaces as a decode error instead of a missing
//! dictionary key three stages later. Sub-schemas owned by the agents
//! (line items, compliance reports, document bodies) stay opaque JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{CustomerId, RfpId, WorkflowId};

/// Agent reply envelope, tagged by its `status` field.
///
/// `{"status": "success", ...fields}` decodes to `Success`;
/// `{"status": "failed", "error": "..."}` decodes to `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentReply<T> {
    /// The stage succeeded; payload fields sit beside the tag
    Success(T),
    /// The stage failed with a human-readable message
    Failed {
        /// What went wrong
        #[serde(default)]
        error: Option<String>,
    },
}

impl<T> AgentReply<T> {
    /// Converts into a result, defaulting the failure message
    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failed { error } => Err(error.unwrap_or_else(|| "unknown error".to_owned())),
        }
    }
}

/// Request to the parsing agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingRequest {
    /// Executing workflow
    pub workflow_id: WorkflowId,
    /// RFP being parsed
    pub rfp_id: RfpId,
    /// Raw document content
    pub document: String,
    /// Format hint
    pub document_type: String,
}

/// Parsing agent result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsingOutput {
    /// Extracted document sections
    #[serde(default)]
    pub sections: Vec<Value>,
    /// Extracted requirement entries
    #[serde(default)]
    pub requirements: Vec<Value>,
    /// Parser-discovered document metadata
    #[serde(default)]
    pub metadata: Value,
    /// Parser self-assessment in [0, 1]
    #[serde(default)]
    pub confidence_score: f64,
}

/// Request to the sales agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesRequest {
    /// Executing workflow
    pub workflow_id: WorkflowId,
    /// RFP under analysis
    pub rfp_id: RfpId,
    /// Issuing customer
    pub customer_id: CustomerId,
    /// Requirements from the parsing stage
    pub requirements: Vec<Value>,
    /// Sections from the parsing stage
    pub sections: Vec<Value>,
}

/// Sales agent result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SalesOutput {
    /// Proposed line items
    #[serde(default)]
    pub line_items: Vec<Value>,
    /// Customer history and relationship context
    #[serde(default)]
    pub customer_context: Value,
    /// Win-likelihood score in [0, 1]
    #[serde(default)]
    pub opportunity_score: f64,
    /// Catalog products matched to the requirements
    #[serde(default)]
    pub recommended_products: Vec<Value>,
    /// Proposed delivery terms
    #[serde(default)]
    pub delivery_terms: Value,
    /// Proposed payment terms
    #[serde(default)]
    pub payment_terms: Value,
}

/// Request to the technical agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalRequest {
    /// Executing workflow
    pub workflow_id: WorkflowId,
    /// RFP under validation
    pub rfp_id: RfpId,
    /// Line items from the sales stage
    pub line_items: Vec<Value>,
    /// Product recommendations from the sales stage
    pub recommended_products: Vec<Value>,
}

/// Technical agent result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechnicalOutput {
    /// Products that passed specification checks
    #[serde(default)]
    pub validated_products: Vec<Value>,
    /// Detailed compliance findings
    #[serde(default)]
    pub compliance_report: Value,
    /// Standards the proposal satisfies
    #[serde(default)]
    pub standards_met: Vec<String>,
    /// Certifications covering the products
    #[serde(default)]
    pub certifications: Vec<String>,
    /// Reviewer notes
    #[serde(default)]
    pub technical_notes: Vec<String>,
    /// Overall compliance score in [0, 1]
    #[serde(default)]
    pub compliance_score: f64,
}

/// Request to the pricing agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRequest {
    /// Executing workflow
    pub workflow_id: WorkflowId,
    /// RFP being quoted
    pub rfp_id: RfpId,
    /// Issuing customer
    pub customer_id: CustomerId,
    /// Line items from the sales stage
    pub line_items: Vec<Value>,
    /// Validated products from the technical stage
    pub validated_products: Vec<Value>,
    /// Customer context from the sales stage
    pub customer_context: Value,
}

fn default_validity_period() -> u32 {
    30
}

/// Pricing agent result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOutput {
    /// Quote identifier issued by the pricing agent
    #[serde(default)]
    pub quote_id: String,
    /// Per-line-item prices
    #[serde(default)]
    pub line_item_prices: Vec<Value>,
    /// Sum before taxes and discounts
    #[serde(default)]
    pub subtotal: Decimal,
    /// Applied taxes
    #[serde(default)]
    pub taxes: Decimal,
    /// Final quote total
    #[serde(default)]
    pub total: Decimal,
    /// Discounts applied, in order
    #[serde(default)]
    pub discounts_applied: Vec<Value>,
    /// Payment terms attached to the quote
    #[serde(default)]
    pub payment_terms: Value,
    /// Days the quote remains valid
    #[serde(default = "default_validity_period")]
    pub validity_period: u32,
}

impl Default for PricingOutput {
    fn default() -> Self {
        Self {
            quote_id: String::new(),
            line_item_prices: Vec::new(),
            subtotal: Decimal::ZERO,
            taxes: Decimal::ZERO,
            total: Decimal::ZERO,
            discounts_applied: Vec::new(),
            payment_terms: Value::Null,
            validity_period: default_validity_period(),
        }
    }
}

/// Request to the response generator agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRequest {
    /// Executing workflow
    pub workflow_id: WorkflowId,
    /// RFP being answered
    pub rfp_id: RfpId,
    /// Issuing customer
    pub customer_id: CustomerId,
    /// Output of the parsing stage
    pub parsed_content: ParsingOutput,
    /// Output of the sales stage
    pub sales_analysis: SalesOutput,
    /// Output of the technical stage; defaults when the stage was skipped
    pub technical_validation: TechnicalOutput,
    /// Output of the pricing stage
    pub pricing: PricingOutput,
    /// Customer deadline, forwarded verbatim
    pub deadline: Option<String>,
}

fn default_format() -> String {
    "pdf".to_owned()
}

/// Response generator result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseOutput {
    /// The assembled response document
    #[serde(default)]
    pub document: Value,
    /// Executive summary text
    #[serde(default)]
    pub executive_summary: String,
    /// Technical section of the document
    #[serde(default)]
    pub technical_section: Value,
    /// Pricing section of the document
    #[serde(default)]
    pub pricing_section: Value,
    /// Terms and conditions section
    #[serde(default)]
    pub terms_conditions: Value,
    /// Output document format
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for ResponseOutput {
    fn default() -> Self {
        Self {
            document: Value::Null,
            executive_summary: String::new(),
            technical_section: Value::Null,
            pricing_section: Value::Null,
            terms_conditions: Value::Null,
            format: default_format(),
        }
    }
}

/// Typed result of a completed stage, stored on the workflow context
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutput {
    /// Parsing stage result
    Parsing(ParsingOutput),
    /// Sales analysis result
    SalesAnalysis(SalesOutput),
    /// Technical validation result
    TechnicalValidation(TechnicalOutput),
    /// Pricing result
    PricingCalculation(PricingOutput),
    /// Response generation result
    ResponseGeneration(ResponseOutput),
}

impl StageOutput {
    /// The pricing output, when this is a pricing result
    #[must_use]
    pub fn as_pricing(&self) -> Option<&PricingOutput> {
        match self {
            Self::PricingCalculation(output) => Some(output),
            _ => None,
        }
    }

    /// The technical output, when this is a technical result
    #[must_use]
    pub fn as_technical(&self) -> Option<&TechnicalOutput> {
        match self {
            Self::TechnicalValidation(output) => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_reply_decodes_payload_beside_the_tag() {
        let raw = json!({
            "status": "success",
            "sections": [{"title": "Scope"}],
            "requirements": [{"id": "REQ-1"}],
            "metadata": {"pages": 12},
            "confidence_score": 0.93,
        });
        let reply: AgentReply<ParsingOutput> = serde_json::from_value(raw).expect("decode");
        let output = reply.into_result().expect("success");
        assert_eq!(output.sections.len(), 1);
        assert_eq!(output.requirements.len(), 1);
        assert!((output.confidence_score - 0.93).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_reply_carries_the_error_message() {
        let raw = json!({"status": "failed", "error": "catalog unavailable"});
        let reply: AgentReply<SalesOutput> = serde_json::from_value(raw).expect("decode");
        assert_eq!(reply.into_result().unwrap_err(), "catalog unavailable");
    }

    #[test]
    fn failed_reply_without_error_gets_a_default_message() {
        let raw = json!({"status": "failed"});
        let reply: AgentReply<SalesOutput> = serde_json::from_value(raw).expect("decode");
        assert_eq!(reply.into_result().unwrap_err(), "unknown error");
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = json!({"status": "success", "quote_id": "Q-77", "total": "125000.50"});
        let reply: AgentReply<PricingOutput> = serde_json::from_value(raw).expect("decode");
        let output = reply.into_result().expect("success");
        assert_eq!(output.quote_id, "Q-77");
        assert_eq!(output.total, Decimal::new(12_500_050, 2));
        assert_eq!(output.validity_period, 30);
        assert!(output.line_item_prices.is_empty());
    }

    #[test]
    fn pricing_request_serializes_money_as_decimal_strings() {
        let request = PricingRequest {
            workflow_id: WorkflowId::generate(),
            rfp_id: RfpId::from("R-9"),
            customer_id: CustomerId::from("C-9"),
            line_items: vec![json!({"sku": "A"})],
            validated_products: vec![],
            customer_context: json!({"tier": "gold"}),
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["rfp_id"], json!("R-9"));
        assert_eq!(value["line_items"][0]["sku"], json!("A"));
    }
}
