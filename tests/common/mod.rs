//! Shared stub-agent harness for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use tenderflow::comms::{handler_fn, CommsConfig, CommunicationManager, MessageType};
use tenderflow::domain_types::{AgentId, CustomerId, RfpId};
use tenderflow::workflow::{
    AgentReply, ParsingOutput, PricingOutput, ResponseOutput, RfpComplexity, RfpData, RfpPriority,
    SalesOutput, TechnicalOutput,
};

/// Communication manager on the in-memory broker with test-sized timeouts
pub fn test_comms() -> Arc<CommunicationManager> {
    Arc::new(CommunicationManager::in_memory(&CommsConfig::testing()))
}

/// RFP snapshot with the given routing characteristics
pub fn make_rfp(
    priority: RfpPriority,
    complexity: RfpComplexity,
    value: i64,
    standard_product: bool,
) -> RfpData {
    RfpData {
        rfp_id: RfpId::from("R-1"),
        customer_id: CustomerId::from("C-1"),
        document: "Request for proposal: industrial supply".to_owned(),
        document_type: Some("pdf".to_owned()),
        deadline: Some("2026-09-30T00:00:00Z".to_owned()),
        priority,
        complexity,
        estimated_value: Decimal::from(value),
        is_standard_product: standard_product,
    }
}

pub fn parsing_reply() -> Value {
    serde_json::to_value(AgentReply::Success(ParsingOutput {
        sections: vec![json!({"title": "Scope"})],
        requirements: vec![json!({"id": "REQ-1"})],
        metadata: json!({"pages": 10}),
        confidence_score: 0.9,
    }))
    .expect("encode parsing reply")
}

pub fn sales_reply() -> Value {
    serde_json::to_value(AgentReply::Success(SalesOutput {
        line_items: vec![json!({"sku": "CBL-600V", "qty": 2000})],
        customer_context: json!({"tier": "gold"}),
        opportunity_score: 0.8,
        recommended_products: vec![json!({"sku": "CBL-600V"})],
        delivery_terms: json!({"incoterm": "DAP"}),
        payment_terms: json!({"days": 45}),
    }))
    .expect("encode sales reply")
}

pub fn technical_reply() -> Value {
    serde_json::to_value(AgentReply::Success(TechnicalOutput {
        validated_products: vec![json!({"sku": "CBL-600V", "compliant": true})],
        compliance_report: json!({"checked": 5, "passed": 5}),
        standards_met: vec!["IEC 60502".to_owned()],
        certifications: vec!["ISO 9001".to_owned()],
        technical_notes: vec![],
        compliance_score: 0.95,
    }))
    .expect("encode technical reply")
}

pub fn pricing_reply() -> Value {
    serde_json::to_value(AgentReply::Success(PricingOutput {
        quote_id: "Q-1".to_owned(),
        line_item_prices: vec![json!({"sku": "CBL-600V", "total": "100000.00"})],
        subtotal: Decimal::new(9_700_000, 2),
        taxes: Decimal::new(300_000, 2),
        total: Decimal::new(10_000_000, 2),
        discounts_applied: vec![],
        payment_terms: json!({"days": 45}),
        validity_period: 30,
    }))
    .expect("encode pricing reply")
}

pub fn response_reply() -> Value {
    serde_json::to_value(AgentReply::Success(ResponseOutput {
        document: json!({"title": "Proposal"}),
        executive_summary: "Full scope covered.".to_owned(),
        technical_section: json!({}),
        pricing_section: json!({}),
        terms_conditions: json!({}),
        format: "pdf".to_owned(),
    }))
    .expect("encode response reply")
}

/// Registers an agent that answers every request with `reply`
pub async fn register_stub(comms: &Arc<CommunicationManager>, agent_id: &str, reply: Value) {
    let agent = AgentId::from(agent_id);
    comms.register_agent(agent.clone(), "stub", vec![]).await;
    let responder = Arc::clone(comms);
    comms.register_handler(
        agent,
        MessageType::Request,
        handler_fn(move |message| {
            let responder = Arc::clone(&responder);
            let reply = reply.clone();
            async move {
                responder.send_response(&message, reply).await;
            }
        }),
    );
}

/// Registers an agent that answers every request with a failure
pub async fn register_failing_stub(comms: &Arc<CommunicationManager>, agent_id: &str, error: &str) {
    register_stub(
        comms,
        agent_id,
        json!({"status": "failed", "error": error}),
    )
    .await;
}

/// Registers an agent that never answers
pub async fn register_silent_stub(comms: &Arc<CommunicationManager>, agent_id: &str) {
    let agent = AgentId::from(agent_id);
    comms.register_agent(agent, "stub", vec![]).await;
}

/// Registers an agent that answers after `delay`
pub async fn register_delayed_stub(
    comms: &Arc<CommunicationManager>,
    agent_id: &str,
    reply: Value,
    delay: Duration,
) {
    let agent = AgentId::from(agent_id);
    comms.register_agent(agent.clone(), "stub", vec![]).await;
    let responder = Arc::clone(comms);
    comms.register_handler(
        agent,
        MessageType::Request,
        handler_fn(move |message| {
            let responder = Arc::clone(&responder);
            let reply = reply.clone();
            async move {
                // Respond from a separate task so the publish path is not
                // held up; this is how a real agent would behave.
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    responder.send_response(&message, reply).await;
                });
            }
        }),
    );
}

/// Registers happy-path stubs for all five pipeline agents
pub async fn register_all_stubs(comms: &Arc<CommunicationManager>) {
    register_stub(comms, "rfp_parser_agent", parsing_reply()).await;
    register_stub(comms, "sales_agent", sales_reply()).await;
    register_stub(comms, "technical_agent", technical_reply()).await;
    register_stub(comms, "pricing_agent", pricing_reply()).await;
    register_stub(comms, "response_generator_agent", response_reply()).await;
}
