//! Tenderflow demo driver
//!
//! Wires stub agents for all five pipeline stages, runs one RFP through
//! the orchestrator, and prints the resulting artifact summary with the
//! execution timeline.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rust_decimal::Decimal;
use serde_json::json;
use tenderflow::comms::{handler_fn, CommsConfig, CommunicationManager, MessageType};
use tenderflow::domain_types::{AgentId, CustomerId, RfpId, TemplateId};
use tenderflow::workflow::{
    AgentReply, ParsingOutput, PricingOutput, ResponseOutput, RfpComplexity, RfpData, RfpPriority,
    RfpOrchestrator, SalesOutput, TechnicalOutput, WorkflowVisualizer,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tenderflow", about = "Run one RFP through the workflow core")]
struct Args {
    /// RFP identifier
    #[arg(long, default_value = "RFP-DEMO-001")]
    rfp_id: String,

    /// Customer identifier
    #[arg(long, default_value = "CUST-ACME")]
    customer_id: String,

    /// Template to use instead of auto-selection
    #[arg(long)]
    template: Option<String>,

    /// RFP priority: low, normal, high, urgent
    #[arg(long, default_value = "normal")]
    priority: String,

    /// RFP complexity: simple, standard, complex
    #[arg(long, default_value = "standard")]
    complexity: String,

    /// Estimated contract value
    #[arg(long, default_value = "250000")]
    value: Decimal,

    /// Treat the request as standard catalog products
    #[arg(long)]
    standard_product: bool,
}

fn parse_priority(value: &str) -> RfpPriority {
    match value {
        "low" => RfpPriority::Low,
        "high" => RfpPriority::High,
        "urgent" => RfpPriority::Urgent,
        _ => RfpPriority::Normal,
    }
}

fn parse_complexity(value: &str) -> RfpComplexity {
    match value {
        "simple" => RfpComplexity::Simple,
        "complex" => RfpComplexity::Complex,
        _ => RfpComplexity::Standard,
    }
}

/// Registers a stub agent that replies successfully to every request with
/// the given payload.
async fn register_stub(
    comms: &Arc<CommunicationManager>,
    agent_id: &str,
    agent_type: &str,
    reply: serde_json::Value,
) {
    let agent = AgentId::from(agent_id);
    comms
        .register_agent(agent.clone(), agent_type, vec![])
        .await;
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

async fn register_stub_agents(comms: &Arc<CommunicationManager>) -> Result<()> {
    let parsing = serde_json::to_value(AgentReply::Success(ParsingOutput {
        sections: vec![json!({"title": "Scope of Supply"}), json!({"title": "Delivery"})],
        requirements: vec![json!({"id": "REQ-1", "text": "600V armored cable, 2km"})],
        metadata: json!({"pages": 14}),
        confidence_score: 0.94,
    }))?;
    let sales = serde_json::to_value(AgentReply::Success(SalesOutput {
        line_items: vec![json!({"sku": "CBL-600V", "qty": 2000})],
        customer_context: json!({"tier": "gold", "region": "EMEA"}),
        opportunity_score: 0.81,
        recommended_products: vec![json!({"sku": "CBL-600V"})],
        delivery_terms: json!({"incoterm": "DAP"}),
        payment_terms: json!({"days": 45}),
    }))?;
    let technical = serde_json::to_value(AgentReply::Success(TechnicalOutput {
        validated_products: vec![json!({"sku": "CBL-600V", "compliant": true})],
        compliance_report: json!({"checked": 12, "passed": 12}),
        standards_met: vec!["IEC 60502".to_owned()],
        certifications: vec!["ISO 9001".to_owned()],
        technical_notes: vec!["armor spec verified".to_owned()],
        compliance_score: 0.97,
    }))?;
    let pricing = serde_json::to_value(AgentReply::Success(PricingOutput {
        quote_id: "Q-2024-0042".to_owned(),
        line_item_prices: vec![json!({"sku": "CBL-600V", "unit": "48.50", "total": "97000.00"})],
        subtotal: Decimal::new(9_700_000, 2),
        taxes: Decimal::new(300_000, 2),
        total: Decimal::new(10_000_000, 2),
        discounts_applied: vec![json!({"code": "VOLUME", "pct": 3})],
        payment_terms: json!({"days": 45}),
        validity_period: 30,
    }))?;
    let response = serde_json::to_value(AgentReply::Success(ResponseOutput {
        document: json!({"title": "Proposal for RFP", "body": "..."}),
        executive_summary: "Full scope covered from stock with 2-week delivery.".to_owned(),
        technical_section: json!({"standards": ["IEC 60502"]}),
        pricing_section: json!({"total": "100000.00"}),
        terms_conditions: json!({"validity_days": 30}),
        format: "pdf".to_owned(),
    }))?;

    register_stub(comms, "rfp_parser_agent", "parser", parsing).await;
    register_stub(comms, "sales_agent", "sales", sales).await;
    register_stub(comms, "technical_agent", "technical", technical).await;
    register_stub(comms, "pricing_agent", "pricing", pricing).await;
    register_stub(comms, "response_generator_agent", "response_generator", response).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenderflow=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let comms = Arc::new(CommunicationManager::in_memory(&CommsConfig::default()));
    comms.connect().await;
    register_stub_agents(&comms).await?;

    let orchestrator = RfpOrchestrator::new(Arc::clone(&comms));
    orchestrator.initialize().await;

    let rfp = RfpData {
        rfp_id: RfpId::from(args.rfp_id),
        customer_id: CustomerId::from(args.customer_id),
        document: "Request for proposal: industrial cable supply".to_owned(),
        document_type: Some("pdf".to_owned()),
        deadline: None,
        priority: parse_priority(&args.priority),
        complexity: parse_complexity(&args.complexity),
        estimated_value: args.value,
        is_standard_product: args.standard_product,
    };

    let template = args.template.map(TemplateId::from);
    match orchestrator.process_rfp(rfp, template).await {
        Ok(artifact) => {
            info!(
                workflow_id = %artifact.workflow_info.workflow_id,
                template = %artifact.workflow_info.template_id,
                quote_total = %artifact.quote.total,
                "workflow completed"
            );
            println!("\nQuote {}: total {}", artifact.quote.quote_id, artifact.quote.total);
            println!("Executive summary: {}", artifact.executive_summary);
            println!(
                "\n{}",
                WorkflowVisualizer::timeline(
                    artifact
                        .timeline
                        .stage_durations
                        .iter()
                        .map(|(stage, duration)| (stage.as_str(), *duration)),
                )
            );
        }
        Err(failure) => {
            eprintln!("workflow failed at {}: {:?}", failure.failed_stage, failure.errors);
        }
    }

    comms.disconnect().await;
    Ok(())
}
