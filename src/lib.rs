//! # Tenderflow: RFP workflow orchestration core
//!
//! Tenderflow automates end-to-end processing of Requests For Proposal:
//! an RFP document is driven through parsing, sales analysis, technical
//! validation, pricing, and response generation by specialized agents, and
//! comes out as a structured response artifact plus a quotable bid.
//!
//! This crate is the orchestration and inter-agent communication core. The
//! analysis agents themselves are external collaborators reached through
//! the typed agent interface in [`workflow::payloads`].
//!
//! ## Architecture
//!
//! - [`comms`]: typed message envelopes, per-recipient priority queues
//!   with pub/sub fan-out and dead-lettering, a TTL-bearing state store,
//!   retry with circuit breaking, and per-message tracing with queue and
//!   latency metrics, all behind the [`comms::CommunicationManager`].
//! - [`workflow`]: workflow templates with conditional stage routing,
//!   human approval gates, rolling time estimates, and the
//!   [`workflow::RfpOrchestrator`] state machine that ties it together.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenderflow::comms::{CommsConfig, CommunicationManager};
//! use tenderflow::workflow::{RfpData, RfpOrchestrator};
//!
//! # async fn run(rfp: RfpData) {
//! let comms = Arc::new(CommunicationManager::in_memory(&CommsConfig::default()));
//! comms.connect().await;
//!
//! let orchestrator = RfpOrchestrator::new(Arc::clone(&comms));
//! orchestrator.initialize().await;
//!
//! match orchestrator.process_rfp(rfp, None).await {
//!     Ok(artifact) => println!("quote total: {}", artifact.quote.total),
//!     Err(failure) => eprintln!("workflow failed: {failure}"),
//! }
//! # }
//! ```

pub mod comms;
pub mod domain_types;
pub mod workflow;

pub use comms::{CommsConfig, CommunicationManager};
pub use domain_types::{
    AgentId, ApprovalId, CorrelationId, CustomerId, MessageId, RfpId, TemplateId, WorkflowId,
};
pub use workflow::{FinalArtifact, RfpData, RfpOrchestrator, WorkflowFailure};
