//! RFP workflow orchestration
//!
//! Templates describe what to run; the [`orchestrator::RfpOrchestrator`]
//! runs it: stage skipping via the [`template::ConditionalRouter`], human
//! gates via the [`approval::ApprovalManager`], duration forecasting via
//! the [`estimator::TimeEstimator`], and agent calls via the communication
//! core.

pub mod approval;
pub mod estimator;
pub mod orchestrator;
pub mod payloads;
pub mod rfp;
pub mod stage;
pub mod template;
pub mod visualizer;

pub use approval::{ApprovalManager, ApprovalRequest, ApprovalStatus};
pub use estimator::{StageEstimate, TimeEstimator};
pub use orchestrator::{
    FinalArtifact, Quote, RfpOrchestrator, StageResult, StageStatus, WorkflowContext,
    WorkflowFailure, WorkflowStatusReport, ORCHESTRATOR_AGENT_ID,
};
pub use payloads::{
    AgentReply, ParsingOutput, ParsingRequest, PricingOutput, PricingRequest, ResponseOutput,
    ResponseRequest, SalesOutput, SalesRequest, StageOutput, TechnicalOutput, TechnicalRequest,
};
pub use rfp::{RfpComplexity, RfpData, RfpPriority};
pub use stage::{WorkflowStage, WorkflowStatus};
pub use template::{
    BranchCondition, ConditionalRouter, StageConfig, WorkflowTemplate, WorkflowTemplateManager,
};
pub use visualizer::WorkflowVisualizer;
