//! Workflow stage and status tags
//!
//! Stage variants are declared in pipeline order so ordered collections of
//! stage results iterate the way the workflow ran.

use serde::{Deserialize, Serialize};

/// One step in the RFP processing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// RFP accepted, nothing started yet
    Received,
    /// Document parsing and requirement extraction
    Parsing,
    /// Sales analysis of requirements and customer context
    SalesAnalysis,
    /// Technical validation of specifications and compliance
    TechnicalValidation,
    /// Quote calculation
    PricingCalculation,
    /// Response document generation
    ResponseGeneration,
    /// Final review and artifact assembly
    Review,
    /// Terminal success
    Completed,
    /// Terminal failure
    Failed,
}

impl WorkflowStage {
    /// Stage label as used in payloads, estimates, and visualizations
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Parsing => "parsing",
            Self::SalesAnalysis => "sales_analysis",
            Self::TechnicalValidation => "technical_validation",
            Self::PricingCalculation => "pricing_calculation",
            Self::ResponseGeneration => "response_generation",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Accepted, not yet running
    Pending,
    /// Stages are executing
    InProgress,
    /// Suspended by the host
    Paused,
    /// Terminal success
    Completed,
    /// Terminal failure
    Failed,
    /// Terminal, externally driven
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the workflow can no longer change
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}
