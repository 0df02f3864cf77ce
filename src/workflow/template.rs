//! Workflow templates, selection, and conditional stage routing

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain_types::{AgentId, TemplateId};
use crate::workflow::rfp::{RfpComplexity, RfpData, RfpPriority};
use crate::workflow::stage::WorkflowStage;

/// Conditions attached to a stage that alter routing or validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchCondition {
    /// Skip when the estimated value is below 10,000
    SkipIfLowValue,
    /// Skip when the RFP covers standard catalog products only
    SkipIfStandardProduct,
    /// Marks the stage as an approval gate; never skips
    RequiresApproval,
    /// Skip when the RFP priority is urgent
    FastTrack,
    /// Requests deeper validation downstream; never skips
    ComplexValidation,
}

/// Configuration of one stage within a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Which pipeline step this is
    pub stage: WorkflowStage,
    /// Agent that services the stage
    pub agent_id: AgentId,
    /// Deadline for the agent request (and the approval gate, if any)
    pub timeout: Duration,
    /// Whether a failure here fails the workflow
    pub required: bool,
    /// Conditions under which the stage is skipped
    pub skip_conditions: Vec<BranchCondition>,
    /// Whether a human approval gates this stage
    pub approval_required: bool,
    /// Roles allowed to decide the approval
    pub approval_roles: Vec<String>,
    /// Stages this one may execute concurrently with
    pub parallel_with: Vec<WorkflowStage>,
}

impl StageConfig {
    /// Creates a required stage with no conditions
    #[must_use]
    pub fn new(stage: WorkflowStage, agent_id: AgentId, timeout: Duration) -> Self {
        Self {
            stage,
            agent_id,
            timeout,
            required: true,
            skip_conditions: Vec::new(),
            approval_required: false,
            approval_roles: Vec::new(),
            parallel_with: Vec::new(),
        }
    }

    /// Adds a skip condition
    #[must_use]
    pub fn with_skip_condition(mut self, condition: BranchCondition) -> Self {
        self.skip_conditions.push(condition);
        self
    }

    /// Marks the stage approval-gated by the given roles
    #[must_use]
    pub fn with_approval(mut self, roles: &[&str]) -> Self {
        self.approval_required = true;
        self.approval_roles = roles.iter().map(|r| (*r).to_owned()).collect();
        self
    }
}

/// Ordered stage list plus selection metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template identifier
    pub template_id: TemplateId,
    /// Human-readable name
    pub name: String,
    /// What the template is for
    pub description: String,
    /// Stages in execution order
    pub stages: Vec<StageConfig>,
    /// Rough expected duration, for planning displays
    pub estimated_duration: Duration,
    /// Free-form metadata
    pub metadata: HashMap<String, Value>,
}

fn parser() -> AgentId {
    AgentId::from("rfp_parser_agent")
}
fn sales() -> AgentId {
    AgentId::from("sales_agent")
}
fn technical() -> AgentId {
    AgentId::from("technical_agent")
}
fn pricing() -> AgentId {
    AgentId::from("pricing_agent")
}
fn response_generator() -> AgentId {
    AgentId::from("response_generator_agent")
}

/// Holds the bundled templates and any registered additions
pub struct WorkflowTemplateManager {
    templates: DashMap<TemplateId, WorkflowTemplate>,
}

impl WorkflowTemplateManager {
    /// Creates a manager preloaded with the four bundled templates
    #[must_use]
    pub fn new() -> Self {
        let manager = Self {
            templates: DashMap::new(),
        };
        for template in Self::default_templates() {
            manager.templates.insert(template.template_id.clone(), template);
        }
        manager
    }

    fn default_templates() -> Vec<WorkflowTemplate> {
        let secs = Duration::from_secs;

        let standard = WorkflowTemplate {
            template_id: TemplateId::from("standard_rfp"),
            name: "Standard RFP Processing".to_owned(),
            description: "Complete RFP processing with all validation steps".to_owned(),
            stages: vec![
                StageConfig::new(WorkflowStage::Parsing, parser(), secs(60)),
                StageConfig::new(WorkflowStage::SalesAnalysis, sales(), secs(90)),
                StageConfig::new(WorkflowStage::TechnicalValidation, technical(), secs(120)),
                StageConfig::new(WorkflowStage::PricingCalculation, pricing(), secs(60)),
                StageConfig::new(WorkflowStage::ResponseGeneration, response_generator(), secs(90)),
            ],
            estimated_duration: secs(7),
            metadata: HashMap::new(),
        };

        let fast_track = WorkflowTemplate {
            template_id: TemplateId::from("fast_track_rfp"),
            name: "Fast Track RFP".to_owned(),
            description: "Expedited processing for standard products".to_owned(),
            stages: vec![
                StageConfig::new(WorkflowStage::Parsing, parser(), secs(30)),
                StageConfig::new(WorkflowStage::SalesAnalysis, sales(), secs(45)),
                StageConfig::new(WorkflowStage::TechnicalValidation, technical(), secs(60))
                    .with_skip_condition(BranchCondition::SkipIfStandardProduct),
                StageConfig::new(WorkflowStage::PricingCalculation, pricing(), secs(30)),
                StageConfig::new(WorkflowStage::ResponseGeneration, response_generator(), secs(45)),
            ],
            estimated_duration: secs(4),
            metadata: HashMap::new(),
        };

        let complex = WorkflowTemplate {
            template_id: TemplateId::from("complex_rfp"),
            name: "Complex RFP with Approvals".to_owned(),
            description: "Detailed processing with manual approval checkpoints".to_owned(),
            stages: vec![
                StageConfig::new(WorkflowStage::Parsing, parser(), secs(90)),
                StageConfig::new(WorkflowStage::SalesAnalysis, sales(), secs(120))
                    .with_approval(&["sales_manager"]),
                StageConfig::new(WorkflowStage::TechnicalValidation, technical(), secs(180))
                    .with_approval(&["technical_lead", "compliance_officer"]),
                StageConfig::new(WorkflowStage::PricingCalculation, pricing(), secs(90))
                    .with_approval(&["pricing_manager"]),
                StageConfig::new(WorkflowStage::ResponseGeneration, response_generator(), secs(120)),
            ],
            estimated_duration: secs(12),
            metadata: HashMap::new(),
        };

        let simple_quote = WorkflowTemplate {
            template_id: TemplateId::from("simple_quote"),
            name: "Simple Quote Generation".to_owned(),
            description: "Basic quote for standard products without technical validation"
                .to_owned(),
            stages: vec![
                StageConfig::new(WorkflowStage::Parsing, parser(), secs(30)),
                StageConfig::new(WorkflowStage::SalesAnalysis, sales(), secs(45)),
                StageConfig::new(WorkflowStage::PricingCalculation, pricing(), secs(30)),
                StageConfig::new(WorkflowStage::ResponseGeneration, response_generator(), secs(30)),
            ],
            estimated_duration: secs(3),
            metadata: HashMap::new(),
        };

        vec![standard, fast_track, complex, simple_quote]
    }

    /// Looks up a template by id
    #[must_use]
    pub fn get_template(&self, template_id: &TemplateId) -> Option<WorkflowTemplate> {
        self.templates.get(template_id).map(|t| t.value().clone())
    }

    /// Registers an additional template, replacing any with the same id
    pub fn register_template(&self, template: WorkflowTemplate) {
        info!(template_id = %template.template_id, "template registered");
        self.templates.insert(template.template_id.clone(), template);
    }

    /// All known templates
    #[must_use]
    pub fn list_templates(&self) -> Vec<WorkflowTemplate> {
        self.templates.iter().map(|t| t.value().clone()).collect()
    }

    /// Picks the best template for an RFP's characteristics
    #[must_use]
    pub fn select_template(&self, rfp: &RfpData) -> TemplateId {
        let selected =
            if rfp.priority == RfpPriority::Urgent && rfp.complexity == RfpComplexity::Simple {
                "fast_track_rfp"
            } else if rfp.complexity == RfpComplexity::Complex
                || rfp.estimated_value > Decimal::from(1_000_000)
            {
                "complex_rfp"
            } else if rfp.complexity == RfpComplexity::Simple
                && rfp.estimated_value < Decimal::from(50_000)
            {
                "simple_quote"
            } else {
                "standard_rfp"
            };
        debug!(template = selected, rfp_id = %rfp.rfp_id, "template selected");
        TemplateId::from(selected)
    }
}

impl Default for WorkflowTemplateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates skip conditions and computes the next runnable stage group
pub struct ConditionalRouter;

impl ConditionalRouter {
    /// Whether any of the stage's skip conditions hold for this RFP
    #[must_use]
    pub fn should_skip(stage: &StageConfig, rfp: &RfpData) -> bool {
        stage.skip_conditions.iter().any(|condition| match condition {
            BranchCondition::SkipIfLowValue => rfp.estimated_value < Decimal::from(10_000),
            BranchCondition::SkipIfStandardProduct => rfp.is_standard_product,
            BranchCondition::FastTrack => rfp.priority == RfpPriority::Urgent,
            BranchCondition::RequiresApproval | BranchCondition::ComplexValidation => false,
        })
    }

    /// Stages that follow `current`, grouped for concurrent execution.
    ///
    /// Walks forward from `current`, dropping skipped stages. Collection
    /// stops after the first stage that does not declare `parallel_with`
    /// partners, so the result is either a singleton or a concurrent group.
    #[must_use]
    pub fn next_stages<'a>(
        current: WorkflowStage,
        stages: &'a [StageConfig],
        rfp: &RfpData,
    ) -> Vec<&'a StageConfig> {
        let Some(current_idx) = stages.iter().position(|s| s.stage == current) else {
            return Vec::new();
        };

        let mut next = Vec::new();
        for stage in stages.iter().skip(current_idx + 1) {
            if Self::should_skip(stage, rfp) {
                debug!(stage = %stage.stage, "stage skipped by condition");
                continue;
            }
            next.push(stage);
            if stage.parallel_with.is_empty() {
                break;
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{CustomerId, RfpId};

    fn rfp(priority: RfpPriority, complexity: RfpComplexity, value: i64) -> RfpData {
        RfpData {
            rfp_id: RfpId::from("R-1"),
            customer_id: CustomerId::from("C-1"),
            document: String::new(),
            document_type: None,
            deadline: None,
            priority,
            complexity,
            estimated_value: Decimal::from(value),
            is_standard_product: false,
        }
    }

    #[test]
    fn four_templates_are_preloaded() {
        let manager = WorkflowTemplateManager::new();
        let mut ids: Vec<String> = manager
            .list_templates()
            .into_iter()
            .map(|t| t.template_id.to_string())
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            vec!["complex_rfp", "fast_track_rfp", "simple_quote", "standard_rfp"]
        );
    }

    #[test]
    fn selection_follows_the_predicate_table() {
        let manager = WorkflowTemplateManager::new();

        let fast = rfp(RfpPriority::Urgent, RfpComplexity::Simple, 40_000);
        assert_eq!(manager.select_template(&fast).to_string(), "fast_track_rfp");

        let complex = rfp(RfpPriority::Normal, RfpComplexity::Complex, 100_000);
        assert_eq!(manager.select_template(&complex).to_string(), "complex_rfp");

        let big = rfp(RfpPriority::Normal, RfpComplexity::Standard, 2_000_000);
        assert_eq!(manager.select_template(&big).to_string(), "complex_rfp");

        let small = rfp(RfpPriority::Normal, RfpComplexity::Simple, 20_000);
        assert_eq!(manager.select_template(&small).to_string(), "simple_quote");

        let standard = rfp(RfpPriority::Normal, RfpComplexity::Standard, 250_000);
        assert_eq!(manager.select_template(&standard).to_string(), "standard_rfp");
    }

    #[test]
    fn standard_product_skips_technical_validation_in_fast_track() {
        let manager = WorkflowTemplateManager::new();
        let template = manager
            .get_template(&TemplateId::from("fast_track_rfp"))
            .expect("template");
        let technical = template
            .stages
            .iter()
            .find(|s| s.stage == WorkflowStage::TechnicalValidation)
            .expect("technical stage");

        let mut rfp = rfp(RfpPriority::Urgent, RfpComplexity::Simple, 40_000);
        assert!(!ConditionalRouter::should_skip(technical, &rfp));
        rfp.is_standard_product = true;
        assert!(ConditionalRouter::should_skip(technical, &rfp));
    }

    #[test]
    fn low_value_condition_uses_the_ten_thousand_threshold() {
        let stage = StageConfig::new(
            WorkflowStage::TechnicalValidation,
            technical(),
            Duration::from_secs(60),
        )
        .with_skip_condition(BranchCondition::SkipIfLowValue);

        let cheap = rfp(RfpPriority::Normal, RfpComplexity::Simple, 9_999);
        assert!(ConditionalRouter::should_skip(&stage, &cheap));
        let pricey = rfp(RfpPriority::Normal, RfpComplexity::Simple, 10_000);
        assert!(!ConditionalRouter::should_skip(&stage, &pricey));
    }

    #[test]
    fn next_stages_drops_skipped_and_stops_at_sequential_stage() {
        let manager = WorkflowTemplateManager::new();
        let template = manager
            .get_template(&TemplateId::from("fast_track_rfp"))
            .expect("template");

        let mut rfp = rfp(RfpPriority::Urgent, RfpComplexity::Simple, 40_000);
        rfp.is_standard_product = true;

        let next =
            ConditionalRouter::next_stages(WorkflowStage::SalesAnalysis, &template.stages, &rfp);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].stage, WorkflowStage::PricingCalculation);
    }
}
