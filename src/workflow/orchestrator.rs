//! Workflow orchestrator: executes a template as a state machine
//!
//! One orchestrator instance owns every workflow it accepts. Each
//! `process_rfp` call selects a template, then drives the template's stages
//! through the communication manager: skip rules first, then the approval
//! gate, then the correlated agent request. Stage results accumulate on the
//! workflow context; the final artifact is synthesized in the review step.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::comms::manager::{handler_fn, CommunicationManager};
use crate::comms::message::MessageType;
use crate::domain_types::{AgentId, CustomerId, RfpId, TemplateId, WorkflowId};
use crate::workflow::approval::{ApprovalManager, ApprovalStatus};
use crate::workflow::estimator::{StageEstimate, TimeEstimator};
use crate::workflow::payloads::{
    AgentReply, ParsingOutput, ParsingRequest, PricingOutput, PricingRequest, ResponseOutput,
    ResponseRequest, SalesOutput, SalesRequest, StageOutput, TechnicalOutput, TechnicalRequest,
};
use crate::workflow::rfp::RfpData;
use crate::workflow::stage::{WorkflowStage, WorkflowStatus};
use crate::workflow::template::{
    ConditionalRouter, StageConfig, WorkflowTemplate, WorkflowTemplateManager,
};
use crate::workflow::visualizer::WorkflowVisualizer;

/// Bus address of the orchestrator itself
pub const ORCHESTRATOR_AGENT_ID: &str = "rfp_workflow_orchestrator";

/// Outcome tag of a single stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Agent returned success
    Success,
    /// Agent failed, timed out, or the approval gate denied
    Failed,
    /// Skip condition held; entered and exited in a zero-duration step
    Skipped,
}

/// Result of one stage, recorded on the workflow context exactly once
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Which stage ran
    pub stage: WorkflowStage,
    /// How it ended
    pub status: StageStatus,
    /// Typed agent output on success
    pub output: Option<StageOutput>,
    /// Failure message, when failed
    pub error: Option<String>,
    /// Wall-clock time spent in the stage
    pub duration: Duration,
    /// When the result was recorded
    pub timestamp: SystemTime,
}

impl StageResult {
    fn success(stage: WorkflowStage, output: StageOutput, duration: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            output: Some(output),
            error: None,
            duration,
            timestamp: SystemTime::now(),
        }
    }

    fn failed(stage: WorkflowStage, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            output: None,
            error: Some(error.into()),
            duration,
            timestamp: SystemTime::now(),
        }
    }

    fn skipped(stage: WorkflowStage) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            output: None,
            error: None,
            duration: Duration::ZERO,
            timestamp: SystemTime::now(),
        }
    }
}

/// Context maintained for one workflow from acceptance to terminal status
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    /// Unique execution identifier
    pub workflow_id: WorkflowId,
    /// The RFP being processed
    pub rfp_id: RfpId,
    /// Issuing customer
    pub customer_id: CustomerId,
    /// Stage the workflow is currently in
    pub current_stage: WorkflowStage,
    /// Execution status
    pub status: WorkflowStatus,
    /// Completed stage results in pipeline order
    pub stage_results: BTreeMap<WorkflowStage, StageResult>,
    /// Errors accumulated, in order
    pub errors: Vec<String>,
    /// When processing started
    pub started_at: SystemTime,
    /// When the workflow reached a terminal status
    pub ended_at: Option<SystemTime>,
    /// Template driving this execution
    pub template_id: TemplateId,
    /// Template display name
    pub template_name: String,
    /// Estimate made at acceptance time
    pub estimated_duration: Duration,
    /// Free-form metadata
    pub metadata: HashMap<String, Value>,
}

/// Point-in-time status view of a workflow
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusReport {
    /// Workflow identifier
    pub workflow_id: WorkflowId,
    /// RFP identifier
    pub rfp_id: RfpId,
    /// Current stage
    pub current_stage: WorkflowStage,
    /// Execution status
    pub status: WorkflowStatus,
    /// Stages with recorded results, in pipeline order
    pub completed_stages: Vec<WorkflowStage>,
    /// Accumulated errors
    pub errors: Vec<String>,
    /// Start time
    pub started_at: SystemTime,
    /// End time, when terminal
    pub ended_at: Option<SystemTime>,
}

/// Structured failure returned when a workflow cannot complete
#[derive(Debug, Clone, Error, Serialize)]
#[error("workflow {workflow_id} ended {status} at stage {failed_stage}")]
pub struct WorkflowFailure {
    /// Workflow identifier
    pub workflow_id: WorkflowId,
    /// RFP identifier
    pub rfp_id: RfpId,
    /// Terminal status (failed or cancelled)
    pub status: WorkflowStatus,
    /// Stage where processing stopped
    pub failed_stage: WorkflowStage,
    /// Accumulated error messages, in order
    pub errors: Vec<String>,
    /// Stages that recorded results before the failure
    pub completed_stages: Vec<WorkflowStage>,
    /// Elapsed time until the terminal status
    pub duration: Duration,
}

/// Identity block of the final artifact
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInfo {
    /// Workflow identifier
    pub workflow_id: WorkflowId,
    /// RFP identifier
    pub rfp_id: RfpId,
    /// Issuing customer
    pub customer_id: CustomerId,
    /// Template used
    pub template_id: TemplateId,
    /// Template display name
    pub template_name: String,
    /// Terminal status
    pub status: WorkflowStatus,
    /// Estimate made at acceptance
    pub estimated_duration: Duration,
    /// Measured duration
    pub actual_duration: Duration,
}

/// Quotable bid extracted from the pricing stage
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    /// Quote identifier from the pricing agent
    pub quote_id: String,
    /// Final total
    pub total: rust_decimal::Decimal,
    /// Priced line items
    pub line_items: Vec<Value>,
    /// Days the quote remains valid
    pub validity_days: u32,
}

/// Compliance block from the technical stage
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceSummary {
    /// Overall compliance score
    pub score: f64,
    /// Standards satisfied
    pub standards_met: Vec<String>,
    /// Certifications covering the products
    pub certifications: Vec<String>,
}

/// Execution timeline of the workflow
#[derive(Debug, Clone, Serialize)]
pub struct Timeline {
    /// Processing start
    pub started_at: SystemTime,
    /// Processing end
    pub completed_at: SystemTime,
    /// End-to-end duration
    pub total_duration: Duration,
    /// Per-stage durations, skipped stages recorded at zero
    pub stage_durations: BTreeMap<String, Duration>,
}

/// Confidence scores reported by the analysis agents
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceScores {
    /// Parser self-assessment
    pub parsing: f64,
    /// Sales opportunity score
    pub opportunity: f64,
    /// Technical compliance score
    pub compliance: f64,
}

/// Trailing metadata on the final artifact
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactMetadata {
    /// Number of stages with recorded results
    pub stages_completed: usize,
    /// Agent confidence scores
    pub confidence_scores: ConfidenceScores,
}

/// The structured response artifact plus quotable bid
#[derive(Debug, Clone, Serialize)]
pub struct FinalArtifact {
    /// Workflow identity and durations
    pub workflow_info: WorkflowInfo,
    /// Assembled response document
    pub response_document: Value,
    /// Executive summary text
    pub executive_summary: String,
    /// Quotable bid
    pub quote: Quote,
    /// Compliance summary
    pub compliance: ComplianceSummary,
    /// Execution timeline
    pub timeline: Timeline,
    /// Confidence metadata
    pub metadata: ArtifactMetadata,
}

/// Per-stage estimates plus the total-workflow estimate
#[derive(Debug, Clone, Serialize)]
pub struct TimeEstimates {
    /// Estimate per stage label
    pub stages: BTreeMap<String, StageEstimate>,
    /// Estimate for a complete workflow
    pub total_workflow: Duration,
    /// Completed workflows backing the total estimate
    pub workflow_samples: usize,
}

/// Summary row for the template listing endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    /// Template identifier
    pub template_id: TemplateId,
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
    /// Stage labels in order
    pub stages: Vec<String>,
    /// Rough expected duration
    pub estimated_duration: Duration,
}

/// Sticky cancellation flag with wakeups for in-flight suspension points
struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Marker for a stage interrupted by workflow cancellation
struct Cancelled;

/// Typed outputs accumulated while the pipeline runs
#[derive(Default)]
struct PipelineData {
    parsing: Option<ParsingOutput>,
    sales: Option<SalesOutput>,
    technical: Option<TechnicalOutput>,
    pricing: Option<PricingOutput>,
    response: Option<ResponseOutput>,
}

/// Drives RFP workflows against the communication manager
pub struct RfpOrchestrator {
    comms: Arc<CommunicationManager>,
    agent_id: AgentId,
    active_workflows: DashMap<WorkflowId, WorkflowContext>,
    cancel_signals: DashMap<WorkflowId, Arc<CancelSignal>>,
    time_estimator: Arc<TimeEstimator>,
    approvals: Arc<ApprovalManager>,
    templates: Arc<WorkflowTemplateManager>,
}

impl RfpOrchestrator {
    /// Creates an orchestrator over the given communication manager
    #[must_use]
    pub fn new(comms: Arc<CommunicationManager>) -> Self {
        Self {
            comms,
            agent_id: AgentId::from(ORCHESTRATOR_AGENT_ID),
            active_workflows: DashMap::new(),
            cancel_signals: DashMap::new(),
            time_estimator: Arc::new(TimeEstimator::new()),
            approvals: Arc::new(ApprovalManager::new()),
            templates: Arc::new(WorkflowTemplateManager::new()),
        }
    }

    /// Registers the orchestrator on the bus and installs its handlers
    pub async fn initialize(&self) {
        self.comms
            .register_agent(
                self.agent_id.clone(),
                "orchestrator",
                vec![
                    "workflow_management".to_owned(),
                    "agent_coordination".to_owned(),
                    "error_recovery".to_owned(),
                ],
            )
            .await;

        // Responses for live requests resolve pending futures before handler
        // dispatch; anything landing here is late or uncorrelated.
        self.comms.register_handler(
            self.agent_id.clone(),
            MessageType::Response,
            handler_fn(|message| async move {
                debug!(
                    sender = %message.sender,
                    correlation_id = ?message.correlation_id,
                    "dropping late agent response"
                );
            }),
        );
        self.comms.register_handler(
            self.agent_id.clone(),
            MessageType::Error,
            handler_fn(|message| async move {
                error!(
                    sender = %message.sender,
                    payload = %message.payload,
                    "agent reported an error"
                );
            }),
        );

        info!(agent_id = %self.agent_id, "orchestrator initialized and registered");
    }

    /// The approval API for this orchestrator's workflows
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    /// The template registry
    #[must_use]
    pub fn templates(&self) -> &Arc<WorkflowTemplateManager> {
        &self.templates
    }

    /// Processes one RFP end to end.
    ///
    /// Selects a template (unless the caller supplies one), then executes
    /// its stages in order, honoring skip conditions, approval gates, and
    /// per-stage timeouts. Returns the final artifact on success or a
    /// structured failure.
    pub async fn process_rfp(
        &self,
        rfp: RfpData,
        template_id: Option<TemplateId>,
    ) -> Result<FinalArtifact, WorkflowFailure> {
        let template_id = template_id.unwrap_or_else(|| self.templates.select_template(&rfp));
        let template = match self.templates.get_template(&template_id) {
            Some(template) => template,
            None => {
                warn!(template_id = %template_id, "unknown template, using standard_rfp");
                self.templates
                    .get_template(&TemplateId::from("standard_rfp"))
                    .expect("standard_rfp template is preloaded")
            }
        };

        let workflow_id = WorkflowId::generate();
        let estimated_duration = self
            .time_estimator
            .estimate_workflow_time(template.stages.iter().map(|s| s.stage.as_str()));

        let context = WorkflowContext {
            workflow_id,
            rfp_id: rfp.rfp_id.clone(),
            customer_id: rfp.customer_id.clone(),
            current_stage: WorkflowStage::Received,
            status: WorkflowStatus::Pending,
            stage_results: BTreeMap::new(),
            errors: Vec::new(),
            started_at: SystemTime::now(),
            ended_at: None,
            template_id: template.template_id.clone(),
            template_name: template.name.clone(),
            estimated_duration,
            metadata: HashMap::from([
                ("priority".to_owned(), json!(rfp.priority)),
                ("deadline".to_owned(), json!(rfp.deadline)),
            ]),
        };
        self.active_workflows.insert(workflow_id, context);

        let cancel = Arc::new(CancelSignal::new());
        self.cancel_signals.insert(workflow_id, Arc::clone(&cancel));

        info!(
            workflow_id = %workflow_id,
            rfp_id = %rfp.rfp_id,
            template = %template.template_id,
            estimated_secs = estimated_duration.as_secs_f64(),
            "starting RFP workflow"
        );

        let result = self.run_pipeline(workflow_id, &template, &rfp, &cancel).await;
        self.cancel_signals.remove(&workflow_id);
        result
    }

    async fn run_pipeline(
        &self,
        workflow_id: WorkflowId,
        template: &WorkflowTemplate,
        rfp: &RfpData,
        cancel: &CancelSignal,
    ) -> Result<FinalArtifact, WorkflowFailure> {
        self.update_context(workflow_id, |context| {
            context.status = WorkflowStatus::InProgress;
        });

        let mut data = PipelineData::default();

        for group in group_stages(&template.stages) {
            let mut to_run: Vec<&StageConfig> = Vec::new();
            for stage_config in group {
                if ConditionalRouter::should_skip(stage_config, rfp) {
                    info!(
                        workflow_id = %workflow_id,
                        stage = %stage_config.stage,
                        "stage skipped"
                    );
                    self.record_stage_result(
                        workflow_id,
                        StageResult::skipped(stage_config.stage),
                    );
                    continue;
                }
                to_run.push(stage_config);
            }
            if to_run.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(self.finish_cancelled(workflow_id));
            }

            let results = if to_run.len() == 1 {
                vec![self.run_stage(workflow_id, to_run[0], rfp, &data, cancel).await]
            } else {
                // Concurrent group: issue every request, join all, then
                // fail the group if any member failed.
                futures::future::join_all(
                    to_run
                        .iter()
                        .map(|config| self.run_stage(workflow_id, config, rfp, &data, cancel)),
                )
                .await
            };

            let mut group_failure: Option<StageResult> = None;
            for outcome in results {
                match outcome {
                    Err(Cancelled) => return Err(self.finish_cancelled(workflow_id)),
                    Ok(result) if result.status == StageStatus::Failed => {
                        // Failed stages never enter stage_results; they are
                        // reported through the error list instead.
                        if group_failure.is_none() {
                            group_failure = Some(result);
                        }
                    }
                    Ok(result) => {
                        apply_output(&mut data, &result);
                        self.record_stage_result(workflow_id, result);
                    }
                }
            }
            if let Some(failed) = group_failure {
                return Err(self.finish_failed(workflow_id, &failed).await);
            }
        }

        Ok(self.finish_completed(workflow_id, &data).await)
    }

    async fn run_stage(
        &self,
        workflow_id: WorkflowId,
        stage_config: &StageConfig,
        rfp: &RfpData,
        data: &PipelineData,
        cancel: &CancelSignal,
    ) -> Result<StageResult, Cancelled> {
        let stage = stage_config.stage;
        let started = Instant::now();

        self.update_context(workflow_id, |context| {
            context.current_stage = stage;
        });
        self.comms
            .set_agent_state(&self.agent_id, "current_stage", json!(stage.as_str()), None)
            .await;
        info!(workflow_id = %workflow_id, stage = %stage, "stage started");

        if stage_config.approval_required {
            let snapshot = json!({
                "rfp_id": rfp.rfp_id,
                "customer_id": rfp.customer_id,
                "estimated_value": rfp.estimated_value,
                "stage": stage.as_str(),
            });
            let approved = tokio::select! {
                approved = self.approvals.request_approval(
                    workflow_id,
                    stage,
                    stage_config.approval_roles.clone(),
                    snapshot,
                    Some(stage_config.timeout),
                ) => approved,
                () = cancel.cancelled() => return Err(Cancelled),
            };
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if !approved {
                let approval_id = ApprovalManager::approval_id(&workflow_id, stage);
                let message = match self.approvals.get(&approval_id) {
                    Some(request) if request.status == ApprovalStatus::Rejected => format!(
                        "approval rejected: {}",
                        request
                            .rejection_reason
                            .as_deref()
                            .unwrap_or("no reason given")
                    ),
                    Some(request) if request.status == ApprovalStatus::Timeout => {
                        "approval timed out".to_owned()
                    }
                    _ => "approval rejected or timed out".to_owned(),
                };
                return Ok(StageResult::failed(stage, message, started.elapsed()));
            }
        }

        let payload = match build_request_payload(workflow_id, stage, rfp, data) {
            Ok(payload) => payload,
            Err(message) => {
                return Ok(StageResult::failed(stage, message, started.elapsed()));
            }
        };

        let response = tokio::select! {
            response = self.comms.send_request(
                &self.agent_id,
                &stage_config.agent_id,
                payload,
                Some(stage_config.timeout),
            ) => response,
            () = cancel.cancelled() => return Err(Cancelled),
        };
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let duration = started.elapsed();
        let Some(value) = response else {
            return Ok(StageResult::failed(
                stage,
                "agent request timed out or was undeliverable",
                duration,
            ));
        };

        match decode_stage_output(stage, value) {
            Ok(output) => {
                self.time_estimator.record_stage_time(stage.as_str(), duration);
                info!(
                    workflow_id = %workflow_id,
                    stage = %stage,
                    duration_ms = duration.as_millis() as u64,
                    "stage completed"
                );
                Ok(StageResult::success(stage, output, duration))
            }
            Err(message) => {
                warn!(workflow_id = %workflow_id, stage = %stage, error = %message, "stage failed");
                Ok(StageResult::failed(stage, message, duration))
            }
        }
    }

    async fn finish_completed(
        &self,
        workflow_id: WorkflowId,
        data: &PipelineData,
    ) -> FinalArtifact {
        let review_started = Instant::now();
        self.update_context(workflow_id, |context| {
            context.current_stage = WorkflowStage::Review;
        });

        let ended_at = SystemTime::now();
        let context = self
            .active_workflows
            .get(&workflow_id)
            .map(|c| c.value().clone())
            .expect("context exists for running workflow");
        let total_duration = ended_at
            .duration_since(context.started_at)
            .unwrap_or(Duration::ZERO);

        let stage_durations: BTreeMap<String, Duration> = context
            .stage_results
            .values()
            .map(|result| (result.stage.as_str().to_owned(), result.duration))
            .collect();

        let pricing = data.pricing.clone().unwrap_or_default();
        let technical = data.technical.clone().unwrap_or_default();
        let response = data.response.clone().unwrap_or_default();

        let artifact = FinalArtifact {
            workflow_info: WorkflowInfo {
                workflow_id,
                rfp_id: context.rfp_id.clone(),
                customer_id: context.customer_id.clone(),
                template_id: context.template_id.clone(),
                template_name: context.template_name.clone(),
                status: WorkflowStatus::Completed,
                estimated_duration: context.estimated_duration,
                actual_duration: total_duration,
            },
            response_document: response.document,
            executive_summary: response.executive_summary,
            quote: Quote {
                quote_id: pricing.quote_id,
                total: pricing.total,
                line_items: pricing.line_item_prices,
                validity_days: pricing.validity_period,
            },
            compliance: ComplianceSummary {
                score: technical.compliance_score,
                standards_met: technical.standards_met,
                certifications: technical.certifications,
            },
            timeline: Timeline {
                started_at: context.started_at,
                completed_at: ended_at,
                total_duration,
                stage_durations,
            },
            metadata: ArtifactMetadata {
                stages_completed: context.stage_results.len(),
                confidence_scores: ConfidenceScores {
                    parsing: data.parsing.as_ref().map(|p| p.confidence_score).unwrap_or(0.0),
                    opportunity: data.sales.as_ref().map(|s| s.opportunity_score).unwrap_or(0.0),
                    compliance: technical.compliance_score,
                },
            },
        };

        self.record_stage_result(
            workflow_id,
            StageResult {
                stage: WorkflowStage::Review,
                status: StageStatus::Success,
                output: None,
                error: None,
                duration: review_started.elapsed(),
                timestamp: SystemTime::now(),
            },
        );
        self.update_context(workflow_id, |context| {
            context.status = WorkflowStatus::Completed;
            context.current_stage = WorkflowStage::Completed;
            context.ended_at = Some(ended_at);
        });
        self.time_estimator.record_workflow_time(total_duration);

        self.comms
            .broadcast(
                &self.agent_id,
                json!({
                    "event": "workflow_completed",
                    "workflow_id": workflow_id,
                    "rfp_id": context.rfp_id,
                    "duration": total_duration.as_secs_f64(),
                }),
                None,
            )
            .await;

        info!(
            workflow_id = %workflow_id,
            duration_secs = total_duration.as_secs_f64(),
            "RFP workflow completed"
        );
        artifact
    }

    async fn finish_failed(
        &self,
        workflow_id: WorkflowId,
        failed: &StageResult,
    ) -> WorkflowFailure {
        let ended_at = SystemTime::now();
        let message = format!(
            "stage {} failed: {}",
            failed.stage,
            failed.error.as_deref().unwrap_or("unknown error")
        );

        self.update_context(workflow_id, |context| {
            context.status = WorkflowStatus::Failed;
            context.current_stage = WorkflowStage::Failed;
            context.errors.push(message.clone());
            context.ended_at = Some(ended_at);
        });

        let failure = self.failure_snapshot(workflow_id, failed.stage, WorkflowStatus::Failed);

        self.comms
            .broadcast(
                &self.agent_id,
                json!({
                    "event": "workflow_failed",
                    "workflow_id": workflow_id,
                    "rfp_id": failure.rfp_id,
                    "failed_stage": failed.stage.as_str(),
                    "errors": failure.errors,
                }),
                None,
            )
            .await;

        error!(
            workflow_id = %workflow_id,
            failed_stage = %failed.stage,
            "RFP workflow failed"
        );
        failure
    }

    fn finish_cancelled(&self, workflow_id: WorkflowId) -> WorkflowFailure {
        let ended_at = SystemTime::now();
        let mut stopped_at = WorkflowStage::Received;
        self.update_context(workflow_id, |context| {
            stopped_at = context.current_stage;
            context.status = WorkflowStatus::Cancelled;
            context.errors.push("workflow cancelled".to_owned());
            context.ended_at = Some(ended_at);
        });
        warn!(workflow_id = %workflow_id, stage = %stopped_at, "RFP workflow cancelled");
        self.failure_snapshot(workflow_id, stopped_at, WorkflowStatus::Cancelled)
    }

    fn failure_snapshot(
        &self,
        workflow_id: WorkflowId,
        failed_stage: WorkflowStage,
        status: WorkflowStatus,
    ) -> WorkflowFailure {
        let context = self
            .active_workflows
            .get(&workflow_id)
            .map(|c| c.value().clone())
            .expect("context exists for running workflow");
        let duration = context
            .ended_at
            .and_then(|end| end.duration_since(context.started_at).ok())
            .unwrap_or(Duration::ZERO);
        WorkflowFailure {
            workflow_id,
            rfp_id: context.rfp_id.clone(),
            status,
            failed_stage,
            errors: context.errors.clone(),
            completed_stages: context.stage_results.keys().copied().collect(),
            duration,
        }
    }

    /// Cancels an active workflow: in-flight requests and approvals are
    /// released and no further stages are issued. Returns whether a running
    /// workflow was found.
    pub fn cancel_workflow(&self, workflow_id: &WorkflowId) -> bool {
        let Some(signal) = self.cancel_signals.get(workflow_id) else {
            return false;
        };
        signal.cancel();
        self.approvals.cancel_workflow(workflow_id);
        info!(workflow_id = %workflow_id, "workflow cancellation requested");
        true
    }

    /// Status view of one workflow, active or terminal-but-not-evicted
    #[must_use]
    pub fn get_workflow_status(&self, workflow_id: &WorkflowId) -> Option<WorkflowStatusReport> {
        self.active_workflows.get(workflow_id).map(|context| WorkflowStatusReport {
            workflow_id: context.workflow_id,
            rfp_id: context.rfp_id.clone(),
            current_stage: context.current_stage,
            status: context.status,
            completed_stages: context.stage_results.keys().copied().collect(),
            errors: context.errors.clone(),
            started_at: context.started_at,
            ended_at: context.ended_at,
        })
    }

    /// Status views of every workflow still in memory
    #[must_use]
    pub fn get_all_active_workflows(&self) -> Vec<WorkflowStatusReport> {
        self.active_workflows
            .iter()
            .map(|entry| WorkflowStatusReport {
                workflow_id: entry.workflow_id,
                rfp_id: entry.rfp_id.clone(),
                current_stage: entry.current_stage,
                status: entry.status,
                completed_stages: entry.stage_results.keys().copied().collect(),
                errors: entry.errors.clone(),
                started_at: entry.started_at,
                ended_at: entry.ended_at,
            })
            .collect()
    }

    /// Drops a terminal workflow's context; running workflows are kept
    pub fn evict_workflow(&self, workflow_id: &WorkflowId) -> bool {
        self.active_workflows
            .remove_if(workflow_id, |_, context| context.status.is_terminal())
            .is_some()
    }

    /// Current time estimates per stage and for a full workflow
    #[must_use]
    pub fn get_time_estimates(&self) -> TimeEstimates {
        let stage_labels = [
            WorkflowStage::Parsing,
            WorkflowStage::SalesAnalysis,
            WorkflowStage::TechnicalValidation,
            WorkflowStage::PricingCalculation,
            WorkflowStage::ResponseGeneration,
        ];
        let stages: BTreeMap<String, StageEstimate> = stage_labels
            .iter()
            .map(|stage| {
                (
                    stage.as_str().to_owned(),
                    self.time_estimator.stage_estimate(stage.as_str()),
                )
            })
            .collect();
        TimeEstimates {
            total_workflow: self
                .time_estimator
                .estimate_workflow_time(stage_labels.iter().map(|s| s.as_str())),
            workflow_samples: self.time_estimator.workflow_samples(),
            stages,
        }
    }

    /// Summaries of every registered template
    #[must_use]
    pub fn get_available_templates(&self) -> Vec<TemplateSummary> {
        self.templates
            .list_templates()
            .into_iter()
            .map(|template| TemplateSummary {
                template_id: template.template_id,
                name: template.name,
                description: template.description,
                stages: template
                    .stages
                    .iter()
                    .map(|s| s.stage.as_str().to_owned())
                    .collect(),
                estimated_duration: template.estimated_duration,
            })
            .collect()
    }

    /// ASCII rendering of a workflow's progress
    #[must_use]
    pub fn visualize_workflow(&self, workflow_id: &WorkflowId) -> Option<String> {
        let context = self.active_workflows.get(workflow_id)?;
        let template = self.templates.get_template(&context.template_id)?;
        let stages: Vec<WorkflowStage> = template.stages.iter().map(|s| s.stage).collect();
        let completed: Vec<WorkflowStage> = context.stage_results.keys().copied().collect();
        let current = (context.status == WorkflowStatus::InProgress)
            .then_some(context.current_stage);
        Some(WorkflowVisualizer::ascii_flow(&stages, current, &completed))
    }

    /// Mermaid rendering of a workflow's progress
    #[must_use]
    pub fn mermaid_diagram(&self, workflow_id: &WorkflowId) -> Option<String> {
        let context = self.active_workflows.get(workflow_id)?;
        let template = self.templates.get_template(&context.template_id)?;
        let stages: Vec<WorkflowStage> = template.stages.iter().map(|s| s.stage).collect();
        let completed: Vec<WorkflowStage> = context
            .stage_results
            .iter()
            .filter(|(_, result)| result.status != StageStatus::Failed)
            .map(|(stage, _)| *stage)
            .collect();
        let failed = (context.status == WorkflowStatus::Failed).then(|| {
            context
                .stage_results
                .values()
                .find(|r| r.status == StageStatus::Failed)
                .map(|r| r.stage)
                .unwrap_or(context.current_stage)
        });
        Some(WorkflowVisualizer::mermaid_diagram(&stages, &completed, failed))
    }

    fn update_context(&self, workflow_id: WorkflowId, update: impl FnOnce(&mut WorkflowContext)) {
        if let Some(mut context) = self.active_workflows.get_mut(&workflow_id) {
            update(&mut context);
        }
    }

    fn record_stage_result(&self, workflow_id: WorkflowId, result: StageResult) {
        self.update_context(workflow_id, |context| {
            // A recorded result is never overwritten.
            context.stage_results.entry(result.stage).or_insert(result);
        });
    }
}

fn apply_output(data: &mut PipelineData, result: &StageResult) {
    match &result.output {
        Some(StageOutput::Parsing(output)) => data.parsing = Some(output.clone()),
        Some(StageOutput::SalesAnalysis(output)) => data.sales = Some(output.clone()),
        Some(StageOutput::TechnicalValidation(output)) => data.technical = Some(output.clone()),
        Some(StageOutput::PricingCalculation(output)) => data.pricing = Some(output.clone()),
        Some(StageOutput::ResponseGeneration(output)) => data.response = Some(output.clone()),
        None => {}
    }
}

fn build_request_payload(
    workflow_id: WorkflowId,
    stage: WorkflowStage,
    rfp: &RfpData,
    data: &PipelineData,
) -> Result<Value, String> {
    let payload = match stage {
        WorkflowStage::Parsing => serde_json::to_value(ParsingRequest {
            workflow_id,
            rfp_id: rfp.rfp_id.clone(),
            document: rfp.document.clone(),
            document_type: rfp.document_type().to_owned(),
        }),
        WorkflowStage::SalesAnalysis => {
            let parsing = data.parsing.clone().unwrap_or_default();
            serde_json::to_value(SalesRequest {
                workflow_id,
                rfp_id: rfp.rfp_id.clone(),
                customer_id: rfp.customer_id.clone(),
                requirements: parsing.requirements,
                sections: parsing.sections,
            })
        }
        WorkflowStage::TechnicalValidation => {
            let sales = data.sales.clone().unwrap_or_default();
            serde_json::to_value(TechnicalRequest {
                workflow_id,
                rfp_id: rfp.rfp_id.clone(),
                line_items: sales.line_items,
                recommended_products: sales.recommended_products,
            })
        }
        WorkflowStage::PricingCalculation => {
            let sales = data.sales.clone().unwrap_or_default();
            let technical = data.technical.clone().unwrap_or_default();
            serde_json::to_value(PricingRequest {
                workflow_id,
                rfp_id: rfp.rfp_id.clone(),
                customer_id: rfp.customer_id.clone(),
                line_items: sales.line_items,
                validated_products: technical.validated_products,
                customer_context: sales.customer_context,
            })
        }
        WorkflowStage::ResponseGeneration => serde_json::to_value(ResponseRequest {
            workflow_id,
            rfp_id: rfp.rfp_id.clone(),
            customer_id: rfp.customer_id.clone(),
            parsed_content: data.parsing.clone().unwrap_or_default(),
            sales_analysis: data.sales.clone().unwrap_or_default(),
            technical_validation: data.technical.clone().unwrap_or_default(),
            pricing: data.pricing.clone().unwrap_or_default(),
            deadline: rfp.deadline.clone(),
        }),
        other => return Err(format!("stage {other} has no agent contract")),
    };
    payload.map_err(|err| format!("failed to encode request payload: {err}"))
}

fn decode_stage_output(stage: WorkflowStage, value: Value) -> Result<StageOutput, String> {
    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, String> {
        serde_json::from_value::<AgentReply<T>>(value)
            .map_err(|err| format!("malformed agent reply: {err}"))?
            .into_result()
    }

    match stage {
        WorkflowStage::Parsing => decode::<ParsingOutput>(value).map(StageOutput::Parsing),
        WorkflowStage::SalesAnalysis => decode::<SalesOutput>(value).map(StageOutput::SalesAnalysis),
        WorkflowStage::TechnicalValidation => {
            decode::<TechnicalOutput>(value).map(StageOutput::TechnicalValidation)
        }
        WorkflowStage::PricingCalculation => {
            decode::<PricingOutput>(value).map(StageOutput::PricingCalculation)
        }
        WorkflowStage::ResponseGeneration => {
            decode::<ResponseOutput>(value).map(StageOutput::ResponseGeneration)
        }
        other => Err(format!("stage {other} has no agent contract")),
    }
}

/// Splits the stage list into sequential singletons and concurrent groups.
///
/// Consecutive stages join one group when either side declares the other in
/// its `parallel_with` list.
fn group_stages(stages: &[StageConfig]) -> Vec<Vec<&StageConfig>> {
    let mut groups: Vec<Vec<&StageConfig>> = Vec::new();
    for stage in stages {
        let joins_previous = groups.last().is_some_and(|group| {
            group.last().is_some_and(|prev| {
                prev.parallel_with.contains(&stage.stage)
                    || stage.parallel_with.contains(&prev.stage)
            })
        });
        if joins_previous {
            if let Some(group) = groups.last_mut() {
                group.push(stage);
            }
        } else {
            groups.push(vec![stage]);
        }
    }
    groups
}
