//! Human-in-the-loop approval gates
//!
//! One approval exists per (workflow, stage). The requesting task suspends
//! on a one-shot future until an approver decides or the timeout elapses;
//! a timed-out approval refuses late decisions.

use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::domain_types::{ApprovalId, WorkflowId};
use crate::workflow::stage::WorkflowStage;

/// Decision state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a decision
    Pending,
    /// Granted
    Approved,
    /// Denied with a reason
    Rejected,
    /// Deadline elapsed before a decision; terminal
    Timeout,
}

/// A pending or decided approval
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    /// Derived identifier: `approval_{workflow}_{stage}`
    pub approval_id: ApprovalId,
    /// Workflow awaiting the decision
    pub workflow_id: WorkflowId,
    /// Stage being gated
    pub stage: WorkflowStage,
    /// When the gate was raised
    pub requested_at: SystemTime,
    /// Roles allowed to decide
    pub required_roles: Vec<String>,
    /// Snapshot of workflow data shown to the approver
    pub context_data: Value,
    /// Current decision state
    pub status: ApprovalStatus,
    /// Who decided
    pub decided_by: Option<String>,
    /// When the decision landed
    pub decided_at: Option<SystemTime>,
    /// Reason supplied on rejection
    pub rejection_reason: Option<String>,
}

/// Manages approval gates and their waiting workflow tasks
#[derive(Default)]
pub struct ApprovalManager {
    approvals: DashMap<ApprovalId, ApprovalRequest>,
    waiters: DashMap<ApprovalId, oneshot::Sender<bool>>,
}

impl ApprovalManager {
    /// Creates an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for the (workflow, stage) gate
    #[must_use]
    pub fn approval_id(workflow_id: &WorkflowId, stage: WorkflowStage) -> ApprovalId {
        ApprovalId::from(format!("approval_{workflow_id}_{stage}"))
    }

    /// Raises an approval gate and suspends until it is decided.
    ///
    /// Returns `true` only when approved; rejection and timeout both return
    /// `false`. After a timeout the approval transitions to
    /// [`ApprovalStatus::Timeout`] and late decisions are ignored.
    pub async fn request_approval(
        &self,
        workflow_id: WorkflowId,
        stage: WorkflowStage,
        required_roles: Vec<String>,
        context_data: Value,
        timeout: Option<Duration>,
    ) -> bool {
        let approval_id = Self::approval_id(&workflow_id, stage);
        let request = ApprovalRequest {
            approval_id: approval_id.clone(),
            workflow_id,
            stage,
            requested_at: SystemTime::now(),
            required_roles: required_roles.clone(),
            context_data,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            rejection_reason: None,
        };
        self.approvals.insert(approval_id.clone(), request);

        let (decision_tx, decision_rx) = oneshot::channel();
        self.waiters.insert(approval_id.clone(), decision_tx);

        info!(
            approval_id = %approval_id,
            stage = %stage,
            roles = ?required_roles,
            "approval requested"
        );

        let decision = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, decision_rx).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    // Transition to timeout before dropping the waiter so a
                    // racing decision observes a terminal status.
                    if let Some(mut entry) = self.approvals.get_mut(&approval_id) {
                        if entry.status == ApprovalStatus::Pending {
                            entry.status = ApprovalStatus::Timeout;
                            entry.decided_at = Some(SystemTime::now());
                        }
                    }
                    self.waiters.remove(&approval_id);
                    warn!(approval_id = %approval_id, "approval timed out");
                    return false;
                }
            },
            None => decision_rx.await,
        };

        decision.unwrap_or(false)
    }

    /// Approves a pending request. Duplicate or late decisions are ignored.
    pub fn approve(&self, approval_id: &ApprovalId, approver: &str) -> bool {
        {
            let Some(mut entry) = self.approvals.get_mut(approval_id) else {
                return false;
            };
            if entry.status != ApprovalStatus::Pending {
                return false;
            }
            entry.status = ApprovalStatus::Approved;
            entry.decided_by = Some(approver.to_owned());
            entry.decided_at = Some(SystemTime::now());
        }
        if let Some((_, waiter)) = self.waiters.remove(approval_id) {
            let _ = waiter.send(true);
        }
        info!(approval_id = %approval_id, approver, "approval granted");
        true
    }

    /// Rejects a pending request with a reason. Duplicate or late decisions
    /// are ignored.
    pub fn reject(&self, approval_id: &ApprovalId, approver: &str, reason: &str) -> bool {
        {
            let Some(mut entry) = self.approvals.get_mut(approval_id) else {
                return false;
            };
            if entry.status != ApprovalStatus::Pending {
                return false;
            }
            entry.status = ApprovalStatus::Rejected;
            entry.decided_by = Some(approver.to_owned());
            entry.decided_at = Some(SystemTime::now());
            entry.rejection_reason = Some(reason.to_owned());
        }
        if let Some((_, waiter)) = self.waiters.remove(approval_id) {
            let _ = waiter.send(false);
        }
        warn!(approval_id = %approval_id, approver, reason, "approval rejected");
        true
    }

    /// Pending approvals, optionally filtered to one workflow
    #[must_use]
    pub fn pending_approvals(&self, workflow_id: Option<&WorkflowId>) -> Vec<ApprovalRequest> {
        self.approvals
            .iter()
            .filter(|entry| entry.status == ApprovalStatus::Pending)
            .filter(|entry| workflow_id.map(|wf| entry.workflow_id == *wf).unwrap_or(true))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of one approval, decided or not
    #[must_use]
    pub fn get(&self, approval_id: &ApprovalId) -> Option<ApprovalRequest> {
        self.approvals.get(approval_id).map(|entry| entry.value().clone())
    }

    /// Cancels every pending approval of a workflow, releasing the waiting
    /// tasks with a rejection. Used when the workflow itself is cancelled.
    pub fn cancel_workflow(&self, workflow_id: &WorkflowId) {
        let ids: Vec<ApprovalId> = self
            .approvals
            .iter()
            .filter(|entry| {
                entry.workflow_id == *workflow_id && entry.status == ApprovalStatus::Pending
            })
            .map(|entry| entry.approval_id.clone())
            .collect();

        for approval_id in ids {
            if let Some(mut entry) = self.approvals.get_mut(&approval_id) {
                if entry.status == ApprovalStatus::Pending {
                    entry.status = ApprovalStatus::Timeout;
                    entry.decided_at = Some(SystemTime::now());
                }
            }
            if let Some((_, waiter)) = self.waiters.remove(&approval_id) {
                let _ = waiter.send(false);
            }
        }
    }
}
