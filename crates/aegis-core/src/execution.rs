use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::auth::AuthorizationResponse;
use crate::plan::StepId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    RolledBack,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::RolledBack => "rolled_back",
        })
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total dispatch attempts including the first.
    pub attempts: u32,
    /// Attempts beyond the first.
    pub retries: u32,
    /// Set when the step was skipped because its circuit was open.
    #[serde(default)]
    pub circuit_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: Value::Null,
            error: None,
            attempts: 0,
            retries: 0,
            circuit_open: false,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
        }
    }

    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::pending(step_id);
        result.status = StepStatus::Skipped;
        result.error = Some(reason.into());
        result.finished_at = Some(Utc::now());
        result
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Lifecycle of one plan execution.
///
/// `queued → authorized → running → {paused, completed, failed, cancelled, cut}`,
/// with `paused → running` on resume and `blocked` when authorization refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Authorized,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Blocked,
    Cut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Blocked | Self::Cut
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Authorized | Self::Running | Self::Paused
        )
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Queued, Authorized | Blocked | Cancelled | Failed) => true,
            (Authorized, Running | Cancelled | Failed | Blocked) => true,
            (Running, Paused | Completed | Failed | Cancelled | Cut | Blocked) => true,
            (Paused, Running | Cancelled | Failed | Cut) => true,
            // checkpoint resume re-enters the machine from a terminal snapshot
            (Failed | Cut | Cancelled, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Authorized => "authorized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
            Self::Cut => "cut",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub reason: String,
}

/// What a rollback pass did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackReport {
    pub plan_id: Uuid,
    /// Steps whose rollback command succeeded, in invocation order.
    pub rolled_back: Vec<StepId>,
    /// Steps whose rollback command failed, with the error.
    pub failed: Vec<(StepId, String)>,
    /// Completed steps that had no rollback path.
    pub skipped_irreversible: Vec<StepId>,
}

impl RollbackReport {
    pub fn new(plan_id: Uuid) -> Self {
        Self {
            plan_id,
            ..Default::default()
        }
    }

    /// True when no rollback command was invoked.
    pub fn is_noop(&self) -> bool {
        self.rolled_back.is_empty() && self.failed.is_empty()
    }
}

/// Aggregate result of executing a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: Uuid,
    pub status: ExecutionStatus,
    /// Per-step results in plan order.
    pub step_results: Vec<StepResult>,
    /// Outputs of completed steps keyed by step id.
    #[serde(default)]
    pub final_output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationResponse>,
    /// Human-readable explanation for blocked, confirmation and cut outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<Uuid>,
    #[serde(default)]
    pub can_resume: bool,
    #[serde(default)]
    pub can_rollback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn new(plan_id: Uuid, status: ExecutionStatus) -> Self {
        Self {
            plan_id,
            status,
            step_results: Vec::new(),
            final_output: Value::Null,
            error: None,
            authorization: None,
            message: None,
            checkpoint_id: None,
            can_resume: false,
            can_rollback: false,
            rollback: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == id)
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}
