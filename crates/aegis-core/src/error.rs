use thiserror::Error;
use uuid::Uuid;

/// Reasons an intent cannot be compiled into an executable plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("no registered skill or hub handles intent '{0}'")]
    UnmappedIntent(String),

    #[error("capability not found: {0}")]
    UnknownCapability(String),

    #[error("plan has no steps")]
    EmptyPlan,

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected between steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("irreversible step '{step}' follows destructive step '{destructive}' without a checkpoint")]
    MissingCheckpointBoundary { step: String, destructive: String },

    #[error("invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },
}

/// Unified error type for the control plane.
#[derive(Error, Debug)]
pub enum AegisError {
    // ── Planning ───────────────────────────────────────────────
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    // ── Authorization ──────────────────────────────────────────
    #[error("authorization denied for request {request_id}: {reason}")]
    AuthorizationDenied { request_id: Uuid, reason: String },

    #[error("authorization request not found or already settled: {0}")]
    AuthorizationNotPending(Uuid),

    // ── Execution ──────────────────────────────────────────────
    #[error("step '{step_id}' failed: {reason}")]
    Step {
        step_id: String,
        reason: String,
        recoverable: bool,
    },

    #[error("execution of plan {plan_id} failed at step '{step_id}': {reason}")]
    Execution {
        plan_id: Uuid,
        step_id: String,
        reason: String,
    },

    #[error("circuit open for '{target}', retry after {retry_after_ms}ms")]
    CircuitOpen { target: String, retry_after_ms: u64 },

    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    Timeout { step_id: String, timeout_ms: u64 },

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("invalid execution state: {0}")]
    InvalidState(String),

    // ── Guardrail / limits ─────────────────────────────────────
    #[error("rate limit exceeded for '{identifier}', retry after {retry_after_ms}ms")]
    RateLimited {
        identifier: String,
        retry_after_ms: u64,
    },

    #[error("limit exceeded: {resource}: used {used}, limit {limit}")]
    LimitExceeded {
        resource: String,
        used: f64,
        limit: f64,
    },

    #[error("guardrail violation in step '{step_id}': {reason}")]
    GuardrailViolation { step_id: String, reason: String },

    // ── Skills ─────────────────────────────────────────────────
    #[error("skill error: {target}.{method}: {reason}")]
    Skill {
        target: String,
        method: String,
        reason: String,
    },

    // ── Checkpoints ────────────────────────────────────────────
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("checkpoint not found or expired: {0}")]
    CheckpointNotFound(Uuid),

    // ── Config ─────────────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AegisError {
    /// Whether the retry policy may attempt the failing operation again.
    ///
    /// Open circuits, guardrail violations, budget overruns and cancellations
    /// are never retried against the same target.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Step { recoverable, .. } => *recoverable,
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Skill { .. } | Self::Io(_) => {
                true
            }
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

pub type Result<T> = std::result::Result<T, AegisError>;
