//! # aegis-core
//!
//! Shared vocabulary of the Aegis execution control plane: intents, plans,
//! execution results, authorization records, checkpoints, the skill handler
//! contract, the event union, and the unified error type.

pub mod auth;
pub mod checkpoint;
pub mod error;
pub mod event;
pub mod execution;
pub mod intent;
pub mod monitor;
pub mod plan;
pub mod skill;
pub mod types;

pub use auth::{AuthorizationRequest, AuthorizationResponse, Decision, RiskFactor, SemaphoreLevel};
pub use checkpoint::ExecutionCheckpoint;
pub use error::{AegisError, PlanError, Result};
pub use event::{Event, EventBus, HandlerId};
pub use execution::{
    ExecutionFailure, ExecutionResult, ExecutionStatus, RollbackReport, StepResult, StepStatus,
};
pub use intent::{SessionContext, UserIntent};
pub use monitor::{
    Anomaly, AnomalyType, ChannelStats, ChannelStatus, RecommendedAction, SystemMetrics,
};
pub use plan::{
    ActionType, ConditionOperator, ExecutionLimits, ExecutionPlan, ExecutionStep,
    ResourceManifest, RiskLevel, RollbackCommand, SandboxMode, StepCondition, StepId,
};
pub use skill::{
    CapabilityDescriptor, CapabilityKind, InvocationContext, MethodSpec, SkillCategory,
    SkillHandler, WorkflowStep,
};
pub use types::*;
