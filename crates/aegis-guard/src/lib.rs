//! # aegis-guard
//!
//! Safety primitives shared by every execution: the guardrail validator
//! (input scanning, rate limiting, resource ceilings), per-plan execution
//! budgets, the circuit breaker registry, and checkpoint storage.

pub mod budget;
pub mod checkpoint;
pub mod circuit;
pub mod guardrail;
pub mod ratelimit;
pub mod resource;

pub use budget::{BudgetState, ExecutionBudget};
pub use checkpoint::{
    CheckpointManager, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore,
};
pub use circuit::{CircuitBreakerRegistry, CircuitSnapshot, CircuitStats, StateChange};
pub use guardrail::{
    GuardrailValidator, InputRule, PatternRule, ValidationReport, Violation, ViolationCategory,
};
pub use ratelimit::RateLimiter;
pub use resource::{ResourceLimits, ResourceMonitor, ResourceUsage};
