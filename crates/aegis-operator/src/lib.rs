//! # aegis-operator
//!
//! The Operator turns intents into plans and runs them.
//!
//! - [`PlanCompiler`] resolves an intent to a skill or hub, expands hub
//!   workflows, inserts checkpoint boundaries after destructive steps, and
//!   derives the resource manifest and risk level.
//! - [`Operator`] authorizes each plan through Aurora and schedules its steps
//!   in dependency order with retries, limits, pause/cut handling,
//!   checkpoints and rollback.
//! - [`SandboxExecutor`] runs a single step in its execution mode.

pub mod compiler;
pub mod engine;
pub mod registry;
pub mod sandbox;

pub use compiler::{PlanCompiler, manifest_for};
pub use engine::Operator;
pub use registry::{RegisteredCapability, SkillRegistry};
pub use sandbox::SandboxExecutor;
