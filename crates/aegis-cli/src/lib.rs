//! # aegis-cli
//!
//! Diagnostics command line for the Aegis control plane.
//!
//! Commands:
//! - `aegis check`: validate the configuration
//! - `aegis config [--json]`: print the effective configuration
//! - `aegis scan <text>`: run the guardrail validator over some input
//! - `aegis metrics`: sample host metrics once and evaluate thresholds
//! - `aegis authorize <plan.json>`: score an execution plan
//! - `aegis checkpoints list|purge`: inspect the SQLite checkpoint store

pub mod commands;

pub use commands::Cli;
