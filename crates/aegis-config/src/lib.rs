//! # aegis-config
//!
//! Configuration for the Aegis control plane. Reads `aegis.toml`, then applies
//! environment variable overrides.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AegisConfig, AuthorizationConfig, CheckpointConfig, CircuitBreakerConfig, ConfigWarning,
    CustomPattern, EngineConfig, GuardrailConfig, HealPolicy, HealerConfig, LoggingConfig,
    MetricThresholds, MonitorConfig, RiskWeights, WarningSeverity,
};
