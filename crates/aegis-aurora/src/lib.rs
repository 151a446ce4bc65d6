//! # aegis-aurora
//!
//! Aurora decides whether a plan may run and watches it while it does.
//!
//! - **Authorization**: a pluggable [`RiskScorer`] turns a plan into named
//!   risk factors and a 0-100 score; the [`AuthorizationGate`] maps it to a
//!   semaphore level and decision, applies rules, and settles confirmations.
//! - **Monitoring**: a [`MetricsCollector`] and [`ExecutionStats`] feed the
//!   [`AnomalyDetector`]; alerts, anomalies and health go out on the event bus.
//!   Published alerts stay in a bounded [`AlertLog`] until acknowledged.
//! - **Reaction**: the [`AutoHealer`] runs configured heal actions; pause and
//!   cut signals are left for the engine to pick up.

pub mod alerts;
pub mod aurora;
pub mod authorize;
pub mod collector;
pub mod detector;
pub mod healer;
pub mod scorer;
pub mod stats;

pub use alerts::{AlertLog, AlertRecord, AlertSummary};
pub use aurora::{Aurora, ControlSignal, MonitorSample, TrackedExecution};
pub use authorize::AuthorizationGate;
pub use collector::{MetricsCollector, StaticCollector, SystemCollector};
pub use detector::{Alert, AnomalyDetector, Evaluation};
pub use healer::{AutoHealer, HealAction, HealOutcome, ResetCircuits, TrimAllocator};
pub use scorer::{DefaultRiskScorer, RiskScorer, ScoringContext};
pub use stats::ExecutionStats;
