use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a per-target circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    #[default]
    Closed,
    /// A single trial call is admitted.
    HalfOpen,
    /// Calls fail fast until `retry_after_ms` elapses.
    Open,
}

impl CircuitState {
    /// 0-100 contribution to the circuit risk factor.
    pub fn risk_score(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 50,
            Self::Open => 100,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        })
    }
}

/// Severity shared by guardrail violations and anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}
