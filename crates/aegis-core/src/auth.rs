use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::plan::{ExecutionLimits, ExecutionPlan, ResourceManifest, RiskLevel, SandboxMode};

/// Traffic-light level derived from a 0-100 risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemaphoreLevel {
    Green,
    Yellow,
    Orange,
    Red,
}

impl SemaphoreLevel {
    /// `green < 30 ≤ yellow < 60 ≤ orange < 80 ≤ red`.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=29 => Self::Green,
            30..=59 => Self::Yellow,
            60..=79 => Self::Orange,
            _ => Self::Red,
        }
    }
}

impl fmt::Display for SemaphoreLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Orange => "orange",
            Self::Red => "red",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Limited,
    RequiresConfirmation,
    Blocked,
}

impl Decision {
    pub fn from_level(level: SemaphoreLevel) -> Self {
        match level {
            SemaphoreLevel::Green => Self::Allowed,
            SemaphoreLevel::Yellow => Self::Limited,
            SemaphoreLevel::Orange => Self::RequiresConfirmation,
            SemaphoreLevel::Red => Self::Blocked,
        }
    }

    /// Whether execution may start under this decision without further input.
    pub fn permits_execution(&self) -> bool {
        matches!(self, Self::Allowed | Self::Limited)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allowed => "allowed",
            Self::Limited => "limited",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::Blocked => "blocked",
        })
    }
}

/// One named contribution to a risk score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    /// 0-100.
    pub score: u8,
    pub weight: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
}

impl RiskFactor {
    pub fn new(name: impl Into<String>, score: u8, weight: f64, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            score: score.min(100),
            weight,
            description: description.into(),
            mitigation: None,
        }
    }

    pub fn with_mitigation(mut self, mitigation: impl Into<String>) -> Self {
        self.mitigation = Some(mitigation.into());
        self
    }

    pub fn contribution(&self) -> f64 {
        self.score as f64 * self.weight
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub id: Uuid,
    pub plan: ExecutionPlan,
    pub manifest: ResourceManifest,
    pub risk_level: RiskLevel,
    pub suggested_limits: ExecutionLimits,
    pub mode: SandboxMode,
    pub requested_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    pub fn for_plan(plan: &ExecutionPlan) -> Self {
        Self {
            id: Uuid::new_v4(),
            manifest: plan.manifest.clone(),
            risk_level: plan.risk_level,
            suggested_limits: plan.limits.clone(),
            mode: plan.mode,
            plan: plan.clone(),
            requested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub request_id: Uuid,
    pub plan_id: Uuid,
    pub decision: Decision,
    pub risk_score: u8,
    pub level: SemaphoreLevel,
    pub factors: Vec<RiskFactor>,
    /// Limits imposed on the execution.
    pub limits: ExecutionLimits,
    /// Rules that fired or constrain the run.
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_prompt: Option<String>,
    pub valid_for_ms: u64,
    pub issued_at: DateTime<Utc>,
}

impl AuthorizationResponse {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::milliseconds(self.valid_for_ms as i64)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn permits_execution(&self) -> bool {
        self.decision.permits_execution()
    }
}
