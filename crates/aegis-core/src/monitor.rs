use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::types::Severity;

/// Point-in-time resource and execution metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Resident memory of this process.
    pub process_memory_mb: f64,
    pub active_executions: u32,
    pub queued_executions: u32,
    /// Failed dispatches / total dispatches over the stats window, 0.0-1.0.
    pub error_rate: f64,
    pub success_rate: f64,
    pub errors_per_minute: u32,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelStats>,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            process_memory_mb: 0.0,
            active_executions: 0,
            queued_executions: 0,
            error_rate: 0.0,
            success_rate: 1.0,
            errors_per_minute: 0,
            channels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Healthy,
    Degraded,
    Down,
}

/// Latency and health of one channel or external target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub latency_ms: f64,
    pub status: ChannelStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Loop,
    MemoryLeak,
    ErrorBurst,
    TimeoutCascade,
    RateExceeded,
    UnauthorizedAccess,
    SuspiciousPattern,
    CpuSaturation,
    DiskExhaustion,
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loop => "loop",
            Self::MemoryLeak => "memory_leak",
            Self::ErrorBurst => "error_burst",
            Self::TimeoutCascade => "timeout_cascade",
            Self::RateExceeded => "rate_exceeded",
            Self::UnauthorizedAccess => "unauthorized_access",
            Self::SuspiciousPattern => "suspicious_pattern",
            Self::CpuSaturation => "cpu_saturation",
            Self::DiskExhaustion => "disk_exhaustion",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Monitor,
    Alert,
    Pause,
    Cut,
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Monitor => "monitor",
            Self::Alert => "alert",
            Self::Pause => "pause",
            Self::Cut => "cut",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    pub recommended_action: RecommendedAction,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn new(
        anomaly_type: AnomalyType,
        severity: Severity,
        metric: impl Into<String>,
        value: f64,
        threshold: f64,
        recommended_action: RecommendedAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            anomaly_type,
            severity,
            metric: metric.into(),
            value,
            threshold,
            message: message.into(),
            plan_id: None,
            recommended_action,
            detected_at: Utc::now(),
        }
    }

    pub fn for_plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    /// Deduplication key: type, metric and plan.
    pub fn key(&self) -> String {
        match self.plan_id {
            Some(id) => format!("{}:{}:{}", self.anomaly_type, self.metric, id),
            None => format!("{}:{}", self.anomaly_type, self.metric),
        }
    }
}
