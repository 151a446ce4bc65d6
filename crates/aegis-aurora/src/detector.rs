use aegis_config::MetricThresholds;
use aegis_core::{Anomaly, AnomalyType, RecommendedAction, Severity, SystemMetrics};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// Window over which anomalies lower the health score.
const HEALTH_ANOMALY_WINDOW_SECS: i64 = 300;
/// Share of consecutive increases that marks memory growth as sustained.
const LEAK_INCREASING_RATIO: f64 = 0.7;

/// A warning-level threshold crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
}

/// What one sample produced after cool-down filtering.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub alerts: Vec<Alert>,
    pub anomalies: Vec<Anomaly>,
}

/// Compares samples against [`MetricThresholds`] and spots patterns across
/// samples (memory growth, repeated actions, timeout and error bursts).
pub struct AnomalyDetector {
    thresholds: RwLock<MetricThresholds>,
    history: Mutex<VecDeque<SystemMetrics>>,
    history_size: usize,
    /// Timestamps per `plan:action` for loop detection.
    actions: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    anomaly_cooldown: Duration,
    alert_cooldown: Duration,
    last_anomaly: DashMap<String, DateTime<Utc>>,
    last_alert: DashMap<String, DateTime<Utc>>,
    /// Admitted anomalies, kept for the health score.
    recent: Mutex<VecDeque<Anomaly>>,
}

impl AnomalyDetector {
    pub fn new(
        thresholds: MetricThresholds,
        history_size: usize,
        anomaly_cooldown_secs: u64,
        alert_cooldown_secs: u64,
    ) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            history: Mutex::new(VecDeque::new()),
            history_size: history_size.max(1),
            actions: Mutex::new(HashMap::new()),
            anomaly_cooldown: Duration::seconds(anomaly_cooldown_secs as i64),
            alert_cooldown: Duration::seconds(alert_cooldown_secs as i64),
            last_anomaly: DashMap::new(),
            last_alert: DashMap::new(),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn thresholds(&self) -> MetricThresholds {
        self.thresholds.read().clone()
    }

    pub fn update_thresholds(&self, thresholds: MetricThresholds) {
        *self.thresholds.write() = thresholds;
    }

    pub fn history(&self) -> Vec<SystemMetrics> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<SystemMetrics> {
        self.history.lock().back().cloned()
    }

    /// Record a sample and evaluate it.
    ///
    /// `timeouts_last_minute` comes from execution statistics; the detector
    /// does not see individual steps.
    pub fn observe_at(
        &self,
        metrics: SystemMetrics,
        timeouts_last_minute: u32,
        now: DateTime<Utc>,
    ) -> Evaluation {
        {
            let mut history = self.history.lock();
            history.push_back(metrics.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
        }

        let t = self.thresholds.read().clone();
        let mut alerts = Vec::new();
        let mut anomalies = Vec::new();

        // ── Host resources ───
        for (metric, value, warning, critical, anomaly_type, action) in [
            (
                "cpu_percent",
                metrics.cpu_percent,
                t.cpu_warning,
                t.cpu_critical,
                AnomalyType::CpuSaturation,
                RecommendedAction::Pause,
            ),
            (
                "memory_percent",
                metrics.memory_percent,
                t.memory_warning,
                t.memory_critical,
                AnomalyType::MemoryLeak,
                RecommendedAction::Pause,
            ),
            (
                "disk_percent",
                metrics.disk_percent,
                t.disk_warning,
                t.disk_critical,
                AnomalyType::DiskExhaustion,
                RecommendedAction::Cut,
            ),
        ] {
            if value >= critical {
                anomalies.push(Anomaly::new(
                    anomaly_type,
                    Severity::Critical,
                    metric,
                    value,
                    critical,
                    action,
                    format!("{metric} at {value:.1}% reached critical threshold {critical}%"),
                ));
            } else if value >= warning {
                alerts.push(Alert {
                    metric: metric.into(),
                    value,
                    threshold: warning,
                    severity: Severity::Medium,
                    message: format!("{metric} at {value:.1}% above warning threshold {warning}%"),
                });
            }
        }

        // ── Error rate ───
        if metrics.error_rate >= t.error_rate_critical {
            anomalies.push(Anomaly::new(
                AnomalyType::ErrorBurst,
                Severity::High,
                "error_rate",
                metrics.error_rate,
                t.error_rate_critical,
                RecommendedAction::Pause,
                format!(
                    "error rate {:.0}% reached critical threshold {:.0}%",
                    metrics.error_rate * 100.0,
                    t.error_rate_critical * 100.0
                ),
            ));
        } else if metrics.error_rate >= t.error_rate_warning {
            alerts.push(Alert {
                metric: "error_rate".into(),
                value: metrics.error_rate,
                threshold: t.error_rate_warning,
                severity: Severity::Medium,
                message: format!("error rate {:.0}% above warning", metrics.error_rate * 100.0),
            });
        }
        if metrics.errors_per_minute >= t.error_burst_per_minute {
            anomalies.push(Anomaly::new(
                AnomalyType::ErrorBurst,
                Severity::High,
                "errors_per_minute",
                metrics.errors_per_minute as f64,
                t.error_burst_per_minute as f64,
                RecommendedAction::Pause,
                format!("{} errors in the last minute", metrics.errors_per_minute),
            ));
        }

        // ── Queue and channels ───
        if metrics.queued_executions >= t.queued_warning {
            alerts.push(Alert {
                metric: "queued_executions".into(),
                value: metrics.queued_executions as f64,
                threshold: t.queued_warning as f64,
                severity: Severity::Low,
                message: format!("{} executions queued", metrics.queued_executions),
            });
        }
        for (name, channel) in &metrics.channels {
            let (threshold, severity) = if channel.latency_ms >= t.latency_critical_ms {
                (t.latency_critical_ms, Severity::High)
            } else if channel.latency_ms >= t.latency_warning_ms {
                (t.latency_warning_ms, Severity::Medium)
            } else {
                continue;
            };
            alerts.push(Alert {
                metric: format!("channel.{name}.latency_ms"),
                value: channel.latency_ms,
                threshold,
                severity,
                message: format!("'{name}' latency {:.0}ms", channel.latency_ms),
            });
        }

        // ── Timeouts ───
        if timeouts_last_minute >= t.timeout_cascade_count {
            anomalies.push(Anomaly::new(
                AnomalyType::TimeoutCascade,
                Severity::High,
                "timeouts_per_minute",
                timeouts_last_minute as f64,
                t.timeout_cascade_count as f64,
                RecommendedAction::Pause,
                format!("{timeouts_last_minute} step timeouts in the last minute"),
            ));
        }

        if let Some(leak) = self.detect_memory_leak(&t) {
            anomalies.push(leak);
        }

        let alerts = alerts
            .into_iter()
            .filter(|a| self.admit_alert(&a.metric, now))
            .collect();
        let anomalies = anomalies
            .into_iter()
            .map(|mut a| {
                a.detected_at = now;
                a
            })
            .filter(|a| self.admit_at(a, now))
            .collect();
        Evaluation { alerts, anomalies }
    }

    /// Sustained process memory growth over the leak window: the second half
    /// of the window averages `memory_growth_percent` above the first half
    /// and most consecutive samples increase.
    fn detect_memory_leak(&self, t: &MetricThresholds) -> Option<Anomaly> {
        let history = self.history.lock();
        let window = t.leak_window_samples.max(4);
        if history.len() < window {
            return None;
        }
        let values: Vec<f64> = history
            .iter()
            .skip(history.len() - window)
            .map(|m| m.process_memory_mb)
            .collect();
        let (first, second) = values.split_at(values.len() / 2);
        let first_avg = first.iter().sum::<f64>() / first.len() as f64;
        let second_avg = second.iter().sum::<f64>() / second.len() as f64;
        if first_avg <= 0.0 {
            return None;
        }
        let growth = (second_avg - first_avg) / first_avg * 100.0;
        let increasing = values.windows(2).filter(|w| w[1] > w[0]).count();
        let ratio = increasing as f64 / (values.len() - 1) as f64;
        if growth > t.memory_growth_percent && ratio > LEAK_INCREASING_RATIO {
            debug!(growth, ratio, "sustained memory growth");
            return Some(Anomaly::new(
                AnomalyType::MemoryLeak,
                Severity::High,
                "process_memory_mb",
                values[values.len() - 1],
                t.memory_growth_percent,
                RecommendedAction::Alert,
                format!(
                    "process memory grew {growth:.1}% (avg {first_avg:.1}MB to {second_avg:.1}MB)"
                ),
            ));
        }
        None
    }

    /// Count one dispatch of `action` for a plan; flags a loop once the same
    /// action repeats more than `loop_max_repeats` times inside the window.
    pub fn record_action_at(
        &self,
        plan_id: Uuid,
        action: &str,
        now: DateTime<Utc>,
    ) -> Option<Anomaly> {
        let t = self.thresholds.read().clone();
        let key = format!("{plan_id}:{action}");
        let count = {
            let mut actions = self.actions.lock();
            let times = actions.entry(key).or_default();
            times.push_back(now);
            let cutoff = now - Duration::seconds(t.loop_window_secs as i64);
            while times.front().is_some_and(|at| *at <= cutoff) {
                times.pop_front();
            }
            times.len() as u32
        };
        if count <= t.loop_max_repeats {
            return None;
        }
        let mut anomaly = Anomaly::new(
            AnomalyType::Loop,
            Severity::Critical,
            action,
            count as f64,
            t.loop_max_repeats as f64,
            RecommendedAction::Cut,
            format!(
                "'{action}' ran {count} times in {}s",
                t.loop_window_secs
            ),
        )
        .for_plan(plan_id);
        anomaly.detected_at = now;
        self.admit_at(&anomaly, now).then_some(anomaly)
    }

    /// Forget loop counters for a finished plan.
    pub fn forget_plan(&self, plan_id: Uuid) {
        let prefix = format!("{plan_id}:");
        self.actions.lock().retain(|k, _| !k.starts_with(&prefix));
    }

    /// Apply the cool-down: identical anomalies (type, metric, plan) inside
    /// `anomaly_cooldown_secs` are dropped. Admitted ones count toward health.
    pub fn admit_at(&self, anomaly: &Anomaly, now: DateTime<Utc>) -> bool {
        let key = anomaly.key();
        if let Some(last) = self.last_anomaly.get(&key) {
            if now - *last < self.anomaly_cooldown {
                debug!(key = %key, "anomaly suppressed by cool-down");
                return false;
            }
        }
        self.last_anomaly.insert(key, now);
        warn!(
            anomaly = %anomaly.anomaly_type,
            metric = %anomaly.metric,
            value = anomaly.value,
            action = %anomaly.recommended_action,
            "anomaly detected"
        );
        let mut recent = self.recent.lock();
        recent.push_back(anomaly.clone());
        let cutoff = now - Duration::seconds(HEALTH_ANOMALY_WINDOW_SECS);
        while recent.front().is_some_and(|a| a.detected_at < cutoff) {
            recent.pop_front();
        }
        true
    }

    fn admit_alert(&self, metric: &str, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_alert.get(metric) {
            if now - *last < self.alert_cooldown {
                return false;
            }
        }
        self.last_alert.insert(metric.to_string(), now);
        true
    }

    /// 0-100 health of the host given its latest sample.
    ///
    /// Starts at 100 and loses half a point per percent of CPU and memory
    /// above 50, a point per percent of disk above 70, and five points per
    /// anomaly admitted in the last five minutes.
    pub fn health_score_at(&self, metrics: &SystemMetrics, now: DateTime<Utc>) -> u8 {
        let cutoff = now - Duration::seconds(HEALTH_ANOMALY_WINDOW_SECS);
        let recent = self
            .recent
            .lock()
            .iter()
            .filter(|a| a.detected_at >= cutoff)
            .count();
        let mut score = 100.0;
        score -= (metrics.cpu_percent - 50.0).max(0.0) * 0.5;
        score -= (metrics.memory_percent - 50.0).max(0.0) * 0.5;
        score -= (metrics.disk_percent - 70.0).max(0.0);
        score -= recent as f64 * 5.0;
        score.clamp(0.0, 100.0).round() as u8
    }

    /// Anomalies admitted in the last five minutes.
    pub fn recent_anomalies(&self) -> Vec<Anomaly> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn reset(&self) {
        self.history.lock().clear();
        self.actions.lock().clear();
        self.last_anomaly.clear();
        self.last_alert.clear();
        self.recent.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(MetricThresholds::default(), 120, 60, 300)
    }

    #[test]
    fn test_alert_cooldown() {
        let d = detector();
        let t0 = Utc::now();
        let hot = SystemMetrics {
            cpu_percent: 85.0,
            ..SystemMetrics::default()
        };
        assert_eq!(d.observe_at(hot.clone(), 0, t0).alerts.len(), 1);
        assert!(d.observe_at(hot.clone(), 0, t0 + Duration::seconds(10)).alerts.is_empty());
        assert_eq!(
            d.observe_at(hot, 0, t0 + Duration::seconds(301)).alerts.len(),
            1
        );
    }

    #[test]
    fn test_forget_plan_clears_loop_counters() {
        let d = detector();
        let plan = Uuid::new_v4();
        let t0 = Utc::now();
        for _ in 0..10 {
            assert!(d.record_action_at(plan, "api.call", t0).is_none());
        }
        d.forget_plan(plan);
        assert!(d.record_action_at(plan, "api.call", t0).is_none());
        assert!(d.actions.lock().len() == 1);
    }
}
