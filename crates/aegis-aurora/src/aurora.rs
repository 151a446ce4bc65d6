use aegis_config::{AegisConfig, MetricThresholds, MonitorConfig};
use aegis_core::{
    AegisError, Anomaly, AuthorizationRequest, AuthorizationResponse, Event, EventBus,
    RecommendedAction, SystemMetrics,
};
use aegis_guard::{CheckpointManager, CircuitBreakerRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertLog;
use crate::authorize::AuthorizationGate;
use crate::collector::{MetricsCollector, SystemCollector};
use crate::detector::{Alert, AnomalyDetector};
use crate::healer::{AutoHealer, HealAction, HealOutcome, ResetCircuits, TrimAllocator};
use crate::scorer::RiskScorer;
use crate::stats::ExecutionStats;

/// Instruction Aurora leaves for a running execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ControlSignal {
    /// Stop scheduling, keep state, wait for resume or the cool-down.
    Pause { reason: String },
    /// Stop now; the engine checkpoints and reports resume/rollback options.
    Cut { reason: String },
}

/// An execution Aurora is watching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedExecution {
    pub plan_id: Uuid,
    pub description: String,
    pub started_at: DateTime<Utc>,
}

/// Result of one monitor tick.
#[derive(Debug, Clone)]
pub struct MonitorSample {
    pub metrics: SystemMetrics,
    pub health_score: u8,
    pub alerts: Vec<Alert>,
    pub anomalies: Vec<Anomaly>,
}

/// Authorization and runtime guardian.
///
/// Scores plans before they run, samples host and execution metrics while
/// they run, turns threshold crossings and patterns into `ALERT` and
/// `ANOMALY` events, tries configured heal actions, and leaves pause or cut
/// signals that the engine picks up between dispatches.
pub struct Aurora {
    gate: AuthorizationGate,
    detector: AnomalyDetector,
    alerts: AlertLog,
    stats: Arc<ExecutionStats>,
    healer: AutoHealer,
    collector: Arc<dyn MetricsCollector>,
    circuits: Arc<CircuitBreakerRegistry>,
    checkpoints: Option<CheckpointManager>,
    monitor: RwLock<MonitorConfig>,
    events: EventBus,
    signals: DashMap<Uuid, ControlSignal>,
    tracked: DashMap<Uuid, TrackedExecution>,
    last_health: RwLock<Option<u8>>,
}

impl Aurora {
    pub fn new(config: &AegisConfig, circuits: Arc<CircuitBreakerRegistry>, events: EventBus) -> Self {
        let healer = AutoHealer::new(&config.healer, events.clone());
        healer.register_action(Arc::new(ResetCircuits::new(circuits.clone())));
        healer.register_action(Arc::new(TrimAllocator));
        Self {
            gate: AuthorizationGate::new(&config.authorization, circuits.clone()),
            detector: AnomalyDetector::new(
                config.thresholds.clone(),
                config.monitor.history_size,
                config.monitor.anomaly_cooldown_secs,
                config.monitor.alert_cooldown_secs,
            ),
            alerts: AlertLog::new(config.monitor.alert_history_size),
            stats: Arc::new(ExecutionStats::new(config.monitor.stats_window_secs)),
            healer,
            collector: Arc::new(SystemCollector::new(config.monitor.disk_path.clone())),
            circuits,
            checkpoints: None,
            monitor: RwLock::new(config.monitor.clone()),
            events,
            signals: DashMap::new(),
            tracked: DashMap::new(),
            last_health: RwLock::new(None),
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// Checkpoints purged on each GC tick of the monitor loop.
    pub fn with_checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_scorer(self, scorer: Arc<dyn RiskScorer>) -> Self {
        self.gate.set_scorer(scorer);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    // ── Accessors ───

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> &Arc<ExecutionStats> {
        &self.stats
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Published alerts, for review and acknowledgement.
    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    pub fn healer(&self) -> &AutoHealer {
        &self.healer
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn register_heal_action(&self, action: Arc<dyn HealAction>) {
        self.healer.register_action(action);
    }

    // ── Authorization ───

    pub fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationResponse {
        self.gate.authorize(request)
    }

    pub fn confirm_authorization(
        &self,
        request_id: Uuid,
        approved: bool,
    ) -> aegis_core::Result<AuthorizationResponse> {
        self.gate.confirm_authorization(request_id, approved)
    }

    pub async fn await_confirmation(
        &self,
        request_id: Uuid,
    ) -> aegis_core::Result<AuthorizationResponse> {
        self.gate.await_confirmation(request_id).await
    }

    // ── Configuration ───

    pub fn update_thresholds(&self, thresholds: MetricThresholds) {
        info!("metric thresholds updated");
        self.detector.update_thresholds(thresholds);
    }

    pub fn thresholds(&self) -> MetricThresholds {
        self.detector.thresholds()
    }

    /// Apply a reloaded configuration to every hot-reloadable part.
    pub fn apply_config(&self, config: &AegisConfig) {
        self.update_thresholds(config.thresholds.clone());
        self.gate.update_config(&config.authorization);
        self.healer.update_config(&config.healer);
        self.circuits.update_config(config.circuit_breaker.clone());
        self.alerts.set_capacity(config.monitor.alert_history_size);
        *self.monitor.write() = config.monitor.clone();
    }

    // ── Execution tracking ───

    pub fn track_execution(&self, plan_id: Uuid, description: &str) {
        self.tracked.insert(
            plan_id,
            TrackedExecution {
                plan_id,
                description: description.to_string(),
                started_at: Utc::now(),
            },
        );
    }

    pub fn untrack_execution(&self, plan_id: Uuid) {
        self.tracked.remove(&plan_id);
        self.signals.remove(&plan_id);
        self.detector.forget_plan(plan_id);
    }

    pub fn tracked_executions(&self) -> Vec<TrackedExecution> {
        self.tracked.iter().map(|e| e.value().clone()).collect()
    }

    /// Count one dispatch for loop detection; a detected loop is handled
    /// (usually a cut) before this returns.
    pub async fn record_action(&self, plan_id: Uuid, action: &str) -> Option<Anomaly> {
        let anomaly = self.detector.record_action_at(plan_id, action, Utc::now())?;
        self.handle_anomaly(&anomaly).await;
        Some(anomaly)
    }

    /// Report an anomaly observed outside the sampler (rate limit hits,
    /// blocked targets, suspicious input). Subject to the same cool-down.
    pub async fn report_anomaly(&self, anomaly: Anomaly) -> bool {
        if !self.detector.admit_at(&anomaly, Utc::now()) {
            return false;
        }
        self.handle_anomaly(&anomaly).await;
        true
    }

    /// Publish `LIMIT` for a budget overrun.
    pub fn report_limit(&self, plan_id: Option<Uuid>, error: &AegisError) {
        if let AegisError::LimitExceeded {
            resource,
            used,
            limit,
        } = error
        {
            warn!(plan_id = ?plan_id, resource = %resource, used, limit, "execution limit reached");
            self.events.publish(Event::Limit {
                plan_id,
                resource: resource.clone(),
                used: *used,
                limit: *limit,
            });
        }
    }

    // ── Control signals ───

    /// Ask a running execution to pause. Publishes `PAUSE`.
    pub fn pause(&self, plan_id: Uuid, reason: &str) {
        info!(plan_id = %plan_id, reason, "pause requested");
        self.signals.insert(
            plan_id,
            ControlSignal::Pause {
                reason: reason.to_string(),
            },
        );
        self.events.publish(Event::Pause {
            plan_id,
            reason: reason.to_string(),
        });
    }

    /// Ask a running execution to stop. The engine publishes `CUT` once it
    /// has written the checkpoint.
    pub fn cut(&self, plan_id: Uuid, reason: &str) {
        warn!(plan_id = %plan_id, reason, "cut requested");
        self.signals.insert(
            plan_id,
            ControlSignal::Cut {
                reason: reason.to_string(),
            },
        );
    }

    /// Clear a pending pause and publish `RESUME`. A pending cut stays in
    /// place for the engine to act on.
    pub fn resume(&self, plan_id: Uuid, reason: &str) {
        self.signals
            .remove_if(&plan_id, |_, s| matches!(s, ControlSignal::Pause { .. }));
        if let Some(ControlSignal::Cut { .. }) = self.peek_signal(plan_id) {
            debug!(plan_id = %plan_id, "resume left a pending cut in place");
        }
        info!(plan_id = %plan_id, reason, "resume");
        self.events.publish(Event::Resume {
            plan_id,
            reason: reason.to_string(),
        });
    }

    /// Take the pending signal for a plan, if any.
    pub fn take_signal(&self, plan_id: Uuid) -> Option<ControlSignal> {
        self.signals.remove(&plan_id).map(|(_, s)| s)
    }

    pub fn peek_signal(&self, plan_id: Uuid) -> Option<ControlSignal> {
        self.signals.get(&plan_id).map(|s| s.value().clone())
    }

    // ── Anomaly handling ───

    /// Publish the anomaly, try to heal it, then apply its recommended action
    /// to its plan or, for host-wide anomalies, to every tracked execution.
    pub async fn handle_anomaly(&self, anomaly: &Anomaly) -> Option<HealOutcome> {
        self.events.publish(Event::Anomaly {
            anomaly: anomaly.clone(),
        });

        let healed = self.attempt_auto_heal(anomaly).await;

        let plans: Vec<Uuid> = match anomaly.plan_id {
            Some(id) => vec![id],
            None => self.tracked.iter().map(|e| *e.key()).collect(),
        };
        match anomaly.recommended_action {
            RecommendedAction::Pause => {
                for plan_id in plans {
                    self.pause(plan_id, &anomaly.message);
                }
            }
            RecommendedAction::Cut => {
                for plan_id in plans {
                    self.cut(plan_id, &anomaly.message);
                }
            }
            RecommendedAction::Alert | RecommendedAction::Monitor => {}
        }
        healed
    }

    pub async fn attempt_auto_heal(&self, anomaly: &Anomaly) -> Option<HealOutcome> {
        self.healer.attempt_auto_heal(anomaly).await
    }

    // ── Sampling ───

    /// Take one sample: collect, fold in execution stats, evaluate, publish.
    pub async fn sample_once(&self) -> aegis_core::Result<MonitorSample> {
        let now = Utc::now();
        let mut metrics = self.collector.collect()?;
        metrics.timestamp = now;
        self.stats.apply_at(&mut metrics, now);

        let timeouts = self.stats.timeouts_last_minute_at(now);
        let evaluation = self.detector.observe_at(metrics.clone(), timeouts, now);
        let health_score = self.detector.health_score_at(&metrics, now);
        *self.last_health.write() = Some(health_score);

        self.events.publish(Event::Health {
            metrics: metrics.clone(),
            health_score,
        });
        for alert in &evaluation.alerts {
            let alert_id = self.alerts.record_at(alert.clone(), now);
            warn!(alert_id = %alert_id, metric = %alert.metric, value = alert.value, "threshold alert");
            self.events.publish(Event::Alert {
                metric: alert.metric.clone(),
                value: alert.value,
                threshold: alert.threshold,
                severity: alert.severity,
                message: alert.message.clone(),
            });
        }
        for anomaly in &evaluation.anomalies {
            self.handle_anomaly(anomaly).await;
        }

        Ok(MonitorSample {
            metrics,
            health_score,
            alerts: evaluation.alerts,
            anomalies: evaluation.anomalies,
        })
    }

    /// Health of the latest sample; 100 before the first one.
    pub fn health_score(&self) -> u8 {
        self.last_health.read().unwrap_or(100)
    }

    /// Drop expired checkpoints and confirmation requests.
    pub fn collect_garbage(&self) -> usize {
        let now = Utc::now();
        let mut removed = self.gate.expire_pending_at(now);
        if let Some(checkpoints) = &self.checkpoints {
            match checkpoints.purge_expired_at(now) {
                Ok(n) => removed += n,
                Err(e) => error!(error = %e, "checkpoint purge failed"),
            }
        }
        removed
    }

    /// Run the sampler and the GC tick until `cancel` fires.
    pub fn start_monitoring(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let aurora = Arc::clone(self);
        let (enabled, sample_every, gc_every) = {
            let monitor = self.monitor.read();
            (
                monitor.enabled,
                Duration::from_secs(monitor.sample_interval_secs.max(1)),
                Duration::from_secs(monitor.gc_interval_secs.max(1)),
            )
        };

        tokio::spawn(async move {
            info!(
                sample_secs = sample_every.as_secs(),
                gc_secs = gc_every.as_secs(),
                enabled,
                "aurora monitor started"
            );
            let mut sample_tick = tokio::time::interval(sample_every);
            let mut gc_tick = tokio::time::interval(gc_every);
            sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sample_tick.tick(), if enabled => {
                        if let Err(e) = aurora.sample_once().await {
                            error!(error = %e, "metrics sample failed");
                        }
                    }
                    _ = gc_tick.tick() => {
                        let removed = aurora.collect_garbage();
                        if removed > 0 {
                            debug!(removed, "aurora garbage collection");
                        }
                    }
                }
            }
            info!("aurora monitor stopped");
        })
    }
}
