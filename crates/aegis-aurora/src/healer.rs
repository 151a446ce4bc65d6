use aegis_config::{HealPolicy, HealerConfig};
use aegis_core::{Anomaly, AnomalyType, Event, EventBus};
use aegis_guard::CircuitBreakerRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

const HISTORY_LIMIT: usize = 100;

/// A corrective action the healer can run for an anomaly.
#[async_trait]
pub trait HealAction: Send + Sync {
    fn name(&self) -> &str;

    /// Run the action; the returned string describes what was done.
    async fn run(&self, anomaly: &Anomaly) -> aegis_core::Result<String>;
}

/// Outcome of one auto-heal attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealOutcome {
    pub anomaly_type: AnomalyType,
    /// Actions that ran, in order.
    pub actions: Vec<String>,
    pub success: bool,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last_at: DateTime<Utc>,
}

/// Runs the configured heal policy for an anomaly type, respecting each
/// policy's cool-down and attempt ceiling, and reports via `AUTO_HEAL`.
pub struct AutoHealer {
    enabled: RwLock<bool>,
    policies: RwLock<BTreeMap<String, HealPolicy>>,
    actions: DashMap<String, Arc<dyn HealAction>>,
    attempts: DashMap<AnomalyType, Attempts>,
    history: Mutex<VecDeque<HealOutcome>>,
    events: EventBus,
}

impl AutoHealer {
    pub fn new(config: &HealerConfig, events: EventBus) -> Self {
        Self {
            enabled: RwLock::new(config.enabled),
            policies: RwLock::new(config.policies.clone()),
            actions: DashMap::new(),
            attempts: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            events,
        }
    }

    pub fn update_config(&self, config: &HealerConfig) {
        *self.enabled.write() = config.enabled;
        *self.policies.write() = config.policies.clone();
    }

    pub fn register_action(&self, action: Arc<dyn HealAction>) {
        debug!(action = action.name(), "heal action registered");
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether a policy exists for this type.
    pub fn can_heal(&self, anomaly_type: AnomalyType) -> bool {
        *self.enabled.read() && self.policies.read().contains_key(&anomaly_type.to_string())
    }

    pub async fn attempt_auto_heal(&self, anomaly: &Anomaly) -> Option<HealOutcome> {
        self.attempt_auto_heal_at(anomaly, Utc::now()).await
    }

    /// Returns `None` when healing is disabled, no policy matches, the policy
    /// is cooling down, or its attempts are used up.
    pub async fn attempt_auto_heal_at(
        &self,
        anomaly: &Anomaly,
        now: DateTime<Utc>,
    ) -> Option<HealOutcome> {
        if !*self.enabled.read() {
            return None;
        }
        let policy = self
            .policies
            .read()
            .get(&anomaly.anomaly_type.to_string())
            .cloned()?;

        if let Some(prev) = self.attempts.get(&anomaly.anomaly_type).map(|a| *a) {
            if prev.count >= policy.max_attempts {
                debug!(anomaly = %anomaly.anomaly_type, "heal attempts exhausted");
                return None;
            }
            if now - prev.last_at < Duration::seconds(policy.cooldown_secs as i64) {
                debug!(anomaly = %anomaly.anomaly_type, "heal policy cooling down");
                return None;
            }
        }

        let mut ran = Vec::new();
        let mut notes = Vec::new();
        let mut failed = false;
        for name in &policy.actions {
            let Some(action) = self.actions.get(name).map(|a| Arc::clone(a.value())) else {
                debug!(action = %name, "no heal action registered");
                continue;
            };
            ran.push(name.clone());
            match action.run(anomaly).await {
                Ok(note) => notes.push(format!("{name}: {note}")),
                Err(e) => {
                    warn!(action = %name, error = %e, "heal action failed");
                    notes.push(format!("{name} failed: {e}"));
                    failed = true;
                    break;
                }
            }
        }

        let success = !ran.is_empty() && !failed;
        let message = if ran.is_empty() {
            format!("no registered actions for {}", anomaly.anomaly_type)
        } else {
            notes.join("; ")
        };

        self.attempts
            .entry(anomaly.anomaly_type)
            .and_modify(|a| {
                a.count = if success { 0 } else { a.count + 1 };
                a.last_at = now;
            })
            .or_insert(Attempts {
                count: u32::from(!success),
                last_at: now,
            });

        info!(
            anomaly = %anomaly.anomaly_type,
            success,
            actions = ?ran,
            "auto-heal attempted"
        );
        let outcome = HealOutcome {
            anomaly_type: anomaly.anomaly_type,
            actions: ran,
            success,
            message,
            at: now,
        };
        self.events.publish(Event::AutoHeal {
            anomaly_type: outcome.anomaly_type,
            actions: outcome.actions.clone(),
            success: outcome.success,
            message: outcome.message.clone(),
        });
        let mut history = self.history.lock();
        history.push_back(outcome.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        Some(outcome)
    }

    /// Most recent outcomes, newest last.
    pub fn history(&self) -> Vec<HealOutcome> {
        self.history.lock().iter().cloned().collect()
    }

    /// Clear attempt counters so exhausted policies may run again.
    pub fn reset(&self) {
        self.attempts.clear();
    }
}

// ── Built-in actions ───────────────────────────────────────────

/// `reset_circuits`: closes every open or half-open breaker so failing
/// targets get a fresh probe.
pub struct ResetCircuits {
    circuits: Arc<CircuitBreakerRegistry>,
}

impl ResetCircuits {
    pub fn new(circuits: Arc<CircuitBreakerRegistry>) -> Self {
        Self { circuits }
    }
}

#[async_trait]
impl HealAction for ResetCircuits {
    fn name(&self) -> &str {
        "reset_circuits"
    }

    async fn run(&self, _anomaly: &Anomaly) -> aegis_core::Result<String> {
        let targets = self.circuits.unhealthy_targets();
        for target in &targets {
            self.circuits.reset(target);
        }
        Ok(format!("reset {} circuits", targets.len()))
    }
}

/// `trim_caches`: returns freed heap pages to the OS.
pub struct TrimAllocator;

#[async_trait]
impl HealAction for TrimAllocator {
    fn name(&self) -> &str {
        "trim_caches"
    }

    async fn run(&self, _anomaly: &Anomaly) -> aegis_core::Result<String> {
        let before = aegis_guard::resource::process_memory_mb();
        trim_heap();
        let after = aegis_guard::resource::process_memory_mb();
        Ok(format!("resident memory {before:.1}MB -> {after:.1}MB"))
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() {
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() {}
