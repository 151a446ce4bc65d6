//! Per-target circuit breakers shared by every execution.
//!
//! `closed → open` after `failure_threshold` consecutive failures, or that many
//! failures inside `failure_window_secs`. `open → half_open` once
//! `retry_after_ms` has elapsed, admitting exactly one probe. The probe's
//! outcome closes the circuit or reopens it with a longer wait.

use aegis_config::CircuitBreakerConfig;
use aegis_core::{AegisError, CircuitState, Event, EventBus};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub open_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Read-only view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub retry_after_ms: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub stats: CircuitStats,
    pub history: Vec<StateChange>,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    recent_failures: VecDeque<DateTime<Utc>>,
    retry_after_ms: u64,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    stats: CircuitStats,
    history: VecDeque<StateChange>,
}

impl Breaker {
    fn new(retry_after_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            recent_failures: VecDeque::new(),
            retry_after_ms,
            opened_at: None,
            probe_in_flight: false,
            stats: CircuitStats::default(),
            history: VecDeque::new(),
        }
    }

    fn probe_due_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
            .map(|t| t + Duration::milliseconds(self.retry_after_ms as i64))
    }

    fn remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        self.probe_due_at()
            .map(|due| (due - now).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    fn transition(
        &mut self,
        to: CircuitState,
        reason: &str,
        now: DateTime<Utc>,
        history_size: usize,
    ) -> Option<StateChange> {
        if self.state == to {
            return None;
        }
        let change = StateChange {
            from: self.state,
            to,
            reason: reason.to_string(),
            at: now,
        };
        self.state = to;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.probe_in_flight = false;
                self.stats.open_count += 1;
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.probe_in_flight = false;
                self.consecutive_failures = 0;
                self.recent_failures.clear();
            }
        }
        self.history.push_back(change.clone());
        while self.history.len() > history_size.max(1) {
            self.history.pop_front();
        }
        Some(change)
    }
}

/// Registry of breakers keyed by target name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Breaker>,
    config: RwLock<CircuitBreakerConfig>,
    events: Option<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config: RwLock::new(config),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn update_config(&self, config: CircuitBreakerConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config.read().clone()
    }

    pub fn check(&self, target: &str) -> aegis_core::Result<()> {
        self.check_at(target, Utc::now())
    }

    /// Admit a call to `target`, or fail fast with `CircuitOpen`.
    ///
    /// An open circuit whose wait has elapsed moves to half-open and the
    /// caller becomes the single probe.
    pub fn check_at(&self, target: &str, now: DateTime<Utc>) -> aegis_core::Result<()> {
        self.attempt_circuit_close_at(target, now);
        let Some(mut breaker) = self.breakers.get_mut(target) else {
            return Ok(());
        };
        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !breaker.probe_in_flight => {
                breaker.probe_in_flight = true;
                info!(circuit = target, "circuit half-open, admitting probe");
                Ok(())
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                breaker.stats.rejected_calls += 1;
                let retry_after_ms = match breaker.state {
                    CircuitState::Open => breaker.remaining_ms(now),
                    _ => breaker.retry_after_ms,
                };
                Err(AegisError::CircuitOpen {
                    target: target.to_string(),
                    retry_after_ms,
                })
            }
        }
    }

    pub fn attempt_circuit_close(&self, target: &str) -> CircuitState {
        self.attempt_circuit_close_at(target, Utc::now())
    }

    /// Move an open circuit to half-open if its wait has elapsed.
    pub fn attempt_circuit_close_at(&self, target: &str, now: DateTime<Utc>) -> CircuitState {
        let history_size = self.config.read().history_size;
        let (state, change) = {
            let Some(mut breaker) = self.breakers.get_mut(target) else {
                return CircuitState::Closed;
            };
            let due = breaker.probe_due_at().is_some_and(|due| now >= due);
            let change = if breaker.state == CircuitState::Open && due {
                breaker.transition(
                    CircuitState::HalfOpen,
                    "retry window elapsed",
                    now,
                    history_size,
                )
            } else {
                None
            };
            (breaker.state, change.map(|c| (c, breaker.retry_after_ms)))
        };
        self.announce(target, change);
        state
    }

    pub fn record_success(&self, target: &str) {
        self.record_success_at(target, Utc::now());
    }

    pub fn record_success_at(&self, target: &str, now: DateTime<Utc>) {
        let config = self.config.read().clone();
        let change = {
            let mut breaker = self
                .breakers
                .entry(target.to_string())
                .or_insert_with(|| Breaker::new(config.retry_after_ms));
            breaker.stats.total_calls += 1;
            breaker.stats.successful_calls += 1;
            breaker.stats.last_success_at = Some(now);
            breaker.consecutive_successes += 1;
            breaker.consecutive_failures = 0;

            let change = if breaker.state == CircuitState::HalfOpen {
                breaker.retry_after_ms = config.retry_after_ms;
                breaker.transition(
                    CircuitState::Closed,
                    "probe succeeded",
                    now,
                    config.history_size,
                )
            } else {
                None
            };
            change.map(|c| (c, breaker.retry_after_ms))
        };
        self.announce(target, change);
    }

    pub fn record_failure(&self, target: &str, reason: &str) {
        self.record_failure_at(target, reason, Utc::now());
    }

    pub fn record_failure_at(&self, target: &str, reason: &str, now: DateTime<Utc>) {
        let config = self.config.read().clone();
        let window = Duration::seconds(config.failure_window_secs as i64);
        let change = {
            let mut breaker = self
                .breakers
                .entry(target.to_string())
                .or_insert_with(|| Breaker::new(config.retry_after_ms));
            breaker.stats.total_calls += 1;
            breaker.stats.failed_calls += 1;
            breaker.stats.last_failure_at = Some(now);
            breaker.consecutive_failures += 1;
            breaker.consecutive_successes = 0;
            breaker.recent_failures.push_back(now);
            while breaker
                .recent_failures
                .front()
                .is_some_and(|t| *t + window <= now)
            {
                breaker.recent_failures.pop_front();
            }

            let change = match breaker.state {
                CircuitState::HalfOpen => {
                    let grown = (breaker.retry_after_ms as f64 * config.backoff_multiplier) as u64;
                    breaker.retry_after_ms = grown.min(config.max_retry_after_ms).max(1);
                    breaker.transition(
                        CircuitState::Open,
                        &format!("probe failed: {reason}"),
                        now,
                        config.history_size,
                    )
                }
                CircuitState::Closed => {
                    let threshold = config.failure_threshold.max(1);
                    let consecutive = breaker.consecutive_failures >= threshold;
                    let windowed = breaker.recent_failures.len() as u32 >= threshold;
                    if consecutive || windowed {
                        breaker.retry_after_ms = config.retry_after_ms;
                        let why = format!(
                            "{} failures (last: {reason})",
                            breaker.consecutive_failures.max(breaker.recent_failures.len() as u32)
                        );
                        breaker.transition(CircuitState::Open, &why, now, config.history_size)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            };
            change.map(|c| (c, breaker.retry_after_ms))
        };
        self.announce(target, change);
    }

    /// Hand back a half-open admission that ended without an outcome, so the
    /// next caller is admitted in its place.
    pub fn release_admission(&self, target: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(target)
            && breaker.state == CircuitState::HalfOpen
            && breaker.probe_in_flight
        {
            breaker.probe_in_flight = false;
            info!(circuit = target, "half-open admission released without outcome");
        }
    }

    /// Force `target` open.
    pub fn open_circuit(&self, target: &str, reason: &str) {
        self.open_circuit_at(target, reason, Utc::now());
    }

    pub fn open_circuit_at(&self, target: &str, reason: &str, now: DateTime<Utc>) {
        let config = self.config.read().clone();
        let change = {
            let mut breaker = self
                .breakers
                .entry(target.to_string())
                .or_insert_with(|| Breaker::new(config.retry_after_ms));
            let change = if breaker.state == CircuitState::Open {
                // restart the wait
                breaker.opened_at = Some(now);
                None
            } else {
                breaker.transition(CircuitState::Open, reason, now, config.history_size)
            };
            change.map(|c| (c, breaker.retry_after_ms))
        };
        self.announce(target, change);
    }

    /// Return `target` to closed and clear its counters.
    pub fn reset(&self, target: &str) {
        let config = self.config.read().clone();
        let change = self.breakers.get_mut(target).and_then(|mut breaker| {
            breaker.retry_after_ms = config.retry_after_ms;
            breaker.consecutive_successes = 0;
            let change = breaker.transition(
                CircuitState::Closed,
                "manual reset",
                Utc::now(),
                config.history_size,
            );
            breaker.consecutive_failures = 0;
            breaker.recent_failures.clear();
            change.map(|c| (c, breaker.retry_after_ms))
        });
        self.announce(target, change);
    }

    pub fn reset_all(&self) {
        let targets: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        for target in targets {
            self.reset(&target);
        }
    }

    /// Targets whose circuits are not closed.
    pub fn unhealthy_targets(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|e| e.state != CircuitState::Closed)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn state(&self, target: &str) -> CircuitState {
        self.breakers
            .get(target)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, target: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(target).map(|b| CircuitSnapshot {
            target: target.to_string(),
            state: b.state,
            consecutive_failures: b.consecutive_failures,
            consecutive_successes: b.consecutive_successes,
            retry_after_ms: b.retry_after_ms,
            opened_at: b.opened_at,
            stats: b.stats.clone(),
            history: b.history.iter().cloned().collect(),
        })
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut targets: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets.iter().filter_map(|t| self.snapshot(t)).collect()
    }

    fn announce(&self, target: &str, change: Option<(StateChange, u64)>) {
        let Some((change, retry_after_ms)) = change else {
            return;
        };
        if change.to == CircuitState::Open {
            warn!(circuit = target, from = %change.from, reason = %change.reason, retry_after_ms, "circuit opened");
        } else {
            info!(circuit = target, from = %change.from, to = %change.to, "circuit state changed");
        }
        if let Some(events) = &self.events {
            events.publish(Event::CircuitBreaker {
                target: target.to_string(),
                from: change.from,
                to: change.to,
                reason: change.reason,
                retry_after_ms,
            });
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
