use aegis_core::{ChannelStats, ChannelStatus, SystemMetrics};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Consecutive failures after which a target is reported down.
const DOWN_AFTER_FAILURES: u32 = 3;
/// Weight of the newest latency sample in the moving average.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
struct TargetHealth {
    latency_ms: f64,
    consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct StatsState {
    active: u32,
    queued: u32,
    /// (when, succeeded) per dispatch inside the window.
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
    timeouts: VecDeque<DateTime<Utc>>,
    targets: HashMap<String, TargetHealth>,
}

/// Execution-side metrics: active and queued plans, rolling success and
/// error rates, per-target latency, and recent timeouts.
///
/// The engine updates it after every dispatch; the monitor folds it into
/// each [`SystemMetrics`] sample.
pub struct ExecutionStats {
    window: Duration,
    state: Mutex<StatsState>,
}

impl ExecutionStats {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::seconds(window_secs.max(1) as i64),
            state: Mutex::new(StatsState::default()),
        }
    }

    // ── Execution counts ───

    pub fn execution_queued(&self) {
        self.state.lock().queued += 1;
    }

    pub fn execution_started(&self) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
        state.active += 1;
    }

    pub fn execution_finished(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
    }

    /// Drop a queued execution that never started.
    pub fn execution_dequeued(&self) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
    }

    // ── Dispatch outcomes ───

    pub fn record_dispatch(&self, target: &str, success: bool, latency_ms: f64) {
        self.record_dispatch_at(target, success, latency_ms, Utc::now());
    }

    pub fn record_dispatch_at(
        &self,
        target: &str,
        success: bool,
        latency_ms: f64,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        state.outcomes.push_back((now, success));
        let health = state.targets.entry(target.to_string()).or_default();
        health.latency_ms = if health.latency_ms == 0.0 {
            latency_ms
        } else {
            LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * health.latency_ms
        };
        if success {
            health.consecutive_failures = 0;
        } else {
            health.consecutive_failures += 1;
        }
        let cutoff = now - self.window;
        evict(&mut state.outcomes, |(t, _)| *t <= cutoff);
    }

    pub fn record_timeout(&self) {
        self.record_timeout_at(Utc::now());
    }

    pub fn record_timeout_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.timeouts.push_back(now);
        let cutoff = now - Duration::minutes(1);
        evict(&mut state.timeouts, |t| *t <= cutoff);
    }

    /// Step timeouts within the last minute.
    pub fn timeouts_last_minute_at(&self, now: DateTime<Utc>) -> u32 {
        let cutoff = now - Duration::minutes(1);
        self.state
            .lock()
            .timeouts
            .iter()
            .filter(|t| **t > cutoff)
            .count() as u32
    }

    /// Fill the execution fields of a sample.
    pub fn apply_at(&self, metrics: &mut SystemMetrics, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let cutoff = now - self.window;
        evict(&mut state.outcomes, |(t, _)| *t <= cutoff);

        metrics.active_executions = state.active;
        metrics.queued_executions = state.queued;

        let total = state.outcomes.len();
        let failures = state.outcomes.iter().filter(|(_, ok)| !ok).count();
        if total > 0 {
            metrics.error_rate = failures as f64 / total as f64;
            metrics.success_rate = 1.0 - metrics.error_rate;
        } else {
            metrics.error_rate = 0.0;
            metrics.success_rate = 1.0;
        }

        let minute_ago = now - Duration::minutes(1);
        metrics.errors_per_minute = state
            .outcomes
            .iter()
            .filter(|(t, ok)| !ok && *t > minute_ago)
            .count() as u32;

        metrics.channels = state
            .targets
            .iter()
            .map(|(name, health)| {
                let status = match health.consecutive_failures {
                    0 => ChannelStatus::Healthy,
                    n if n >= DOWN_AFTER_FAILURES => ChannelStatus::Down,
                    _ => ChannelStatus::Degraded,
                };
                (
                    name.clone(),
                    ChannelStats {
                        latency_ms: health.latency_ms,
                        status,
                    },
                )
            })
            .collect();
    }
}

impl Default for ExecutionStats {
    fn default() -> Self {
        Self::new(60)
    }
}

fn evict<T>(queue: &mut VecDeque<T>, stale: impl Fn(&T) -> bool) {
    while queue.front().is_some_and(&stale) {
        queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_over_window() {
        let stats = ExecutionStats::new(60);
        let t0 = Utc::now();
        stats.record_dispatch_at("api", true, 10.0, t0);
        stats.record_dispatch_at("api", false, 10.0, t0);
        stats.record_dispatch_at("api", true, 10.0, t0);
        stats.record_dispatch_at("api", true, 10.0, t0);

        let mut metrics = SystemMetrics::default();
        stats.apply_at(&mut metrics, t0);
        assert!((metrics.error_rate - 0.25).abs() < 1e-9);
        assert!((metrics.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(metrics.errors_per_minute, 1);

        // Everything ages out of the window.
        stats.apply_at(&mut metrics, t0 + Duration::seconds(61));
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[test]
    fn test_channel_status_from_consecutive_failures() {
        let stats = ExecutionStats::default();
        let t0 = Utc::now();
        stats.record_dispatch_at("flaky", false, 100.0, t0);
        let mut metrics = SystemMetrics::default();
        stats.apply_at(&mut metrics, t0);
        assert_eq!(metrics.channels["flaky"].status, ChannelStatus::Degraded);

        stats.record_dispatch_at("flaky", false, 100.0, t0);
        stats.record_dispatch_at("flaky", false, 100.0, t0);
        stats.apply_at(&mut metrics, t0);
        assert_eq!(metrics.channels["flaky"].status, ChannelStatus::Down);

        stats.record_dispatch_at("flaky", true, 100.0, t0);
        stats.apply_at(&mut metrics, t0);
        assert_eq!(metrics.channels["flaky"].status, ChannelStatus::Healthy);
    }

    #[test]
    fn test_execution_counts() {
        let stats = ExecutionStats::default();
        stats.execution_queued();
        stats.execution_queued();
        stats.execution_started();
        let mut metrics = SystemMetrics::default();
        stats.apply_at(&mut metrics, Utc::now());
        assert_eq!(metrics.active_executions, 1);
        assert_eq!(metrics.queued_executions, 1);

        stats.execution_finished();
        stats.execution_finished();
        stats.apply_at(&mut metrics, Utc::now());
        assert_eq!(metrics.active_executions, 0);
    }

    #[test]
    fn test_timeouts_last_minute() {
        let stats = ExecutionStats::default();
        let t0 = Utc::now();
        stats.record_timeout_at(t0);
        stats.record_timeout_at(t0 + Duration::seconds(30));
        assert_eq!(stats.timeouts_last_minute_at(t0 + Duration::seconds(30)), 2);
        assert_eq!(stats.timeouts_last_minute_at(t0 + Duration::seconds(61)), 1);
    }
}
