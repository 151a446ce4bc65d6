//! Sliding-window rate limiter keyed by request origin.
//!
//! Each identifier keeps the timestamps of its admitted requests from the last
//! 60 seconds. A request is rejected once the window already holds
//! `max_requests_per_minute` entries; rejected requests are not recorded.

use aegis_core::AegisError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

const WINDOW_SECS: i64 = 60;

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, VecDeque<DateTime<Utc>>>>,
    max_per_minute: Arc<AtomicU32>,
}

impl RateLimiter {
    pub fn new(max_requests_per_minute: u32) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_per_minute: Arc::new(AtomicU32::new(max_requests_per_minute)),
        }
    }

    pub fn max_per_minute(&self) -> u32 {
        self.max_per_minute.load(Ordering::Relaxed)
    }

    pub fn set_max_per_minute(&self, max: u32) {
        self.max_per_minute.store(max, Ordering::Relaxed);
    }

    pub fn check_rate_limit(&self, identifier: &str) -> aegis_core::Result<()> {
        self.check_rate_limit_at(identifier, Utc::now())
    }

    /// Admit a request at `now` or return `RateLimited` with the wait until
    /// the oldest entry leaves the window.
    pub fn check_rate_limit_at(&self, identifier: &str, now: DateTime<Utc>) -> aegis_core::Result<()> {
        let window = Duration::seconds(WINDOW_SECS);
        let max = self.max_per_minute() as usize;
        let mut entry = self.windows.entry(identifier.to_string()).or_default();

        while entry.front().is_some_and(|t| *t + window <= now) {
            entry.pop_front();
        }

        if entry.len() >= max {
            let retry_after_ms = entry
                .front()
                .map(|oldest| (*oldest + window - now).num_milliseconds().max(0) as u64)
                .unwrap_or(WINDOW_SECS as u64 * 1000);
            warn!(identifier, in_window = entry.len(), max, "rate limited");
            return Err(AegisError::RateLimited {
                identifier: identifier.to_string(),
                retry_after_ms,
            });
        }

        entry.push_back(now);
        Ok(())
    }

    /// Requests still admissible in the current window.
    pub fn remaining_at(&self, identifier: &str, now: DateTime<Utc>) -> u32 {
        let window = Duration::seconds(WINDOW_SECS);
        let used = self
            .windows
            .get(identifier)
            .map(|w| w.iter().filter(|t| **t + window > now).count())
            .unwrap_or(0) as u32;
        self.max_per_minute().saturating_sub(used)
    }

    pub fn reset(&self, identifier: &str) {
        self.windows.remove(identifier);
    }

    /// Drop identifiers whose windows are empty at `now`.
    pub fn cleanup_at(&self, now: DateTime<Utc>) {
        let window = Duration::seconds(WINDOW_SECS);
        self.windows
            .retain(|_, w| w.back().is_some_and(|t| *t + window > now));
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.windows.len()
    }
}
