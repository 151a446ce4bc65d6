use aegis_config::GuardrailConfig;
use aegis_core::AegisError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

/// Process-level ceilings checked by the guardrail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: f64,
    pub max_cpu_secs: f64,
    pub max_execution_secs: u64,
}

impl ResourceLimits {
    pub fn from_config(config: &GuardrailConfig) -> Self {
        Self {
            max_memory_mb: config.max_memory_mb,
            max_cpu_secs: config.max_cpu_secs,
            max_execution_secs: config.max_execution_secs,
        }
    }
}

/// Live usage of this process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_secs: f64,
    pub elapsed_secs: f64,
}

pub struct ResourceMonitor {
    limits: ResourceLimits,
    started: Instant,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            started: Instant::now(),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Sample usage; `elapsed` is the execution's own runtime when known,
    /// otherwise the time since this monitor was created.
    pub fn current_usage(&self, elapsed: Option<Duration>) -> ResourceUsage {
        let elapsed = elapsed.unwrap_or_else(|| self.started.elapsed());
        ResourceUsage {
            memory_mb: process_memory_mb(),
            cpu_secs: process_cpu_secs(),
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    pub fn check_resource_limits(&self, elapsed: Option<Duration>) -> aegis_core::Result<ResourceUsage> {
        let usage = self.current_usage(elapsed);
        self.check_usage(&usage)?;
        Ok(usage)
    }

    /// Compare a usage sample against the ceilings.
    pub fn check_usage(&self, usage: &ResourceUsage) -> aegis_core::Result<()> {
        let checks = [
            ("memory_mb", usage.memory_mb, self.limits.max_memory_mb),
            ("cpu_secs", usage.cpu_secs, self.limits.max_cpu_secs),
            (
                "execution_secs",
                usage.elapsed_secs,
                self.limits.max_execution_secs as f64,
            ),
        ];
        for (resource, used, limit) in checks {
            if limit > 0.0 && used > limit {
                warn!(resource, used, limit, "resource ceiling exceeded");
                return Err(AegisError::LimitExceeded {
                    resource: resource.into(),
                    used,
                    limit,
                });
            }
        }
        Ok(())
    }
}

/// Resident set size of this process in MiB.
pub fn process_memory_mb() -> f64 {
    if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
        if let Some(pages) = statm
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<f64>().ok())
        {
            return pages * page_size() / (1024.0 * 1024.0);
        }
    }
    // ru_maxrss is the peak, in KiB on Linux
    rusage().map(|r| r.ru_maxrss as f64 / 1024.0).unwrap_or(0.0)
}

/// User plus system CPU time consumed by this process.
pub fn process_cpu_secs() -> f64 {
    rusage()
        .map(|r| timeval_secs(r.ru_utime) + timeval_secs(r.ru_stime))
        .unwrap_or(0.0)
}

fn rusage() -> Option<libc::rusage> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage fills the struct; we only read it on success.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc == 0 {
        // SAFETY: initialised by the successful call above.
        Some(unsafe { usage.assume_init() })
    } else {
        None
    }
}

fn timeval_secs(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

fn page_size() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as f64 } else { 4096.0 }
}
