use aegis_core::SystemMetrics;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of host resource metrics.
///
/// Collectors fill the host fields of [`SystemMetrics`]; execution fields
/// are layered on top by [`crate::ExecutionStats`].
pub trait MetricsCollector: Send + Sync {
    fn collect(&self) -> aegis_core::Result<SystemMetrics>;
}

// ── Linux ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Reads `/proc/stat`, `/proc/meminfo` and `statvfs`.
///
/// CPU usage is the busy share since the previous sample; the first sample
/// reports the average since boot.
pub struct SystemCollector {
    disk_path: PathBuf,
    previous: Mutex<Option<CpuTimes>>,
}

impl SystemCollector {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            previous: Mutex::new(None),
        }
    }

    fn cpu_percent(&self) -> f64 {
        let Some(now) = read_cpu_times() else {
            return 0.0;
        };
        let mut previous = self.previous.lock();
        let (busy, total) = match *previous {
            Some(prev) if now.total > prev.total => {
                (now.busy.saturating_sub(prev.busy), now.total - prev.total)
            }
            _ => (now.busy, now.total),
        };
        *previous = Some(now);
        if total == 0 {
            return 0.0;
        }
        busy as f64 / total as f64 * 100.0
    }
}

impl MetricsCollector for SystemCollector {
    fn collect(&self) -> aegis_core::Result<SystemMetrics> {
        let metrics = SystemMetrics {
            timestamp: Utc::now(),
            cpu_percent: self.cpu_percent(),
            memory_percent: memory_percent().unwrap_or(0.0),
            disk_percent: disk_percent(&self.disk_path).unwrap_or_else(|e| {
                debug!(path = ?self.disk_path, error = %e, "disk usage unavailable");
                0.0
            }),
            process_memory_mb: aegis_guard::resource::process_memory_mb(),
            ..SystemMetrics::default()
        };
        Ok(metrics)
    }
}

fn read_cpu_times() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(stat.lines().next()?)
}

/// `cpu  user nice system idle iowait irq softirq steal ...`
fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn memory_percent() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

/// Used share of the filesystem holding `path`, computed the way `df` does.
fn disk_percent(path: &Path) -> std::io::Result<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let used = (stat.f_blocks - stat.f_bfree) as f64;
    let available = stat.f_bavail as f64;
    if used + available <= 0.0 {
        return Ok(0.0);
    }
    Ok(used / (used + available) * 100.0)
}

// ── Static ─────────────────────────────────────────────────────

/// Returns whatever metrics were last set. For tests and hosts that sample elsewhere.
pub struct StaticCollector {
    metrics: Mutex<SystemMetrics>,
}

impl StaticCollector {
    pub fn new(metrics: SystemMetrics) -> Self {
        Self {
            metrics: Mutex::new(metrics),
        }
    }

    pub fn set(&self, metrics: SystemMetrics) {
        *self.metrics.lock() = metrics;
    }
}

impl Default for StaticCollector {
    fn default() -> Self {
        Self::new(SystemMetrics::default())
    }
}

impl MetricsCollector for StaticCollector {
    fn collect(&self) -> aegis_core::Result<SystemMetrics> {
        let mut metrics = self.metrics.lock().clone();
        metrics.timestamp = Utc::now();
        Ok(metrics)
    }
}
