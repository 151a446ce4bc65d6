use aegis_core::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration: maps to `aegis.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AegisConfig {
    pub engine: EngineConfig,
    pub authorization: AuthorizationConfig,
    pub thresholds: MetricThresholds,
    pub monitor: MonitorConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub guardrail: GuardrailConfig,
    pub checkpoint: CheckpointConfig,
    pub healer: HealerConfig,
    pub logging: LoggingConfig,
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Mode used when an intent does not ask for one.
    pub default_mode: String,
    /// Step deadline when neither the step nor the capability sets one.
    pub default_step_timeout_ms: u64,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// How long a paused execution waits for a resume before continuing.
    pub pause_cooldown_secs: u64,
    /// Wait for a human answer when authorization requires confirmation.
    /// When false the execution returns immediately with the prompt.
    pub await_confirmation: bool,
    /// Finished executions kept for `get_execution_status`.
    pub retain_finished: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_mode: "production".into(),
            default_step_timeout_ms: 30_000,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 10_000,
            pause_cooldown_secs: 300,
            await_confirmation: false,
            retain_finished: 256,
        }
    }
}

// ── Authorization ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Lifetime of an authorization decision.
    pub ttl_ms: u64,
    /// How long a confirmation request stays open before it expires to blocked.
    pub confirmation_ttl_ms: u64,
    /// Touching more files than this raises the file-count factor.
    pub max_files_before_confirmation: u32,
    /// Verbs that make a step destructive.
    pub destructive_patterns: Vec<String>,
    /// Regexes matched against manifest paths.
    pub sensitive_file_patterns: Vec<String>,
    /// `target.method` or bare method names that always need confirmation.
    pub confirmation_required_operations: Vec<String>,
    /// Targets that are never authorized.
    pub blocked_targets: Vec<String>,
    /// Running against a production environment.
    pub production: bool,
    pub weights: RiskWeights,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            confirmation_ttl_ms: 120_000,
            max_files_before_confirmation: 10,
            destructive_patterns: aegis_core::plan::default_destructive_verbs(),
            sensitive_file_patterns: vec![
                r"^/etc/".into(),
                r"^/root/".into(),
                r"^/boot/".into(),
                r"(^|/)\.ssh(/|$)".into(),
                r"(^|/)\.env(\.|$)".into(),
                r"(^|/)\.aws(/|$)".into(),
                r"id_(rsa|ed25519|ecdsa)".into(),
                r"\.(pem|key|p12|pfx)$".into(),
                r"(?i)(secret|credential|password|token)s?".into(),
                r"(^|/)(passwd|shadow|sudoers)$".into(),
            ],
            confirmation_required_operations: vec![
                "deploy".into(),
                "publish".into(),
                "send_bulk".into(),
                "transfer".into(),
            ],
            blocked_targets: vec![],
            production: false,
            weights: RiskWeights::default(),
        }
    }
}

/// Weights applied to each 0-100 risk factor score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub base: f64,
    pub destructive: f64,
    pub sensitive_files: f64,
    pub file_count: f64,
    pub production: f64,
    pub circuit: f64,
    pub external: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            base: 0.5,
            destructive: 0.4,
            sensitive_files: 0.3,
            file_count: 0.2,
            production: 0.2,
            circuit: 0.3,
            external: 0.1,
        }
    }
}

// ── Thresholds ─────────────────────────────────────────────────

/// Process-wide metric thresholds; hot-updatable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
    /// Error rate (0.0-1.0) over the stats window.
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub queued_warning: u32,
    pub latency_warning_ms: f64,
    pub latency_critical_ms: f64,
    /// Growth of process memory across the leak window, in percent.
    pub memory_growth_percent: f64,
    /// Samples considered for leak detection.
    pub leak_window_samples: usize,
    /// Same action repeated more than this inside `loop_window_secs` is a loop.
    pub loop_max_repeats: u32,
    pub loop_window_secs: u64,
    pub error_burst_per_minute: u32,
    /// Step timeouts inside one minute that count as a cascade.
    pub timeout_cascade_count: u32,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 85.0,
            memory_critical: 95.0,
            disk_warning: 90.0,
            disk_critical: 98.0,
            error_rate_warning: 0.1,
            error_rate_critical: 0.3,
            queued_warning: 50,
            latency_warning_ms: 5_000.0,
            latency_critical_ms: 15_000.0,
            memory_growth_percent: 5.0,
            leak_window_samples: 10,
            loop_max_repeats: 10,
            loop_window_secs: 60,
            error_burst_per_minute: 20,
            timeout_cascade_count: 3,
        }
    }
}

// ── Monitor ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub sample_interval_secs: u64,
    /// Samples kept in memory.
    pub history_size: usize,
    /// Identical anomalies are suppressed for this long.
    pub anomaly_cooldown_secs: u64,
    /// Alerts for the same metric are suppressed for this long.
    pub alert_cooldown_secs: u64,
    /// Published alerts kept for acknowledgement.
    pub alert_history_size: usize,
    /// Interval for purging expired checkpoints.
    pub gc_interval_secs: u64,
    /// Rolling window for error and success rates.
    pub stats_window_secs: u64,
    /// Filesystem whose usage is reported as disk percent.
    pub disk_path: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: 5,
            history_size: 120,
            anomaly_cooldown_secs: 60,
            alert_cooldown_secs: 300,
            alert_history_size: 500,
            gc_interval_secs: 300,
            stats_window_secs: 60,
            disk_path: PathBuf::from("/"),
        }
    }
}

// ── Circuit breaker ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    /// Base wait before an open circuit admits a probe.
    pub retry_after_ms: u64,
    /// Multiplier applied each time a probe fails.
    pub backoff_multiplier: f64,
    pub max_retry_after_ms: u64,
    /// State changes retained per breaker.
    pub history_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            retry_after_ms: 30_000,
            backoff_multiplier: 2.0,
            max_retry_after_ms: 600_000,
            history_size: 20,
        }
    }
}

// ── Guardrail ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub enabled: bool,
    pub max_requests_per_minute: u32,
    pub max_input_length: usize,
    /// Resident memory ceiling for this process.
    pub max_memory_mb: f64,
    /// CPU time ceiling for this process.
    pub max_cpu_secs: f64,
    /// Wall-clock ceiling for a single execution.
    pub max_execution_secs: u64,
    pub custom_patterns: Vec<CustomPattern>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_minute: 60,
            max_input_length: 100_000,
            max_memory_mb: 2_048.0,
            max_cpu_secs: 3_600.0,
            max_execution_secs: 600,
            custom_patterns: vec![],
        }
    }
}

/// Caller-supplied pattern reported under the `custom` category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    pub pattern: String,
    #[serde(default = "default_custom_severity")]
    pub severity: Severity,
}

fn default_custom_severity() -> Severity {
    Severity::Medium
}

// ── Checkpoint ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// "memory" or "sqlite".
    pub backend: String,
    /// SQLite database; defaults to ~/.aegis/checkpoints.db.
    pub db_path: Option<PathBuf>,
    pub ttl_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            db_path: None,
            ttl_secs: 86_400,
        }
    }
}

impl CheckpointConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".aegis")
                .join("checkpoints.db")
        })
    }
}

// ── Auto-heal ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    pub enabled: bool,
    /// Policies keyed by anomaly type ("memory_leak", "error_burst", ...).
    pub policies: BTreeMap<String, HealPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealPolicy {
    /// Heal action names, run in order until one fails.
    pub actions: Vec<String>,
    #[serde(default = "default_heal_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_heal_attempts")]
    pub max_attempts: u32,
}

fn default_heal_cooldown() -> u64 {
    300
}

fn default_heal_attempts() -> u32 {
    3
}

impl Default for HealerConfig {
    fn default() -> Self {
        let policy = |actions: &[&str], cooldown_secs, max_attempts| HealPolicy {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            cooldown_secs,
            max_attempts,
        };
        let mut policies = BTreeMap::new();
        policies.insert(
            "memory_leak".into(),
            policy(&["release_resources", "trim_caches"], 600, 3),
        );
        policies.insert("error_burst".into(), policy(&["reset_circuits"], 300, 5));
        policies.insert("timeout_cascade".into(), policy(&["reset_circuits"], 300, 3));
        policies.insert("cpu_saturation".into(), policy(&["trim_caches"], 300, 3));
        Self {
            enabled: true,
            policies,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl ConfigWarning {
    fn error(field: &str, message: impl Into<String>, hint: Option<&str>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: WarningSeverity::Error,
            hint: hint.map(Into::into),
        }
    }

    fn warning(field: &str, message: impl Into<String>, hint: Option<&str>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: WarningSeverity::Warning,
            hint: hint.map(Into::into),
        }
    }
}

impl AegisConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();
        let t = &self.thresholds;

        // ── Thresholds ───
        for (field, warn, crit) in [
            ("thresholds.cpu", t.cpu_warning, t.cpu_critical),
            ("thresholds.memory", t.memory_warning, t.memory_critical),
            ("thresholds.disk", t.disk_warning, t.disk_critical),
        ] {
            if !(0.0..=100.0).contains(&warn) || !(0.0..=100.0).contains(&crit) {
                warnings.push(ConfigWarning::error(
                    field,
                    format!("thresholds {warn}/{crit} out of range"),
                    Some("Percent thresholds must be between 0 and 100"),
                ));
            } else if warn >= crit {
                warnings.push(ConfigWarning::error(
                    field,
                    format!("warning {warn} is not below critical {crit}"),
                    None,
                ));
            }
        }
        if t.error_rate_warning >= t.error_rate_critical
            || !(0.0..=1.0).contains(&t.error_rate_critical)
        {
            warnings.push(ConfigWarning::error(
                "thresholds.error_rate",
                format!(
                    "error rate thresholds {}/{} are invalid",
                    t.error_rate_warning, t.error_rate_critical
                ),
                Some("Use fractions, e.g. 0.1 and 0.3"),
            ));
        }
        if t.leak_window_samples < 4 {
            warnings.push(ConfigWarning::warning(
                "thresholds.leak_window_samples",
                "fewer than 4 samples makes leak detection noisy",
                None,
            ));
        }

        // ── Monitor ───
        if self.monitor.sample_interval_secs == 0 {
            warnings.push(ConfigWarning::error(
                "monitor.sample_interval_secs",
                "sample interval is 0",
                Some("Set to e.g. 5"),
            ));
        }
        if self.monitor.history_size == 0 {
            warnings.push(ConfigWarning::error(
                "monitor.history_size",
                "history size is 0",
                None,
            ));
        }
        if self.monitor.alert_history_size == 0 {
            warnings.push(ConfigWarning::warning(
                "monitor.alert_history_size",
                "alert history size is 0, only the latest alert is kept",
                Some("Set to e.g. 500"),
            ));
        }

        // ── Circuit breaker ───
        if self.circuit_breaker.failure_threshold == 0 {
            warnings.push(ConfigWarning::error(
                "circuit_breaker.failure_threshold",
                "failure threshold is 0, every target would start open",
                Some("Set to e.g. 5"),
            ));
        }
        if self.circuit_breaker.backoff_multiplier < 1.0 {
            warnings.push(ConfigWarning::warning(
                "circuit_breaker.backoff_multiplier",
                "multiplier below 1.0 shortens the wait after failed probes",
                None,
            ));
        }
        if self.circuit_breaker.max_retry_after_ms < self.circuit_breaker.retry_after_ms {
            warnings.push(ConfigWarning::error(
                "circuit_breaker.max_retry_after_ms",
                "max_retry_after_ms is below retry_after_ms",
                None,
            ));
        }

        // ── Authorization ───
        if self.authorization.ttl_ms == 0 {
            warnings.push(ConfigWarning::error(
                "authorization.ttl_ms",
                "authorization TTL is 0, every decision would be stale",
                None,
            ));
        }
        for pattern in &self.authorization.sensitive_file_patterns {
            if regex::Regex::new(pattern).is_err() {
                warnings.push(ConfigWarning::error(
                    "authorization.sensitive_file_patterns",
                    format!("invalid regex '{pattern}'"),
                    None,
                ));
            }
        }
        if self.authorization.production {
            warnings.push(ConfigWarning {
                field: "authorization.production".into(),
                message: "production flag set, every plan carries the production factor".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Guardrail ───
        for custom in &self.guardrail.custom_patterns {
            if regex::Regex::new(&custom.pattern).is_err() {
                warnings.push(ConfigWarning::error(
                    "guardrail.custom_patterns",
                    format!("invalid regex for '{}'", custom.name),
                    None,
                ));
            }
        }
        if self.guardrail.max_requests_per_minute == 0 {
            warnings.push(ConfigWarning::warning(
                "guardrail.max_requests_per_minute",
                "0 rejects every step",
                None,
            ));
        }

        // ── Engine ───
        if aegis_core::SandboxMode::parse(&self.engine.default_mode).is_none() {
            warnings.push(ConfigWarning::error(
                "engine.default_mode",
                format!("unknown mode '{}'", self.engine.default_mode),
                Some("Valid values: dry_run, preview, sandbox, validate, production"),
            ));
        }

        // ── Checkpoint ───
        if !["memory", "sqlite"].contains(&self.checkpoint.backend.as_str()) {
            warnings.push(ConfigWarning::error(
                "checkpoint.backend",
                format!("unknown backend '{}'", self.checkpoint.backend),
                Some("Valid values: memory, sqlite"),
            ));
        }

        // ── Healer ───
        let known_anomalies = [
            "loop",
            "memory_leak",
            "error_burst",
            "timeout_cascade",
            "rate_exceeded",
            "unauthorized_access",
            "suspicious_pattern",
            "cpu_saturation",
            "disk_exhaustion",
        ];
        for key in self.healer.policies.keys() {
            if !known_anomalies.contains(&key.as_str()) {
                warnings.push(ConfigWarning::warning(
                    "healer.policies",
                    format!("policy for unknown anomaly type '{key}'"),
                    None,
                ));
            }
        }

        // ── Logging ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning::error(
                "logging.level",
                format!("unknown log level '{}'", self.logging.level),
                Some("Valid values: trace, debug, info, warn, error"),
            ));
        }
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning::error(
                "logging.format",
                format!("unknown log format '{}'", self.logging.format),
                Some("Valid values: pretty, json, compact"),
            ));
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }

    /// Engine default mode, parsed.
    pub fn default_mode(&self) -> aegis_core::SandboxMode {
        aegis_core::SandboxMode::parse(&self.engine.default_mode).unwrap_or_default()
    }
}
