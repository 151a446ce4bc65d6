use aegis_config::{CustomPattern, GuardrailConfig};
use aegis_core::Severity;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::ratelimit::RateLimiter;
use crate::resource::{ResourceLimits, ResourceMonitor, ResourceUsage};

/// Matched fragments are cut to this many characters before they are logged.
const FRAGMENT_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    Custom,
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SqlInjection => "sql_injection",
            Self::Xss => "xss",
            Self::PathTraversal => "path_traversal",
            Self::CommandInjection => "command_injection",
            Self::Custom => "custom",
        })
    }
}

/// One anti-pattern match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub category: ViolationCategory,
    pub severity: Severity,
    /// Name of the rule that matched.
    pub rule: String,
    /// Matched text, truncated.
    pub fragment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn clean() -> Self {
        Self {
            is_valid: true,
            violations: Vec::new(),
        }
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    pub fn has_category(&self, category: ViolationCategory) -> bool {
        self.violations.iter().any(|v| v.category == category)
    }

    fn merge(&mut self, other: ValidationReport) {
        self.violations.extend(other.violations);
        self.is_valid = self.violations.is_empty();
    }
}

/// A single input-scanning rule.
pub trait InputRule: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> ViolationCategory;
    fn scan(&self, input: &str) -> Option<Violation>;
}

/// Regex-backed rule.
pub struct PatternRule {
    name: String,
    category: ViolationCategory,
    severity: Severity,
    regex: Regex,
}

impl PatternRule {
    pub fn new(
        name: impl Into<String>,
        category: ViolationCategory,
        severity: Severity,
        pattern: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            category,
            severity,
            regex: Regex::new(pattern)?,
        })
    }
}

impl InputRule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> ViolationCategory {
        self.category
    }

    fn scan(&self, input: &str) -> Option<Violation> {
        self.regex.find(input).map(|m| Violation {
            category: self.category,
            severity: self.severity,
            rule: self.name.clone(),
            fragment: m.as_str().chars().take(FRAGMENT_LIMIT).collect(),
        })
    }
}

// ── Built-in pattern sets ──────────────────────────────────────

const BUILTIN_PATTERNS: &[(&str, ViolationCategory, Severity, &str)] = &[
    // SQL injection
    (
        "sql_stacked_ddl",
        ViolationCategory::SqlInjection,
        Severity::Critical,
        r"(?i);\s*(drop|truncate|alter|create)\s+(table|database|schema|index|view)\b",
    ),
    (
        "sql_stacked_dml",
        ViolationCategory::SqlInjection,
        Severity::Critical,
        r"(?i);\s*(delete\s+from|insert\s+into|update\s+\w+\s+set)\b",
    ),
    (
        "sql_union_select",
        ViolationCategory::SqlInjection,
        Severity::High,
        r"(?i)\bunion\s+(all\s+)?select\b",
    ),
    (
        "sql_tautology",
        ViolationCategory::SqlInjection,
        Severity::High,
        r#"(?i)['"]\s*or\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
    ),
    (
        "sql_comment_terminator",
        ViolationCategory::SqlInjection,
        Severity::Medium,
        r"'\s*(--|/\*)",
    ),
    (
        "sql_procedure_exec",
        ViolationCategory::SqlInjection,
        Severity::Critical,
        r"(?i)\bexec(ute)?\s+(xp|sp)_\w+",
    ),
    (
        "sql_time_based",
        ViolationCategory::SqlInjection,
        Severity::Medium,
        r"(?i)\b(pg_sleep|benchmark|waitfor\s+delay)\b",
    ),
    // XSS
    (
        "xss_script_tag",
        ViolationCategory::Xss,
        Severity::High,
        r"(?i)<\s*script\b",
    ),
    (
        "xss_js_uri",
        ViolationCategory::Xss,
        Severity::High,
        r"(?i)javascript\s*:",
    ),
    (
        "xss_event_handler",
        ViolationCategory::Xss,
        Severity::Medium,
        r"(?i)\bon(error|load|click|mouseover|focus|blur|submit)\s*=",
    ),
    (
        "xss_embedded_frame",
        ViolationCategory::Xss,
        Severity::Medium,
        r"(?i)<\s*(iframe|object|embed)\b",
    ),
    (
        "xss_dom_sink",
        ViolationCategory::Xss,
        Severity::Medium,
        r"(?i)document\.(cookie|write)",
    ),
    // Path traversal
    (
        "path_dot_dot",
        ViolationCategory::PathTraversal,
        Severity::High,
        r"\.\.[/\\]",
    ),
    (
        "path_encoded_dot_dot",
        ViolationCategory::PathTraversal,
        Severity::High,
        r"(?i)(%2e%2e|\.\.)(%2f|%5c)",
    ),
    (
        "path_system_file",
        ViolationCategory::PathTraversal,
        Severity::Critical,
        r"(^|[\s'\x22=:])/(etc/(passwd|shadow|sudoers)|proc/self/)",
    ),
    (
        "path_null_byte",
        ViolationCategory::PathTraversal,
        Severity::High,
        r"(\x00|%00)",
    ),
    // Command injection
    (
        "cmd_chained_shell",
        ViolationCategory::CommandInjection,
        Severity::Critical,
        r"(;|&&|\|\|)\s*(rm|curl|wget|nc|ncat|bash|sh|chmod|chown|mkfs|dd|shutdown|reboot)\b",
    ),
    (
        "cmd_pipe_to_shell",
        ViolationCategory::CommandInjection,
        Severity::Critical,
        r"\|\s*(sh|bash|zsh|nc|python[0-9.]*|perl|ruby)\b",
    ),
    (
        "cmd_substitution",
        ViolationCategory::CommandInjection,
        Severity::High,
        r"\$\([^)]*\)|`[^`]+`",
    ),
    (
        "cmd_rm_root",
        ViolationCategory::CommandInjection,
        Severity::Critical,
        r"\brm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+/(\*|\s|$)",
    ),
];

/// Input validator with per-category counters, a rate limiter, and resource ceilings.
///
/// Scanning never blocks by itself; callers decide policy from the report.
pub struct GuardrailValidator {
    rules: Vec<Box<dyn InputRule>>,
    max_input_length: usize,
    counters: DashMap<ViolationCategory, u64>,
    scans: AtomicU64,
    rate_limiter: RateLimiter,
    resources: ResourceMonitor,
}

impl GuardrailValidator {
    pub fn new(config: &GuardrailConfig) -> Self {
        let mut validator = Self {
            rules: Vec::new(),
            max_input_length: config.max_input_length,
            counters: DashMap::new(),
            scans: AtomicU64::new(0),
            rate_limiter: RateLimiter::new(config.max_requests_per_minute),
            resources: ResourceMonitor::new(ResourceLimits::from_config(config)),
        };
        for (name, category, severity, pattern) in BUILTIN_PATTERNS {
            match PatternRule::new(*name, *category, *severity, pattern) {
                Ok(rule) => validator.add_rule(Box::new(rule)),
                Err(e) => warn!(rule = name, error = %e, "built-in pattern failed to compile"),
            }
        }
        for custom in &config.custom_patterns {
            validator.add_custom_pattern(custom);
        }
        validator
    }

    pub fn add_rule(&mut self, rule: Box<dyn InputRule>) {
        self.rules.push(rule);
    }

    /// Register a caller-supplied pattern under the `custom` category.
    /// Returns false if the pattern does not compile.
    pub fn add_custom_pattern(&mut self, custom: &CustomPattern) -> bool {
        match PatternRule::new(
            custom.name.clone(),
            ViolationCategory::Custom,
            custom.severity,
            &custom.pattern,
        ) {
            Ok(rule) => {
                self.add_rule(Box::new(rule));
                true
            }
            Err(e) => {
                warn!(rule = %custom.name, error = %e, "invalid custom guardrail pattern");
                false
            }
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Scan one string against every rule.
    pub fn validate_input(&self, input: &str) -> ValidationReport {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let mut violations = Vec::new();

        if input.len() > self.max_input_length {
            violations.push(Violation {
                category: ViolationCategory::Custom,
                severity: Severity::Medium,
                rule: "input_length".into(),
                fragment: format!("{} bytes", input.len()),
            });
        }

        for rule in &self.rules {
            if let Some(v) = rule.scan(input) {
                violations.push(v);
            }
        }

        for v in &violations {
            *self.counters.entry(v.category).or_insert(0) += 1;
            warn!(
                category = %v.category,
                severity = %v.severity,
                rule = %v.rule,
                "guardrail violation"
            );
        }
        if violations.is_empty() {
            debug!(len = input.len(), "input passed guardrail scan");
        }

        ValidationReport {
            is_valid: violations.is_empty(),
            violations,
        }
    }

    /// Scan every string inside a JSON value.
    pub fn validate_value(&self, value: &Value) -> ValidationReport {
        let mut report = ValidationReport::clean();
        match value {
            Value::String(s) => report.merge(self.validate_input(s)),
            Value::Array(items) => {
                for item in items {
                    report.merge(self.validate_value(item));
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    report.merge(self.validate_value(item));
                }
            }
            _ => {}
        }
        report
    }

    /// Violations seen so far for a category.
    pub fn violation_count(&self, category: ViolationCategory) -> u64 {
        self.counters.get(&category).map(|c| *c).unwrap_or(0)
    }

    pub fn total_violations(&self) -> u64 {
        self.counters.iter().map(|e| *e.value()).sum()
    }

    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Admit or reject one request for `identifier`.
    pub fn check_rate_limit(&self, identifier: &str) -> aegis_core::Result<()> {
        self.rate_limiter.check_rate_limit(identifier)
    }

    /// Compare live process usage against the configured ceilings.
    pub fn check_resource_limits(
        &self,
        elapsed: Option<std::time::Duration>,
    ) -> aegis_core::Result<ResourceUsage> {
        self.resources.check_resource_limits(elapsed)
    }

    pub fn resources(&self) -> &ResourceMonitor {
        &self.resources
    }
}

impl Default for GuardrailValidator {
    fn default() -> Self {
        Self::new(&GuardrailConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_builtin_patterns_compile() {
        let v = GuardrailValidator::default();
        assert_eq!(v.rule_count(), BUILTIN_PATTERNS.len());
    }

    #[test]
    fn test_fragment_is_truncated() {
        let rule = PatternRule::new("long", ViolationCategory::Custom, Severity::Low, "a+").unwrap();
        let hit = rule.scan(&"a".repeat(500)).unwrap();
        assert_eq!(hit.fragment.len(), FRAGMENT_LIMIT);
    }
}
