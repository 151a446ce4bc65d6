use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::error::PlanError;

/// Step identifiers are unique within a plan.
pub type StepId = String;

/// Verbs that mark a step as destructive when no configured list is supplied.
pub const DEFAULT_DESTRUCTIVE_VERBS: &[&str] = &[
    "delete", "remove", "rm", "drop", "truncate", "destroy", "wipe", "purge", "format", "kill",
    "overwrite", "reset", "uninstall",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Baseline 0-100 score used by the default risk scorer.
    pub fn base_score(&self) -> u8 {
        match self {
            Self::Low => 10,
            Self::Medium => 40,
            Self::High => 70,
            Self::Critical => 95,
        }
    }

    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Execution strategy applied by the sandbox executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Describe what would be invoked, invoke nothing.
    DryRun,
    /// Ask the handler for a preview of the effect.
    Preview,
    /// Snapshot first, invoke, roll back automatically on failure.
    Sandbox,
    /// Check that the target and method exist and the params are acceptable.
    Validate,
    /// Invoke for real.
    #[default]
    Production,
}

impl SandboxMode {
    /// Whether handlers are actually invoked with side effects.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Self::Sandbox | Self::Production)
    }

    /// Mode a step runs in under this plan mode. A step may narrow the plan
    /// mode but never gain side effects the plan does not have.
    pub fn for_step(self, step_mode: Option<SandboxMode>) -> SandboxMode {
        match step_mode {
            Some(mode) if mode.has_side_effects() && !self.has_side_effects() => self,
            Some(mode) => mode,
            None => self,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "dry_run" | "dryrun" => Some(Self::DryRun),
            "preview" => Some(Self::Preview),
            "sandbox" => Some(Self::Sandbox),
            "validate" | "validate_only" => Some(Self::Validate),
            "production" | "real" => Some(Self::Production),
            _ => None,
        }
    }
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DryRun => "dry_run",
            Self::Preview => "preview",
            Self::Sandbox => "sandbox",
            Self::Validate => "validate",
            Self::Production => "production",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Skill,
    Hub,
    Conditional,
    Parallel,
    Wait,
    Checkpoint,
    Rollback,
}

impl ActionType {
    /// Whether the step is dispatched to a registered skill or hub handler.
    pub fn dispatches(&self) -> bool {
        matches!(self, Self::Skill | Self::Hub)
    }
}

// ── Conditions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Contains,
    NotContains,
    Exists,
    NotExists,
    Truthy,
}

/// Gate a step on a field of a prior step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    /// Step whose output is inspected. Must be one of the step's dependencies.
    pub step_id: StepId,
    /// Dot-separated path into the output ("" = the whole output).
    #[serde(default)]
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl StepCondition {
    pub fn new(
        step_id: impl Into<String>,
        field: impl Into<String>,
        operator: ConditionOperator,
        value: Value,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate against the referenced step's output.
    pub fn evaluate(&self, output: &Value) -> bool {
        let actual = lookup_path(output, &self.field);
        match self.operator {
            ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
            ConditionOperator::NotExists => actual.is_none_or(|v| v.is_null()),
            ConditionOperator::Truthy => actual.is_some_and(is_truthy),
            ConditionOperator::Equals => actual.is_some_and(|v| values_equal(v, &self.value)),
            ConditionOperator::NotEquals => !actual.is_some_and(|v| values_equal(v, &self.value)),
            ConditionOperator::GreaterThan => compare(actual, &self.value, |a, b| a > b),
            ConditionOperator::GreaterOrEqual => compare(actual, &self.value, |a, b| a >= b),
            ConditionOperator::LessThan => compare(actual, &self.value, |a, b| a < b),
            ConditionOperator::LessOrEqual => compare(actual, &self.value, |a, b| a <= b),
            ConditionOperator::Contains => actual.is_some_and(|v| contains(v, &self.value)),
            ConditionOperator::NotContains => !actual.is_some_and(|v| contains(v, &self.value)),
        }
    }
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

// ── Steps ──────────────────────────────────────────────────────

/// Call issued to undo a completed reversible step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackCommand {
    pub target: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: StepId,
    pub order: u32,
    pub action: ActionType,
    /// Skill or hub name; empty for control steps.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Runs the step when a primary dependency was skipped but these completed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_depends_on: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Overrides the plan mode for this step; see [`SandboxMode::for_step`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SandboxMode>,
    #[serde(default)]
    pub description: String,
}

impl ExecutionStep {
    pub fn new(id: impl Into<String>, action: ActionType) -> Self {
        Self {
            id: id.into(),
            order: 0,
            action,
            target: String::new(),
            method: String::new(),
            params: Value::Null,
            depends_on: Vec::new(),
            alternate_depends_on: Vec::new(),
            condition: None,
            reversible: false,
            rollback: None,
            timeout_ms: None,
            max_retries: None,
            mode: None,
            description: String::new(),
        }
    }

    /// A step that calls `method` on the skill `target`.
    pub fn skill(id: impl Into<String>, target: impl Into<String>, method: impl Into<String>) -> Self {
        let mut step = Self::new(id, ActionType::Skill);
        step.target = target.into();
        step.method = method.into();
        step
    }

    pub fn hub(id: impl Into<String>, target: impl Into<String>, method: impl Into<String>) -> Self {
        let mut step = Self::skill(id, target, method);
        step.action = ActionType::Hub;
        step
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn or_after(mut self, alternates: &[&str]) -> Self {
        self.alternate_depends_on = alternates.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn when(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn reversible_with(mut self, rollback: RollbackCommand) -> Self {
        self.reversible = true;
        self.rollback = Some(rollback);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn in_mode(mut self, mode: SandboxMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Every step this one waits on, primary and alternate.
    pub fn all_dependencies(&self) -> impl Iterator<Item = &StepId> {
        self.depends_on.iter().chain(self.alternate_depends_on.iter())
    }

    /// Whether the method, target, or command of this step names a destructive verb.
    pub fn is_destructive(&self, verbs: &[String]) -> bool {
        if !self.action.dispatches() {
            return false;
        }
        let mut words: Vec<String> = split_words(&self.method);
        words.extend(split_words(&self.target));
        if let Some(cmd) = self.params.get("command").and_then(Value::as_str) {
            words.extend(split_words(cmd));
        }
        words
            .iter()
            .any(|w| verbs.iter().any(|v| v.eq_ignore_ascii_case(w)))
    }
}

fn split_words(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

/// The default destructive verb list as owned strings.
pub fn default_destructive_verbs() -> Vec<String> {
    DEFAULT_DESTRUCTIVE_VERBS.iter().map(|v| v.to_string()).collect()
}

// ── Resources & limits ─────────────────────────────────────────

/// Everything a plan is expected to touch, derived from step parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManifest {
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub directories: BTreeSet<String>,
    #[serde(default)]
    pub repositories: BTreeSet<String>,
    #[serde(default)]
    pub urls: BTreeSet<String>,
    #[serde(default)]
    pub databases: BTreeSet<String>,
    #[serde(default)]
    pub external_apis: BTreeSet<String>,
    #[serde(default)]
    pub system_services: BTreeSet<String>,
}

impl ResourceManifest {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.directories.is_empty()
            && self.repositories.is_empty()
            && self.urls.is_empty()
            && self.databases.is_empty()
            && self.external_apis.is_empty()
            && self.system_services.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// All file-system paths (files and directories).
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.iter().chain(self.directories.iter())
    }

    pub fn merge(&mut self, other: ResourceManifest) {
        self.files.extend(other.files);
        self.directories.extend(other.directories);
        self.repositories.extend(other.repositories);
        self.urls.extend(other.urls);
        self.databases.extend(other.databases);
        self.external_apis.extend(other.external_apis);
        self.system_services.extend(other.system_services);
    }
}

/// Ceilings enforced while a plan runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub max_duration_ms: u64,
    pub max_retries_per_step: u32,
    pub max_files_changed: u32,
    pub max_bytes_written: u64,
    pub max_external_requests: u32,
    pub max_processes: u32,
    pub actions_per_second: f64,
}

impl ExecutionLimits {
    /// Conservative defaults that shrink as risk grows.
    pub fn for_risk(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => Self {
                max_duration_ms: 600_000,
                max_retries_per_step: 3,
                max_files_changed: 100,
                max_bytes_written: 100 * 1024 * 1024,
                max_external_requests: 200,
                max_processes: 8,
                actions_per_second: 10.0,
            },
            RiskLevel::Medium => Self {
                max_duration_ms: 300_000,
                max_retries_per_step: 3,
                max_files_changed: 50,
                max_bytes_written: 50 * 1024 * 1024,
                max_external_requests: 100,
                max_processes: 4,
                actions_per_second: 5.0,
            },
            RiskLevel::High => Self {
                max_duration_ms: 120_000,
                max_retries_per_step: 2,
                max_files_changed: 20,
                max_bytes_written: 10 * 1024 * 1024,
                max_external_requests: 50,
                max_processes: 2,
                actions_per_second: 2.0,
            },
            RiskLevel::Critical => Self {
                max_duration_ms: 60_000,
                max_retries_per_step: 1,
                max_files_changed: 5,
                max_bytes_written: 1024 * 1024,
                max_external_requests: 10,
                max_processes: 1,
                actions_per_second: 1.0,
            },
        }
    }

    /// Halve every ceiling (never below one unit).
    pub fn tightened(&self) -> Self {
        Self {
            max_duration_ms: (self.max_duration_ms / 2).max(1_000),
            max_retries_per_step: self.max_retries_per_step.min(1),
            max_files_changed: (self.max_files_changed / 2).max(1),
            max_bytes_written: (self.max_bytes_written / 2).max(1),
            max_external_requests: (self.max_external_requests / 2).max(1),
            max_processes: (self.max_processes / 2).max(1),
            actions_per_second: (self.actions_per_second / 2.0).max(0.5),
        }
    }

    /// Field-wise minimum of two limit sets.
    pub fn min(&self, other: &Self) -> Self {
        Self {
            max_duration_ms: self.max_duration_ms.min(other.max_duration_ms),
            max_retries_per_step: self.max_retries_per_step.min(other.max_retries_per_step),
            max_files_changed: self.max_files_changed.min(other.max_files_changed),
            max_bytes_written: self.max_bytes_written.min(other.max_bytes_written),
            max_external_requests: self.max_external_requests.min(other.max_external_requests),
            max_processes: self.max_processes.min(other.max_processes),
            actions_per_second: self.actions_per_second.min(other.actions_per_second),
        }
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::for_risk(RiskLevel::Medium)
    }
}

// ── Plan ───────────────────────────────────────────────────────

/// A compiled, dependency-ordered set of steps fulfilling one intent.
///
/// Plans are not mutated once authorized; changed parameters produce a new plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
    /// Rate-limit identifier of the requester.
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub manifest: ResourceManifest,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub limits: ExecutionLimits,
    #[serde(default)]
    pub mode: SandboxMode,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_origin() -> String {
    "anonymous".into()
}

impl ExecutionPlan {
    /// Build a plan from steps with medium risk and default limits.
    pub fn new(description: impl Into<String>, steps: Vec<ExecutionStep>) -> Self {
        let mut steps = steps;
        for (i, step) in steps.iter_mut().enumerate() {
            if step.order == 0 {
                step.order = i as u32 + 1;
            }
        }
        Self {
            id: Uuid::new_v4(),
            intent_id: None,
            origin: default_origin(),
            description: description.into(),
            steps,
            manifest: ResourceManifest::default(),
            risk_level: RiskLevel::Medium,
            required_permissions: Vec::new(),
            limits: ExecutionLimits::default(),
            mode: SandboxMode::Production,
            created_at: Utc::now(),
        }
    }

    pub fn with_mode(mut self, mode: SandboxMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Kahn's algorithm over `depends_on ∪ alternate_depends_on`, ties broken by `order`.
    pub fn topological_order(&self) -> Result<Vec<StepId>, PlanError> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&ExecutionStep>> = HashMap::new();
        for step in &self.steps {
            indegree.entry(step.id.as_str()).or_insert(0);
            for dep in step.all_dependencies() {
                if self.step(dep).is_none() {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                *indegree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(step);
            }
        }

        let mut ready: Vec<&ExecutionStep> = self
            .steps
            .iter()
            .filter(|s| indegree.get(s.id.as_str()).copied() == Some(0))
            .collect();
        let mut queue: VecDeque<&ExecutionStep> = VecDeque::new();
        ready.sort_by_key(|s| s.order);
        queue.extend(ready);

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(step) = queue.pop_front() {
            order.push(step.id.clone());
            let mut unlocked = Vec::new();
            for dependent in dependents.get(step.id.as_str()).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(dependent.id.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        unlocked.push(*dependent);
                    }
                }
            }
            unlocked.sort_by_key(|s| s.order);
            queue.extend(unlocked);
        }

        if order.len() != self.steps.len() {
            let done: HashSet<&str> = order.iter().map(String::as_str).collect();
            let mut cyclic: Vec<String> = self
                .steps
                .iter()
                .filter(|s| !done.contains(s.id.as_str()))
                .map(|s| s.id.clone())
                .collect();
            cyclic.sort();
            return Err(PlanError::Cycle(cyclic));
        }
        Ok(order)
    }

    /// Transitive dependencies of a step (excluding itself).
    pub fn ancestors(&self, id: &str) -> HashSet<StepId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(step) = self.step(current) {
                for dep in step.all_dependencies() {
                    if seen.insert(dep.clone()) {
                        stack.push(dep.as_str());
                    }
                }
            }
        }
        seen.remove(id);
        seen
    }

    /// Check structure: unique ids, known dependencies, no cycles, conditions
    /// referencing dependencies, and checkpoint boundaries after destructive steps.
    pub fn validate(&self, destructive_verbs: &[String]) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
            if step.action.dispatches() && (step.target.is_empty() || step.method.is_empty()) {
                return Err(PlanError::InvalidStep {
                    step: step.id.clone(),
                    reason: "skill and hub steps need a target and a method".into(),
                });
            }
            if step.action == ActionType::Conditional && step.condition.is_none() {
                return Err(PlanError::InvalidStep {
                    step: step.id.clone(),
                    reason: "conditional step without a condition".into(),
                });
            }
            if let Some(cond) = &step.condition {
                if !step.all_dependencies().any(|d| d == &cond.step_id) {
                    return Err(PlanError::InvalidStep {
                        step: step.id.clone(),
                        reason: format!(
                            "condition references '{}' which is not a dependency",
                            cond.step_id
                        ),
                    });
                }
            }
        }

        self.topological_order()?;
        self.check_checkpoint_boundaries(destructive_verbs)
    }

    fn check_checkpoint_boundaries(&self, verbs: &[String]) -> Result<(), PlanError> {
        let destructive: HashSet<&str> = self
            .steps
            .iter()
            .filter(|s| s.is_destructive(verbs))
            .map(|s| s.id.as_str())
            .collect();
        if destructive.is_empty() {
            return Ok(());
        }

        for step in self.steps.iter().filter(|s| s.action.dispatches() && !s.reversible) {
            let ancestors = self.ancestors(&step.id);
            for d in ancestors.iter().filter(|a| destructive.contains(a.as_str())) {
                let guarded = ancestors.iter().any(|c| {
                    self.step(c)
                        .is_some_and(|cs| cs.action == ActionType::Checkpoint)
                        && self.ancestors(c).contains(d)
                });
                if !guarded {
                    return Err(PlanError::MissingCheckpointBoundary {
                        step: step.id.clone(),
                        destructive: d.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
