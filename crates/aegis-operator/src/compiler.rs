use aegis_config::AegisConfig;
use aegis_core::{
    ActionType, CapabilityDescriptor, CapabilityKind, ExecutionLimits, ExecutionPlan,
    ExecutionStep, PlanError, ResourceManifest, RiskLevel, RollbackCommand, SandboxMode, StepId,
    UserIntent,
};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::registry::SkillRegistry;

/// Entity keys the compiler consumes itself instead of passing to the handler.
const RESERVED_ENTITIES: &[&str] = &["method", "mode"];

/// Parameter keys whose presence marks a step as handling credentials.
const CREDENTIAL_KEYS: &[&str] = &[
    "password", "passwd", "secret", "token", "api_key", "apikey", "private_key", "credentials",
];

/// Permissions that on their own make a plan high risk.
const BROAD_PERMISSIONS: &[&str] = &["admin", "root", "sudo", "system", "all"];

/// More distinct permissions than this escalates risk by one level.
const PERMISSION_BREADTH: usize = 3;

/// Turns a classified [`UserIntent`] into a validated [`ExecutionPlan`].
///
/// Compilation is pure: it reads the registry and configuration and touches
/// nothing else.
pub struct PlanCompiler {
    registry: Arc<SkillRegistry>,
    destructive_verbs: Vec<String>,
    sensitive: Vec<Regex>,
    default_mode: SandboxMode,
}

impl PlanCompiler {
    pub fn new(registry: Arc<SkillRegistry>, config: &AegisConfig) -> Self {
        let sensitive = config
            .authorization
            .sensitive_file_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid sensitive file pattern");
                    None
                }
            })
            .collect();
        Self {
            registry,
            destructive_verbs: config.authorization.destructive_patterns.clone(),
            sensitive,
            default_mode: config.default_mode(),
        }
    }

    pub fn destructive_verbs(&self) -> &[String] {
        &self.destructive_verbs
    }

    pub fn compile(&self, intent: &UserIntent) -> Result<ExecutionPlan, PlanError> {
        let capability = self
            .registry
            .resolve_intent(&intent.intent_type, intent.context.active_hub.as_deref())
            .ok_or_else(|| PlanError::UnmappedIntent(intent.intent_type.clone()))?;

        let entities = handler_params(&intent.entities);
        let mut steps = match (&capability.kind, capability.workflow.is_empty()) {
            (CapabilityKind::Hub, false) => self.expand_workflow(capability, &entities)?,
            _ => {
                let method = requested_method(intent, capability)?;
                vec![self.dispatch_step(
                    capability.name.clone(),
                    capability,
                    &method,
                    Value::Object(entities.clone()),
                    Vec::new(),
                )?]
            }
        };
        self.insert_checkpoints(&mut steps);

        let mut manifest = ResourceManifest::default();
        let mut permissions = BTreeSet::new();
        for step in steps.iter().filter(|s| s.action.dispatches()) {
            let Some(desc) = self.registry.descriptor(&step.target) else {
                continue;
            };
            manifest.merge(manifest_for(&step.params, desc));
            permissions.extend(desc.required_permissions.iter().cloned());
        }
        let permissions: Vec<String> = permissions.into_iter().collect();

        let risk = self.assess_risk(&steps, &manifest, &permissions);
        let mode = intent
            .entities
            .get("mode")
            .and_then(Value::as_str)
            .and_then(SandboxMode::parse)
            .unwrap_or(self.default_mode);

        let mut plan = ExecutionPlan::new(describe(intent), steps)
            .with_mode(mode)
            .with_risk(risk)
            .with_limits(ExecutionLimits::for_risk(risk));
        plan.intent_id = Some(intent.id);
        plan.origin = intent.identifier();
        plan.manifest = manifest;
        plan.required_permissions = permissions;

        plan.validate(&self.destructive_verbs)?;
        info!(
            plan_id = %plan.id,
            intent = %intent.intent_type,
            capability = %capability.name,
            steps = plan.steps.len(),
            risk = %plan.risk_level,
            mode = %plan.mode,
            "plan compiled"
        );
        Ok(plan)
    }

    // ── Expansion ───

    fn expand_workflow(
        &self,
        hub: &CapabilityDescriptor,
        entities: &Map<String, Value>,
    ) -> Result<Vec<ExecutionStep>, PlanError> {
        let mut steps = Vec::with_capacity(hub.workflow.len());
        for ws in &hub.workflow {
            let target = self
                .registry
                .descriptor(&ws.target)
                .ok_or_else(|| PlanError::UnknownCapability(ws.target.clone()))?;
            // workflow params win; intent entities fill the gaps
            let mut params = entities.clone();
            if let Value::Object(own) = &ws.params {
                for (k, v) in own {
                    params.insert(k.clone(), v.clone());
                }
            }
            steps.push(self.dispatch_step(
                ws.id.clone(),
                target,
                &ws.method,
                Value::Object(params),
                ws.depends_on.clone(),
            )?);
        }
        debug!(hub = %hub.name, steps = steps.len(), "workflow expanded");
        Ok(steps)
    }

    fn dispatch_step(
        &self,
        id: StepId,
        target: &CapabilityDescriptor,
        method: &str,
        params: Value,
        depends_on: Vec<StepId>,
    ) -> Result<ExecutionStep, PlanError> {
        let spec = target
            .method(method)
            .ok_or_else(|| PlanError::UnknownCapability(format!("{}.{}", target.name, method)))?;

        let mut step = match target.kind {
            CapabilityKind::Skill => ExecutionStep::skill(id, &target.name, method),
            CapabilityKind::Hub => ExecutionStep::hub(id, &target.name, method),
        }
        .with_params(params);
        step.depends_on = depends_on;
        step.description = if spec.description.is_empty() {
            format!("{}.{}", target.name, method)
        } else {
            spec.description.clone()
        };
        if let Some(rollback) = &spec.rollback_method {
            let params = step.params.clone();
            step = step.reversible_with(RollbackCommand {
                target: target.name.clone(),
                method: rollback.clone(),
                params,
            });
        }
        Ok(step)
    }

    fn is_destructive(&self, step: &ExecutionStep) -> bool {
        step.is_destructive(&self.destructive_verbs)
            || self
                .registry
                .descriptor(&step.target)
                .and_then(|d| d.method(&step.method))
                .is_some_and(|m| m.destructive)
    }

    /// Put a checkpoint step behind every destructive step that has an
    /// irreversible descendant. The checkpoint is added to the destructive
    /// step's direct dependents in the same dependency list, so every path
    /// from the destructive step passes through it.
    fn insert_checkpoints(&self, steps: &mut Vec<ExecutionStep>) {
        let destructive: Vec<StepId> = steps
            .iter()
            .filter(|s| self.is_destructive(s))
            .map(|s| s.id.clone())
            .collect();
        if destructive.is_empty() {
            return;
        }

        let scratch = ExecutionPlan::new("", steps.clone());
        for d in destructive {
            let needs_boundary = steps.iter().any(|s| {
                s.action.dispatches() && !s.reversible && scratch.ancestors(&s.id).contains(&d)
            });
            if !needs_boundary {
                continue;
            }
            let checkpoint_id = unique_id(steps, &format!("checkpoint_after_{d}"));
            for step in steps.iter_mut() {
                if step.depends_on.contains(&d) {
                    step.depends_on.push(checkpoint_id.clone());
                } else if step.alternate_depends_on.contains(&d) {
                    step.alternate_depends_on.push(checkpoint_id.clone());
                }
            }
            let mut checkpoint = ExecutionStep::new(checkpoint_id.clone(), ActionType::Checkpoint);
            checkpoint.depends_on = vec![d.clone()];
            checkpoint.description = format!("checkpoint after destructive step '{d}'");
            debug!(step = %d, checkpoint = %checkpoint_id, "checkpoint boundary inserted");
            steps.push(checkpoint);
        }
        for (i, step) in steps.iter_mut().enumerate() {
            step.order = i as u32;
        }
    }

    // ── Risk ───

    fn assess_risk(
        &self,
        steps: &[ExecutionStep],
        manifest: &ResourceManifest,
        permissions: &[String],
    ) -> RiskLevel {
        let mut risk = RiskLevel::Low;

        let touches_outside = !manifest.urls.is_empty()
            || !manifest.external_apis.is_empty()
            || !manifest.databases.is_empty()
            || !manifest.system_services.is_empty();
        if touches_outside {
            risk = risk.max(RiskLevel::Medium);
        }

        let destructive: Vec<&ExecutionStep> =
            steps.iter().filter(|s| self.is_destructive(s)).collect();
        if !destructive.is_empty() {
            let floor = if destructive.iter().all(|s| s.reversible) {
                RiskLevel::Medium
            } else {
                RiskLevel::High
            };
            risk = risk.max(floor);
        }

        let sensitive = manifest
            .paths()
            .any(|p| self.sensitive.iter().any(|re| re.is_match(p)))
            || steps.iter().any(|s| carries_credentials(&s.params));
        if sensitive {
            risk = if destructive.is_empty() {
                risk.max(RiskLevel::High)
            } else {
                RiskLevel::Critical
            };
        }

        let broad = permissions.iter().any(|p| {
            let p = p.to_ascii_lowercase();
            BROAD_PERMISSIONS
                .iter()
                .any(|b| p == *b || p.ends_with(&format!(":{b}")))
        });
        if broad {
            risk = risk.max(RiskLevel::High);
        }
        if permissions.len() > PERMISSION_BREADTH {
            risk = risk.escalate();
        }
        risk
    }
}

// ── Helpers ────────────────────────────────────────────────────

fn handler_params(entities: &Map<String, Value>) -> Map<String, Value> {
    entities
        .iter()
        .filter(|(k, _)| !RESERVED_ENTITIES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn requested_method(
    intent: &UserIntent,
    capability: &CapabilityDescriptor,
) -> Result<String, PlanError> {
    match intent.entities.get("method").and_then(Value::as_str) {
        Some(method) => Ok(method.to_string()),
        None => capability.default_method.clone().ok_or_else(|| PlanError::InvalidStep {
            step: capability.name.clone(),
            reason: "no method requested and no default method declared".into(),
        }),
    }
}

fn describe(intent: &UserIntent) -> String {
    let raw: String = intent.raw_input.chars().take(80).collect();
    if raw.is_empty() {
        intent.intent_type.clone()
    } else {
        format!("{}: {}", intent.intent_type, raw)
    }
}

fn unique_id(steps: &[ExecutionStep], base: &str) -> StepId {
    let taken = |id: &str| steps.iter().any(|s| s.id == id);
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|id| !taken(id))
        .unwrap_or_else(|| base.to_string())
}

/// Static manifest derivation from one step's parameters.
pub fn manifest_for(params: &Value, capability: &CapabilityDescriptor) -> ResourceManifest {
    let mut manifest = ResourceManifest::default();
    walk(params, None, &mut |key, value| {
        if key.is_some_and(|k| add_keyed(&mut manifest, k, value)) {
            return;
        }
        if key == Some("command") {
            for token in value.split_whitespace() {
                if token.starts_with('/') || token.starts_with("~/") {
                    add_path(&mut manifest, token);
                }
            }
            return;
        }
        if value.starts_with("http://") || value.starts_with("https://") {
            manifest.urls.insert(value.to_string());
        } else if value.starts_with("git@") || value.ends_with(".git") {
            manifest.repositories.insert(value.to_string());
        }
    });

    if capability.external {
        manifest.external_apis.insert(capability.name.clone());
        let hosts: Vec<String> = manifest.urls.iter().filter_map(|u| host_of(u)).collect();
        manifest.external_apis.extend(hosts);
    }
    manifest
}

/// File the value under the manifest field its key names.
fn add_keyed(manifest: &mut ResourceManifest, key: &str, value: &str) -> bool {
    let set = match key.to_ascii_lowercase().as_str() {
        "path" | "paths" | "file" | "files" | "source" | "destination" | "dest" => {
            add_path(manifest, value);
            return true;
        }
        "dir" | "directory" | "cwd" | "workdir" => &mut manifest.directories,
        "url" | "urls" | "endpoint" | "webhook" => &mut manifest.urls,
        "repo" | "repos" | "repository" => &mut manifest.repositories,
        "database" | "db" | "dsn" | "connection_string" => &mut manifest.databases,
        "service" | "services" | "unit" => &mut manifest.system_services,
        _ => return false,
    };
    set.insert(value.to_string());
    true
}

fn add_path(manifest: &mut ResourceManifest, value: &str) {
    if value.ends_with('/') {
        manifest.directories.insert(value.to_string());
    } else {
        manifest.files.insert(value.to_string());
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    (!host.is_empty()).then(|| host.to_string())
}

/// Visit every string leaf with the nearest object key above it.
fn walk<'a>(value: &'a Value, key: Option<&'a str>, visit: &mut dyn FnMut(Option<&str>, &str)) {
    match value {
        Value::String(s) => visit(key, s),
        Value::Array(items) => {
            for item in items {
                walk(item, key, visit);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                walk(v, Some(k.as_str()), visit);
            }
        }
        _ => {}
    }
}

fn carries_credentials(params: &Value) -> bool {
    match params {
        Value::Object(map) => map.iter().any(|(k, v)| {
            CREDENTIAL_KEYS.contains(&k.to_ascii_lowercase().as_str()) || carries_credentials(v)
        }),
        Value::Array(items) => items.iter().any(carries_credentials),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::SkillCategory;
    use serde_json::json;

    #[test]
    fn test_manifest_from_params() {
        let cap = CapabilityDescriptor::skill("http", SkillCategory::Browser).external();
        let params = json!({
            "path": "/etc/hosts",
            "dir": "/var/log",
            "url": "https://api.example.com/v1/items",
            "nested": { "repo": "git@github.com:acme/site.git" },
            "command": "rm -rf /tmp/cache ~/old.txt",
            "service": "nginx",
        });
        let m = manifest_for(&params, &cap);
        assert!(m.files.contains("/etc/hosts"));
        assert!(m.files.contains("/tmp/cache"));
        assert!(m.files.contains("~/old.txt"));
        assert!(m.directories.contains("/var/log"));
        assert!(m.urls.contains("https://api.example.com/v1/items"));
        assert!(m.repositories.contains("git@github.com:acme/site.git"));
        assert!(m.system_services.contains("nginx"));
        assert!(m.external_apis.contains("http"));
        assert!(m.external_apis.contains("api.example.com"));
    }

    #[test]
    fn test_manifest_bare_values() {
        let cap = CapabilityDescriptor::skill("notes", SkillCategory::Data);
        let m = manifest_for(
            &json!({ "text": "see https://example.org", "files": ["a.txt", "out/"] }),
            &cap,
        );
        assert!(m.files.contains("a.txt"));
        assert!(m.directories.contains("out/"));
        // free text is not parsed for embedded urls
        assert!(m.urls.is_empty());
        assert!(m.external_apis.is_empty());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://user@host.io:8080/x").as_deref(), Some("host.io:8080"));
        assert_eq!(host_of("no-scheme"), None);
    }

    #[test]
    fn test_credentials_detected_nested() {
        assert!(carries_credentials(&json!({ "auth": { "Token": "x" } })));
        assert!(!carries_credentials(&json!({ "text": "token" })));
    }
}
