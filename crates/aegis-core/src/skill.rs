use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::plan::SandboxMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Skill,
    Hub,
}

/// Broad category of a capability; decides whether string inputs are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCategory {
    Exec,
    File,
    Browser,
    Messaging,
    Ai,
    Data,
    #[default]
    Other,
}

impl SkillCategory {
    pub fn requires_input_scan(&self) -> bool {
        matches!(self, Self::Exec | Self::File | Self::Browser)
    }
}

/// A method exposed by a skill or hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub destructive: bool,
    /// Method on the same target that undoes this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_method: Option<String>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            destructive: false,
            rollback_method: None,
        }
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    pub fn undone_by(mut self, method: impl Into<String>) -> Self {
        self.rollback_method = Some(method.into());
        self
    }
}

/// One stage of a hub workflow, expanded into a plan step by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub target: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Read-only description of a registered skill or hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub kind: CapabilityKind,
    #[serde(default)]
    pub category: SkillCategory,
    #[serde(default)]
    pub description: String,
    pub methods: Vec<MethodSpec>,
    /// Method used when an intent names only the capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_method: Option<String>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Intent types this capability fulfills.
    #[serde(default)]
    pub intents: Vec<String>,
    /// Whether calls leave the host (counts against external request limits).
    #[serde(default)]
    pub external: bool,
    /// Hub workflow; empty for plain skills.
    #[serde(default)]
    pub workflow: Vec<WorkflowStep>,
}

impl CapabilityDescriptor {
    pub fn skill(name: impl Into<String>, category: SkillCategory) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::Skill,
            category,
            description: String::new(),
            methods: Vec::new(),
            default_method: None,
            required_permissions: Vec::new(),
            intents: Vec::new(),
            external: false,
            workflow: Vec::new(),
        }
    }

    pub fn hub(name: impl Into<String>) -> Self {
        let mut desc = Self::skill(name, SkillCategory::Other);
        desc.kind = CapabilityKind::Hub;
        desc
    }

    pub fn with_method(mut self, method: MethodSpec) -> Self {
        if self.default_method.is_none() {
            self.default_method = Some(method.name.clone());
        }
        self.methods.push(method);
        self
    }

    pub fn handles(mut self, intent_type: impl Into<String>) -> Self {
        self.intents.push(intent_type.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.push(permission.into());
        self
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    pub fn with_workflow(mut self, workflow: Vec<WorkflowStep>) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Context handed to a handler on each call.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub plan_id: Uuid,
    pub step_id: String,
    pub mode: SandboxMode,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Contract every skill or hub handler implements.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    /// Perform `method` with `params`.
    async fn invoke(
        &self,
        method: &str,
        params: &Value,
        ctx: &InvocationContext,
    ) -> crate::Result<Value>;

    /// Describe the effect of `method` without performing it.
    async fn preview(
        &self,
        method: &str,
        params: &Value,
        _ctx: &InvocationContext,
    ) -> crate::Result<Value> {
        Ok(serde_json::json!({
            "method": method,
            "params": params,
            "preview": "no preview available",
        }))
    }
}
