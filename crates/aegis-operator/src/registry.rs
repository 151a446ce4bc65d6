use aegis_core::{CapabilityDescriptor, CapabilityKind, SkillHandler};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered capability: what it declares plus the handler that runs it.
#[derive(Clone)]
pub struct RegisteredCapability {
    pub descriptor: CapabilityDescriptor,
    pub handler: Arc<dyn SkillHandler>,
}

/// The skill and hub registry.
///
/// Filled once at start-up, then shared read-only by the compiler and the
/// sandbox executor. Later registrations under the same name replace earlier
/// ones.
#[derive(Default, Clone)]
pub struct SkillRegistry {
    capabilities: HashMap<String, RegisteredCapability>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CapabilityDescriptor, handler: Arc<dyn SkillHandler>) {
        if self.capabilities.contains_key(&descriptor.name) {
            warn!(capability = %descriptor.name, "capability re-registered, replacing previous handler");
        } else {
            info!(
                capability = %descriptor.name,
                kind = ?descriptor.kind,
                methods = descriptor.methods.len(),
                "registered capability"
            );
        }
        self.capabilities.insert(
            descriptor.name.clone(),
            RegisteredCapability {
                descriptor,
                handler,
            },
        );
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, descriptor: CapabilityDescriptor, handler: Arc<dyn SkillHandler>) -> Self {
        self.register(descriptor, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredCapability> {
        self.capabilities.get(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.capabilities.get(name).map(|c| &c.descriptor)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn SkillHandler>> {
        self.capabilities.get(name).map(|c| Arc::clone(&c.handler))
    }

    /// Find the capability for a classified intent type.
    ///
    /// Declared intents win over name matches. When the session has an active
    /// hub that declares the intent, the hub is preferred; otherwise ties go to
    /// the alphabetically first name so resolution is stable.
    pub fn resolve_intent(
        &self,
        intent_type: &str,
        active_hub: Option<&str>,
    ) -> Option<&CapabilityDescriptor> {
        if let Some(hub) = active_hub.and_then(|h| self.descriptor(h)) {
            if hub.kind == CapabilityKind::Hub && hub.intents.iter().any(|i| i == intent_type) {
                debug!(intent = intent_type, hub = %hub.name, "intent resolved to active hub");
                return Some(hub);
            }
        }

        let mut declared: Vec<&CapabilityDescriptor> = self
            .capabilities
            .values()
            .map(|c| &c.descriptor)
            .filter(|d| d.intents.iter().any(|i| i == intent_type))
            .collect();
        declared.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(found) = declared.first() {
            debug!(intent = intent_type, capability = %found.name, "intent resolved");
            return Some(found);
        }

        self.descriptor(intent_type)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
