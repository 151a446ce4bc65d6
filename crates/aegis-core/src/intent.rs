use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A classified user request, as handed over by a CLI, chat, or HTTP front end.
///
/// Intents are values: once built they are only read by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIntent {
    pub id: Uuid,
    /// Channel the request arrived on ("cli", "telegram", "http", ...).
    pub channel: String,
    /// Originating user, when the front end knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Raw text as typed by the user.
    pub raw_input: String,
    /// Classified intent type, e.g. "send_message" or "deploy_landing_page".
    pub intent_type: String,
    /// Entities extracted by the classifier.
    #[serde(default)]
    pub entities: Map<String, Value>,
    #[serde(default)]
    pub context: SessionContext,
    pub created_at: DateTime<Utc>,
}

/// Conversation state that travels with an intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_hub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workflow: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl UserIntent {
    pub fn new(
        channel: impl Into<String>,
        raw_input: impl Into<String>,
        intent_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            user_id: None,
            raw_input: raw_input.into(),
            intent_type: intent_type.into(),
            entities: Map::new(),
            context: SessionContext::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_entity(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entities.insert(key.into(), value);
        self
    }

    pub fn with_context(mut self, context: SessionContext) -> Self {
        self.context = context;
        self
    }

    /// Identifier used for per-origin rate limiting: the user when known,
    /// otherwise the channel.
    pub fn identifier(&self) -> String {
        match &self.user_id {
            Some(user) => format!("{}:{}", self.channel, user),
            None => self.channel.clone(),
        }
    }

    /// Look up a session variable.
    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.context.variables.get(key)
    }
}
