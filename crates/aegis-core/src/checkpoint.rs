use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::auth::AuthorizationResponse;
use crate::execution::{StepResult, StepStatus};
use crate::plan::{ExecutionPlan, StepId};

/// Snapshot of in-flight plan state, sufficient to resume or roll back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub id: Uuid,
    pub plan_id: Uuid,
    /// Completed step ids in completion order.
    pub completed_steps: Vec<StepId>,
    #[serde(default)]
    pub skipped_steps: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepId>,
    #[serde(default)]
    pub partial_results: BTreeMap<StepId, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub hub_state: Value,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationResponse>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExecutionCheckpoint {
    pub fn new(plan_id: Uuid, reason: impl Into<String>, ttl_secs: u64) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plan_id,
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            current_step: None,
            partial_results: BTreeMap::new(),
            context: Map::new(),
            hub_state: Value::Null,
            reason: reason.into(),
            plan: None,
            authorization: None,
            created_at,
            expires_at: created_at + Duration::seconds(ttl_secs as i64),
        }
    }

    /// Record completed and skipped steps from a set of results.
    pub fn with_results<'a>(mut self, results: impl IntoIterator<Item = &'a StepResult>) -> Self {
        for result in results {
            match result.status {
                StepStatus::Completed => {
                    self.completed_steps.push(result.step_id.clone());
                    self.partial_results
                        .insert(result.step_id.clone(), result.output.clone());
                }
                StepStatus::Skipped => {
                    self.skipped_steps.push(result.step_id.clone());
                }
                _ => {}
            }
        }
        self
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_authorization(mut self, auth: Option<AuthorizationResponse>) -> Self {
        self.authorization = auth;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
