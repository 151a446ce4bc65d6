use aegis_core::{AegisError, ExecutionLimits};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Tracks what one execution has consumed against its limits.
#[derive(Debug, Clone)]
pub struct ExecutionBudget {
    plan_id: Uuid,
    state: Arc<RwLock<BudgetState>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub limits: ExecutionLimits,
    pub files_changed: u64,
    pub bytes_written: u64,
    pub external_requests: u64,
    /// Steps currently dispatched.
    pub processes: u32,
    pub peak_processes: u32,
    /// Dispatches including retries.
    pub actions: u64,
}

impl ExecutionBudget {
    pub fn new(plan_id: Uuid, limits: ExecutionLimits) -> Self {
        Self {
            plan_id,
            state: Arc::new(RwLock::new(BudgetState {
                limits,
                files_changed: 0,
                bytes_written: 0,
                external_requests: 0,
                processes: 0,
                peak_processes: 0,
                actions: 0,
            })),
        }
    }

    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn record_files(&self, n: u64) -> aegis_core::Result<()> {
        let mut state = self.state.write();
        state.files_changed += n;
        exceeded(
            "files_changed",
            state.files_changed,
            state.limits.max_files_changed as u64,
        )
    }

    pub fn record_bytes(&self, n: u64) -> aegis_core::Result<()> {
        let mut state = self.state.write();
        state.bytes_written += n;
        exceeded(
            "bytes_written",
            state.bytes_written,
            state.limits.max_bytes_written,
        )
    }

    pub fn record_external_request(&self) -> aegis_core::Result<()> {
        let mut state = self.state.write();
        state.external_requests += 1;
        exceeded(
            "external_requests",
            state.external_requests,
            state.limits.max_external_requests as u64,
        )
    }

    pub fn record_action(&self) {
        self.state.write().actions += 1;
    }

    /// Account for a newly dispatched step.
    pub fn acquire_process(&self) -> aegis_core::Result<()> {
        let mut state = self.state.write();
        if state.processes >= state.limits.max_processes {
            return Err(AegisError::LimitExceeded {
                resource: "processes".into(),
                used: (state.processes + 1) as f64,
                limit: state.limits.max_processes as f64,
            });
        }
        state.processes += 1;
        state.peak_processes = state.peak_processes.max(state.processes);
        Ok(())
    }

    pub fn release_process(&self) {
        let mut state = self.state.write();
        state.processes = state.processes.saturating_sub(1);
    }

    /// Charge the `files_changed` and `bytes_written` a skill reports in its output.
    pub fn record_output(&self, output: &Value) -> aegis_core::Result<()> {
        if let Some(files) = output.get("files_changed").and_then(count) {
            self.record_files(files)?;
        }
        if let Some(bytes) = output.get("bytes_written").and_then(Value::as_u64) {
            self.record_bytes(bytes)?;
        }
        Ok(())
    }

    /// Re-check every counter without recording.
    pub fn check(&self) -> aegis_core::Result<()> {
        let state = self.state.read();
        exceeded(
            "files_changed",
            state.files_changed,
            state.limits.max_files_changed as u64,
        )?;
        exceeded(
            "bytes_written",
            state.bytes_written,
            state.limits.max_bytes_written,
        )?;
        exceeded(
            "external_requests",
            state.external_requests,
            state.limits.max_external_requests as u64,
        )
    }

    pub fn snapshot(&self) -> BudgetState {
        self.state.read().clone()
    }
}

/// `files_changed` may be a count or a list of paths.
fn count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_array().map(|a| a.len() as u64))
}

fn exceeded(resource: &str, used: u64, limit: u64) -> aegis_core::Result<()> {
    if used > limit {
        warn!(resource, used, limit, "execution budget exceeded");
        return Err(AegisError::LimitExceeded {
            resource: resource.into(),
            used: used as f64,
            limit: limit as f64,
        });
    }
    Ok(())
}
