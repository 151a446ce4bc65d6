use aegis_core::{
    AegisError, ExecutionStep, InvocationContext, RollbackCommand, SandboxMode, SkillHandler,
};
use aegis_guard::CheckpointManager;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::SkillRegistry;

/// Wraps every handler call in the step's execution mode, its deadline and
/// the execution's cancellation token.
///
/// | mode         | handler call                                        |
/// |--------------|-----------------------------------------------------|
/// | `dry_run`    | none; describes the call                            |
/// | `preview`    | `SkillHandler::preview`                             |
/// | `validate`   | none; checks target, method and params              |
/// | `sandbox`    | snapshot, `invoke`, roll back the step on failure   |
/// | `production` | `invoke`                                            |
pub struct SandboxExecutor {
    registry: Arc<SkillRegistry>,
    checkpoints: CheckpointManager,
}

impl SandboxExecutor {
    pub fn new(registry: Arc<SkillRegistry>, checkpoints: CheckpointManager) -> Self {
        Self {
            registry,
            checkpoints,
        }
    }

    /// Run one step in `ctx.mode`.
    pub async fn execute(
        &self,
        step: &ExecutionStep,
        ctx: &InvocationContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> aegis_core::Result<Value> {
        match ctx.mode {
            SandboxMode::DryRun => {
                self.capability(step)?;
                debug!(step_id = %step.id, target = %step.target, method = %step.method, "dry run");
                Ok(json!({
                    "mode": "dry_run",
                    "target": step.target,
                    "method": step.method,
                    "params": step.params,
                    "would_execute": true,
                }))
            }
            SandboxMode::Validate => {
                self.validate(step)?;
                Ok(json!({
                    "mode": "validate",
                    "target": step.target,
                    "method": step.method,
                    "valid": true,
                }))
            }
            SandboxMode::Preview => {
                let handler = self.capability(step)?;
                bounded(&step.id, timeout, cancel, async {
                    handler.preview(&step.method, &step.params, ctx).await
                })
                .await
            }
            SandboxMode::Sandbox => self.run_sandboxed(step, ctx, timeout, cancel).await,
            SandboxMode::Production => {
                let handler = self.capability(step)?;
                bounded(&step.id, timeout, cancel, async {
                    handler.invoke(&step.method, &step.params, ctx).await
                })
                .await
            }
        }
    }

    /// Invoke a step's rollback command.
    pub async fn rollback(
        &self,
        step_id: &str,
        command: &RollbackCommand,
        ctx: &InvocationContext,
        timeout: Duration,
    ) -> aegis_core::Result<Value> {
        let handler = self.registry.handler(&command.target).ok_or_else(|| AegisError::Step {
            step_id: step_id.to_string(),
            reason: format!("no handler registered for rollback target '{}'", command.target),
            recoverable: false,
        })?;
        debug!(step_id, target = %command.target, method = %command.method, "invoking rollback");
        bounded(step_id, timeout, &CancellationToken::new(), async {
            handler.invoke(&command.method, &command.params, ctx).await
        })
        .await
    }

    async fn run_sandboxed(
        &self,
        step: &ExecutionStep,
        ctx: &InvocationContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> aegis_core::Result<Value> {
        let handler = self.capability(step)?;

        let mut snapshot = self
            .checkpoints
            .draft(ctx.plan_id, format!("sandbox snapshot before '{}'", step.id));
        snapshot.current_step = Some(step.id.clone());
        snapshot.hub_state = json!({
            "target": step.target,
            "method": step.method,
            "params": step.params,
            "attempt": ctx.attempt,
        });
        let snapshot = self.checkpoints.create_checkpoint(snapshot)?;

        let result = bounded(&step.id, timeout, cancel, async {
            handler.invoke(&step.method, &step.params, ctx).await
        })
        .await;

        match result {
            Ok(mut output) => {
                if let Value::Object(map) = &mut output {
                    map.insert("sandbox_checkpoint".into(), json!(snapshot.id));
                }
                Ok(output)
            }
            Err(e) => {
                if let Some(command) = step.rollback.as_ref().filter(|_| step.reversible) {
                    info!(step_id = %step.id, error = %e, "sandboxed step failed, rolling back");
                    if let Err(rb) = self.rollback(&step.id, command, ctx, timeout).await {
                        warn!(step_id = %step.id, error = %rb, "sandbox rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    fn capability(&self, step: &ExecutionStep) -> aegis_core::Result<Arc<dyn SkillHandler>> {
        self.registry.handler(&step.target).ok_or_else(|| AegisError::Step {
            step_id: step.id.clone(),
            reason: format!("no handler registered for '{}'", step.target),
            recoverable: false,
        })
    }

    fn validate(&self, step: &ExecutionStep) -> aegis_core::Result<()> {
        let invalid = |reason: String| AegisError::Step {
            step_id: step.id.clone(),
            reason,
            recoverable: false,
        };
        let descriptor = self
            .registry
            .descriptor(&step.target)
            .ok_or_else(|| invalid(format!("unknown target '{}'", step.target)))?;
        if descriptor.method(&step.method).is_none() {
            return Err(invalid(format!(
                "'{}' has no method '{}'",
                step.target, step.method
            )));
        }
        if !matches!(step.params, Value::Object(_) | Value::Null) {
            return Err(invalid("params must be an object".into()));
        }
        Ok(())
    }
}

/// Race a handler call against its deadline and the cancellation token.
async fn bounded<F>(
    step_id: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> aegis_core::Result<Value>
where
    F: Future<Output = aegis_core::Result<Value>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(AegisError::Cancelled(format!("step '{step_id}' interrupted"))),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(AegisError::Timeout {
                step_id: step_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}
