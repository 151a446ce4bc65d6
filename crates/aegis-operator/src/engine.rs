use aegis_aurora::{Aurora, ControlSignal};
use aegis_config::{AegisConfig, EngineConfig};
use aegis_core::{
    ActionType, AegisError, Anomaly, AnomalyType, AuthorizationRequest, AuthorizationResponse,
    CircuitState, Decision, Event, EventBus, ExecutionCheckpoint, ExecutionFailure, ExecutionPlan,
    ExecutionResult, ExecutionStatus, ExecutionStep, InvocationContext, RecommendedAction,
    RiskLevel, RollbackReport, SandboxMode, Severity, StepId, StepResult, StepStatus, UserIntent,
};
use aegis_guard::{CheckpointManager, CircuitBreakerRegistry, ExecutionBudget, GuardrailValidator};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compiler::PlanCompiler;
use crate::registry::SkillRegistry;
use crate::sandbox::SandboxExecutor;

/// How often the scheduler re-checks control signals while steps run.
const SIGNAL_POLL: Duration = Duration::from_millis(25);

/// Event bus capacity when the operator builds its own bus.
const EVENT_CAPACITY: usize = 1024;

// ── Execution state ────────────────────────────────────────────

/// One plan's live state. Shared between the scheduling task and callers
/// asking for status, cancellation or resume.
struct Execution {
    plan: ExecutionPlan,
    state: Mutex<ExecutionState>,
    cancel: CancellationToken,
    resume: Notify,
}

struct ExecutionState {
    status: ExecutionStatus,
    results: HashMap<StepId, StepResult>,
    completion_order: Vec<StepId>,
    authorization: Option<AuthorizationResponse>,
    checkpoint_id: Option<Uuid>,
    error: Option<ExecutionFailure>,
    message: Option<String>,
    rollback: Option<RollbackReport>,
    can_resume: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    fn transition(&mut self, plan_id: Uuid, next: ExecutionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            warn!(plan_id = %plan_id, from = %self.status, to = %next, "illegal status transition ignored");
            return false;
        }
        debug!(plan_id = %plan_id, from = %self.status, to = %next, "status transition");
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    fn status_of(&self, id: &str) -> StepStatus {
        self.results
            .get(id)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    fn failure(&mut self, step_id: Option<StepId>, reason: impl Into<String>) {
        let reason = reason.into();
        self.message = Some(reason.clone());
        self.error = Some(ExecutionFailure { step_id, reason });
    }
}

impl Execution {
    fn new(plan: ExecutionPlan) -> Self {
        let results = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepResult::pending(&s.id)))
            .collect();
        Self {
            plan,
            state: Mutex::new(ExecutionState {
                status: ExecutionStatus::Queued,
                results,
                completion_order: Vec::new(),
                authorization: None,
                checkpoint_id: None,
                error: None,
                message: None,
                rollback: None,
                can_resume: false,
                started_at: Utc::now(),
                finished_at: None,
            }),
            cancel: CancellationToken::new(),
            resume: Notify::new(),
        }
    }

    /// Rebuild from a checkpoint: completed steps keep their outputs, skipped
    /// steps stay skipped, everything else runs again.
    fn restore(plan: ExecutionPlan, checkpoint: &ExecutionCheckpoint, status: ExecutionStatus) -> Self {
        let execution = Self::new(plan);
        {
            let mut guard = execution.state.lock();
            let state = &mut *guard;
            state.status = status;
            for id in &checkpoint.completed_steps {
                if let Some(result) = state.results.get_mut(id) {
                    result.status = StepStatus::Completed;
                    result.output = checkpoint
                        .partial_results
                        .get(id)
                        .cloned()
                        .unwrap_or(Value::Null);
                    state.completion_order.push(id.clone());
                }
            }
            for id in &checkpoint.skipped_steps {
                if state.results.contains_key(id) {
                    state.results.insert(
                        id.clone(),
                        StepResult::skipped(id.as_str(), "skipped before checkpoint"),
                    );
                }
            }
            state.authorization = checkpoint.authorization.clone();
            state.checkpoint_id = Some(checkpoint.id);
        }
        execution
    }

    fn status(&self) -> ExecutionStatus {
        self.state.lock().status
    }

    /// Completed steps whose effects a rollback would undo, newest first.
    fn undoable(&self, state: &ExecutionState, only: Option<&[StepId]>) -> (Vec<ExecutionStep>, Vec<StepId>) {
        let mut undo = Vec::new();
        let mut irreversible = Vec::new();
        for id in state.completion_order.iter().rev() {
            if state.status_of(id) != StepStatus::Completed {
                continue;
            }
            if only.is_some_and(|o| !o.contains(id)) {
                continue;
            }
            let Some(step) = self.plan.step(id) else { continue };
            if !step.action.dispatches() || !self.plan.mode.for_step(step.mode).has_side_effects() {
                continue;
            }
            if step.reversible && step.rollback.is_some() {
                undo.push(step.clone());
            } else {
                irreversible.push(step.id.clone());
            }
        }
        (undo, irreversible)
    }

    fn snapshot(&self) -> ExecutionResult {
        let state = self.state.lock();
        let mut result = ExecutionResult::new(self.plan.id, state.status);
        result.step_results = self
            .plan
            .steps
            .iter()
            .filter_map(|s| state.results.get(&s.id).cloned())
            .collect();

        let mut output = Map::new();
        for id in &state.completion_order {
            if let Some(r) = state.results.get(id).filter(|r| r.is_completed()) {
                output.insert(id.clone(), r.output.clone());
            }
        }
        if !output.is_empty() {
            result.final_output = Value::Object(output);
        }

        result.error = state.error.clone();
        result.authorization = state.authorization.clone();
        result.message = state.message.clone();
        result.checkpoint_id = state.checkpoint_id;
        result.can_resume = state.can_resume;
        result.can_rollback =
            state.status.is_terminal() && !self.undoable(&state, None).0.is_empty();
        result.rollback = state.rollback.clone();
        result.started_at = state.started_at;
        result.finished_at = state.finished_at;
        let end = state.finished_at.unwrap_or_else(Utc::now);
        result.duration_ms = (end - state.started_at).num_milliseconds().max(0) as u64;
        result
    }
}

enum Readiness {
    Waiting,
    Ready,
    Skip(String),
}

enum Outcome {
    Completed,
    Failed(ExecutionFailure),
    Cancelled,
    Cut(String),
}

enum PauseExit {
    Resumed,
    Cancelled,
    Cut(String),
}

// ── Operator ───────────────────────────────────────────────────

/// The execution engine.
///
/// Compiles intents, asks Aurora for authorization, runs the steps of each
/// plan in dependency order (independent steps concurrently, bounded by the
/// plan's limits), and answers to Aurora's pause and cut signals. Failed,
/// cancelled and cut executions are checkpointed so they can be resumed or
/// rolled back later.
pub struct Operator {
    config: EngineConfig,
    registry: Arc<SkillRegistry>,
    compiler: PlanCompiler,
    sandbox: Arc<SandboxExecutor>,
    aurora: Arc<Aurora>,
    guardrail: Arc<GuardrailValidator>,
    circuits: Arc<CircuitBreakerRegistry>,
    checkpoints: CheckpointManager,
    events: EventBus,
    executions: DashMap<Uuid, Arc<Execution>>,
    finished: Mutex<VecDeque<Uuid>>,
}

impl Operator {
    /// Build an operator with its own event bus, circuit registry, checkpoint
    /// store and Aurora instance.
    pub fn new(config: &AegisConfig, registry: SkillRegistry) -> aegis_core::Result<Self> {
        let events = EventBus::new(EVENT_CAPACITY);
        let circuits = CircuitBreakerRegistry::new(config.circuit_breaker.clone())
            .with_events(events.clone())
            .shared();
        let checkpoints = CheckpointManager::from_config(&config.checkpoint)?;
        let aurora = Aurora::new(config, circuits, events)
            .with_checkpoints(checkpoints.clone())
            .shared();
        let guardrail = Arc::new(GuardrailValidator::new(&config.guardrail));
        Ok(Self::with_parts(config, registry, aurora, guardrail, checkpoints))
    }

    /// Build around an existing Aurora; the event bus and circuit registry
    /// are Aurora's.
    pub fn with_parts(
        config: &AegisConfig,
        registry: SkillRegistry,
        aurora: Arc<Aurora>,
        guardrail: Arc<GuardrailValidator>,
        checkpoints: CheckpointManager,
    ) -> Self {
        let registry = Arc::new(registry);
        info!(capabilities = registry.len(), "operator initialized");
        Self {
            config: config.engine.clone(),
            compiler: PlanCompiler::new(Arc::clone(&registry), config),
            sandbox: Arc::new(SandboxExecutor::new(
                Arc::clone(&registry),
                checkpoints.clone(),
            )),
            circuits: Arc::clone(aurora.circuits()),
            events: aurora.events().clone(),
            registry,
            aurora,
            guardrail,
            checkpoints,
            executions: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn aurora(&self) -> &Arc<Aurora> {
        &self.aurora
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn guardrail(&self) -> &GuardrailValidator {
        &self.guardrail
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    // ── Intake ───

    /// Compile, authorize and run an intent.
    pub async fn process_intent(&self, intent: UserIntent) -> aegis_core::Result<ExecutionResult> {
        info!(
            intent_id = %intent.id,
            intent = %intent.intent_type,
            channel = %intent.channel,
            "intent received"
        );
        self.events.publish(Event::IntentReceived {
            intent_id: intent.id,
            intent_type: intent.intent_type.clone(),
            channel: intent.channel.clone(),
        });
        let plan = self.create_plan(&intent)?;
        self.execute_plan(plan).await
    }

    pub fn create_plan(&self, intent: &UserIntent) -> aegis_core::Result<ExecutionPlan> {
        let plan = self.compiler.compile(intent).map_err(|e| {
            warn!(intent = %intent.intent_type, error = %e, "intent could not be compiled");
            AegisError::Plan(e)
        })?;
        self.events.publish(Event::PlanCreated {
            plan_id: plan.id,
            steps: plan.steps.len(),
            risk_level: plan.risk_level,
        });
        Ok(plan)
    }

    /// Authorize and run a plan.
    ///
    /// Blocked plans come back with status `blocked` and a message. A plan
    /// needing confirmation either waits for it (`engine.await_confirmation`)
    /// or comes back `queued` with the prompt; answer it with
    /// [`confirm_and_execute`](Self::confirm_and_execute).
    pub async fn execute_plan(&self, plan: ExecutionPlan) -> aegis_core::Result<ExecutionResult> {
        plan.validate(self.compiler.destructive_verbs())?;
        if let Some(existing) = self.executions.get(&plan.id) {
            if existing.status().is_active() {
                return Err(AegisError::InvalidState(format!(
                    "plan {} is already {}",
                    plan.id,
                    existing.status()
                )));
            }
        }

        let execution = Arc::new(Execution::new(plan));
        let plan_id = execution.plan.id;
        self.executions.insert(plan_id, Arc::clone(&execution));
        self.aurora.stats().execution_queued();
        info!(
            plan_id = %plan_id,
            steps = execution.plan.steps.len(),
            risk = %execution.plan.risk_level,
            mode = %execution.plan.mode,
            "execution queued"
        );

        if !self.authorize(&execution).await? {
            return Ok(self.settle_unstarted(&execution));
        }
        Ok(self.run(execution).await)
    }

    /// Answer a pending confirmation and, when approved, run the plan.
    pub async fn confirm_and_execute(
        &self,
        plan_id: Uuid,
        approved: bool,
    ) -> aegis_core::Result<ExecutionResult> {
        let execution = self.execution(plan_id)?;
        let request_id = {
            let state = execution.state.lock();
            match &state.authorization {
                Some(auth)
                    if state.status == ExecutionStatus::Queued
                        && auth.decision == Decision::RequiresConfirmation =>
                {
                    auth.request_id
                }
                _ => {
                    return Err(AegisError::InvalidState(format!(
                        "plan {plan_id} is not awaiting confirmation"
                    )));
                }
            }
        };

        let response = match self.aurora.confirm_authorization(request_id, approved) {
            Ok(response) => response,
            // already expired by the gate's sweep
            Err(AegisError::AuthorizationNotPending(_)) => {
                if !self.expire_confirmation(&execution) {
                    return Err(AegisError::InvalidState(format!(
                        "plan {plan_id} is not awaiting confirmation"
                    )));
                }
                return Ok(self.settle_unstarted(&execution));
            }
            Err(e) => return Err(e),
        };
        self.publish_decision(&response);
        if !self.settle_authorization(&execution, response) {
            return Ok(self.settle_unstarted(&execution));
        }
        Ok(self.run(execution).await)
    }

    // ── Control ───

    /// Continue from a checkpoint. Completed steps are not run again; the
    /// stored authorization is reused while it is still valid.
    pub async fn resume_from_checkpoint(
        &self,
        checkpoint_id: Uuid,
    ) -> aegis_core::Result<ExecutionResult> {
        let checkpoint = self
            .checkpoints
            .get_checkpoint(checkpoint_id)?
            .ok_or(AegisError::CheckpointNotFound(checkpoint_id))?;
        let plan_id = checkpoint.plan_id;

        let known = self.executions.get(&plan_id).map(|e| Arc::clone(e.value()));
        if let Some(existing) = &known {
            let status = existing.status();
            if status.is_active() {
                return Err(AegisError::InvalidState(format!(
                    "plan {plan_id} is still {status}"
                )));
            }
        }
        let plan = checkpoint
            .plan
            .clone()
            .or_else(|| known.map(|e| e.plan.clone()))
            .ok_or_else(|| {
                AegisError::Checkpoint(format!("checkpoint {checkpoint_id} carries no plan"))
            })?;

        let execution = Arc::new(Execution::restore(plan, &checkpoint, ExecutionStatus::Queued));
        self.executions.insert(plan_id, Arc::clone(&execution));
        self.aurora.stats().execution_queued();
        info!(
            plan_id = %plan_id,
            checkpoint_id = %checkpoint_id,
            completed = checkpoint.completed_steps.len(),
            "resuming from checkpoint"
        );

        let reusable = checkpoint
            .authorization
            .clone()
            .filter(|a| a.permits_execution() && a.is_valid());
        let authorized = match reusable {
            Some(auth) => self.settle_authorization(&execution, auth),
            None => {
                info!(plan_id = %plan_id, "stored authorization lapsed, re-authorizing");
                self.authorize(&execution).await?
            }
        };
        if !authorized {
            return Ok(self.settle_unstarted(&execution));
        }
        Ok(self.run(execution).await)
    }

    /// Wake a paused execution before its cool-down runs out.
    pub fn resume_execution(&self, plan_id: Uuid) -> aegis_core::Result<()> {
        let execution = self.execution(plan_id)?;
        let status = execution.status();
        if status != ExecutionStatus::Paused {
            return Err(AegisError::InvalidState(format!(
                "plan {plan_id} is {status}, not paused"
            )));
        }
        execution.resume.notify_one();
        Ok(())
    }

    /// Stop scheduling new steps and interrupt in-flight ones. The execution
    /// settles as `cancelled` with a checkpoint.
    pub fn cancel_execution(&self, plan_id: Uuid) -> aegis_core::Result<()> {
        let execution = self.execution(plan_id)?;
        let status = execution.status();
        if !status.is_active() {
            return Err(AegisError::InvalidState(format!(
                "plan {plan_id} is already {status}"
            )));
        }
        info!(plan_id = %plan_id, status = %status, "cancellation requested");
        execution.cancel.cancel();

        // never started: nothing will observe the token
        if status == ExecutionStatus::Queued {
            {
                let mut state = execution.state.lock();
                state.transition(plan_id, ExecutionStatus::Cancelled);
                state.message = Some("cancelled before start".into());
            }
            self.events.publish(Event::ExecutionCancelled { plan_id });
            self.aurora.stats().execution_dequeued();
            self.retire(plan_id);
        }
        Ok(())
    }

    /// Undo the completed reversible steps of a finished execution, newest
    /// first. Falls back to the latest checkpoint when the execution is no
    /// longer in memory.
    pub async fn rollback_execution(&self, plan_id: Uuid) -> aegis_core::Result<RollbackReport> {
        let known = self.executions.get(&plan_id).map(|e| Arc::clone(e.value()));
        let execution = match known {
            Some(execution) => execution,
            None => {
                let checkpoint = self
                    .checkpoints
                    .latest_for_plan(plan_id)?
                    .ok_or(AegisError::ExecutionNotFound(plan_id))?;
                let plan = checkpoint.plan.clone().ok_or_else(|| {
                    AegisError::Checkpoint(format!("checkpoint {} carries no plan", checkpoint.id))
                })?;
                Arc::new(Execution::restore(plan, &checkpoint, ExecutionStatus::Failed))
            }
        };
        let status = execution.status();
        if status.is_active() {
            return Err(AegisError::InvalidState(format!(
                "plan {plan_id} is {status}; cancel it before rolling back"
            )));
        }

        let report = self.rollback_steps(&execution, None).await;
        let checkpoint_id = {
            let mut state = execution.state.lock();
            state.rollback = Some(report.clone());
            state.checkpoint_id
        };
        if let Some(id) = checkpoint_id {
            if let Err(e) = self.write_checkpoint(&execution, "after rollback", Some(id)) {
                warn!(plan_id = %plan_id, error = %e, "checkpoint refresh after rollback failed");
            }
        }
        Ok(report)
    }

    pub fn get_execution_status(&self, plan_id: Uuid) -> Option<ExecutionResult> {
        self.expire_confirmations();
        self.executions.get(&plan_id).map(|e| e.snapshot())
    }

    pub fn list_active_executions(&self) -> Vec<ExecutionResult> {
        self.expire_confirmations();
        let mut active: Vec<ExecutionResult> = self
            .executions
            .iter()
            .filter(|e| e.status().is_active())
            .map(|e| e.snapshot())
            .collect();
        active.sort_by_key(|r| r.started_at);
        active
    }

    // ── Authorization ───

    /// Ask Aurora; returns whether the plan may start. A pending confirmation
    /// that is not awaited leaves the execution `queued`.
    async fn authorize(&self, execution: &Arc<Execution>) -> aegis_core::Result<bool> {
        let plan_id = execution.plan.id;
        let request = AuthorizationRequest::for_plan(&execution.plan);
        self.events.publish(Event::AuthorizationRequested {
            request_id: request.id,
            plan_id,
        });
        let mut response = self.aurora.authorize(&request);
        self.publish_decision(&response);

        if response.decision == Decision::RequiresConfirmation {
            let prompt = response
                .confirmation_prompt
                .clone()
                .unwrap_or_else(|| "confirmation required".into());
            self.events.publish(Event::ConfirmationRequired {
                request_id: request.id,
                plan_id,
                prompt,
            });
            if !self.config.await_confirmation {
                let mut state = execution.state.lock();
                state.message = response.message.clone();
                state.authorization = Some(response);
                if state.status != ExecutionStatus::Queued {
                    // a lapsed authorization cannot go back to queued
                    state.transition(plan_id, ExecutionStatus::Blocked);
                    state.failure(None, "authorization lapsed and needs confirmation again");
                }
                return Ok(false);
            }
            info!(plan_id = %plan_id, request_id = %request.id, "awaiting confirmation");
            response = tokio::select! {
                answer = self.aurora.await_confirmation(request.id) => answer?,
                _ = execution.cancel.cancelled() => return Ok(false),
            };
            self.publish_decision(&response);
        }

        if response.rules.iter().any(|r| r.starts_with("blocked_target:")) {
            let anomaly = Anomaly::new(
                AnomalyType::UnauthorizedAccess,
                Severity::High,
                "blocked_target",
                response.risk_score as f64,
                80.0,
                RecommendedAction::Alert,
                format!("plan {plan_id} targets a blocked capability"),
            )
            .for_plan(plan_id);
            self.aurora.report_anomaly(anomaly).await;
        }
        Ok(self.settle_authorization(execution, response))
    }

    /// Block queued executions whose confirmation went unanswered past its
    /// TTL, or was already expired by the gate. Returns how many.
    pub fn expire_confirmations(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<Arc<Execution>> = self
            .executions
            .iter()
            .filter(|e| {
                let state = e.state.lock();
                state.status == ExecutionStatus::Queued
                    && state.authorization.as_ref().is_some_and(|auth| {
                        auth.decision == Decision::RequiresConfirmation
                            && (!auth.is_valid_at(now)
                                || !self.aurora.gate().is_pending(auth.request_id))
                    })
            })
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut expired = 0;
        for execution in stale {
            if self.expire_confirmation(&execution) {
                self.settle_unstarted(&execution);
                expired += 1;
            }
        }
        expired
    }

    /// Move a queued execution to `blocked` because its confirmation
    /// expired. False when it is no longer queued.
    fn expire_confirmation(&self, execution: &Execution) -> bool {
        let plan_id = execution.plan.id;
        let response = {
            let mut state = execution.state.lock();
            if state.status != ExecutionStatus::Queued {
                return false;
            }
            let message = "No answer before the confirmation expired".to_string();
            state.transition(plan_id, ExecutionStatus::Blocked);
            state.failure(None, "confirmation expired");
            state.message = Some(message.clone());
            state.authorization.as_mut().map(|auth| {
                auth.decision = Decision::Blocked;
                auth.rules.push("confirmation_expired".into());
                auth.reason = Some("confirmation expired".into());
                auth.message = Some(message);
                auth.confirmation_prompt = None;
                auth.clone()
            })
        };
        warn!(plan_id = %plan_id, "confirmation expired, execution blocked");
        if let Some(response) = response {
            self.publish_decision(&response);
        }
        true
    }

    fn publish_decision(&self, response: &AuthorizationResponse) {
        self.events.publish(Event::AuthorizationDecided {
            request_id: response.request_id,
            plan_id: response.plan_id,
            decision: response.decision,
            risk_score: response.risk_score,
            level: response.level,
        });
    }

    fn settle_authorization(&self, execution: &Execution, response: AuthorizationResponse) -> bool {
        let plan_id = execution.plan.id;
        let permitted = response.permits_execution();
        let mut state = execution.state.lock();
        if permitted {
            state.transition(plan_id, ExecutionStatus::Authorized);
            state.message = response.message.clone();
        } else {
            info!(plan_id = %plan_id, decision = ?response.decision, score = response.risk_score, "execution blocked");
            state.transition(plan_id, ExecutionStatus::Blocked);
            let reason = response
                .reason
                .clone()
                .unwrap_or_else(|| "authorization denied".into());
            state.failure(None, reason);
            if response.message.is_some() {
                state.message = response.message.clone();
            }
        }
        state.authorization = Some(response);
        permitted
    }

    /// Result for an execution that did not start.
    fn settle_unstarted(&self, execution: &Execution) -> ExecutionResult {
        let status = execution.status();
        if status.is_terminal() {
            self.aurora.stats().execution_dequeued();
            self.retire(execution.plan.id);
        }
        execution.snapshot()
    }

    // ── Running ───

    async fn run(&self, execution: Arc<Execution>) -> ExecutionResult {
        let plan_id = execution.plan.id;

        let fresh = execution
            .state
            .lock()
            .authorization
            .as_ref()
            .is_some_and(|a| a.permits_execution() && a.is_valid());
        if !fresh {
            info!(plan_id = %plan_id, "authorization expired before start, re-authorizing");
            match self.authorize(&execution).await {
                Ok(true) => {}
                Ok(false) => return self.settle_unstarted(&execution),
                Err(e) => {
                    {
                        let mut state = execution.state.lock();
                        state.transition(plan_id, ExecutionStatus::Blocked);
                        state.failure(None, e.to_string());
                    }
                    return self.settle_unstarted(&execution);
                }
            }
        }

        let limits = {
            let mut state = execution.state.lock();
            state.transition(plan_id, ExecutionStatus::Running);
            state.started_at = Utc::now();
            match &state.authorization {
                Some(auth) => execution.plan.limits.min(&auth.limits),
                None => execution.plan.limits.clone(),
            }
        };
        self.aurora.track_execution(plan_id, &execution.plan.description);
        self.aurora.stats().execution_started();
        self.events.publish(Event::ExecutionStarted {
            plan_id,
            mode: execution.plan.mode,
        });
        info!(plan_id = %plan_id, mode = %execution.plan.mode, "execution started");

        let outcome = self.drive(&execution, &limits).await;
        let result = self.finish(&execution, outcome).await;

        self.aurora.untrack_execution(plan_id);
        self.aurora.stats().execution_finished();
        self.retire(plan_id);
        result
    }

    /// The scheduling loop. Returns once every step is terminal or the
    /// execution has to stop.
    async fn drive(&self, execution: &Arc<Execution>, limits: &aegis_core::ExecutionLimits) -> Outcome {
        let plan = &execution.plan;
        let order = match plan.topological_order() {
            Ok(order) => order,
            Err(e) => {
                return Outcome::Failed(ExecutionFailure {
                    step_id: None,
                    reason: e.to_string(),
                });
            }
        };

        let stop = execution.cancel.child_token();
        let runner = self.step_runner(plan, limits);
        let permits = Arc::new(Semaphore::new(limits.max_processes.max(1) as usize));
        let interval = if limits.actions_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / limits.actions_per_second)
        } else {
            Duration::ZERO
        };
        let max_duration = Duration::from_millis(limits.max_duration_ms);
        let started = Instant::now();
        let mut next_slot = tokio::time::Instant::now();
        let mut tasks: JoinSet<StepResult> = JoinSet::new();

        loop {
            if execution.cancel.is_cancelled() {
                self.drain(execution, &mut tasks).await;
                return Outcome::Cancelled;
            }

            match self.aurora.take_signal(plan.id) {
                Some(ControlSignal::Cut { reason }) => {
                    stop.cancel();
                    self.drain(execution, &mut tasks).await;
                    return Outcome::Cut(reason);
                }
                Some(ControlSignal::Pause { reason }) => {
                    if let Some(failure) = self.drain(execution, &mut tasks).await {
                        return Outcome::Failed(failure);
                    }
                    match self.pause(execution, &reason).await {
                        PauseExit::Resumed => continue,
                        PauseExit::Cancelled => return Outcome::Cancelled,
                        PauseExit::Cut(reason) => return Outcome::Cut(reason),
                    }
                }
                None => {}
            }

            let elapsed = started.elapsed();
            let overrun = if elapsed > max_duration {
                Some(AegisError::LimitExceeded {
                    resource: "duration_ms".into(),
                    used: elapsed.as_millis() as f64,
                    limit: limits.max_duration_ms as f64,
                })
            } else {
                self.guardrail.check_resource_limits(Some(elapsed)).err()
            };
            if let Some(e) = overrun {
                self.aurora.report_limit(Some(plan.id), &e);
                stop.cancel();
                self.drain(execution, &mut tasks).await;
                return Outcome::Failed(ExecutionFailure {
                    step_id: None,
                    reason: e.to_string(),
                });
            }

            // ── schedule everything that is ready ───
            let mut pace_until = None;
            let mut failure = None;
            'scan: loop {
                let mut progressed = false;
                for id in &order {
                    let Some(step) = plan.step(id) else { continue };
                    match self.readiness(execution, step) {
                        Readiness::Waiting => {}
                        Readiness::Skip(reason) => {
                            self.skip(execution, step, reason);
                            progressed = true;
                        }
                        Readiness::Ready if is_control(step) => {
                            let result = self.run_control_step(execution, step).await;
                            failure = self.record_step(execution, result);
                            progressed = true;
                            if failure.is_some() {
                                break 'scan;
                            }
                        }
                        Readiness::Ready => {
                            let now = tokio::time::Instant::now();
                            if now < next_slot {
                                pace_until = Some(next_slot);
                                break 'scan;
                            }
                            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                                break 'scan;
                            };
                            next_slot = now.max(next_slot) + interval;
                            self.mark_running(execution, step);

                            let runner = runner.clone();
                            let step = step.clone();
                            let stop = stop.clone();
                            tasks.spawn(async move {
                                let _permit = permit;
                                let step_id = step.id.clone();
                                // inner task so a panicking handler still yields a result
                                match tokio::spawn(runner.run(step, stop)).await {
                                    Ok(result) => result,
                                    Err(e) => panicked(step_id, e.to_string()),
                                }
                            });
                            progressed = true;
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }

            if let Some(failure) = failure {
                stop.cancel();
                self.drain(execution, &mut tasks).await;
                return Outcome::Failed(failure);
            }
            if tasks.is_empty() && pace_until.is_none() {
                if self.all_terminal(execution) {
                    return Outcome::Completed;
                }
                error!(plan_id = %plan.id, "no step can be scheduled");
                return Outcome::Failed(ExecutionFailure {
                    step_id: None,
                    reason: "no schedulable steps remain".into(),
                });
            }

            let pace = pace_until.unwrap_or_else(tokio::time::Instant::now);
            tokio::select! {
                _ = execution.cancel.cancelled() => {}
                Some(joined) = tasks.join_next() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            error!(plan_id = %plan.id, error = %e, "step task failed to join");
                            stop.cancel();
                            self.drain(execution, &mut tasks).await;
                            return Outcome::Failed(ExecutionFailure {
                                step_id: None,
                                reason: format!("step task failed: {e}"),
                            });
                        }
                    };
                    if let Some(failure) = self.record_step(execution, result) {
                        stop.cancel();
                        self.drain(execution, &mut tasks).await;
                        return Outcome::Failed(failure);
                    }
                }
                _ = tokio::time::sleep_until(pace), if pace_until.is_some() => {}
                _ = tokio::time::sleep(SIGNAL_POLL) => {}
            }
        }
    }

    fn step_runner(&self, plan: &ExecutionPlan, limits: &aegis_core::ExecutionLimits) -> StepRunner {
        StepRunner {
            plan_id: plan.id,
            plan_mode: plan.mode,
            origin: plan.origin.clone(),
            risk: plan.risk_level,
            max_retries: limits.max_retries_per_step,
            default_timeout_ms: self.config.default_step_timeout_ms,
            retry_base_ms: self.config.retry_base_delay_ms,
            retry_max_ms: self.config.retry_max_delay_ms,
            registry: Arc::clone(&self.registry),
            sandbox: Arc::clone(&self.sandbox),
            aurora: Arc::clone(&self.aurora),
            guardrail: Arc::clone(&self.guardrail),
            circuits: Arc::clone(&self.circuits),
            events: self.events.clone(),
            budget: ExecutionBudget::new(plan.id, limits.clone()),
        }
    }

    /// Wait for in-flight steps and record what they return. Returns the
    /// first failure among them.
    async fn drain(
        &self,
        execution: &Execution,
        tasks: &mut JoinSet<StepResult>,
    ) -> Option<ExecutionFailure> {
        let mut first = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    let failure = self.record_step(execution, result);
                    if first.is_none() {
                        first = failure;
                    }
                }
                Err(e) => error!(plan_id = %execution.plan.id, error = %e, "step task failed to join"),
            }
        }
        first
    }

    fn readiness(&self, execution: &Execution, step: &ExecutionStep) -> Readiness {
        let state = execution.state.lock();
        if state.status_of(&step.id) != StepStatus::Pending {
            return Readiness::Waiting;
        }
        if step
            .all_dependencies()
            .any(|d| !state.status_of(d).is_terminal())
        {
            return Readiness::Waiting;
        }

        let primaries_done = step
            .depends_on
            .iter()
            .all(|d| state.status_of(d) == StepStatus::Completed);
        let alternates_done = !step.alternate_depends_on.is_empty()
            && step
                .depends_on
                .iter()
                .any(|d| state.status_of(d) == StepStatus::Skipped)
            && step
                .alternate_depends_on
                .iter()
                .all(|d| state.status_of(d) == StepStatus::Completed);
        if !primaries_done && !alternates_done {
            let blocker = step
                .depends_on
                .iter()
                .chain(step.alternate_depends_on.iter())
                .find(|d| state.status_of(d) != StepStatus::Completed)
                .map(|d| format!("dependency '{d}' {}", state.status_of(d)))
                .unwrap_or_else(|| "dependencies not met".into());
            return Readiness::Skip(blocker);
        }

        if let Some(condition) = &step.condition {
            let output = state
                .results
                .get(&condition.step_id)
                .map(|r| &r.output)
                .unwrap_or(&Value::Null);
            if !condition.evaluate(output) {
                return Readiness::Skip(format!(
                    "condition on '{}.{}' not met",
                    condition.step_id, condition.field
                ));
            }
        }
        Readiness::Ready
    }

    fn skip(&self, execution: &Execution, step: &ExecutionStep, reason: String) {
        debug!(plan_id = %execution.plan.id, step_id = %step.id, reason = %reason, "step skipped");
        execution
            .state
            .lock()
            .results
            .insert(step.id.clone(), StepResult::skipped(step.id.as_str(), reason.clone()));
        self.events.publish(Event::StepSkipped {
            plan_id: execution.plan.id,
            step_id: step.id.clone(),
            reason,
            circuit_open: false,
        });
    }

    fn mark_running(&self, execution: &Execution, step: &ExecutionStep) {
        let mut state = execution.state.lock();
        if let Some(result) = state.results.get_mut(&step.id) {
            result.status = StepStatus::Running;
            result.started_at = Some(Utc::now());
        }
    }

    /// Store a finished step; returns the plan failure it causes, if any.
    fn record_step(&self, execution: &Execution, result: StepResult) -> Option<ExecutionFailure> {
        let mut state = execution.state.lock();
        let failure = (result.status == StepStatus::Failed).then(|| ExecutionFailure {
            step_id: Some(result.step_id.clone()),
            reason: result
                .error
                .clone()
                .unwrap_or_else(|| "step failed".into()),
        });
        if result.status == StepStatus::Completed {
            state.completion_order.push(result.step_id.clone());
        }
        state.results.insert(result.step_id.clone(), result);
        failure
    }

    fn all_terminal(&self, execution: &Execution) -> bool {
        let state = execution.state.lock();
        execution
            .plan
            .steps
            .iter()
            .all(|s| state.status_of(&s.id).is_terminal())
    }

    /// Checkpoint, conditional, parallel and rollback steps run inline on the
    /// scheduler.
    async fn run_control_step(&self, execution: &Arc<Execution>, step: &ExecutionStep) -> StepResult {
        let plan_id = execution.plan.id;
        let mut result = StepResult::pending(step.id.as_str());
        result.started_at = Some(Utc::now());
        result.attempts = 1;
        self.events.publish(Event::StepStarted {
            plan_id,
            step_id: step.id.clone(),
            attempt: 1,
        });
        let clock = Instant::now();

        let outcome: aegis_core::Result<Value> = match step.action {
            ActionType::Conditional => Ok(json!({ "condition": true })),
            ActionType::Parallel => Ok(Value::Null),
            ActionType::Checkpoint => self
                .write_checkpoint(execution, &format!("checkpoint step '{}'", step.id), None)
                .map(|id| json!({ "checkpoint_id": id })),
            ActionType::Rollback => {
                let only: Option<Vec<StepId>> = step.params.get("steps").and_then(|v| {
                    v.as_array().map(|ids| {
                        ids.iter()
                            .filter_map(|id| id.as_str().map(str::to_string))
                            .collect()
                    })
                });
                let report = self.rollback_steps(execution, only.as_deref()).await;
                if report.failed.is_empty() {
                    serde_json::to_value(&report).map_err(AegisError::from)
                } else {
                    Err(AegisError::Step {
                        step_id: step.id.clone(),
                        reason: format!("{} rollback command(s) failed", report.failed.len()),
                        recoverable: false,
                    })
                }
            }
            ActionType::Skill | ActionType::Hub | ActionType::Wait => {
                Err(AegisError::InvalidState(format!(
                    "'{}' is not a control step",
                    step.id
                )))
            }
        };

        result.finished_at = Some(Utc::now());
        result.duration_ms = clock.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                result.status = StepStatus::Completed;
                result.output = output;
                self.events.publish(Event::StepCompleted {
                    plan_id,
                    step_id: step.id.clone(),
                    duration_ms: result.duration_ms,
                });
            }
            Err(e) => {
                result.status = StepStatus::Failed;
                result.error = Some(e.to_string());
                self.events.publish(Event::StepFailed {
                    plan_id,
                    step_id: step.id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn pause(&self, execution: &Arc<Execution>, reason: &str) -> PauseExit {
        let plan_id = execution.plan.id;
        execution
            .state
            .lock()
            .transition(plan_id, ExecutionStatus::Paused);
        let checkpoint_id = self
            .write_checkpoint(execution, &format!("paused: {reason}"), None)
            .map_err(|e| warn!(plan_id = %plan_id, error = %e, "pause checkpoint failed"))
            .ok();
        self.events.publish(Event::ExecutionPaused {
            plan_id,
            checkpoint_id,
        });
        info!(
            plan_id = %plan_id,
            reason,
            cooldown_secs = self.config.pause_cooldown_secs,
            "execution paused"
        );

        let cooldown = tokio::time::sleep(Duration::from_secs(self.config.pause_cooldown_secs));
        tokio::pin!(cooldown);
        let why = loop {
            tokio::select! {
                _ = execution.resume.notified() => break "resumed by operator",
                _ = &mut cooldown => break "pause cool-down elapsed",
                _ = execution.cancel.cancelled() => return PauseExit::Cancelled,
                _ = tokio::time::sleep(SIGNAL_POLL) => {
                    if let Some(ControlSignal::Cut { .. }) = self.aurora.peek_signal(plan_id) {
                        if let Some(ControlSignal::Cut { reason }) = self.aurora.take_signal(plan_id) {
                            return PauseExit::Cut(reason);
                        }
                    }
                }
            }
        };
        // a cut raised while paused wins over the resume
        if let Some(ControlSignal::Cut { reason }) = self.aurora.peek_signal(plan_id) {
            self.aurora.take_signal(plan_id);
            return PauseExit::Cut(reason);
        }

        self.aurora.resume(plan_id, why);
        execution
            .state
            .lock()
            .transition(plan_id, ExecutionStatus::Running);
        self.events.publish(Event::ExecutionResumed { plan_id });
        info!(plan_id = %plan_id, why, "execution resumed");
        PauseExit::Resumed
    }

    async fn finish(&self, execution: &Arc<Execution>, outcome: Outcome) -> ExecutionResult {
        let plan_id = execution.plan.id;
        match outcome {
            Outcome::Completed => {
                let duration_ms = {
                    let mut state = execution.state.lock();
                    state.transition(plan_id, ExecutionStatus::Completed);
                    let behind_open_circuit: Vec<&str> = execution
                        .plan
                        .steps
                        .iter()
                        .filter(|s| state.results.get(&s.id).is_some_and(|r| r.circuit_open))
                        .map(|s| s.id.as_str())
                        .collect();
                    if !behind_open_circuit.is_empty() {
                        let message = format!(
                            "completed without {} (circuit open)",
                            behind_open_circuit.join(", ")
                        );
                        state.message = Some(message);
                    }
                    (Utc::now() - state.started_at).num_milliseconds().max(0) as u64
                };
                self.events.publish(Event::ExecutionCompleted {
                    plan_id,
                    duration_ms,
                });
                info!(plan_id = %plan_id, duration_ms, "execution completed");
            }
            Outcome::Failed(failure) => {
                warn!(
                    plan_id = %plan_id,
                    step_id = ?failure.step_id,
                    reason = %failure.reason,
                    "execution failed"
                );
                let checkpoint = self
                    .write_checkpoint(execution, &format!("failed: {}", failure.reason), None)
                    .map_err(|e| error!(plan_id = %plan_id, error = %e, "failure checkpoint not written"))
                    .ok();
                let report = self.rollback_steps(execution, None).await;
                if let Some(id) = checkpoint.filter(|_| !report.rolled_back.is_empty()) {
                    // rolled-back steps must run again on resume
                    if let Err(e) = self.write_checkpoint(execution, "rolled back after failure", Some(id)) {
                        warn!(plan_id = %plan_id, error = %e, "checkpoint refresh failed");
                    }
                }
                {
                    let mut state = execution.state.lock();
                    state.transition(plan_id, ExecutionStatus::Failed);
                    state.failure(failure.step_id.clone(), failure.reason.clone());
                    state.rollback = Some(report);
                    state.can_resume = checkpoint.is_some();
                }
                self.events.publish(Event::ExecutionFailed {
                    plan_id,
                    step_id: failure.step_id,
                    error: failure.reason,
                });
            }
            Outcome::Cancelled => {
                let checkpoint = self
                    .write_checkpoint(execution, "cancelled", None)
                    .map_err(|e| error!(plan_id = %plan_id, error = %e, "cancel checkpoint not written"))
                    .ok();
                {
                    let mut state = execution.state.lock();
                    state.transition(plan_id, ExecutionStatus::Cancelled);
                    state.message = Some("execution cancelled".into());
                    state.can_resume = checkpoint.is_some();
                }
                self.events.publish(Event::ExecutionCancelled { plan_id });
                info!(plan_id = %plan_id, "execution cancelled");
            }
            Outcome::Cut(reason) => {
                let checkpoint = self
                    .write_checkpoint(execution, &format!("cut: {reason}"), None)
                    .map_err(|e| error!(plan_id = %plan_id, error = %e, "cut checkpoint not written"))
                    .ok();
                let can_rollback = {
                    let mut state = execution.state.lock();
                    state.transition(plan_id, ExecutionStatus::Cut);
                    state.message = Some(format!("execution cut: {reason}"));
                    state.can_resume = checkpoint.is_some();
                    !execution.undoable(&state, None).0.is_empty()
                };
                self.events.publish(Event::Cut {
                    plan_id,
                    reason: reason.clone(),
                    checkpoint_id: checkpoint.unwrap_or_else(Uuid::nil),
                    can_resume: checkpoint.is_some(),
                    can_rollback,
                });
                warn!(plan_id = %plan_id, reason = %reason, "execution cut");
            }
        }
        execution.snapshot()
    }

    // ── Checkpoints & rollback ───

    /// Persist the execution's progress. `reuse` overwrites an earlier
    /// checkpoint instead of creating a new one.
    fn write_checkpoint(
        &self,
        execution: &Execution,
        reason: &str,
        reuse: Option<Uuid>,
    ) -> aegis_core::Result<Uuid> {
        let plan = &execution.plan;
        let (ordered, authorization, current, status) = {
            let state = execution.state.lock();
            let mut ordered: Vec<StepResult> = state
                .completion_order
                .iter()
                .filter_map(|id| state.results.get(id).cloned())
                .collect();
            ordered.extend(
                plan.steps
                    .iter()
                    .filter_map(|s| state.results.get(&s.id))
                    .filter(|r| r.status == StepStatus::Skipped)
                    .cloned(),
            );
            // first step a resume would run
            let current = plan
                .steps
                .iter()
                .find(|s| {
                    !matches!(
                        state.status_of(&s.id),
                        StepStatus::Completed | StepStatus::Skipped
                    )
                })
                .map(|s| s.id.clone());
            (ordered, state.authorization.clone(), current, state.status)
        };

        let mut checkpoint = self
            .checkpoints
            .draft(plan.id, reason)
            .with_results(&ordered)
            .with_plan(plan.clone())
            .with_authorization(authorization);
        if let Some(id) = reuse {
            checkpoint.id = id;
        }
        checkpoint.current_step = current;
        checkpoint.context.insert("origin".into(), json!(plan.origin));
        checkpoint.context.insert("mode".into(), json!(plan.mode));
        checkpoint.context.insert("status".into(), json!(status));
        let hub_state: Map<String, Value> = ordered
            .iter()
            .filter(|r| r.is_completed())
            .filter(|r| plan.step(&r.step_id).is_some_and(|s| s.action == ActionType::Hub))
            .map(|r| (r.step_id.clone(), r.output.clone()))
            .collect();
        checkpoint.hub_state = Value::Object(hub_state);

        let checkpoint = self.checkpoints.create_checkpoint(checkpoint)?;
        execution.state.lock().checkpoint_id = Some(checkpoint.id);
        self.events.publish(Event::CheckpointCreated {
            plan_id: plan.id,
            checkpoint_id: checkpoint.id,
            reason: reason.to_string(),
        });
        Ok(checkpoint.id)
    }

    /// Run rollback commands for completed reversible steps, newest first.
    /// Irreversible steps are listed, never touched.
    async fn rollback_steps(&self, execution: &Execution, only: Option<&[StepId]>) -> RollbackReport {
        let plan_id = execution.plan.id;
        let (undo, irreversible) = {
            let state = execution.state.lock();
            execution.undoable(&state, only)
        };
        let mut report = RollbackReport::new(plan_id);
        report.skipped_irreversible = irreversible;
        if undo.is_empty() {
            debug!(plan_id = %plan_id, "nothing to roll back");
            return report;
        }

        info!(plan_id = %plan_id, steps = undo.len(), "rollback started");
        self.events.publish(Event::RollbackStarted {
            plan_id,
            steps: undo.len(),
        });
        for step in &undo {
            let Some(command) = &step.rollback else { continue };
            let ctx = InvocationContext {
                plan_id,
                step_id: step.id.clone(),
                mode: execution.plan.mode.for_step(step.mode),
                attempt: 1,
            };
            let timeout =
                Duration::from_millis(step.timeout_ms.unwrap_or(self.config.default_step_timeout_ms));
            match self.sandbox.rollback(&step.id, command, &ctx, timeout).await {
                Ok(_) => {
                    if let Some(result) = execution.state.lock().results.get_mut(&step.id) {
                        result.status = StepStatus::RolledBack;
                    }
                    report.rolled_back.push(step.id.clone());
                }
                Err(e) => {
                    warn!(plan_id = %plan_id, step_id = %step.id, error = %e, "rollback command failed");
                    report.failed.push((step.id.clone(), e.to_string()));
                }
            }
        }
        self.events.publish(Event::RollbackCompleted {
            plan_id,
            rolled_back: report.rolled_back.len(),
            failed: report.failed.len(),
        });
        info!(
            plan_id = %plan_id,
            rolled_back = report.rolled_back.len(),
            failed = report.failed.len(),
            "rollback completed"
        );
        report
    }

    // ── Bookkeeping ───

    fn execution(&self, plan_id: Uuid) -> aegis_core::Result<Arc<Execution>> {
        self.executions
            .get(&plan_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(AegisError::ExecutionNotFound(plan_id))
    }

    /// Keep at most `retain_finished` finished executions in memory.
    fn retire(&self, plan_id: Uuid) {
        let mut finished = self.finished.lock();
        if !finished.contains(&plan_id) {
            finished.push_back(plan_id);
        }
        while finished.len() > self.config.retain_finished {
            if let Some(old) = finished.pop_front() {
                self.executions.remove_if(&old, |_, e| !e.status().is_active());
            }
        }
    }
}

fn is_control(step: &ExecutionStep) -> bool {
    matches!(
        step.action,
        ActionType::Conditional | ActionType::Parallel | ActionType::Checkpoint | ActionType::Rollback
    )
}

fn panicked(step_id: StepId, error: String) -> StepResult {
    let mut result = StepResult::pending(step_id);
    result.status = StepStatus::Failed;
    result.error = Some(format!("step handler panicked: {error}"));
    result.finished_at = Some(Utc::now());
    result
}

// ── Step runner ────────────────────────────────────────────────

/// A dispatch admitted through a half-open circuit. Dropped before an
/// outcome is recorded, it hands the admission back to the breaker.
struct Admission<'a> {
    circuits: &'a CircuitBreakerRegistry,
    target: &'a str,
    pending: bool,
}

impl<'a> Admission<'a> {
    fn new(circuits: &'a CircuitBreakerRegistry, target: &'a str) -> Self {
        let pending = circuits.state(target) == CircuitState::HalfOpen;
        Self {
            circuits,
            target,
            pending,
        }
    }

    fn recorded(&mut self) {
        self.pending = false;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.pending {
            self.circuits.release_admission(self.target);
        }
    }
}

/// Everything a spawned step needs, cloned per dispatch.
#[derive(Clone)]
struct StepRunner {
    plan_id: Uuid,
    plan_mode: SandboxMode,
    origin: String,
    risk: RiskLevel,
    max_retries: u32,
    default_timeout_ms: u64,
    retry_base_ms: u64,
    retry_max_ms: u64,
    registry: Arc<SkillRegistry>,
    sandbox: Arc<SandboxExecutor>,
    aurora: Arc<Aurora>,
    guardrail: Arc<GuardrailValidator>,
    circuits: Arc<CircuitBreakerRegistry>,
    events: EventBus,
    budget: ExecutionBudget,
}

impl StepRunner {
    async fn run(self, step: ExecutionStep, stop: CancellationToken) -> StepResult {
        let mut result = StepResult::pending(step.id.as_str());
        result.status = StepStatus::Running;
        result.started_at = Some(Utc::now());
        let clock = Instant::now();

        let outcome = match step.action {
            ActionType::Wait => self.wait(&step, &stop, &mut result).await,
            _ => self.dispatch(&step, &stop, &mut result).await,
        };

        result.finished_at = Some(Utc::now());
        result.duration_ms = clock.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                result.status = StepStatus::Completed;
                result.output = output;
                debug!(
                    plan_id = %self.plan_id,
                    step_id = %step.id,
                    attempts = result.attempts,
                    duration_ms = result.duration_ms,
                    "step completed"
                );
                self.events.publish(Event::StepCompleted {
                    plan_id: self.plan_id,
                    step_id: step.id.clone(),
                    duration_ms: result.duration_ms,
                });
            }
            Err(AegisError::Cancelled(reason)) => {
                debug!(plan_id = %self.plan_id, step_id = %step.id, reason = %reason, "step cancelled");
                result.status = StepStatus::Cancelled;
                result.error = Some(reason);
            }
            // skip and report; dependents skip with it
            Err(e) if e.is_circuit_open() => {
                warn!(
                    plan_id = %self.plan_id,
                    step_id = %step.id,
                    target = %step.target,
                    "circuit open, step skipped"
                );
                result.status = StepStatus::Skipped;
                result.circuit_open = true;
                result.error = Some(e.to_string());
                self.events.publish(Event::StepSkipped {
                    plan_id: self.plan_id,
                    step_id: step.id.clone(),
                    reason: e.to_string(),
                    circuit_open: true,
                });
            }
            Err(e) => {
                warn!(
                    plan_id = %self.plan_id,
                    step_id = %step.id,
                    attempts = result.attempts,
                    error = %e,
                    "step failed"
                );
                result.status = StepStatus::Failed;
                result.error = Some(e.to_string());
                self.events.publish(Event::StepFailed {
                    plan_id: self.plan_id,
                    step_id: step.id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn wait(
        &self,
        step: &ExecutionStep,
        stop: &CancellationToken,
        result: &mut StepResult,
    ) -> aegis_core::Result<Value> {
        result.attempts = 1;
        self.events.publish(Event::StepStarted {
            plan_id: self.plan_id,
            step_id: step.id.clone(),
            attempt: 1,
        });
        let ms = ["ms", "duration_ms"]
            .iter()
            .find_map(|k| step.params.get(*k).and_then(Value::as_u64))
            .or_else(|| step.params.get("secs").and_then(Value::as_u64).map(|s| s * 1000))
            .unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "waited_ms": ms })),
            _ = stop.cancelled() => Err(AegisError::Cancelled(format!("wait step '{}' interrupted", step.id))),
        }
    }

    /// Dispatch with retries. Only recoverable errors are retried; an open
    /// circuit fails the step at once.
    async fn dispatch(
        &self,
        step: &ExecutionStep,
        stop: &CancellationToken,
        result: &mut StepResult,
    ) -> aegis_core::Result<Value> {
        let mode = self.plan_mode.for_step(step.mode);
        let (category, external) = self
            .registry
            .descriptor(&step.target)
            .map(|d| (d.category, d.external))
            .ok_or_else(|| AegisError::Step {
                step_id: step.id.clone(),
                reason: format!("no handler registered for '{}'", step.target),
                recoverable: false,
            })?;

        if category.requires_input_scan() {
            self.scan(step).await?;
        }

        let max_attempts = step.max_retries.unwrap_or(self.max_retries) + 1;
        let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(self.default_timeout_ms));
        let mut attempt = 0;
        loop {
            attempt += 1;
            result.attempts = attempt;
            result.retries = attempt - 1;
            if stop.is_cancelled() {
                return Err(AegisError::Cancelled(format!("step '{}' not started", step.id)));
            }
            self.events.publish(Event::StepStarted {
                plan_id: self.plan_id,
                step_id: step.id.clone(),
                attempt,
            });

            let err = match self.attempt(step, mode, external, attempt, timeout, stop).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };
            if !err.is_recoverable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = self.backoff(attempt, &err);
            info!(
                plan_id = %self.plan_id,
                step_id = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying step"
            );
            self.events.publish(Event::StepRetrying {
                plan_id: self.plan_id,
                step_id: step.id.clone(),
                attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.cancelled() => {
                    return Err(AegisError::Cancelled(format!("step '{}' interrupted during backoff", step.id)));
                }
            }
        }
    }

    async fn attempt(
        &self,
        step: &ExecutionStep,
        mode: SandboxMode,
        external: bool,
        attempt: u32,
        timeout: Duration,
        stop: &CancellationToken,
    ) -> aegis_core::Result<Value> {
        if let Err(e) = self.guardrail.check_rate_limit(&self.origin) {
            let max = self.guardrail.rate_limiter().max_per_minute() as f64;
            let anomaly = Anomaly::new(
                AnomalyType::RateExceeded,
                Severity::Medium,
                "requests_per_minute",
                max + 1.0,
                max,
                RecommendedAction::Alert,
                format!("'{}' exceeded its request rate", self.origin),
            )
            .for_plan(self.plan_id);
            self.aurora.report_anomaly(anomaly).await;
            return Err(e);
        }

        self.aurora
            .record_action(self.plan_id, &format!("{}.{}", step.target, step.method))
            .await;
        if let Some(ControlSignal::Cut { reason }) = self.aurora.peek_signal(self.plan_id) {
            return Err(AegisError::Cancelled(format!("cut before dispatch: {reason}")));
        }

        self.budget.record_action();
        if external && mode.has_side_effects() {
            self.budget.record_external_request().inspect_err(|e| {
                self.aurora.report_limit(Some(self.plan_id), e);
            })?;
        }

        let calls_handler = matches!(
            mode,
            SandboxMode::Preview | SandboxMode::Sandbox | SandboxMode::Production
        );
        let mut admission = None;
        if calls_handler {
            self.circuits.check(&step.target)?;
            admission = Some(Admission::new(&self.circuits, &step.target));
        }

        self.budget.acquire_process().inspect_err(|e| {
            self.aurora.report_limit(Some(self.plan_id), e);
        })?;
        let ctx = InvocationContext {
            plan_id: self.plan_id,
            step_id: step.id.clone(),
            mode,
            attempt,
        };
        let clock = Instant::now();
        let outcome = self.sandbox.execute(step, &ctx, timeout, stop).await;
        self.budget.release_process();
        let latency_ms = clock.elapsed().as_secs_f64() * 1000.0;

        if calls_handler {
            match &outcome {
                Ok(_) => {
                    if let Some(a) = admission.as_mut() {
                        a.recorded();
                    }
                    self.circuits.record_success(&step.target);
                    self.aurora.stats().record_dispatch(&step.target, true, latency_ms);
                }
                // no outcome; a half-open admission is handed back on drop
                Err(AegisError::Cancelled(_)) => {}
                Err(e) => {
                    if matches!(e, AegisError::Timeout { .. }) {
                        self.aurora.stats().record_timeout();
                    }
                    if let Some(a) = admission.as_mut() {
                        a.recorded();
                    }
                    self.circuits.record_failure(&step.target, &e.to_string());
                    self.aurora.stats().record_dispatch(&step.target, false, latency_ms);
                }
            }
        }

        let output = outcome?;
        if mode.has_side_effects() {
            self.budget.record_output(&output).inspect_err(|e| {
                self.aurora.report_limit(Some(self.plan_id), e);
            })?;
        }
        Ok(output)
    }

    /// Scan string parameters. Critical findings always block; high ones
    /// block plans of medium risk or more.
    async fn scan(&self, step: &ExecutionStep) -> aegis_core::Result<()> {
        let report = self.guardrail.validate_value(&step.params);
        let Some(severity) = report.max_severity() else {
            return Ok(());
        };
        let categories: Vec<String> = report
            .violations
            .iter()
            .map(|v| v.category.to_string())
            .collect();
        let blocks = severity == Severity::Critical
            || (severity == Severity::High && self.risk >= RiskLevel::Medium);

        let anomaly = Anomaly::new(
            AnomalyType::SuspiciousPattern,
            severity,
            "guardrail",
            report.violations.len() as f64,
            0.0,
            RecommendedAction::Alert,
            format!("step '{}' input matched {}", step.id, categories.join(", ")),
        )
        .for_plan(self.plan_id);
        self.aurora.report_anomaly(anomaly).await;

        if blocks {
            return Err(AegisError::GuardrailViolation {
                step_id: step.id.clone(),
                reason: format!("{severity} input violation: {}", categories.join(", ")),
            });
        }
        warn!(
            plan_id = %self.plan_id,
            step_id = %step.id,
            severity = %severity,
            "guardrail findings below blocking threshold"
        );
        Ok(())
    }

    fn backoff(&self, attempt: u32, err: &AegisError) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(20);
        let mut delay = self
            .retry_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_max_ms);
        if let AegisError::RateLimited { retry_after_ms, .. } = err {
            delay = delay.max((*retry_after_ms).min(self.retry_max_ms));
        }
        Duration::from_millis(delay)
    }
}
