#[cfg(test)]
mod tests {
    use aegis_config::AegisConfig;
    use aegis_core::*;
    use aegis_operator::{Operator, SkillRegistry};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    /// Records `step:method` for every call. Methods can be told to fail a
    /// number of times, or always.
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
        fail_first: Mutex<HashMap<String, u32>>,
        always_fail: Vec<&'static str>,
    }

    impl Scripted {
        fn failing(method: &str, times: u32) -> Self {
            let script = Self::default();
            script.fail_first.lock().insert(method.to_string(), times);
            script
        }

        fn always(methods: Vec<&'static str>) -> Self {
            Self {
                always_fail: methods,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, method: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.ends_with(&format!(":{method}")))
                .count()
        }
    }

    #[async_trait]
    impl SkillHandler for Scripted {
        async fn invoke(
            &self,
            method: &str,
            _params: &Value,
            ctx: &InvocationContext,
        ) -> aegis_core::Result<Value> {
            self.calls.lock().push(format!("{}:{method}", ctx.step_id));
            match method {
                "slow" => tokio::time::sleep(Duration::from_millis(300)).await,
                "hang" => tokio::time::sleep(Duration::from_secs(10)).await,
                _ => {}
            }
            let scripted_failure = {
                let mut left = self.fail_first.lock();
                match left.get_mut(method) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if scripted_failure || self.always_fail.contains(&method) {
                return Err(AegisError::Skill {
                    target: "scripted".into(),
                    method: method.into(),
                    reason: "upstream unavailable".into(),
                });
            }
            Ok(json!({ "method": method, "step": ctx.step_id, "ok": true }))
        }
    }

    fn registry(handler: Arc<Scripted>) -> SkillRegistry {
        SkillRegistry::new()
            .with(
                CapabilityDescriptor::skill("notes", SkillCategory::Data)
                    .with_method(MethodSpec::new("write").undone_by("erase"))
                    .with_method(MethodSpec::new("erase"))
                    .with_method(MethodSpec::new("read"))
                    .with_method(MethodSpec::new("prepare"))
                    .with_method(MethodSpec::new("slow"))
                    .with_method(MethodSpec::new("hang"))
                    .with_method(MethodSpec::new("finish"))
                    .handles("save_note"),
                handler.clone(),
            )
            .with(
                CapabilityDescriptor::skill("flaky", SkillCategory::Data)
                    .with_method(MethodSpec::new("call")),
                handler.clone(),
            )
            .with(
                CapabilityDescriptor::skill("shell", SkillCategory::Exec)
                    .with_method(MethodSpec::new("run")),
                handler.clone(),
            )
            .with(
                CapabilityDescriptor::skill("chat", SkillCategory::Messaging)
                    .with_method(MethodSpec::new("send"))
                    .with_method(MethodSpec::new("publish")),
                handler,
            )
    }

    fn config() -> AegisConfig {
        let mut config = AegisConfig::default();
        config.engine.retry_base_delay_ms = 5;
        config.engine.retry_max_delay_ms = 20;
        config
    }

    fn operator_with(config: AegisConfig, handler: Arc<Scripted>) -> Arc<Operator> {
        Operator::new(&config, registry(handler)).unwrap().shared()
    }

    fn operator(handler: Arc<Scripted>) -> Arc<Operator> {
        operator_with(config(), handler)
    }

    /// Lift the pacing so tests do not wait between dispatches.
    fn fast(plan: ExecutionPlan) -> ExecutionPlan {
        plan.with_limits(ExecutionLimits {
            actions_per_second: 1000.0,
            ..ExecutionLimits::default()
        })
    }

    fn write(id: &str) -> ExecutionStep {
        ExecutionStep::skill(id, "notes", "write").reversible_with(RollbackCommand {
            target: "notes".into(),
            method: "erase".into(),
            params: json!({ "id": id }),
        })
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    async fn wait_for(
        op: &Operator,
        plan_id: Uuid,
        what: &str,
        done: impl Fn(&ExecutionResult) -> bool,
    ) {
        for _ in 0..300 {
            if op.get_execution_status(plan_id).is_some_and(|r| done(&r)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    mod execution {
        use super::*;

        #[tokio::test]
        async fn test_retried_dependency_completes_before_dependent_starts() {
            let handler = Arc::new(Scripted::failing("read", 2));
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "read then write",
                vec![
                    ExecutionStep::skill("a", "notes", "read").with_retries(2),
                    write("b").after(&["a"]),
                ],
            ));
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            let a = result.step("a").unwrap();
            let b = result.step("b").unwrap();
            assert_eq!(a.status, StepStatus::Completed);
            assert_eq!(a.retries, 2);
            assert_eq!(a.attempts, 3);
            assert!(b.started_at.unwrap() >= a.finished_at.unwrap());
            assert_eq!(handler.calls(), vec!["a:read", "a:read", "a:read", "b:write"]);
            assert_eq!(result.final_output["b"]["ok"], true);
            assert!(result.can_rollback);

            let events = drain(&mut rx);
            assert_eq!(events.iter().filter(|e| **e == "STEP_RETRYING").count(), 2);
            assert_eq!(events.last(), Some(&"EXECUTION_COMPLETED"));
        }

        #[tokio::test]
        async fn test_process_intent_compiles_and_runs() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let intent = UserIntent::new("cli", "remember the milk", "save_note")
                .with_entity("text", json!("milk"));
            let result = op.process_intent(intent).await.unwrap();

            assert!(result.is_success());
            assert_eq!(handler.calls(), vec!["notes:write"]);
            let events = drain(&mut rx);
            assert_eq!(events[0], "INTENT_RECEIVED");
            assert_eq!(events[1], "PLAN_CREATED");
            assert!(events.contains(&"AUTHORIZATION_DECIDED"));
        }

        #[tokio::test]
        async fn test_false_condition_skips_and_alternate_dependency_runs() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());

            let plan = fast(ExecutionPlan::new(
                "branching",
                vec![
                    ExecutionStep::skill("a", "notes", "read"),
                    ExecutionStep::skill("b", "notes", "prepare")
                        .after(&["a"])
                        .when(StepCondition::new(
                            "a",
                            "ok",
                            ConditionOperator::Equals,
                            json!(false),
                        )),
                    ExecutionStep::skill("c", "notes", "finish")
                        .after(&["b"])
                        .or_after(&["a"]),
                    ExecutionStep::skill("d", "chat", "send").after(&["b"]),
                ],
            ));
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(result.step("b").unwrap().status, StepStatus::Skipped);
            assert_eq!(result.step("c").unwrap().status, StepStatus::Completed);
            assert_eq!(result.step("d").unwrap().status, StepStatus::Skipped);
            assert_eq!(handler.calls(), vec!["a:read", "c:finish"]);
        }

        #[tokio::test]
        async fn test_independent_steps_overlap() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler);

            let plan = fast(ExecutionPlan::new(
                "two slow reads",
                vec![
                    ExecutionStep::skill("a", "notes", "slow"),
                    ExecutionStep::skill("b", "notes", "slow"),
                ],
            ));
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            let a = result.step("a").unwrap();
            let b = result.step("b").unwrap();
            assert!(a.started_at.unwrap() < b.finished_at.unwrap());
            assert!(b.started_at.unwrap() < a.finished_at.unwrap());
        }

        #[tokio::test]
        async fn test_dry_run_never_invokes_handlers() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());

            let plan = fast(ExecutionPlan::new(
                "dry",
                vec![write("a"), write("b").after(&["a"])],
            ))
            .with_mode(SandboxMode::DryRun);
            let plan_id = plan.id;
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(result.final_output["a"]["would_execute"], true);
            assert!(handler.calls().is_empty());
            assert!(!result.can_rollback);

            let report = op.rollback_execution(plan_id).await.unwrap();
            assert!(report.is_noop());
            assert!(report.skipped_irreversible.is_empty());
            assert!(handler.calls().is_empty());
        }

        #[tokio::test]
        async fn test_step_mode_cannot_widen_plan_mode() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());

            let plan = fast(ExecutionPlan::new(
                "mixed",
                vec![
                    write("a").in_mode(SandboxMode::Production),
                    write("b").in_mode(SandboxMode::Validate),
                ],
            ))
            .with_mode(SandboxMode::Preview);
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(result.final_output["b"]["valid"], true);
            assert!(handler.calls().is_empty());
        }
    }

    mod failure {
        use super::*;

        #[tokio::test]
        async fn test_failure_rolls_back_in_reverse_completion_order() {
            let handler = Arc::new(Scripted::always(vec!["call"]));
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "write twice then call",
                vec![
                    write("a"),
                    write("b").after(&["a"]),
                    ExecutionStep::skill("c", "flaky", "call")
                        .after(&["b"])
                        .with_retries(0),
                ],
            ));
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Failed);
            assert_eq!(
                result.error.as_ref().and_then(|e| e.step_id.as_deref()),
                Some("c")
            );
            assert_eq!(
                handler.calls(),
                vec!["a:write", "b:write", "c:call", "b:erase", "a:erase"]
            );
            let report = result.rollback.as_ref().unwrap();
            assert_eq!(report.rolled_back, vec!["b", "a"]);
            assert!(report.failed.is_empty());
            assert_eq!(result.step("a").unwrap().status, StepStatus::RolledBack);
            assert!(!result.can_rollback);
            assert!(result.can_resume);

            let checkpoint = op
                .checkpoints()
                .get_checkpoint(result.checkpoint_id.unwrap())
                .unwrap()
                .unwrap();
            assert!(checkpoint.completed_steps.is_empty());

            let events = drain(&mut rx);
            let rollback = events.iter().position(|e| *e == "ROLLBACK_STARTED").unwrap();
            let failed = events.iter().position(|e| *e == "EXECUTION_FAILED").unwrap();
            assert!(events.contains(&"CHECKPOINT_CREATED"));
            assert!(rollback < failed);
        }

        #[tokio::test]
        async fn test_rollback_of_irreversible_plan_is_noop() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "read and announce",
                vec![
                    ExecutionStep::skill("a", "notes", "read"),
                    ExecutionStep::skill("b", "chat", "send").after(&["a"]),
                ],
            ));
            let plan_id = plan.id;
            let result = op.execute_plan(plan).await.unwrap();
            assert!(result.is_success());
            assert!(!result.can_rollback);
            drain(&mut rx);

            let report = op.rollback_execution(plan_id).await.unwrap();
            assert!(report.is_noop());
            assert_eq!(report.skipped_irreversible, vec!["b", "a"]);
            assert_eq!(handler.count("erase"), 0);
            assert!(!drain(&mut rx).contains(&"ROLLBACK_STARTED"));
        }

        #[tokio::test]
        async fn test_open_circuit_skips_step_and_dependents() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();
            op.circuits().open_circuit("flaky", "maintenance");

            let plan = fast(ExecutionPlan::new(
                "call flaky then report",
                vec![
                    ExecutionStep::skill("a", "flaky", "call").with_retries(3),
                    write("b").after(&["a"]),
                    ExecutionStep::skill("c", "notes", "read"),
                    ExecutionStep::skill("d", "notes", "finish")
                        .after(&["a"])
                        .or_after(&["c"]),
                ],
            ));
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            let a = result.step("a").unwrap();
            assert_eq!(a.status, StepStatus::Skipped);
            assert!(a.circuit_open);
            assert_eq!(a.attempts, 1);
            assert!(a.error.as_ref().unwrap().contains("circuit open"));
            let b = result.step("b").unwrap();
            assert_eq!(b.status, StepStatus::Skipped);
            assert!(!b.circuit_open);
            assert_eq!(result.step("d").unwrap().status, StepStatus::Completed);
            assert_eq!(handler.calls(), vec!["c:read", "d:finish"]);
            assert!(result.message.unwrap().contains("without a"));
            assert!(result.rollback.is_none());
            let authorization = result.authorization.unwrap();
            assert!(authorization.factors.iter().any(|f| f.name == "circuit"));

            let mut skipped_on_circuit = 0;
            while let Ok(event) = rx.try_recv() {
                match event {
                    Event::StepSkipped { circuit_open: true, step_id, .. } => {
                        assert_eq!(step_id, "a");
                        skipped_on_circuit += 1;
                    }
                    Event::StepFailed { .. } | Event::ExecutionFailed { .. } => {
                        panic!("open circuit must not fail the plan")
                    }
                    _ => {}
                }
            }
            assert_eq!(skipped_on_circuit, 1);
        }

        #[tokio::test]
        async fn test_cancelled_half_open_call_does_not_wedge_circuit() {
            let mut config = config();
            config.circuit_breaker.retry_after_ms = 20;
            let handler = Arc::new(Scripted::default());
            let op = operator_with(config, handler.clone());
            op.circuits().open_circuit("notes", "maintenance");
            tokio::time::sleep(Duration::from_millis(40)).await;

            let plan = fast(ExecutionPlan::new(
                "hang",
                vec![ExecutionStep::skill("a", "notes", "hang")],
            ));
            let plan_id = plan.id;
            let runner = Arc::clone(&op);
            let task = tokio::spawn(async move { runner.execute_plan(plan).await });
            // the handler is only reached once the circuit admitted the call
            for _ in 0..300 {
                if handler.count("hang") == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(handler.count("hang"), 1);
            assert_eq!(op.circuits().state("notes"), CircuitState::HalfOpen);
            op.cancel_execution(plan_id).unwrap();
            let cancelled = task.await.unwrap().unwrap();
            assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

            let next = fast(ExecutionPlan::new(
                "read",
                vec![ExecutionStep::skill("b", "notes", "read")],
            ));
            let result = op.execute_plan(next).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(op.circuits().state("notes"), CircuitState::Closed);
            assert_eq!(handler.count("read"), 1);
        }

        #[tokio::test]
        async fn test_guardrail_blocks_injected_exec_step() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "list files",
                vec![
                    ExecutionStep::skill("a", "shell", "run")
                        .with_params(json!({ "command": "ls `whoami`" })),
                ],
            ));
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Failed);
            let error = result.step("a").unwrap().error.clone().unwrap();
            assert!(error.contains("command_injection"), "{error}");
            assert!(handler.calls().is_empty());
            assert!(drain(&mut rx).contains(&"ANOMALY"));
        }

        #[tokio::test]
        async fn test_runaway_retries_are_cut() {
            let mut config = config();
            config.circuit_breaker.failure_threshold = 100;
            let handler = Arc::new(Scripted::always(vec!["call"]));
            let op = operator_with(config, handler.clone());
            let mut rx = op.events().subscribe();

            let plan = ExecutionPlan::new(
                "hammer",
                vec![ExecutionStep::skill("a", "flaky", "call").with_retries(20)],
            )
            .with_limits(ExecutionLimits {
                actions_per_second: 1000.0,
                max_retries_per_step: 20,
                ..ExecutionLimits::default()
            });
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Cut);
            assert!(result.can_resume);
            assert_eq!(handler.count("call"), 10);
            let events = drain(&mut rx);
            assert!(events.contains(&"ANOMALY"));
            assert!(events.contains(&"CUT"));
        }
    }

    mod authorization {
        use super::*;

        #[tokio::test]
        async fn test_blocked_target_returns_message() {
            let mut config = config();
            config.authorization.blocked_targets = vec!["shell".into()];
            let handler = Arc::new(Scripted::default());
            let op = operator_with(config, handler.clone());

            let plan = ExecutionPlan::new("run", vec![ExecutionStep::skill("a", "shell", "run")]);
            let plan_id = plan.id;
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Blocked);
            assert!(result.message.unwrap().contains("blocked"));
            assert_eq!(result.authorization.unwrap().decision, Decision::Blocked);
            assert!(handler.calls().is_empty());
            assert!(op.list_active_executions().is_empty());
            assert!(op.cancel_execution(plan_id).is_err());
        }

        #[tokio::test]
        async fn test_confirmation_then_approval_runs() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "announce",
                vec![ExecutionStep::skill("a", "chat", "publish")],
            ));
            let plan_id = plan.id;
            let pending = op.execute_plan(plan).await.unwrap();

            assert_eq!(pending.status, ExecutionStatus::Queued);
            let auth = pending.authorization.unwrap();
            assert_eq!(auth.decision, Decision::RequiresConfirmation);
            assert!(auth.confirmation_prompt.is_some());
            assert!(handler.calls().is_empty());
            assert!(drain(&mut rx).contains(&"CONFIRMATION_REQUIRED"));

            let result = op.confirm_and_execute(plan_id, true).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(handler.calls(), vec!["a:publish"]);

            let again = op.confirm_and_execute(plan_id, true).await;
            assert!(matches!(again, Err(AegisError::InvalidState(_))));
        }

        #[tokio::test]
        async fn test_confirmation_denied_blocks() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());

            let plan = ExecutionPlan::new("announce", vec![ExecutionStep::skill("a", "chat", "publish")]);
            let plan_id = plan.id;
            op.execute_plan(plan).await.unwrap();

            let result = op.confirm_and_execute(plan_id, false).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Blocked);
            assert!(result.message.is_some());
            assert!(handler.calls().is_empty());
        }

        fn short_confirmation() -> AegisConfig {
            let mut config = config();
            config.authorization.confirmation_ttl_ms = 50;
            config
        }

        #[tokio::test]
        async fn test_unanswered_confirmation_expires_to_blocked() {
            let handler = Arc::new(Scripted::default());
            let op = operator_with(short_confirmation(), handler.clone());

            let plan = ExecutionPlan::new("announce", vec![ExecutionStep::skill("a", "chat", "publish")]);
            let plan_id = plan.id;
            let pending = op.execute_plan(plan).await.unwrap();
            assert_eq!(pending.status, ExecutionStatus::Queued);
            assert_eq!(op.list_active_executions().len(), 1);

            tokio::time::sleep(Duration::from_millis(120)).await;
            assert!(op.list_active_executions().is_empty());
            let result = op.get_execution_status(plan_id).unwrap();
            assert_eq!(result.status, ExecutionStatus::Blocked);
            assert_eq!(result.error.unwrap().reason, "confirmation expired");
            let auth = result.authorization.unwrap();
            assert_eq!(auth.decision, Decision::Blocked);
            assert!(auth.rules.iter().any(|r| r == "confirmation_expired"));

            let late = op.confirm_and_execute(plan_id, true).await;
            assert!(matches!(late, Err(AegisError::InvalidState(_))));
            assert!(handler.calls().is_empty());
        }

        #[tokio::test]
        async fn test_confirming_after_gate_sweep_reports_blocked() {
            let handler = Arc::new(Scripted::default());
            let op = operator_with(short_confirmation(), handler.clone());
            let mut rx = op.events().subscribe();

            let plan = ExecutionPlan::new("announce", vec![ExecutionStep::skill("a", "chat", "publish")]);
            let plan_id = plan.id;
            op.execute_plan(plan).await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            assert_eq!(op.aurora().collect_garbage(), 1);
            drain(&mut rx);

            let result = op.confirm_and_execute(plan_id, true).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Blocked);
            assert!(result.message.unwrap().contains("expired"));
            assert!(handler.calls().is_empty());
            assert!(drain(&mut rx).contains(&"AUTHORIZATION_DECIDED"));
            assert_eq!(op.expire_confirmations(), 0);
        }

        #[tokio::test]
        async fn test_confirming_after_ttl_without_sweep_blocks() {
            let handler = Arc::new(Scripted::default());
            let op = operator_with(short_confirmation(), handler.clone());

            let plan = ExecutionPlan::new("announce", vec![ExecutionStep::skill("a", "chat", "publish")]);
            let plan_id = plan.id;
            op.execute_plan(plan).await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;

            let result = op.confirm_and_execute(plan_id, true).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Blocked);
            assert!(handler.calls().is_empty());
            assert!(op.list_active_executions().is_empty());
        }

        #[tokio::test]
        async fn test_invalid_plan_rejected_before_authorization() {
            let op = operator(Arc::new(Scripted::default()));
            let plan = ExecutionPlan::new(
                "cycle",
                vec![
                    ExecutionStep::skill("a", "notes", "read").after(&["b"]),
                    ExecutionStep::skill("b", "notes", "read").after(&["a"]),
                ],
            );
            let err = op.execute_plan(plan).await.unwrap_err();
            assert!(matches!(err, AegisError::Plan(PlanError::Cycle(_))));
        }
    }

    mod control {
        use super::*;

        #[tokio::test]
        async fn test_cancel_stops_running_step() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());

            let plan = fast(ExecutionPlan::new(
                "hang",
                vec![
                    ExecutionStep::skill("a", "notes", "hang"),
                    ExecutionStep::skill("b", "notes", "read").after(&["a"]),
                ],
            ));
            let plan_id = plan.id;
            let runner = Arc::clone(&op);
            let task = tokio::spawn(async move { runner.execute_plan(plan).await });

            wait_for(&op, plan_id, "step a to run", |r| {
                r.step("a").is_some_and(|s| s.status == StepStatus::Running)
            })
            .await;
            assert_eq!(op.list_active_executions().len(), 1);
            op.cancel_execution(plan_id).unwrap();

            let result = task.await.unwrap().unwrap();
            assert_eq!(result.status, ExecutionStatus::Cancelled);
            assert_eq!(result.step("a").unwrap().status, StepStatus::Cancelled);
            assert_eq!(result.step("b").unwrap().status, StepStatus::Pending);
            assert_eq!(handler.count("read"), 0);
            let checkpoint = op
                .checkpoints()
                .get_checkpoint(result.checkpoint_id.unwrap())
                .unwrap()
                .unwrap();
            assert_eq!(checkpoint.current_step.as_deref(), Some("a"));
        }

        #[tokio::test]
        async fn test_pause_then_resume_completes() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "slow then read",
                vec![
                    ExecutionStep::skill("a", "notes", "slow"),
                    ExecutionStep::skill("b", "notes", "read").after(&["a"]),
                ],
            ));
            let plan_id = plan.id;
            let runner = Arc::clone(&op);
            let task = tokio::spawn(async move { runner.execute_plan(plan).await });

            wait_for(&op, plan_id, "running", |r| r.status == ExecutionStatus::Running).await;
            op.aurora().pause(plan_id, "operator check");
            wait_for(&op, plan_id, "paused", |r| r.status == ExecutionStatus::Paused).await;
            assert_eq!(handler.count("read"), 0);
            op.resume_execution(plan_id).unwrap();

            let result = task.await.unwrap().unwrap();
            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(handler.calls(), vec!["a:slow", "b:read"]);
            let events = drain(&mut rx);
            assert!(events.contains(&"EXECUTION_PAUSED"));
            assert!(events.contains(&"EXECUTION_RESUMED"));
            assert!(events.contains(&"RESUME"));
        }

        #[tokio::test]
        async fn test_cut_raised_while_paused_survives_resume() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "slow then read",
                vec![
                    ExecutionStep::skill("a", "notes", "slow"),
                    ExecutionStep::skill("b", "notes", "read").after(&["a"]),
                ],
            ));
            let plan_id = plan.id;
            let runner = Arc::clone(&op);
            let task = tokio::spawn(async move { runner.execute_plan(plan).await });

            wait_for(&op, plan_id, "running", |r| r.status == ExecutionStatus::Running).await;
            op.aurora().pause(plan_id, "operator check");
            wait_for(&op, plan_id, "paused", |r| r.status == ExecutionStatus::Paused).await;
            // resume lands before the paused loop polls for the cut
            op.aurora().cut(plan_id, "error burst");
            op.resume_execution(plan_id).unwrap();

            let result = task.await.unwrap().unwrap();
            assert_eq!(result.status, ExecutionStatus::Cut);
            assert!(result.can_resume);
            assert!(result.checkpoint_id.is_some());
            assert_eq!(handler.count("read"), 0);
            let events = drain(&mut rx);
            assert!(events.contains(&"CUT"));
            assert!(!events.contains(&"EXECUTION_RESUMED"));
        }

        #[tokio::test]
        async fn test_cut_checkpoints_and_resume_skips_completed_steps() {
            let handler = Arc::new(Scripted::default());
            let op = operator(handler.clone());
            let mut rx = op.events().subscribe();

            let plan = fast(ExecutionPlan::new(
                "prepare, slow, finish",
                vec![
                    ExecutionStep::skill("a", "notes", "prepare"),
                    ExecutionStep::skill("b", "notes", "slow").after(&["a"]),
                    ExecutionStep::skill("c", "notes", "finish").after(&["b"]),
                ],
            ));
            let plan_id = plan.id;
            let runner = Arc::clone(&op);
            let task = tokio::spawn(async move { runner.execute_plan(plan).await });

            wait_for(&op, plan_id, "step a to complete", |r| {
                r.step("a").is_some_and(|s| s.status == StepStatus::Completed)
            })
            .await;
            op.aurora().cut(plan_id, "error burst");

            let cut = task.await.unwrap().unwrap();
            assert_eq!(cut.status, ExecutionStatus::Cut);
            assert!(cut.can_resume);
            assert_ne!(cut.step("c").unwrap().status, StepStatus::Completed);
            let checkpoint_id = cut.checkpoint_id.unwrap();
            assert!(drain(&mut rx).contains(&"CUT"));

            let resumed = op.resume_from_checkpoint(checkpoint_id).await.unwrap();
            assert_eq!(resumed.status, ExecutionStatus::Completed);
            assert_eq!(handler.count("prepare"), 1);
            assert_eq!(handler.count("finish"), 1);
            assert_eq!(resumed.step("a").unwrap().status, StepStatus::Completed);
        }

        #[tokio::test]
        async fn test_resume_from_missing_checkpoint() {
            let op = operator(Arc::new(Scripted::default()));
            let missing = Uuid::new_v4();
            let err = op.resume_from_checkpoint(missing).await.unwrap_err();
            assert!(matches!(err, AegisError::CheckpointNotFound(id) if id == missing));
            assert!(matches!(
                op.resume_execution(missing),
                Err(AegisError::ExecutionNotFound(_))
            ));
        }
    }

    mod compiler {
        use super::*;

        fn compiling_operator() -> Arc<Operator> {
            let handler = Arc::new(Scripted::default());
            let registry = SkillRegistry::new()
                .with(
                    CapabilityDescriptor::skill("files", SkillCategory::File)
                        .with_method(MethodSpec::new("write").undone_by("restore"))
                        .with_method(MethodSpec::new("restore"))
                        .with_method(MethodSpec::new("prune").destructive()),
                    handler.clone(),
                )
                .with(
                    CapabilityDescriptor::skill("chat", SkillCategory::Messaging)
                        .with_method(MethodSpec::new("send")),
                    handler.clone(),
                )
                .with(
                    CapabilityDescriptor::skill("web", SkillCategory::Browser)
                        .with_method(MethodSpec::new("fetch"))
                        .external()
                        .handles("fetch_page"),
                    handler.clone(),
                )
                .with(
                    CapabilityDescriptor::hub("release")
                        .handles("ship")
                        .with_workflow(vec![
                            WorkflowStep {
                                id: "build".into(),
                                target: "files".into(),
                                method: "write".into(),
                                params: json!({ "path": "/tmp/build/out.txt" }),
                                depends_on: vec![],
                            },
                            WorkflowStep {
                                id: "prune".into(),
                                target: "files".into(),
                                method: "prune".into(),
                                params: json!({ "path": "/tmp/build/" }),
                                depends_on: vec!["build".into()],
                            },
                            WorkflowStep {
                                id: "announce".into(),
                                target: "chat".into(),
                                method: "send".into(),
                                params: json!({ "text": "shipped" }),
                                depends_on: vec!["prune".into()],
                            },
                        ]),
                    handler,
                );
            Operator::new(&config(), registry).unwrap().shared()
        }

        #[test]
        fn test_unmapped_intent() {
            let op = compiling_operator();
            let err = op
                .create_plan(&UserIntent::new("cli", "pizza please", "order_pizza"))
                .unwrap_err();
            assert!(
                matches!(err, AegisError::Plan(PlanError::UnmappedIntent(ref t)) if t == "order_pizza")
            );
        }

        #[test]
        fn test_workflow_gets_checkpoint_boundary() {
            let op = compiling_operator();
            let intent = UserIntent::new("cli", "ship it", "ship").with_entity("mode", json!("dry_run"));
            let plan = op.create_plan(&intent).unwrap();

            assert_eq!(plan.mode, SandboxMode::DryRun);
            assert_eq!(plan.risk_level, RiskLevel::High);
            let checkpoint = plan.step("checkpoint_after_prune").unwrap();
            assert_eq!(checkpoint.action, ActionType::Checkpoint);
            assert_eq!(checkpoint.depends_on, vec!["prune"]);
            let announce = plan.step("announce").unwrap();
            assert!(announce.depends_on.contains(&"checkpoint_after_prune".to_string()));
            assert!(plan.step("build").unwrap().reversible);
            assert!(plan.manifest.files.contains("/tmp/build/out.txt"));
            assert!(plan.manifest.directories.contains("/tmp/build/"));
            assert!(plan.step("build").unwrap().params.get("mode").is_none());
        }

        #[tokio::test]
        async fn test_compiled_workflow_runs_in_dry_run() {
            let op = compiling_operator();
            let intent = UserIntent::new("cli", "ship it", "ship").with_entity("mode", json!("dry_run"));
            let plan = op.create_plan(&intent).unwrap();
            let result = op.execute_plan(plan).await.unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(result.authorization.unwrap().decision, Decision::Limited);
            assert!(result.final_output["checkpoint_after_prune"]["checkpoint_id"].is_string());
            assert_eq!(result.final_output["announce"]["would_execute"], true);
        }

        #[test]
        fn test_external_fetch_is_medium_risk() {
            let op = compiling_operator();
            let intent = UserIntent::new("cli", "grab the page", "fetch_page")
                .with_entity("url", json!("https://api.example.com/v1/items"));
            let plan = op.create_plan(&intent).unwrap();

            assert_eq!(plan.risk_level, RiskLevel::Medium);
            assert_eq!(plan.steps.len(), 1);
            assert_eq!(plan.steps[0].method, "fetch");
            assert!(plan.manifest.urls.contains("https://api.example.com/v1/items"));
            assert!(plan.manifest.external_apis.contains("web"));
            assert!(plan.manifest.external_apis.contains("api.example.com"));
            assert_eq!(plan.limits, ExecutionLimits::for_risk(RiskLevel::Medium));
        }
    }
}
