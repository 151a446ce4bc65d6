#[cfg(test)]
mod tests {
    use aegis_core::Event;
    use tokio::sync::broadcast;

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    mod authorization {
        use aegis_aurora::*;
        use aegis_config::{AuthorizationConfig, CircuitBreakerConfig};
        use aegis_core::*;
        use aegis_guard::CircuitBreakerRegistry;
        use chrono::{Duration, Utc};
        use std::sync::Arc;

        struct FixedScorer(u8);

        impl RiskScorer for FixedScorer {
            fn factors(&self, _: &AuthorizationRequest, _: &ScoringContext) -> Vec<RiskFactor> {
                vec![RiskFactor::new("fixed", self.0, 1.0, "fixed score")]
            }
        }

        fn gate(config: AuthorizationConfig) -> AuthorizationGate {
            AuthorizationGate::new(
                &config,
                Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            )
        }

        fn simple_plan(method: &str) -> ExecutionPlan {
            ExecutionPlan::new("write notes", vec![ExecutionStep::skill("a", "notes", method)])
        }

        #[test]
        fn test_decision_follows_level_thresholds() {
            let g = gate(AuthorizationConfig::default());
            let request = AuthorizationRequest::for_plan(&simple_plan("write"));
            for (score, level, decision) in [
                (29, SemaphoreLevel::Green, Decision::Allowed),
                (30, SemaphoreLevel::Yellow, Decision::Limited),
                (59, SemaphoreLevel::Yellow, Decision::Limited),
                (60, SemaphoreLevel::Orange, Decision::RequiresConfirmation),
                (79, SemaphoreLevel::Orange, Decision::RequiresConfirmation),
                (80, SemaphoreLevel::Red, Decision::Blocked),
            ] {
                g.set_scorer(Arc::new(FixedScorer(score)));
                let response = g.authorize(&request);
                assert_eq!(response.risk_score, score);
                assert_eq!(response.level, level, "score {score}");
                assert_eq!(response.decision, decision, "score {score}");
            }
        }

        #[test]
        fn test_plain_medium_plan_is_allowed() {
            let g = gate(AuthorizationConfig::default());
            let plan = simple_plan("write");
            let response = g.authorize(&AuthorizationRequest::for_plan(&plan));
            assert_eq!(response.decision, Decision::Allowed);
            assert_eq!(response.limits, plan.limits);
            assert!(response.is_valid());
            assert!(response.message.is_none());
        }

        #[test]
        fn test_limited_tightens_limits() {
            let g = gate(AuthorizationConfig::default());
            g.set_scorer(Arc::new(FixedScorer(45)));
            let plan = simple_plan("write");
            let response = g.authorize(&AuthorizationRequest::for_plan(&plan));
            assert_eq!(response.decision, Decision::Limited);
            assert_eq!(response.limits, plan.limits.tightened());
            assert!(response.rules.iter().any(|r| r == "limits_tightened"));
        }

        #[test]
        fn test_destructive_irreversible_needs_confirmation() {
            let g = gate(AuthorizationConfig::default());
            let plan = simple_plan("delete");
            let response = g.authorize(&AuthorizationRequest::for_plan(&plan));
            // base 40 * 0.5 + destructive 100 * 0.4
            assert_eq!(response.risk_score, 60);
            assert_eq!(response.decision, Decision::RequiresConfirmation);
            assert!(response.confirmation_prompt.is_some());
            assert!(response.factors.iter().any(|f| f.name == "destructive"));
        }

        #[test]
        fn test_blocked_target_rule_overrides_level() {
            let config = AuthorizationConfig {
                blocked_targets: vec!["notes".into()],
                ..Default::default()
            };
            let g = gate(config);
            let response = g.authorize(&AuthorizationRequest::for_plan(&simple_plan("write")));
            assert_eq!(response.level, SemaphoreLevel::Green);
            assert_eq!(response.decision, Decision::Blocked);
            assert!(response.rules.contains(&"blocked_target:notes".to_string()));
            assert!(response.message.unwrap().contains("blocked"));
        }

        #[test]
        fn test_confirmation_required_operation() {
            let g = gate(AuthorizationConfig::default());
            let plan = ExecutionPlan::new("ship", vec![ExecutionStep::skill("a", "app", "deploy")]);
            let response = g.authorize(&AuthorizationRequest::for_plan(&plan));
            assert_eq!(response.decision, Decision::RequiresConfirmation);
            assert!(response
                .rules
                .contains(&"confirmation_required:app.deploy".to_string()));
            assert!(g.is_pending(response.request_id));
        }

        #[test]
        fn test_open_circuit_raises_score() {
            let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
            circuits.open_circuit("notes", "maintenance");
            let g = AuthorizationGate::new(&AuthorizationConfig::default(), circuits);
            let response = g.authorize(&AuthorizationRequest::for_plan(&simple_plan("write")));
            // base 20 + circuit 100 * 0.3
            assert_eq!(response.risk_score, 50);
            assert_eq!(response.decision, Decision::Limited);
            let circuit = response.factors.iter().find(|f| f.name == "circuit").unwrap();
            assert!(circuit.mitigation.is_some());
        }

        #[test]
        fn test_sensitive_paths_and_production() {
            let config = AuthorizationConfig {
                production: true,
                ..Default::default()
            };
            let g = gate(config);
            let mut plan = simple_plan("write");
            plan.manifest.files.insert("/etc/hosts".into());
            let response = g.authorize(&AuthorizationRequest::for_plan(&plan));
            let names: Vec<&str> = response.factors.iter().map(|f| f.name.as_str()).collect();
            assert!(names.contains(&"sensitive_files"));
            assert!(names.contains(&"production"));

            // Production factor does not apply without side effects.
            let dry = plan.clone().with_mode(SandboxMode::DryRun);
            let response = g.authorize(&AuthorizationRequest::for_plan(&dry));
            assert!(!response.factors.iter().any(|f| f.name == "production"));
        }

        #[test]
        fn test_confirm_approve_and_deny() {
            let g = gate(AuthorizationConfig::default());
            g.set_scorer(Arc::new(FixedScorer(70)));
            let request = AuthorizationRequest::for_plan(&simple_plan("write"));

            let pending = g.authorize(&request);
            assert_eq!(pending.decision, Decision::RequiresConfirmation);
            let approved = g.confirm_authorization(request.id, true).unwrap();
            assert_eq!(approved.decision, Decision::Allowed);
            assert!(approved.confirmation_prompt.is_none());
            assert!(approved.is_valid());

            // Settled requests cannot be confirmed twice.
            assert!(matches!(
                g.confirm_authorization(request.id, true),
                Err(AegisError::AuthorizationNotPending(_))
            ));

            let request = AuthorizationRequest::for_plan(&simple_plan("write"));
            g.authorize(&request);
            let denied = g.confirm_authorization(request.id, false).unwrap();
            assert_eq!(denied.decision, Decision::Blocked);
        }

        #[test]
        fn test_unanswered_confirmation_expires_to_blocked() {
            let g = gate(AuthorizationConfig::default());
            g.set_scorer(Arc::new(FixedScorer(70)));
            let request = AuthorizationRequest::for_plan(&simple_plan("write"));
            let t0 = Utc::now();
            g.authorize_at(&request, t0);

            let late = g
                .confirm_authorization_at(request.id, true, t0 + Duration::seconds(121))
                .unwrap();
            assert_eq!(late.decision, Decision::Blocked);
            assert!(late.rules.iter().any(|r| r == "confirmation_expired"));

            let request = AuthorizationRequest::for_plan(&simple_plan("write"));
            g.authorize_at(&request, t0);
            assert_eq!(g.expire_pending_at(t0 + Duration::seconds(60)), 0);
            assert_eq!(g.expire_pending_at(t0 + Duration::seconds(121)), 1);
            assert!(!g.is_pending(request.id));
        }

        #[tokio::test]
        async fn test_await_confirmation_receives_answer() {
            let g = Arc::new(gate(AuthorizationConfig::default()));
            g.set_scorer(Arc::new(FixedScorer(70)));
            let request = AuthorizationRequest::for_plan(&simple_plan("write"));
            g.authorize(&request);

            let answering = g.clone();
            let id = request.id;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                answering.confirm_authorization(id, true).unwrap();
            });

            let response = g.await_confirmation(request.id).await.unwrap();
            assert_eq!(response.decision, Decision::Allowed);
        }

        #[tokio::test]
        async fn test_await_confirmation_times_out() {
            let config = AuthorizationConfig {
                confirmation_ttl_ms: 50,
                ..Default::default()
            };
            let g = gate(config);
            g.set_scorer(Arc::new(FixedScorer(70)));
            let request = AuthorizationRequest::for_plan(&simple_plan("write"));
            g.authorize(&request);

            let response = g.await_confirmation(request.id).await.unwrap();
            assert_eq!(response.decision, Decision::Blocked);
            assert!(!g.is_pending(request.id));
        }
    }

    mod detector {
        use aegis_aurora::*;
        use aegis_config::MetricThresholds;
        use aegis_core::*;
        use chrono::{Duration, Utc};
        use uuid::Uuid;

        fn detector() -> AnomalyDetector {
            AnomalyDetector::new(MetricThresholds::default(), 120, 60, 300)
        }

        #[test]
        fn test_warning_alerts_and_critical_anomalies() {
            let d = detector();
            let metrics = SystemMetrics {
                cpu_percent: 85.0,
                disk_percent: 99.0,
                ..SystemMetrics::default()
            };
            let eval = d.observe_at(metrics, 0, Utc::now());
            assert_eq!(eval.alerts.len(), 1);
            assert_eq!(eval.alerts[0].metric, "cpu_percent");
            assert_eq!(eval.anomalies.len(), 1);
            let disk = &eval.anomalies[0];
            assert_eq!(disk.anomaly_type, AnomalyType::DiskExhaustion);
            assert_eq!(disk.severity, Severity::Critical);
            assert_eq!(disk.recommended_action, RecommendedAction::Cut);
        }

        #[test]
        fn test_identical_anomalies_cool_down() {
            let d = detector();
            let t0 = Utc::now();
            let hot = SystemMetrics {
                cpu_percent: 99.0,
                ..SystemMetrics::default()
            };
            assert_eq!(d.observe_at(hot.clone(), 0, t0).anomalies.len(), 1);
            assert!(d
                .observe_at(hot.clone(), 0, t0 + Duration::seconds(30))
                .anomalies
                .is_empty());
            assert_eq!(
                d.observe_at(hot, 0, t0 + Duration::seconds(61)).anomalies.len(),
                1
            );
        }

        #[test]
        fn test_memory_leak_needs_sustained_growth() {
            let d = detector();
            let t0 = Utc::now();
            let mut found = None;
            for i in 0..10 {
                let metrics = SystemMetrics {
                    process_memory_mb: 100.0 + i as f64 * 5.0,
                    ..SystemMetrics::default()
                };
                let eval = d.observe_at(metrics, 0, t0 + Duration::seconds(i));
                if let Some(a) = eval
                    .anomalies
                    .into_iter()
                    .find(|a| a.anomaly_type == AnomalyType::MemoryLeak)
                {
                    found = Some(a);
                }
            }
            let leak = found.expect("leak detected");
            assert_eq!(leak.metric, "process_memory_mb");
            assert_eq!(leak.recommended_action, RecommendedAction::Alert);

            // Flat memory is not a leak.
            let flat = detector();
            for i in 0..10 {
                let metrics = SystemMetrics {
                    process_memory_mb: 100.0 + (i % 2) as f64,
                    ..SystemMetrics::default()
                };
                let eval = flat.observe_at(metrics, 0, t0 + Duration::seconds(i));
                assert!(eval.anomalies.is_empty());
            }
        }

        #[test]
        fn test_loop_detected_after_max_repeats() {
            let d = detector();
            let plan = Uuid::new_v4();
            let t0 = Utc::now();
            for i in 0..10 {
                assert!(d
                    .record_action_at(plan, "api.fetch", t0 + Duration::seconds(i))
                    .is_none());
            }
            let anomaly = d
                .record_action_at(plan, "api.fetch", t0 + Duration::seconds(10))
                .expect("loop detected");
            assert_eq!(anomaly.anomaly_type, AnomalyType::Loop);
            assert_eq!(anomaly.plan_id, Some(plan));
            assert_eq!(anomaly.recommended_action, RecommendedAction::Cut);

            // Outside the window the count starts over.
            assert!(d
                .record_action_at(plan, "api.fetch", t0 + Duration::seconds(200))
                .is_none());
        }

        #[test]
        fn test_error_burst_and_timeout_cascade() {
            let d = detector();
            let metrics = SystemMetrics {
                errors_per_minute: 25,
                ..SystemMetrics::default()
            };
            let eval = d.observe_at(metrics, 3, Utc::now());
            let types: Vec<AnomalyType> = eval.anomalies.iter().map(|a| a.anomaly_type).collect();
            assert!(types.contains(&AnomalyType::ErrorBurst));
            assert!(types.contains(&AnomalyType::TimeoutCascade));
        }

        #[test]
        fn test_health_score() {
            let d = detector();
            let now = Utc::now();
            assert_eq!(d.health_score_at(&SystemMetrics::default(), now), 100);

            let busy = SystemMetrics {
                cpu_percent: 70.0,
                memory_percent: 60.0,
                disk_percent: 80.0,
                ..SystemMetrics::default()
            };
            // 100 - 10 - 5 - 10
            assert_eq!(d.health_score_at(&busy, now), 75);

            let anomaly = Anomaly::new(
                AnomalyType::SuspiciousPattern,
                Severity::High,
                "input",
                1.0,
                0.0,
                RecommendedAction::Alert,
                "suspicious",
            );
            assert!(d.admit_at(&anomaly, now));
            assert_eq!(d.health_score_at(&busy, now), 70);
            assert_eq!(d.health_score_at(&busy, now + Duration::seconds(301)), 75);
        }

        #[test]
        fn test_update_thresholds() {
            let d = detector();
            let metrics = SystemMetrics {
                cpu_percent: 50.0,
                ..SystemMetrics::default()
            };
            assert!(d.observe_at(metrics.clone(), 0, Utc::now()).alerts.is_empty());
            d.update_thresholds(MetricThresholds {
                cpu_warning: 40.0,
                ..MetricThresholds::default()
            });
            assert_eq!(d.thresholds().cpu_warning, 40.0);
            assert_eq!(d.observe_at(metrics, 0, Utc::now()).alerts.len(), 1);
        }
    }

    mod alerts {
        use aegis_aurora::*;
        use aegis_core::Severity;
        use chrono::{Duration, Utc};
        use uuid::Uuid;

        fn alert(metric: &str, severity: Severity) -> Alert {
            Alert {
                metric: metric.into(),
                value: 85.0,
                threshold: 80.0,
                severity,
                message: format!("{metric} above warning"),
            }
        }

        #[test]
        fn test_history_is_bounded_and_filtered() {
            let log = AlertLog::new(3);
            let first = log.record(alert("cpu_percent", Severity::Medium));
            log.record(alert("memory_percent", Severity::Medium));
            log.record(alert("disk_percent", Severity::High));
            log.record(alert("error_rate", Severity::Low));

            assert_eq!(log.len(), 3);
            assert!(!log.acknowledge(first, "ops"));
            let metrics: Vec<_> = log.history(10, None).into_iter().map(|r| r.alert.metric).collect();
            assert_eq!(metrics, vec!["memory_percent", "disk_percent", "error_rate"]);
            let latest = log.history(1, None);
            assert_eq!(latest[0].alert.metric, "error_rate");
            let serious = log.history(10, Some(Severity::Medium));
            assert_eq!(serious.len(), 2);

            log.set_capacity(1);
            assert_eq!(log.len(), 1);
            log.clear();
            assert!(log.is_empty());
        }

        #[test]
        fn test_acknowledge_once() {
            let log = AlertLog::new(10);
            let id = log.record(alert("cpu_percent", Severity::Medium));
            log.record(alert("cpu_percent", Severity::Medium));
            assert_eq!(log.unacknowledged().len(), 2);

            assert!(log.acknowledge(id, "ops"));
            assert!(!log.acknowledge(id, "ops"));
            assert!(!log.acknowledge(Uuid::new_v4(), "ops"));
            let open = log.unacknowledged();
            assert_eq!(open.len(), 1);
            assert_ne!(open[0].id, id);
            let acked = log.history(10, None).into_iter().find(|r| r.id == id).unwrap();
            assert_eq!(acked.acknowledged_by.as_deref(), Some("ops"));
        }

        #[test]
        fn test_summary_counts() {
            let log = AlertLog::new(10);
            let now = Utc::now();
            let old = log.record_at(alert("cpu_percent", Severity::Medium), now - Duration::hours(30));
            log.record_at(alert("cpu_percent", Severity::Medium), now);
            log.record_at(alert("disk_percent", Severity::High), now);
            log.acknowledge_at(old, "ops", now);

            let summary = log.summary_at(now);
            assert_eq!(summary.total, 3);
            assert_eq!(summary.unacknowledged, 2);
            assert_eq!(summary.last_24_hours, 2);
            assert_eq!(summary.by_severity["medium"], 2);
            assert_eq!(summary.by_severity["high"], 1);
            assert_eq!(summary.by_metric["cpu_percent"], 2);
        }
    }

    mod healer {
        use aegis_aurora::*;
        use aegis_config::{CircuitBreakerConfig, HealPolicy, HealerConfig};
        use aegis_core::*;
        use aegis_guard::CircuitBreakerRegistry;
        use async_trait::async_trait;
        use chrono::{Duration, Utc};
        use std::collections::BTreeMap;
        use std::sync::Arc;

        struct Broken;

        #[async_trait]
        impl HealAction for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            async fn run(&self, _anomaly: &Anomaly) -> aegis_core::Result<String> {
                Err(AegisError::Other(anyhow::anyhow!("nothing to release")))
            }
        }

        fn anomaly(anomaly_type: AnomalyType) -> Anomaly {
            Anomaly::new(
                anomaly_type,
                Severity::High,
                "errors_per_minute",
                30.0,
                20.0,
                RecommendedAction::Pause,
                "burst",
            )
        }

        #[tokio::test]
        async fn test_reset_circuits_heals_error_burst() {
            let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
            circuits.open_circuit("api", "down");
            let bus = EventBus::default();
            let mut rx = bus.subscribe();
            let healer = AutoHealer::new(&HealerConfig::default(), bus);
            healer.register_action(Arc::new(ResetCircuits::new(circuits.clone())));

            let t0 = Utc::now();
            let outcome = healer
                .attempt_auto_heal_at(&anomaly(AnomalyType::ErrorBurst), t0)
                .await
                .expect("policy applies");
            assert!(outcome.success);
            assert_eq!(outcome.actions, vec!["reset_circuits".to_string()]);
            assert_eq!(circuits.state("api"), CircuitState::Closed);
            assert_eq!(super::drain(&mut rx), vec!["AUTO_HEAL"]);

            // Cooling down.
            assert!(healer
                .attempt_auto_heal_at(&anomaly(AnomalyType::ErrorBurst), t0 + Duration::seconds(10))
                .await
                .is_none());
            assert!(healer
                .attempt_auto_heal_at(&anomaly(AnomalyType::ErrorBurst), t0 + Duration::seconds(301))
                .await
                .is_some());
        }

        #[tokio::test]
        async fn test_no_policy_means_no_attempt() {
            let healer = AutoHealer::new(&HealerConfig::default(), EventBus::default());
            assert!(!healer.can_heal(AnomalyType::Loop));
            assert!(healer
                .attempt_auto_heal(&anomaly(AnomalyType::Loop))
                .await
                .is_none());
        }

        #[tokio::test]
        async fn test_failed_attempts_are_capped() {
            let mut policies = BTreeMap::new();
            policies.insert(
                "memory_leak".to_string(),
                HealPolicy {
                    actions: vec!["broken".into()],
                    cooldown_secs: 10,
                    max_attempts: 2,
                },
            );
            let healer = AutoHealer::new(
                &HealerConfig {
                    enabled: true,
                    policies,
                },
                EventBus::default(),
            );
            healer.register_action(Arc::new(Broken));

            let leak = anomaly(AnomalyType::MemoryLeak);
            let t0 = Utc::now();
            let first = healer.attempt_auto_heal_at(&leak, t0).await.unwrap();
            assert!(!first.success);
            assert!(first.message.contains("nothing to release"));
            assert!(healer
                .attempt_auto_heal_at(&leak, t0 + Duration::seconds(11))
                .await
                .is_some());
            assert!(healer
                .attempt_auto_heal_at(&leak, t0 + Duration::seconds(22))
                .await
                .is_none());

            healer.reset();
            assert!(healer
                .attempt_auto_heal_at(&leak, t0 + Duration::seconds(33))
                .await
                .is_some());
            assert_eq!(healer.history().len(), 3);
        }

        #[tokio::test]
        async fn test_unregistered_actions_are_skipped() {
            let healer = AutoHealer::new(&HealerConfig::default(), EventBus::default());
            let outcome = healer
                .attempt_auto_heal(&anomaly(AnomalyType::TimeoutCascade))
                .await
                .unwrap();
            assert!(!outcome.success);
            assert!(outcome.actions.is_empty());
        }
    }

    mod monitor {
        use aegis_aurora::*;
        use aegis_config::{AegisConfig, CircuitBreakerConfig};
        use aegis_core::*;
        use aegis_guard::{CheckpointManager, CircuitBreakerRegistry};
        use std::sync::Arc;
        use tokio_util::sync::CancellationToken;
        use uuid::Uuid;

        fn aurora(collector: Arc<StaticCollector>) -> (Aurora, EventBus) {
            let bus = EventBus::default();
            let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
            let aurora = Aurora::new(&AegisConfig::default(), circuits, bus.clone())
                .with_collector(collector);
            (aurora, bus)
        }

        #[tokio::test]
        async fn test_sample_publishes_health() {
            let (aurora, bus) = aurora(Arc::new(StaticCollector::default()));
            let mut rx = bus.subscribe();
            let sample = aurora.sample_once().await.unwrap();
            assert_eq!(sample.health_score, 100);
            assert!(sample.anomalies.is_empty());
            assert_eq!(aurora.health_score(), 100);
            assert_eq!(super::drain(&mut rx), vec!["HEALTH"]);
        }

        #[tokio::test]
        async fn test_execution_stats_flow_into_samples() {
            let (aurora, _bus) = aurora(Arc::new(StaticCollector::default()));
            aurora.stats().execution_queued();
            aurora.stats().execution_started();
            aurora.stats().record_dispatch("api", false, 12.0);
            aurora.stats().record_dispatch("api", true, 12.0);
            let sample = aurora.sample_once().await.unwrap();
            assert_eq!(sample.metrics.active_executions, 1);
            assert!((sample.metrics.error_rate - 0.5).abs() < 1e-9);
            assert!(sample.metrics.channels.contains_key("api"));
        }

        #[tokio::test]
        async fn test_published_alerts_are_kept_for_acknowledgement() {
            let collector = Arc::new(StaticCollector::new(SystemMetrics {
                cpu_percent: 85.0,
                ..SystemMetrics::default()
            }));
            let (aurora, bus) = aurora(collector);
            let mut rx = bus.subscribe();
            let sample = aurora.sample_once().await.unwrap();
            assert_eq!(sample.alerts.len(), 1);
            assert!(super::drain(&mut rx).contains(&"ALERT"));

            let open = aurora.alerts().unacknowledged();
            assert_eq!(open.len(), 1);
            assert_eq!(open[0].alert.metric, "cpu_percent");
            assert!(aurora.alerts().acknowledge(open[0].id, "ops"));
            assert_eq!(aurora.alerts().summary().unacknowledged, 0);

            let mut config = AegisConfig::default();
            config.monitor.alert_history_size = 0;
            aurora.apply_config(&config);
            assert_eq!(aurora.alerts().len(), 1);
        }

        #[tokio::test]
        async fn test_critical_cpu_pauses_tracked_executions() {
            let collector = Arc::new(StaticCollector::new(SystemMetrics {
                cpu_percent: 99.0,
                ..SystemMetrics::default()
            }));
            let (aurora, bus) = aurora(collector);
            let mut rx = bus.subscribe();
            let plan_id = Uuid::new_v4();
            aurora.track_execution(plan_id, "demo");

            let sample = aurora.sample_once().await.unwrap();
            assert_eq!(sample.anomalies.len(), 1);
            assert!(matches!(
                aurora.peek_signal(plan_id),
                Some(ControlSignal::Pause { .. })
            ));
            let names = super::drain(&mut rx);
            assert!(names.contains(&"ANOMALY"));
            assert!(names.contains(&"PAUSE"));

            aurora.resume(plan_id, "operator resumed");
            assert!(aurora.take_signal(plan_id).is_none());
            assert!(super::drain(&mut rx).contains(&"RESUME"));
        }

        #[tokio::test]
        async fn test_disk_exhaustion_cuts() {
            let collector = Arc::new(StaticCollector::new(SystemMetrics {
                disk_percent: 99.5,
                ..SystemMetrics::default()
            }));
            let (aurora, _bus) = aurora(collector);
            let plan_id = Uuid::new_v4();
            aurora.track_execution(plan_id, "demo");
            aurora.sample_once().await.unwrap();
            assert!(matches!(
                aurora.take_signal(plan_id),
                Some(ControlSignal::Cut { .. })
            ));
            assert!(aurora.take_signal(plan_id).is_none());
        }

        #[tokio::test]
        async fn test_resume_keeps_pending_cut() {
            let (aurora, bus) = aurora(Arc::new(StaticCollector::default()));
            let mut rx = bus.subscribe();
            let plan_id = Uuid::new_v4();
            aurora.pause(plan_id, "cpu high");
            aurora.cut(plan_id, "error burst");
            aurora.resume(plan_id, "operator resumed");

            assert!(super::drain(&mut rx).contains(&"RESUME"));
            assert!(matches!(
                aurora.take_signal(plan_id),
                Some(ControlSignal::Cut { reason }) if reason == "error burst"
            ));
            assert!(aurora.take_signal(plan_id).is_none());
        }

        #[tokio::test]
        async fn test_loop_cuts_only_its_plan() {
            let (aurora, _bus) = aurora(Arc::new(StaticCollector::default()));
            let looping = Uuid::new_v4();
            let other = Uuid::new_v4();
            aurora.track_execution(looping, "loop");
            aurora.track_execution(other, "other");
            for _ in 0..10 {
                assert!(aurora.record_action(looping, "api.poll").await.is_none());
            }
            let anomaly = aurora.record_action(looping, "api.poll").await.unwrap();
            assert_eq!(anomaly.anomaly_type, AnomalyType::Loop);
            assert!(matches!(
                aurora.peek_signal(looping),
                Some(ControlSignal::Cut { .. })
            ));
            assert!(aurora.peek_signal(other).is_none());

            aurora.untrack_execution(looping);
            assert!(aurora.peek_signal(looping).is_none());
        }

        #[tokio::test]
        async fn test_report_limit_publishes_limit() {
            let (aurora, bus) = aurora(Arc::new(StaticCollector::default()));
            let mut rx = bus.subscribe();
            let err = AegisError::LimitExceeded {
                resource: "files_changed".into(),
                used: 6.0,
                limit: 5.0,
            };
            aurora.report_limit(Some(Uuid::new_v4()), &err);
            assert_eq!(super::drain(&mut rx), vec!["LIMIT"]);
        }

        #[tokio::test]
        async fn test_update_thresholds_and_monitor_loop() {
            let checkpoints = CheckpointManager::in_memory(60);
            let (aurora, bus) = aurora(Arc::new(StaticCollector::default()));
            let aurora = aurora.with_checkpoints(checkpoints).shared();
            let mut config = AegisConfig::default();
            config.thresholds.cpu_warning = 10.0;
            aurora.apply_config(&config);
            assert_eq!(aurora.thresholds().cpu_warning, 10.0);

            let mut rx = bus.subscribe();
            let cancel = CancellationToken::new();
            let handle = aurora.start_monitoring(cancel.clone());
            // First interval tick fires immediately.
            let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.name(), "HEALTH");
            cancel.cancel();
            handle.await.unwrap();
        }
    }
}
