use aegis_config::AuthorizationConfig;
use aegis_core::{
    AegisError, AuthorizationRequest, AuthorizationResponse, Decision, ExecutionPlan, RiskFactor,
    SemaphoreLevel,
};
use aegis_guard::CircuitBreakerRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::scorer::{DefaultRiskScorer, RiskScorer, ScoringContext};

/// A `requires_confirmation` decision waiting for a human answer.
struct PendingConfirmation {
    response: AuthorizationResponse,
    expires_at: DateTime<Utc>,
    waiters: Vec<oneshot::Sender<AuthorizationResponse>>,
}

/// Risk-scores plans and settles confirmation requests.
///
/// The decision is a pure function of the semaphore level unless a rule
/// fires: a blocked target always blocks, and a confirmation-required
/// operation lifts an allowed or limited plan to `requires_confirmation`.
pub struct AuthorizationGate {
    config: RwLock<AuthorizationConfig>,
    scorer: RwLock<Arc<dyn RiskScorer>>,
    circuits: Arc<CircuitBreakerRegistry>,
    pending: DashMap<Uuid, PendingConfirmation>,
}

impl AuthorizationGate {
    pub fn new(config: &AuthorizationConfig, circuits: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            config: RwLock::new(config.clone()),
            scorer: RwLock::new(Arc::new(DefaultRiskScorer::new(config))),
            circuits,
            pending: DashMap::new(),
        }
    }

    /// Replace the risk scorer.
    pub fn set_scorer(&self, scorer: Arc<dyn RiskScorer>) {
        *self.scorer.write() = scorer;
    }

    /// Swap in new settings; the default scorer is rebuilt from them.
    pub fn update_config(&self, config: &AuthorizationConfig) {
        *self.config.write() = config.clone();
        *self.scorer.write() = Arc::new(DefaultRiskScorer::new(config));
    }

    pub fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationResponse {
        self.authorize_at(request, Utc::now())
    }

    pub fn authorize_at(
        &self,
        request: &AuthorizationRequest,
        now: DateTime<Utc>,
    ) -> AuthorizationResponse {
        let config = self.config.read().clone();
        let scorer = self.scorer.read().clone();

        let ctx = ScoringContext {
            circuit_states: dispatched_targets(&request.plan)
                .into_iter()
                .map(|t| {
                    let state = self.circuits.state(&t);
                    (t, state)
                })
                .collect(),
        };
        let factors = scorer.factors(request, &ctx);
        let risk_score = scorer.score(&factors);
        let level = SemaphoreLevel::from_score(risk_score);
        let mut decision = Decision::from_level(level);
        let mut rules = Vec::new();

        // ── Rules ───
        let blocked: Vec<String> = dispatched_targets(&request.plan)
            .into_iter()
            .filter(|t| config.blocked_targets.iter().any(|b| b == t))
            .collect();
        for target in &blocked {
            rules.push(format!("blocked_target:{target}"));
        }
        let confirm_ops = confirmation_operations(&request.plan, &config);
        for op in &confirm_ops {
            rules.push(format!("confirmation_required:{op}"));
        }
        if !blocked.is_empty() {
            decision = Decision::Blocked;
        } else if !confirm_ops.is_empty() && decision.permits_execution() {
            decision = Decision::RequiresConfirmation;
        }

        let limits = match decision {
            Decision::Allowed => request.suggested_limits.clone(),
            _ => request.suggested_limits.tightened(),
        };
        if decision == Decision::Limited {
            rules.push("limits_tightened".into());
        }

        let reason = summarize(&factors, &rules);
        let mut response = AuthorizationResponse {
            request_id: request.id,
            plan_id: request.plan.id,
            decision,
            risk_score,
            level,
            factors,
            limits,
            rules,
            reason: None,
            message: None,
            confirmation_prompt: None,
            valid_for_ms: config.ttl_ms,
            issued_at: now,
        };

        match decision {
            Decision::Blocked => {
                response.message = Some(format!(
                    "Plan '{}' was blocked (risk {risk_score}, {level}): {reason}",
                    request.plan.description
                ));
                response.reason = Some(reason);
            }
            Decision::RequiresConfirmation => {
                response.valid_for_ms = config.confirmation_ttl_ms;
                response.confirmation_prompt = Some(format!(
                    "Plan '{}' scored {risk_score} ({level}): {reason}. Approve execution?",
                    request.plan.description
                ));
                response.message = Some("Execution is waiting for confirmation".into());
                response.reason = Some(reason);
                self.pending.insert(
                    request.id,
                    PendingConfirmation {
                        response: response.clone(),
                        expires_at: response.expires_at(),
                        waiters: Vec::new(),
                    },
                );
            }
            Decision::Limited => {
                response.message = Some("Execution allowed with tightened limits".into());
                response.reason = Some(reason);
            }
            Decision::Allowed => {}
        }

        info!(
            request_id = %request.id,
            plan_id = %request.plan.id,
            risk_score,
            level = %level,
            decision = %decision,
            "authorization decided"
        );
        response
    }

    /// Settle a pending confirmation.
    pub fn confirm_authorization(
        &self,
        request_id: Uuid,
        approved: bool,
    ) -> aegis_core::Result<AuthorizationResponse> {
        self.confirm_authorization_at(request_id, approved, Utc::now())
    }

    pub fn confirm_authorization_at(
        &self,
        request_id: Uuid,
        approved: bool,
        now: DateTime<Utc>,
    ) -> aegis_core::Result<AuthorizationResponse> {
        let (_, pending) = self
            .pending
            .remove(&request_id)
            .ok_or(AegisError::AuthorizationNotPending(request_id))?;
        let ttl_ms = self.config.read().ttl_ms;

        let response = if now >= pending.expires_at {
            expired(pending.response, now)
        } else if approved {
            let mut response = pending.response;
            response.decision = Decision::Allowed;
            response.rules.push("confirmed".into());
            response.message = Some("Execution approved".into());
            response.confirmation_prompt = None;
            response.valid_for_ms = ttl_ms;
            response.issued_at = now;
            response
        } else {
            let mut response = pending.response;
            response.decision = Decision::Blocked;
            response.rules.push("confirmation_denied".into());
            response.reason = Some("confirmation denied".into());
            response.message = Some("Execution was not approved".into());
            response.confirmation_prompt = None;
            response.issued_at = now;
            response
        };

        info!(
            request_id = %request_id,
            approved,
            decision = %response.decision,
            "confirmation settled"
        );
        for waiter in pending.waiters {
            let _ = waiter.send(response.clone());
        }
        Ok(response)
    }

    /// Wait for a pending confirmation to be answered. Unanswered requests
    /// expire to `blocked` once their TTL lapses.
    pub async fn await_confirmation(
        &self,
        request_id: Uuid,
    ) -> aegis_core::Result<AuthorizationResponse> {
        let (rx, expires_at) = {
            let mut entry = self
                .pending
                .get_mut(&request_id)
                .ok_or(AegisError::AuthorizationNotPending(request_id))?;
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            (rx, entry.expires_at)
        };

        let wait = (expires_at - Utc::now()).to_std().unwrap_or_default();
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Settled without a reply, or the TTL ran out.
            _ => match self.pending.remove(&request_id) {
                Some((_, pending)) => {
                    warn!(request_id = %request_id, "confirmation expired");
                    let response = expired(pending.response, Utc::now());
                    for waiter in pending.waiters {
                        let _ = waiter.send(response.clone());
                    }
                    Ok(response)
                }
                None => Err(AegisError::AuthorizationNotPending(request_id)),
            },
        }
    }

    /// Expire every confirmation whose TTL has lapsed; returns how many.
    pub fn expire_pending_at(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|e| now >= e.expires_at)
            .map(|e| *e.key())
            .collect();
        let mut expired_count = 0;
        for id in stale {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let response = expired(pending.response, now);
                for waiter in pending.waiters {
                    let _ = waiter.send(response.clone());
                }
                expired_count += 1;
            }
        }
        expired_count
    }

    pub fn is_pending(&self, request_id: Uuid) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn pending_requests(&self) -> Vec<AuthorizationResponse> {
        self.pending.iter().map(|e| e.response.clone()).collect()
    }
}

fn expired(mut response: AuthorizationResponse, now: DateTime<Utc>) -> AuthorizationResponse {
    response.decision = Decision::Blocked;
    response.rules.push("confirmation_expired".into());
    response.reason = Some("confirmation expired".into());
    response.message = Some("No answer before the confirmation expired".into());
    response.confirmation_prompt = None;
    response.issued_at = now;
    response
}

/// Distinct targets of dispatching steps, in plan order.
fn dispatched_targets(plan: &ExecutionPlan) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for step in plan.steps.iter().filter(|s| s.action.dispatches()) {
        if !targets.contains(&step.target) {
            targets.push(step.target.clone());
        }
    }
    targets
}

/// Confirmation-required operations named by the plan, as `target.method`.
fn confirmation_operations(plan: &ExecutionPlan, config: &AuthorizationConfig) -> Vec<String> {
    plan.steps
        .iter()
        .filter(|s| s.action.dispatches())
        .filter(|s| {
            let qualified = format!("{}.{}", s.target, s.method);
            config
                .confirmation_required_operations
                .iter()
                .any(|op| *op == qualified || *op == s.method)
        })
        .map(|s| format!("{}.{}", s.target, s.method))
        .collect()
}

fn summarize(factors: &[RiskFactor], rules: &[String]) -> String {
    let mut ranked: Vec<&RiskFactor> = factors.iter().filter(|f| f.score > 0).collect();
    ranked.sort_by(|a, b| b.contribution().total_cmp(&a.contribution()));
    let mut parts: Vec<String> = ranked
        .iter()
        .take(3)
        .map(|f| f.description.clone())
        .collect();
    parts.extend(rules.iter().filter(|r| *r != "limits_tightened").cloned());
    parts.join("; ")
}
