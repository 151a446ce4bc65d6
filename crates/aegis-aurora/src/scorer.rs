use aegis_config::AuthorizationConfig;
use aegis_core::{AuthorizationRequest, CircuitState, RiskFactor};
use regex::Regex;
use tracing::warn;

/// What a scorer sees besides the request itself.
#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    /// Breaker state of every target the plan dispatches to.
    pub circuit_states: Vec<(String, CircuitState)>,
}

/// Turns an authorization request into named risk factors and a 0-100 score.
pub trait RiskScorer: Send + Sync {
    fn factors(&self, request: &AuthorizationRequest, ctx: &ScoringContext) -> Vec<RiskFactor>;

    /// Additive and saturating: `Σ score × weight`, clamped to 0-100.
    fn score(&self, factors: &[RiskFactor]) -> u8 {
        let total: f64 = factors.iter().map(RiskFactor::contribution).sum();
        total.round().clamp(0.0, 100.0) as u8
    }
}

/// Weighted-factor scorer seeded from `[authorization]`.
pub struct DefaultRiskScorer {
    config: AuthorizationConfig,
    sensitive: Vec<Regex>,
}

impl DefaultRiskScorer {
    pub fn new(config: &AuthorizationConfig) -> Self {
        let sensitive = config
            .sensitive_file_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid sensitive file pattern");
                    None
                }
            })
            .collect();
        Self {
            config: config.clone(),
            sensitive,
        }
    }

    /// Manifest paths matching any sensitive pattern.
    pub fn sensitive_paths<'a>(&self, request: &'a AuthorizationRequest) -> Vec<&'a String> {
        request
            .manifest
            .paths()
            .filter(|p| self.sensitive.iter().any(|re| re.is_match(p)))
            .collect()
    }
}

impl RiskScorer for DefaultRiskScorer {
    fn factors(&self, request: &AuthorizationRequest, ctx: &ScoringContext) -> Vec<RiskFactor> {
        let w = &self.config.weights;
        let plan = &request.plan;
        let mut factors = vec![RiskFactor::new(
            "base",
            request.risk_level.base_score(),
            w.base,
            format!("plan compiled at {} risk", request.risk_level),
        )];

        // ── Destructive steps ───
        let destructive: Vec<_> = plan
            .steps
            .iter()
            .filter(|s| s.is_destructive(&self.config.destructive_patterns))
            .collect();
        if !destructive.is_empty() {
            let irreversible = destructive.iter().filter(|s| !s.reversible).count();
            let score = if irreversible > 0 { 100 } else { 60 };
            let ids: Vec<&str> = destructive.iter().map(|s| s.id.as_str()).collect();
            let mut factor = RiskFactor::new(
                "destructive",
                score,
                w.destructive,
                format!("destructive steps: {}", ids.join(", ")),
            );
            if irreversible == 0 {
                factor = factor.with_mitigation("every destructive step declares a rollback");
            }
            factors.push(factor);
        }

        // ── Sensitive files ───
        let sensitive = self.sensitive_paths(request);
        if !sensitive.is_empty() {
            let score = (60 + 20 * (sensitive.len() as u32 - 1)).min(100) as u8;
            let shown: Vec<&str> = sensitive.iter().take(3).map(|p| p.as_str()).collect();
            factors.push(RiskFactor::new(
                "sensitive_files",
                score,
                w.sensitive_files,
                format!("touches sensitive paths: {}", shown.join(", ")),
            ));
        }

        // ── File count ───
        let files = request.manifest.file_count() as u32;
        let max_files = self.config.max_files_before_confirmation;
        if files > max_files {
            let score = (50 + (files - max_files) * 5).min(100) as u8;
            factors.push(
                RiskFactor::new(
                    "file_count",
                    score,
                    w.file_count,
                    format!("{files} files exceed the {max_files} file threshold"),
                )
                .with_mitigation("split the plan into smaller batches"),
            );
        }

        // ── Production ───
        if self.config.production && request.mode.has_side_effects() {
            factors.push(RiskFactor::new(
                "production",
                100,
                w.production,
                "runs against the production environment",
            ));
        }

        // ── Circuit state ───
        if let Some((target, state)) = ctx
            .circuit_states
            .iter()
            .max_by_key(|(_, state)| state.risk_score())
            .filter(|(_, state)| *state != CircuitState::Closed)
        {
            factors.push(
                RiskFactor::new(
                    "circuit",
                    state.risk_score(),
                    w.circuit,
                    format!("circuit for '{target}' is {state}"),
                )
                .with_mitigation("wait for the circuit to close"),
            );
        }

        // ── External reach ───
        let external = request.manifest.external_apis.len() + request.manifest.urls.len();
        if external > 0 {
            let score = (40 + 10 * (external as u32 - 1)).min(100) as u8;
            factors.push(RiskFactor::new(
                "external",
                score,
                w.external,
                format!("{external} external endpoints"),
            ));
        }

        factors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{ExecutionPlan, ExecutionStep, RiskLevel};

    #[test]
    fn test_score_saturates_at_100() {
        let scorer = DefaultRiskScorer::new(&AuthorizationConfig::default());
        let factors = vec![
            RiskFactor::new("a", 100, 0.8, ""),
            RiskFactor::new("b", 100, 0.8, ""),
        ];
        assert_eq!(scorer.score(&factors), 100);
        assert_eq!(scorer.score(&[]), 0);
    }

    #[test]
    fn test_reversible_destructive_scores_lower() {
        let scorer = DefaultRiskScorer::new(&AuthorizationConfig::default());
        let plain = ExecutionPlan::new("x", vec![ExecutionStep::skill("a", "files", "delete")])
            .with_risk(RiskLevel::Low);
        let request = AuthorizationRequest::for_plan(&plain);
        let factors = scorer.factors(&request, &ScoringContext::default());
        let destructive = factors.iter().find(|f| f.name == "destructive").unwrap();
        assert_eq!(destructive.score, 100);

        let undoable = ExecutionPlan::new(
            "x",
            vec![ExecutionStep::skill("a", "files", "delete").reversible_with(
                aegis_core::RollbackCommand {
                    target: "files".into(),
                    method: "restore".into(),
                    params: serde_json::Value::Null,
                },
            )],
        );
        let request = AuthorizationRequest::for_plan(&undoable);
        let factors = scorer.factors(&request, &ScoringContext::default());
        let destructive = factors.iter().find(|f| f.name == "destructive").unwrap();
        assert_eq!(destructive.score, 60);
        assert!(destructive.mitigation.is_some());
    }
}
