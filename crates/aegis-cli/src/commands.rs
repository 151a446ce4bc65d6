use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use aegis_aurora::{Aurora, MonitorSample};
use aegis_config::{AegisConfig, ConfigLoader, WarningSeverity};
use aegis_core::{AegisError, AuthorizationRequest, EventBus, ExecutionPlan};
use aegis_guard::{
    CheckpointManager, CircuitBreakerRegistry, GuardrailValidator, SqliteCheckpointStore,
};

/// 🛡️ Aegis: execution safety control plane
#[derive(Parser)]
#[command(name = "aegis", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to aegis.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and report warnings
    Check,
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scan text with the guardrail validator
    Scan {
        /// Text to scan
        input: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sample host metrics once and evaluate them against the thresholds
    Metrics {
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Keep sampling every N seconds and apply config file edits live
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// Score an execution plan read from a JSON file
    Authorize {
        /// Path to a JSON-encoded execution plan
        plan: PathBuf,
        /// Output the full authorization response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect the SQLite checkpoint store
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored checkpoints
    List {
        /// Only checkpoints of this plan
        #[arg(long)]
        plan: Option<String>,
        /// Database path (defaults to checkpoint.db_path)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Delete expired checkpoints
    Purge {
        /// Database path (defaults to checkpoint.db_path)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn run(self) -> aegis_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(config.logging.level.as_str())
        };
        init_tracing(&config.logging.format, log_level);

        match self.command {
            Commands::Check => Self::cmd_check(&config, config_loader.path()),
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Scan { input, json } => Self::cmd_scan(&config, &input, json),
            Commands::Metrics { json, watch: None } => Self::cmd_metrics(&config, json).await,
            Commands::Metrics {
                json,
                watch: Some(secs),
            } => Self::cmd_metrics_watch(&config_loader, json, secs).await,
            Commands::Authorize { plan, json } => Self::cmd_authorize(&config, &plan, json),
            Commands::Checkpoints { action } => match action {
                CheckpointAction::List { plan, db } => {
                    Self::cmd_checkpoints_list(&config, db.as_deref(), plan.as_deref())
                }
                CheckpointAction::Purge { db } => Self::cmd_checkpoints_purge(&config, db.as_deref()),
            },
        }
    }

    fn cmd_check(config: &AegisConfig, path: &Path) -> aegis_core::Result<()> {
        println!("🩺 Aegis Check: {}", path.display());
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{}", e);
                return Err(AegisError::Config("configuration has errors".into()));
            }
        };

        let mut warn_count = 0;
        let mut info_count = 0;
        for w in &warnings {
            println!("  {}", w);
            match w.severity {
                WarningSeverity::Warning => warn_count += 1,
                WarningSeverity::Info => info_count += 1,
                WarningSeverity::Error => {}
            }
        }

        if config.authorization.blocked_targets.is_empty() {
            println!("  💡 authorization.blocked_targets: nothing is blocked outright");
            info_count += 1;
        }
        if config.checkpoint.backend == "memory" {
            println!("  💡 checkpoint.backend: memory checkpoints do not survive a restart");
            info_count += 1;
        }

        println!();
        println!(
            "  ✅ configuration valid, ⚠️  {} warnings, 💡 {} suggestions",
            warn_count, info_count
        );
        Ok(())
    }

    fn cmd_config(config: &AegisConfig, json: bool) -> aegis_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            let rendered =
                toml::to_string_pretty(config).map_err(|e| AegisError::Config(e.to_string()))?;
            println!("{}", rendered);
        }
        Ok(())
    }

    fn cmd_scan(config: &AegisConfig, input: &str, json: bool) -> aegis_core::Result<()> {
        let validator = GuardrailValidator::new(&config.guardrail);
        let report = validator.validate_input(input);

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        if report.is_valid {
            println!("✅ clean ({} rules)", validator.rule_count());
            return Ok(());
        }
        println!("🚫 {} violation(s):", report.violations.len());
        for v in &report.violations {
            println!("  [{}] {} ({}): {}", v.severity, v.category, v.rule, v.fragment);
        }
        Ok(())
    }

    async fn cmd_metrics(config: &AegisConfig, json: bool) -> aegis_core::Result<()> {
        let aurora = standalone_aurora(config);
        let sample = aurora.sample_once().await?;
        print_sample(&sample, json)
    }

    /// Sample until Ctrl-C. Thresholds follow edits to the config file.
    async fn cmd_metrics_watch(
        config_loader: &ConfigLoader,
        json: bool,
        secs: u64,
    ) -> aegis_core::Result<()> {
        let aurora = standalone_aurora(&config_loader.get());

        // Kept alive for the duration of the loop
        let reload_target = Arc::clone(&aurora);
        let _watcher = match config_loader.watch(move |config| reload_target.apply_config(config)) {
            Ok(w) => {
                println!("   Config hot-reload: enabled");
                Some(w)
            }
            Err(e) => {
                warn!(error = %e, "config hot-reload disabled");
                None
            }
        };

        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sample = aurora.sample_once().await?;
                    print_sample(&sample, json)?;
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("👋 Stopped sampling");
                    return Ok(());
                }
            }
        }
    }

    fn cmd_authorize(config: &AegisConfig, path: &Path, json: bool) -> aegis_core::Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let plan: ExecutionPlan = serde_json::from_str(&raw)?;
        let aurora = standalone_aurora(config);
        let response = aurora.authorize(&AuthorizationRequest::for_plan(&plan));

        if json {
            println!("{}", serde_json::to_string_pretty(&response)?);
            return Ok(());
        }

        println!(
            "🚦 {}, score {} ({}), plan risk {}",
            response.decision, response.risk_score, response.level, plan.risk_level
        );
        for factor in &response.factors {
            println!(
                "   {:<22} {:>3} × {:.2} = {:>5.1}  {}",
                factor.name,
                factor.score,
                factor.weight,
                factor.contribution(),
                factor.description
            );
        }
        for rule in &response.rules {
            println!("   rule: {}", rule);
        }
        if let Some(ref message) = response.message {
            println!("   {}", message);
        }
        if let Some(ref prompt) = response.confirmation_prompt {
            println!("   ❓ {}", prompt);
        }
        let l = &response.limits;
        println!(
            "   limits: {} actions/s, {} processes, {} retries, {} ms",
            l.actions_per_second, l.max_processes, l.max_retries_per_step, l.max_duration_ms
        );
        Ok(())
    }

    fn cmd_checkpoints_list(
        config: &AegisConfig,
        db: Option<&Path>,
        plan: Option<&str>,
    ) -> aegis_core::Result<()> {
        let manager = sqlite_checkpoints(config, db)?;
        let mut checkpoints = match plan {
            Some(raw) => {
                let plan_id: uuid::Uuid = raw
                    .parse()
                    .map_err(|e| AegisError::Config(format!("invalid plan id '{raw}': {e}")))?;
                manager
                    .list()?
                    .into_iter()
                    .filter(|cp| cp.plan_id == plan_id)
                    .collect()
            }
            None => manager.list()?,
        };
        checkpoints.sort_by_key(|cp| cp.created_at);

        if checkpoints.is_empty() {
            println!("No checkpoints stored.");
            return Ok(());
        }
        println!("💾 Checkpoints ({}):", checkpoints.len());
        for cp in &checkpoints {
            let expired = if cp.is_expired() { " (expired)" } else { "" };
            println!(
                "  {}  plan {}  {}  {} done, next {}{}",
                cp.id,
                cp.plan_id,
                cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                cp.completed_steps.len(),
                cp.current_step.as_deref().unwrap_or("-"),
                expired
            );
            println!("      {}", cp.reason);
        }
        Ok(())
    }

    fn cmd_checkpoints_purge(config: &AegisConfig, db: Option<&Path>) -> aegis_core::Result<()> {
        let manager = sqlite_checkpoints(config, db)?;
        let purged = manager.purge_expired()?;
        println!("🧹 Purged {} expired checkpoint(s)", purged);
        Ok(())
    }
}

fn init_tracing(format: &str, level: &str) {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    match format {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init(),
    }
}

fn print_sample(sample: &MonitorSample, json: bool) -> aegis_core::Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "metrics": sample.metrics,
                "health_score": sample.health_score,
                "alerts": sample.alerts.iter().map(|a| serde_json::json!({
                    "metric": a.metric,
                    "value": a.value,
                    "threshold": a.threshold,
                    "severity": a.severity,
                    "message": a.message,
                })).collect::<Vec<_>>(),
                "anomalies": sample.anomalies,
            }))?
        );
        return Ok(());
    }

    let m = &sample.metrics;
    println!("📈 Health score: {}/100", sample.health_score);
    println!("   cpu        {:>6.1}%", m.cpu_percent);
    println!("   memory     {:>6.1}%", m.memory_percent);
    println!("   disk       {:>6.1}%", m.disk_percent);
    println!("   process    {:>6.1} MB", m.process_memory_mb);
    for alert in &sample.alerts {
        println!("  ⚠️  [{}] {}", alert.severity, alert.message);
    }
    for anomaly in &sample.anomalies {
        println!(
            "  🚨 [{}] {}: {} (recommended: {})",
            anomaly.severity, anomaly.anomaly_type, anomaly.message, anomaly.recommended_action
        );
    }
    Ok(())
}

/// Aurora with its own breaker registry and event bus, for one-shot commands.
fn standalone_aurora(config: &AegisConfig) -> Arc<Aurora> {
    let events = EventBus::new(64);
    let circuits = CircuitBreakerRegistry::new(config.circuit_breaker.clone())
        .with_events(events.clone())
        .shared();
    Aurora::new(config, circuits, events).shared()
}

fn sqlite_checkpoints(config: &AegisConfig, db: Option<&Path>) -> aegis_core::Result<CheckpointManager> {
    let path = db
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.checkpoint.resolved_db_path());
    if !path.exists() {
        return Err(AegisError::Config(format!(
            "no checkpoint database at {}",
            path.display()
        )));
    }
    debug!(path = %path.display(), "opening checkpoint database");
    let store = SqliteCheckpointStore::open(&path)?;
    Ok(CheckpointManager::new(Arc::new(store), config.checkpoint.ttl_secs))
}
