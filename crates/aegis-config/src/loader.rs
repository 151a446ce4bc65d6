use aegis_core::AegisError;
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::AegisConfig;

/// Loads and optionally hot-reloads the Aegis configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<AegisConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > AEGIS_CONFIG env > ~/.aegis/aegis.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("AEGIS_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aegis")
            .join("aegis.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> aegis_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            AegisConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        // Validate config: log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(AegisError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file behind it).
    pub fn from_config(config: AegisConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        }
    }

    /// Parse a TOML document.
    pub fn parse(raw: &str) -> aegis_core::Result<AegisConfig> {
        toml::from_str::<AegisConfig>(raw)
            .map_err(|e| AegisError::Config(format!("failed to parse config: {}", e)))
    }

    fn read(path: &Path) -> aegis_core::Result<AegisConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<AegisConfig>(&raw).map_err(|e| {
            AegisError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> AegisConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<AegisConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (AEGIS_LOG_LEVEL, AEGIS_PRODUCTION, ...).
    pub fn apply_env_overrides(config: AegisConfig) -> AegisConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(
        mut config: AegisConfig,
        var: impl Fn(&str) -> Option<String>,
    ) -> AegisConfig {
        if let Some(v) = var("AEGIS_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = var("AEGIS_PRODUCTION") {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.authorization.production = true,
                "0" | "false" | "no" => config.authorization.production = false,
                other => warn!(value = other, "ignoring unparseable AEGIS_PRODUCTION"),
            }
        }
        if let Some(v) = var("AEGIS_MAX_REQUESTS_PER_MINUTE") {
            if let Ok(n) = v.parse::<u32>() {
                config.guardrail.max_requests_per_minute = n;
            }
        }
        if let Some(v) = var("AEGIS_CHECKPOINT_DB") {
            config.checkpoint.backend = "sqlite".into();
            config.checkpoint.db_path = Some(PathBuf::from(v));
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> aegis_core::Result<AegisConfig> {
        if !self.config_path.exists() {
            return Err(AegisError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read(&self.config_path)?);
        new_config.validate().map_err(AegisError::Config)?;
        *self.config.write() = new_config.clone();
        info!("configuration reloaded");
        Ok(new_config)
    }

    /// Start a background file watcher that reloads when the config file changes
    /// and hands each accepted config to `on_reload`.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch<F>(&self, on_reload: F) -> aegis_core::Result<notify::RecommendedWatcher>
    where
        F: Fn(&AegisConfig) + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    let loaded = ConfigLoader::read(&path_for_event)
                        .map(ConfigLoader::apply_env_overrides)
                        .and_then(|c| c.validate().map(|_| c).map_err(AegisError::Config));
                    match loaded {
                        Ok(new_config) => {
                            *config.write() = new_config.clone();
                            on_reload(&new_config);
                            info!("configuration hot-reloaded successfully");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| AegisError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| AegisError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
