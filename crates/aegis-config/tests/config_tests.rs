#[cfg(test)]
mod tests {
    use aegis_config::ConfigLoader;
    use aegis_config::schema::*;
    use std::collections::HashMap;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_aegis_config_defaults() {
        let config = AegisConfig::default();
        assert_eq!(config.engine.default_mode, "production");
        assert_eq!(config.authorization.ttl_ms, 300_000);
        assert!(!config.authorization.production);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.retry_after_ms, 30_000);
        assert_eq!(config.guardrail.max_requests_per_minute, 60);
        assert_eq!(config.checkpoint.backend, "memory");
    }

    #[test]
    fn test_threshold_defaults() {
        let t = MetricThresholds::default();
        assert_eq!(t.cpu_critical, 95.0);
        assert_eq!(t.memory_critical, 95.0);
        assert_eq!(t.disk_critical, 98.0);
        assert!(t.cpu_warning < t.cpu_critical);
    }

    #[test]
    fn test_healer_default_policies() {
        let healer = HealerConfig::default();
        assert!(healer.enabled);
        let leak = &healer.policies["memory_leak"];
        assert_eq!(leak.actions, vec!["release_resources", "trim_caches"]);
        assert!(!healer.policies.contains_key("loop"));
    }

    #[test]
    fn test_default_config_validates() {
        let warnings = AegisConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = AegisConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: AegisConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.thresholds, config.thresholds);
        assert_eq!(restored.monitor.history_size, config.monitor.history_size);
        assert_eq!(
            restored.authorization.destructive_patterns,
            config.authorization.destructive_patterns
        );
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[thresholds]
cpu_warning = 70.0

[authorization]
production = true
blocked_targets = ["payments"]

[[guardrail.custom_patterns]]
name = "internal_host"
pattern = "corp\\.internal"
severity = "high"
"#;
        let config = ConfigLoader::parse(toml_str).unwrap();
        assert_eq!(config.thresholds.cpu_warning, 70.0);
        assert_eq!(config.thresholds.cpu_critical, 95.0);
        assert!(config.authorization.production);
        assert_eq!(config.authorization.blocked_targets, vec!["payments"]);
        assert_eq!(config.authorization.ttl_ms, 300_000);
        assert_eq!(config.guardrail.custom_patterns.len(), 1);
        assert_eq!(
            config.guardrail.custom_patterns[0].severity,
            aegis_core::Severity::High
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ConfigLoader::parse("[thresholds\ncpu = ").unwrap_err();
        assert!(matches!(err, aegis_core::AegisError::Config(_)));
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = AegisConfig::default();
        config.thresholds.memory_warning = 96.0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("thresholds.memory"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_percent() {
        let mut config = AegisConfig::default();
        config.thresholds.disk_critical = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_failure_threshold() {
        let mut config = AegisConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("circuit_breaker.failure_threshold"));
    }

    #[test]
    fn test_validate_rejects_unknown_backend_and_format() {
        let mut config = AegisConfig::default();
        config.checkpoint.backend = "redis".into();
        config.logging.format = "xml".into();
        let err = config.validate().unwrap_err();
        assert!(err.contains("checkpoint.backend"));
        assert!(err.contains("logging.format"));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut config = AegisConfig::default();
        config.guardrail.custom_patterns.push(CustomPattern {
            name: "broken".into(),
            pattern: "([a-z".into(),
            severity: aegis_core::Severity::Low,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warns_on_unknown_heal_policy() {
        let mut config = AegisConfig::default();
        config.healer.policies.insert(
            "gremlins".into(),
            HealPolicy {
                actions: vec!["trim_caches".into()],
                cooldown_secs: 10,
                max_attempts: 1,
            },
        );
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "healer.policies"));
    }

    // ── Env override tests ─────────────────────────────────────

    #[test]
    fn test_overrides_from_variables() {
        let vars: HashMap<&str, &str> = [
            ("AEGIS_LOG_LEVEL", "debug"),
            ("AEGIS_PRODUCTION", "true"),
            ("AEGIS_MAX_REQUESTS_PER_MINUTE", "5"),
            ("AEGIS_CHECKPOINT_DB", "/tmp/cp.db"),
        ]
        .into_iter()
        .collect();
        let config = ConfigLoader::apply_overrides(AegisConfig::default(), |k| {
            vars.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.logging.level, "debug");
        assert!(config.authorization.production);
        assert_eq!(config.guardrail.max_requests_per_minute, 5);
        assert_eq!(config.checkpoint.backend, "sqlite");
        assert_eq!(
            config.checkpoint.resolved_db_path(),
            std::path::PathBuf::from("/tmp/cp.db")
        );
    }

    #[test]
    fn test_unparseable_override_is_ignored() {
        let config = ConfigLoader::apply_overrides(AegisConfig::default(), |k| {
            (k == "AEGIS_MAX_REQUESTS_PER_MINUTE").then(|| "lots".to_string())
        });
        assert_eq!(config.guardrail.max_requests_per_minute, 60);
    }

    // ── Loader tests ───────────────────────────────────────────

    #[test]
    fn test_load_and_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.toml");
        std::fs::write(&path, "[monitor]\nsample_interval_secs = 2\n").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().monitor.sample_interval_secs, 2);
        assert_eq!(loader.path(), path.as_path());

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[monitor]\nsample_interval_secs = 9").unwrap();
        drop(f);

        let reloaded = loader.reload().unwrap();
        assert_eq!(reloaded.monitor.sample_interval_secs, 9);
        assert_eq!(loader.shared().read().monitor.sample_interval_secs, 9);
    }

    #[test]
    fn test_reload_keeps_config_on_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.toml");
        std::fs::write(&path, "").unwrap();
        let loader = ConfigLoader::load(Some(&path)).unwrap();

        std::fs::write(&path, "[circuit_breaker]\nfailure_threshold = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_watch_reloads_on_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.toml");
        std::fs::write(&path, "[thresholds]\ncpu_warning = 70.0\n").unwrap();
        let loader = ConfigLoader::load(Some(&path)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let _watcher = loader
            .watch(move |config| {
                let _ = tx.send(config.thresholds.cpu_warning);
            })
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        std::fs::write(&path, "[thresholds]\ncpu_warning = 55.0\n").unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut seen = None;
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(v) if v == 55.0 => {
                    seen = Some(v);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(seen, Some(55.0));
        assert_eq!(loader.get().thresholds.cpu_warning, 55.0);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loader.get().monitor.sample_interval_secs, 5);
    }

    #[test]
    fn test_load_fails_on_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.toml");
        std::fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }
}
