use std::collections::HashMap;
use std::time::Duration;

use super::types::{WerkstattConfig, DEFAULT_POOL_SIZE};
use crate::context::Isolation;
use crate::worker::PauseMode;

#[test]
fn parse_minimal_toml() {
    let cfg = WerkstattConfig::from_toml("").unwrap();
    assert_eq!(cfg.pool.initial_tags().len(), DEFAULT_POOL_SIZE);
    assert_eq!(cfg.pool.isolation, Isolation::Task);
    assert_eq!(cfg.pool.pause_mode, PauseMode::GateDispatch);
    assert_eq!(cfg.pool.default_timeout(), None);
    assert_eq!(cfg.pool.startup_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.log.level, "info");
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[pool]
tags = ["ingest", "resize", "custom"]
isolation = "thread"
pause_mode = "hold_completions"
default_timeout_ms = 1500
startup_timeout_ms = 250
event_capacity = 64
diagnostics = true

[log]
level = "werkstatt=debug"
"#;
    let cfg = WerkstattConfig::from_toml(toml).unwrap();
    assert_eq!(cfg.pool.initial_tags(), vec!["ingest", "resize", "custom"]);
    assert_eq!(cfg.pool.isolation, Isolation::Thread);
    assert_eq!(cfg.pool.pause_mode, PauseMode::HoldCompletions);
    assert_eq!(cfg.pool.default_timeout(), Some(Duration::from_millis(1500)));
    assert_eq!(cfg.pool.startup_timeout(), Duration::from_millis(250));
    assert_eq!(cfg.pool.event_capacity, 64);
    assert!(cfg.pool.diagnostics);
    assert_eq!(cfg.log.level, "werkstatt=debug");
}

#[test]
fn size_generates_positional_tags() {
    let cfg = WerkstattConfig::from_toml("[pool]\nsize = 2\n").unwrap();
    assert_eq!(cfg.pool.initial_tags(), vec!["worker_1", "worker_2"]);
}

#[test]
fn detect_duplicate_tags() {
    let err = WerkstattConfig::from_toml("[pool]\ntags = [\"a\", \"b\", \"a\"]\n").unwrap_err();
    assert!(err.to_string().contains("'a'"), "{err}");
}

#[test]
fn detect_empty_tag() {
    let err = WerkstattConfig::from_toml("[pool]\ntags = [\"a\", \" \"]\n").unwrap_err();
    assert!(err.to_string().contains("must not be empty"), "{err}");
}

#[test]
fn detect_size_tag_mismatch() {
    let err = WerkstattConfig::from_toml("[pool]\nsize = 3\ntags = [\"a\"]\n").unwrap_err();
    assert!(err.to_string().contains("does not match"), "{err}");
}

#[test]
fn detect_zero_limits() {
    assert!(WerkstattConfig::from_toml("[pool]\nevent_capacity = 0\n").is_err());
    assert!(WerkstattConfig::from_toml("[pool]\nstartup_timeout_ms = 0\n").is_err());
    assert!(WerkstattConfig::from_toml("[pool]\ndefault_timeout_ms = 0\n").is_err());
}

#[test]
fn detect_invalid_pause_mode() {
    let err = WerkstattConfig::from_toml("[pool]\npause_mode = \"sometimes\"\n").unwrap_err();
    assert!(err.to_string().contains("sometimes"), "{err}");
}

#[test]
fn overrides_replace_file_values() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("WERKSTATT_POOL_TAGS", "x, y"),
        ("WERKSTATT_POOL_ISOLATION", "thread"),
        ("WERKSTATT_POOL_PAUSE_MODE", "hold_completions"),
        ("WERKSTATT_POOL_DEFAULT_TIMEOUT_MS", "40"),
        ("WERKSTATT_POOL_DIAGNOSTICS", "true"),
        ("WERKSTATT_LOG_LEVEL", "debug"),
    ]);
    let mut cfg: WerkstattConfig = toml::from_str("[pool]\ntags = [\"a\"]\n").unwrap();
    cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

    assert_eq!(cfg.pool.tags, vec!["x", "y"]);
    assert_eq!(cfg.pool.isolation, Isolation::Thread);
    assert_eq!(cfg.pool.pause_mode, PauseMode::HoldCompletions);
    assert_eq!(cfg.pool.default_timeout_ms, Some(40));
    assert!(cfg.pool.diagnostics);
    assert_eq!(cfg.log.level, "debug");
    cfg.validate().unwrap();
}

#[test]
fn unparsable_overrides_are_ignored() {
    let mut cfg = WerkstattConfig::local();
    cfg.apply_overrides(|key| match key {
        "WERKSTATT_POOL_SIZE" => Some("many".into()),
        "WERKSTATT_POOL_EVENT_CAPACITY" => Some("-1".into()),
        _ => None,
    });
    assert_eq!(cfg.pool.size, None);
    assert_eq!(cfg.pool.event_capacity, 256);
}

#[test]
fn local_config_defaults() {
    let cfg = WerkstattConfig::local();
    assert!(cfg.pool.tags.is_empty());
    assert!(!cfg.pool.diagnostics);
    cfg.validate().unwrap();
}
