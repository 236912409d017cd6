//! Integration tests for configuration management
//!
//! These tests verify that the Config struct can be loaded from disk,
//! validated, and processed with path expansion and directory creation.

use kommandant_engine::config::Config;
use sdk::{Capability, SpecialistKind};
use std::fs;
use tempfile::TempDir;

fn config_text(data_dir: &std::path::Path, extra: &str) -> String {
    format!(
        r#"
[core]
log_level = "debug"
data_dir = "{}"
database_file = "room.db"

[orchestrator]
room_id = 42
name = "Kommandant Nord"
delegation_timeout_secs = 15

[registry]
default_max_load = 3
prefer_performance = false
{}
"#,
        data_dir.display(),
        extra
    )
}

#[test]
fn test_load_full_config_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("data");
    let config_path = temp_dir.path().join("config.toml");

    let extra = r#"
[[specialists]]
id = "scholar"
kind = "research-specialist"
capabilities = ["web_search"]
max_load = 2
"#;
    fs::write(&config_path, config_text(&data_dir, extra)).unwrap();

    let config = Config::load_from_path(&config_path).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.orchestrator.orchestrator_id(), "kommandant_42");
    assert_eq!(config.orchestrator.delegation_timeout().as_secs(), 15);
    assert_eq!(config.registry.default_max_load, 3);
    assert!(!config.registry.prefer_performance);
    // Omitted sections fall back to defaults
    assert_eq!(config.orchestrator.max_prompt_length, 10000);
    assert!((config.analyzer.base_complexity - 0.5).abs() < f64::EPSILON);

    assert_eq!(config.specialists.len(), 1);
    assert_eq!(config.specialists[0].kind, SpecialistKind::ResearchSpecialist);
    assert_eq!(config.specialists[0].capabilities, vec![Capability::WebSearch]);

    // Data directory is created during processing
    assert!(data_dir.is_dir());
    assert_eq!(config.database_path(), data_dir.join("room.db"));
}

#[test]
fn test_load_or_create_prefers_existing_file() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("data");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    fs::write(&config_path, config_text(&data_dir, "")).unwrap();

    let loaded = Config::load_or_create_at(&config_path).unwrap();
    assert_eq!(loaded.orchestrator.room_id, 42);
    assert_eq!(loaded.orchestrator.name, "Kommandant Nord");
}

#[test]
fn test_default_config_serializes_without_specialists() {
    let written = toml::to_string_pretty(&Config::default()).unwrap();
    assert!(written.contains("delegation_timeout_secs = 60"));
    assert!(written.contains("data_dir = \"~/.kommandant/data\""));
    assert!(!written.contains("[[specialists]]"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("data");

    let bad_level = config_text(&data_dir, "").replace("\"debug\"", "\"loud\"");
    assert!(Config::from_toml_str(&bad_level).is_err());

    let zero_timeout = config_text(&data_dir, "").replace(
        "delegation_timeout_secs = 15",
        "delegation_timeout_secs = 0",
    );
    assert!(Config::from_toml_str(&zero_timeout).is_err());

    let complexity = config_text(&data_dir, "[analyzer]\nbase_complexity = 1.5\n");
    assert!(Config::from_toml_str(&complexity).is_err());

    let mismatch = config_text(
        &data_dir,
        r#"
[[specialists]]
id = "writer"
kind = "creative-synthesizer"
capabilities = ["ocr"]
"#,
    );
    let err = Config::from_toml_str(&mismatch).unwrap_err();
    assert!(err.to_string().contains("ocr"));
}

#[test]
fn test_unknown_kind_fails_to_parse() {
    let temp_dir = TempDir::new().unwrap();
    let text = config_text(
        temp_dir.path(),
        r#"
[[specialists]]
id = "mystery"
kind = "fortune-teller"
"#,
    );
    assert!(Config::from_toml_str(&text).is_err());
}
