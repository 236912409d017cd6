//! Configuration management
//!
//! This module handles loading, validation, and management of the Kommandant
//! configuration. Configuration is stored in TOML format at
//! ~/.kommandant/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory and database file
//! - **orchestrator**: Room, delegation timeout, prompt limit, learning, audit
//! - **registry**: Default specialist load and selection preference
//! - **analyzer**: Base complexity and duration unit
//! - **specialists**: Statically configured specialists (optional)
//!
//! # Path Expansion
//!
//! `~` in `core.data_dir` is expanded to the user's home directory and the
//! directory is created when it does not exist.
//!
//! # Examples
//!
//! ```no_run
//! use kommandant_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Room: {}", config.orchestrator.room_id);
//! println!("Database: {:?}", config.database_path());
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::{Capability, SpecialistKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conductor::analyzer::AnalyzerSettings;
use crate::conductor::types::MERGER_ID;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Orchestrator behaviour
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Specialist registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Prompt analysis settings
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Specialists registered at startup in addition to the defaults
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specialists: Vec<SpecialistConfig>,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite file name inside the data directory
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Room (partition) this orchestrator owns
    #[serde(default = "default_room_id")]
    pub room_id: i64,

    /// Display name announced to the task registry
    #[serde(default = "default_name")]
    pub name: String,

    /// Per-delegation timeout in seconds
    #[serde(default = "default_delegation_timeout")]
    pub delegation_timeout_secs: u64,

    /// Longest prompt accepted by receive_task, in characters
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    /// Update learned confidence after every task
    #[serde(default = "default_true")]
    pub auto_learn: bool,

    /// Audit entries kept in memory
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

/// Specialist registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Register one `<kind>_default` specialist per kind at startup
    #[serde(default = "default_true")]
    pub register_defaults: bool,

    /// Max concurrent delegations for specialists that do not set their own
    #[serde(default = "default_max_load")]
    pub default_max_load: u32,

    /// Rank candidates by performance score before load
    #[serde(default = "default_true")]
    pub prefer_performance: bool,
}

/// Task analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Complexity before keyword adjustments (0.0-1.0)
    #[serde(default = "default_base_complexity")]
    pub base_complexity: f64,

    /// Estimated seconds per specialist at zero complexity
    #[serde(default = "default_base_duration")]
    pub base_duration_secs: u64,
}

/// A statically configured specialist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistConfig {
    pub id: String,
    pub kind: SpecialistKind,

    /// Capabilities; empty means every capability of the kind
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Falls back to `registry.default_max_load`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_load: Option<u32>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.kommandant/data")
}

fn default_database_file() -> String {
    "kommandant.db".to_string()
}

fn default_room_id() -> i64 {
    1
}

fn default_name() -> String {
    "Kommandant".to_string()
}

fn default_delegation_timeout() -> u64 {
    60
}

fn default_max_prompt_length() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_audit_capacity() -> usize {
    1000
}

fn default_max_load() -> u32 {
    5
}

fn default_base_complexity() -> f64 {
    0.5
}

fn default_base_duration() -> u64 {
    10
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            database_file: default_database_file(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            room_id: default_room_id(),
            name: default_name(),
            delegation_timeout_secs: default_delegation_timeout(),
            max_prompt_length: default_max_prompt_length(),
            auto_learn: true,
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            register_defaults: true,
            default_max_load: default_max_load(),
            prefer_performance: true,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            base_complexity: default_base_complexity(),
            base_duration_secs: default_base_duration(),
        }
    }
}

impl OrchestratorConfig {
    pub fn delegation_timeout(&self) -> Duration {
        Duration::from_secs(self.delegation_timeout_secs)
    }

    /// Owner id used for persisted state of this room
    pub fn orchestrator_id(&self) -> String {
        format!("kommandant_{}", self.room_id)
    }
}

impl AnalyzerConfig {
    pub fn settings(&self) -> AnalyzerSettings {
        AnalyzerSettings {
            base_complexity: self.base_complexity,
            base_duration_secs: self.base_duration_secs,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.kommandant/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create_at(&config_path)
    }

    /// Load configuration from `path`, writing defaults there first if missing
    pub fn load_or_create_at(path: &Path) -> Result<Self, EngineError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Written before processing so the file keeps the portable ~ form
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.kommandant/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".kommandant").join("config.toml"))
    }

    /// Full path of the SQLite state store
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join(&self.core.database_file)
    }

    /// Validate values and expand paths
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The log level is unknown
    /// - A timeout, capacity or load limit is zero
    /// - The base complexity is outside 0.0-1.0
    /// - A configured specialist is inconsistent with its kind
    /// - The data directory cannot be created
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.core.database_file.trim().is_empty() {
            return Err(EngineError::Config(
                "database_file must not be empty".to_string(),
            ));
        }

        if self.orchestrator.delegation_timeout_secs == 0 {
            return Err(EngineError::Config(
                "delegation_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.orchestrator.max_prompt_length == 0 {
            return Err(EngineError::Config(
                "max_prompt_length must be greater than 0".to_string(),
            ));
        }
        if self.orchestrator.audit_capacity == 0 {
            return Err(EngineError::Config(
                "audit_capacity must be greater than 0".to_string(),
            ));
        }

        if self.registry.default_max_load == 0 {
            return Err(EngineError::Config(
                "default_max_load must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.analyzer.base_complexity) {
            return Err(EngineError::Config(
                "base_complexity must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.analyzer.base_duration_secs == 0 {
            return Err(EngineError::Config(
                "base_duration_secs must be greater than 0".to_string(),
            ));
        }

        self.validate_specialists()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    fn validate_specialists(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for specialist in &self.specialists {
            let id = specialist.id.trim();
            if id.is_empty() {
                return Err(EngineError::Config(
                    "specialist id must not be empty".to_string(),
                ));
            }
            if id == MERGER_ID {
                return Err(EngineError::Config(format!(
                    "specialist id '{}' is reserved",
                    MERGER_ID
                )));
            }
            if !seen.insert(id) {
                return Err(EngineError::Config(format!(
                    "specialist '{}' is configured twice",
                    id
                )));
            }
            if specialist.max_load == Some(0) {
                return Err(EngineError::Config(format!(
                    "specialist '{}' max_load must be at least 1",
                    id
                )));
            }
            if let Some(cap) = specialist
                .capabilities
                .iter()
                .find(|c| !specialist.kind.supports(**c))
            {
                return Err(EngineError::Config(format!(
                    "specialist '{}' of kind {} cannot provide {}",
                    id, specialist.kind, cap
                )));
            }
        }
        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
