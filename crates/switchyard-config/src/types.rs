//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [engine]                 # run limits
//! [engine.backoff]         # retry delays
//! [store]                  # run store location
//! [logging]                # console + JSON file logging
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    /// Run engine settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSection>,
    /// Run store settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreSection>,
    /// Logging settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl SwitchyardConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: SwitchyardConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Engine section, or defaults when absent.
    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    /// Logging section, or defaults when absent.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if let Some(engine) = &self.engine {
            engine.validate()?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Run engine configuration.
///
/// ```toml
/// [engine]
/// run_timeout_secs = 3600
/// max_concurrent_runs = 64
///
/// [engine.backoff]
/// initial_ms = 250
/// max_ms = 30000
/// multiplier = 2.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Active execution time allowed per run, in seconds.
    pub run_timeout_secs: u64,
    /// Runs that may be driven at the same time.
    pub max_concurrent_runs: usize,
    /// Retry backoff between failed step attempts.
    pub backoff: BackoffSection,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            run_timeout_secs: 3600,
            max_concurrent_runs: 64,
            backoff: BackoffSection::default(),
        }
    }
}

impl EngineSection {
    fn validate(&self) -> Result<()> {
        if self.run_timeout_secs == 0 {
            return Err(invalid("engine.run_timeout_secs", "must be greater than zero"));
        }
        if self.max_concurrent_runs == 0 {
            return Err(invalid("engine.max_concurrent_runs", "must be greater than zero"));
        }
        self.backoff.validate()
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_ms: u64,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffSection {
    fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("engine.backoff.multiplier", "must be a finite number >= 1.0"));
        }
        if self.max_ms < self.initial_ms {
            return Err(invalid("engine.backoff.max_ms", "must not be below initial_ms"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Run store configuration.
///
/// Without `runs_db` runs are kept in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Path to the SQLite database holding runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runs_db: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
///
/// `RUST_LOG`, when set, takes precedence over `level` for the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter directive (e.g. `"info"`, `"switchyard_engine=debug,warn"`).
    pub level: String,
    /// Whether to also write a daily-rolling JSON log file.
    pub json_file: bool,
    /// Directory for the JSON log file. Defaults to `<user config dir>/logs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
            directory: None,
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
