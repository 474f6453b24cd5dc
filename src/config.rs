//! Resolved policy configuration.
//!
//! Loaded once per invocation from `.trak_flow/config.yml` (YAML), overlaid
//! with `TF_*` environment variables, validated, then passed explicitly to the
//! ID generator and the sync engine.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Config file name within the `.trak_flow` directory.
pub const CONFIG_FILE: &str = "config.yml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Author recorded on comments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub id: IdConfig,
    pub import: ImportConfig,
    pub export: ExportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            actor: std::env::var("USER").ok(),
            id: IdConfig::default(),
            import: ImportConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

/// ID generation bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    pub prefix: String,
    pub min_hash_length: usize,
    pub max_hash_length: usize,
}

impl IdConfig {
    pub const MIN_HASH_LENGTH: usize = 4;
    pub const MAX_HASH_LENGTH: usize = 8;
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            prefix: "tf".to_string(),
            min_hash_length: Self::MIN_HASH_LENGTH,
            max_hash_length: Self::MAX_HASH_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub orphan_handling: OrphanHandling,
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub error_policy: ErrorPolicy,
}

/// What to do with imported tasks whose parent is absent from the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanHandling {
    /// Keep them unchanged
    #[default]
    Allow,
    /// Drop them
    Skip,
    /// Keep them with `parent_id` cleared
    Resurrect,
    /// Abort the whole import
    Strict,
}

/// How per-entity failures during a bulk import/export are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Collect every failure and fail once at the end
    Strict,
    /// Log and continue
    #[default]
    Warn,
    /// Continue silently
    Ignore,
}

impl FromStr for OrphanHandling {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(OrphanHandling::Allow),
            "skip" => Ok(OrphanHandling::Skip),
            "resurrect" => Ok(OrphanHandling::Resurrect),
            "strict" => Ok(OrphanHandling::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "import.orphan_handling",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(ErrorPolicy::Strict),
            "warn" => Ok(ErrorPolicy::Warn),
            "ignore" => Ok(ErrorPolicy::Ignore),
            other => Err(ConfigError::InvalidValue {
                key: "error_policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidPrefix(String),
    InvalidHashLength { min: usize, max: usize },
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPrefix(prefix) => {
                write!(f, "invalid ID prefix '{}': must be lowercase ASCII letters", prefix)
            }
            ConfigError::InvalidHashLength { min, max } => write!(
                f,
                "invalid hash length bounds {}..{}: must satisfy {} <= min <= max <= {}",
                min,
                max,
                IdConfig::MIN_HASH_LENGTH,
                IdConfig::MAX_HASH_LENGTH
            ),
            ConfigError::InvalidValue { key, value } => write!(f, "invalid value for {}: {}", key, value),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load `<dir>/config.yml` (defaults when absent), apply env overrides, validate.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read config.yml")?;
            Self::from_yaml(&content)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate().map_err(|e| eyre::eyre!(e))?;
        Ok(config)
    }

    /// Parse YAML; empty documents yield defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Failed to parse config.yml")
    }

    /// Write the config as YAML.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(dir.join(CONFIG_FILE), yaml).context("Failed to write config.yml")
    }

    /// Overlay `TF_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(actor) = lookup("TF_ACTOR") {
            self.actor = Some(actor);
        }
        if let Some(prefix) = lookup("TF_ID_PREFIX") {
            self.id.prefix = prefix;
        }
        if let Some(value) = lookup("TF_IMPORT_ORPHAN_HANDLING") {
            self.import.orphan_handling = value.parse()?;
        }
        if let Some(value) = lookup("TF_IMPORT_ERROR_POLICY") {
            self.import.error_policy = value.parse()?;
        }
        if let Some(value) = lookup("TF_EXPORT_ERROR_POLICY") {
            self.export.error_policy = value.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.id.prefix;
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(ConfigError::InvalidPrefix(prefix.clone()));
        }

        let (min, max) = (self.id.min_hash_length, self.id.max_hash_length);
        if min < IdConfig::MIN_HASH_LENGTH || max > IdConfig::MAX_HASH_LENGTH || min > max {
            return Err(ConfigError::InvalidHashLength { min, max });
        }

        Ok(())
    }
}
