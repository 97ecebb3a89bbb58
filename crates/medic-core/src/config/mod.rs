//! Reconciler configuration.
//!
//! A single YAML or JSON document. Loading runs three passes: the raw
//! document is checked against the embedded JSON Schema, deserialized with
//! every key defaulted, then semantically validated.

pub mod duration;
pub mod schema;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::staleness::StalenessPolicy;
use crate::types::RemediationAction;

pub use schema::validate_config_schema;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Maximum attempts per budgeted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryLimits {
    pub rebuild: u32,
    pub update_branch: u32,
    pub close_reopen: u32,
    pub retrigger_policy: u32,
    pub retrigger_sod: u32,
    pub retrigger_approver: u32,
    pub retrigger_merge: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            rebuild: 3,
            update_branch: 2,
            close_reopen: 1,
            retrigger_policy: 2,
            retrigger_sod: 1,
            retrigger_approver: 2,
            retrigger_merge: 2,
        }
    }
}

impl RetryLimits {
    /// Configured maximum, or `None` for actions that are never budget-gated.
    pub fn max_for(&self, action: RemediationAction) -> Option<u32> {
        match action {
            RemediationAction::Rebuild => Some(self.rebuild),
            RemediationAction::UpdateBranch => Some(self.update_branch),
            RemediationAction::CloseReopen => Some(self.close_reopen),
            RemediationAction::RetriggerPolicy => Some(self.retrigger_policy),
            RemediationAction::RetriggerSod => Some(self.retrigger_sod),
            RemediationAction::RetriggerApprover => Some(self.retrigger_approver),
            RemediationAction::RetriggerMerge => Some(self.retrigger_merge),
            RemediationAction::ClosePr => None,
        }
    }
}

/// When retry counters are cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// Counters accumulate for the whole life of the PR.
    #[default]
    Lifetime,
    /// Counters reset when drift correction shows forward progress.
    ResetOnProgress,
}

/// Extra failure signatures, added to the built-in ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub transient_signatures: Vec<String>,
    pub persistent_signatures: Vec<String>,
}

/// Configuration for the shared circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent dispatch outcomes kept in the window
    pub window_size: usize,

    /// Minimum outcomes in the window before the breaker may trip
    pub min_samples: usize,

    /// Failure ratio that must be exceeded to trip
    pub failure_ratio: f64,

    /// Time in OPEN before a probe is allowed
    #[serde(with = "duration::human")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_samples: 5,
            failure_ratio: 0.5,
            cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between reconciliation runs
    #[serde(with = "duration::human")]
    pub cadence: Duration,

    /// PRs not started before this much time into a run are skipped
    #[serde(with = "duration::human")]
    pub run_deadline: Duration,

    /// PRs processed concurrently within one run
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(300),
            run_deadline: Duration::from_secs(240),
            max_concurrency: 8,
        }
    }
}

/// Timeout and backoff applied to every collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    #[serde(with = "duration::human")]
    pub timeout: Duration,

    /// Retries after the first attempt (transient errors only)
    pub max_retries: usize,

    #[serde(with = "duration::human")]
    pub min_delay: Duration,

    #[serde(with = "duration::human")]
    pub max_delay: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Upstream GitHub API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,

    /// Falls back to `GITHUB_TOKEN` when unset. Never serialized.
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

/// Complete reconciler configuration. Every key has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicConfig {
    pub staleness: StalenessPolicy,

    /// How long terminal records are kept before purge
    #[serde(with = "duration::human")]
    pub retention: Duration,

    pub retry_limits: RetryLimits,

    pub budget_scope: BudgetScope,

    pub classification: ClassificationConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub scheduler: SchedulerConfig,

    pub calls: CallConfig,

    pub github: GithubConfig,
}

impl Default for MedicConfig {
    fn default() -> Self {
        Self {
            staleness: StalenessPolicy::default(),
            retention: Duration::from_secs(24 * 60 * 60),
            retry_limits: RetryLimits::default(),
            budget_scope: BudgetScope::default(),
            classification: ClassificationConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            scheduler: SchedulerConfig::default(),
            calls: CallConfig::default(),
            github: GithubConfig::default(),
        }
    }
}

impl MedicConfig {
    /// Parse a config from a YAML string. An empty document yields the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Self::from_value(serde_json::Value::Null);
        }
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load a config file, choosing the format from its extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let value = match value {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };

        validate_config_schema(&value).map_err(ConfigError::Schema)?;

        let config: MedicConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let breaker = &self.circuit_breaker;
        if !(breaker.failure_ratio > 0.0 && breaker.failure_ratio <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "circuit_breaker.failure_ratio must be in (0, 1], got {}",
                breaker.failure_ratio
            )));
        }
        if breaker.window_size == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.window_size must be positive".to_string(),
            ));
        }
        if breaker.min_samples > breaker.window_size {
            return Err(ConfigError::Validation(format!(
                "circuit_breaker.min_samples ({}) exceeds window_size ({})",
                breaker.min_samples, breaker.window_size
            )));
        }

        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_concurrency must be positive".to_string(),
            ));
        }
        if self.calls.min_delay > self.calls.max_delay {
            return Err(ConfigError::Validation(
                "calls.min_delay exceeds calls.max_delay".to_string(),
            ));
        }

        let terminal = self.staleness.terminal_entries();
        if !terminal.is_empty() {
            let names: Vec<&str> = terminal.iter().map(|s| s.as_str()).collect();
            return Err(ConfigError::Validation(format!(
                "staleness thresholds for terminal states are not allowed: {}",
                names.join(", ")
            )));
        }

        for pattern in self
            .classification
            .transient_signatures
            .iter()
            .chain(&self.classification.persistent_signatures)
        {
            Regex::new(pattern).map_err(|e| {
                ConfigError::Validation(format!("invalid signature '{}': {}", pattern, e))
            })?;
        }

        Ok(())
    }
}
