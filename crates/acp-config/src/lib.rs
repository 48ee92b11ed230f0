// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the control plane.
//!
//! This crate provides [`ControlPlaneConfig`] — the top-level runtime
//! settings — together with helpers for loading from TOML files, applying
//! environment overrides, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A cap is set unusually high.
    LargeValue {
        /// Field name.
        field: String,
        /// The configured value.
        value: u64,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeValue { field, value } => {
                write!(f, "'{field}' is unusually large ({value})")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the control plane.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ControlPlaneConfig {
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Persistent store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Durable queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Content-addressed store settings.
    #[serde(default)]
    pub cas: CasConfig,

    /// Budget controller settings.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Reputation engine settings.
    #[serde(default)]
    pub reputation: ReputationConfig,

    /// Drift detector settings.
    #[serde(default)]
    pub drift: DriftConfig,
}

/// Persistent store settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct StoreConfig {
    /// Path to the SQLite database file. `":memory:"` for tests.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String {
    "controlplane.db".into()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Durable queue settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of live jobs before enqueue rejects.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Default lease duration in seconds.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Default attempt cap for jobs that do not set one.
    #[serde(default = "default_default_max_attempts")]
    pub default_max_attempts: u32,
}

fn default_max_depth() -> usize {
    1_000
}

fn default_lease_secs() -> u64 {
    30
}

fn default_default_max_attempts() -> u32 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            lease_secs: default_lease_secs(),
            default_max_attempts: default_default_max_attempts(),
        }
    }
}

/// Eviction policy for the content-addressed store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Never evict.
    #[default]
    None,
    /// Evict least-recently-used objects first.
    Lru,
    /// Evict oldest-first until total size fits the cap.
    SizeCap,
}

/// Content-addressed store settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CasConfig {
    /// Root directory for object storage.
    #[serde(default = "default_cas_root")]
    pub root: String,
    /// Eviction policy.
    #[serde(default)]
    pub eviction: EvictionPolicy,
    /// Size cap in bytes (applies to `lru` and `size_cap`).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// LRU retention window in seconds; older entries are always evictable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_cas_root() -> String {
    "cas".into()
}

fn default_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            root: default_cas_root(),
            eviction: EvictionPolicy::None,
            max_bytes: default_max_bytes(),
            retention_secs: default_retention_secs(),
        }
    }
}

/// Budget controller settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BudgetConfig {
    /// Budget assigned to runs that do not set one, in USD.
    #[serde(default = "default_budget_usd")]
    pub default_budget_usd: f64,
}

fn default_budget_usd() -> f64 {
    5.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_budget_usd: default_budget_usd(),
        }
    }
}

/// Reputation engine settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ReputationConfig {
    /// Seconds an open circuit waits before probing (half-open).
    #[serde(default = "default_circuit_recovery_secs")]
    pub circuit_recovery_secs: u64,
}

fn default_circuit_recovery_secs() -> u64 {
    30
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            circuit_recovery_secs: default_circuit_recovery_secs(),
        }
    }
}

/// Drift detector settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DriftConfig {
    /// Cumulative drift score above which a run is marked hardened.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
}

fn default_alert_threshold() -> f64 {
    0.5
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            alert_threshold: default_alert_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Queue depth above which a warning is emitted.
const LARGE_QUEUE_DEPTH: usize = 100_000;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`ControlPlaneConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`ControlPlaneConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<ControlPlaneConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ControlPlaneConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`ControlPlaneConfig`].
pub fn parse_toml(content: &str) -> Result<ControlPlaneConfig, ConfigError> {
    toml::from_str::<ControlPlaneConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `ACP_LOG_LEVEL`
/// - `ACP_DB_PATH`
/// - `ACP_CAS_ROOT`
/// - `ACP_QUEUE_MAX_DEPTH`
pub fn apply_env_overrides(config: &mut ControlPlaneConfig) {
    if let Ok(val) = std::env::var("ACP_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Ok(val) = std::env::var("ACP_DB_PATH") {
        config.store.db_path = val;
    }
    if let Ok(val) = std::env::var("ACP_CAS_ROOT") {
        config.cas.root = val;
    }
    if let Ok(val) = std::env::var("ACP_QUEUE_MAX_DEPTH")
        && let Ok(depth) = val.parse::<usize>()
    {
        config.queue.max_depth = depth;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (zero queue depth, empty paths, out-of-range thresholds) come
/// back as a [`ConfigError::ValidationError`]; soft issues as warnings.
pub fn validate_config(config: &ControlPlaneConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.store.db_path.is_empty() {
        errors.push("store.db_path must not be empty".into());
    }

    if config.queue.max_depth == 0 {
        errors.push("queue.max_depth must be at least 1".into());
    } else if config.queue.max_depth > LARGE_QUEUE_DEPTH {
        warnings.push(ConfigWarning::LargeValue {
            field: "queue.max_depth".into(),
            value: config.queue.max_depth as u64,
        });
    }

    if config.queue.lease_secs == 0 {
        errors.push("queue.lease_secs must be at least 1".into());
    }

    if config.queue.default_max_attempts == 0 {
        errors.push("queue.default_max_attempts must be at least 1".into());
    }

    if config.cas.root.is_empty() {
        errors.push("cas.root must not be empty".into());
    }
    if config.cas.eviction != EvictionPolicy::None && config.cas.max_bytes == 0 {
        errors.push("cas.max_bytes must be positive when eviction is enabled".into());
    }

    if config.budget.default_budget_usd < 0.0 {
        errors.push("budget.default_budget_usd must not be negative".into());
    }

    if !(0.0..=1.0).contains(&config.drift.alert_threshold) {
        errors.push("drift.alert_threshold must lie in [0, 1]".into());
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
