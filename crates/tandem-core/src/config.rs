//! Configuration module for Tandem.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Platform;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Tandem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub conflicts: ConflictsConfig,
    pub ignore: IgnoreConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local folder kept in sync with the remote account.
    pub root: PathBuf,
    /// Naming rules of the local filesystem: `auto`, `linux`, `macos` or `windows`.
    pub platform: String,
    /// Seconds between two sync attempts when nothing else wakes the driver.
    pub heartbeat_secs: u64,
    /// Failed attempts on a record before its change is abandoned.
    pub max_sync_attempts: u32,
    /// Milliseconds to wait for a parent deletion before trashing a child on its own.
    pub trashing_delay_ms: u64,
    /// Immediate retries of a content transfer on transient errors.
    pub transfer_retries: u32,
    /// Milliseconds between two transfer retries.
    pub transfer_retry_delay_ms: u64,
    /// Folder, relative to `root`, receiving trashed local documents.
    pub trash_dir: String,
}

/// Delays before retrying a blocked sync, per error kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub unreachable_secs: u64,
    pub user_action_required_secs: u64,
    pub missing_permissions_secs: u64,
    pub no_disk_space_secs: u64,
    pub no_remote_space_secs: u64,
    pub excluded_dir_secs: u64,
}

/// Conflict copy naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Characters of the original base name kept in a conflict copy name.
    pub max_base_name_chars: usize,
}

/// Local ignore rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Extra rules in gitignore syntax.
    pub patterns: Vec<String>,
    /// Whether the built-in rules (temporary and system files) apply.
    pub use_default_rules: bool,
}

/// Metadata store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub path: PathBuf,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/tandem/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("tandem")
            .join("config.yaml")
    }
}

impl SyncConfig {
    /// Naming rules to apply, resolving `auto` to the running platform.
    ///
    /// Unknown values fall back to the running platform; `validate` reports them.
    pub fn platform(&self) -> Platform {
        if self.platform == "auto" {
            return Platform::current();
        }
        self.platform.parse().unwrap_or_else(|_| Platform::current())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn trashing_delay(&self) -> Duration {
        Duration::from_millis(self.trashing_delay_ms)
    }

    pub fn transfer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transfer_retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Tandem"),
            platform: "auto".to_string(),
            heartbeat_secs: 60,
            max_sync_attempts: 3,
            trashing_delay_ms: 1000,
            transfer_retries: 3,
            transfer_retry_delay_ms: 1000,
            trash_dir: ".tandem-trash".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            unreachable_secs: 10,
            user_action_required_secs: 60,
            missing_permissions_secs: 10,
            no_disk_space_secs: 60,
            no_remote_space_secs: 10,
            excluded_dir_secs: 300,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            max_base_name_chars: 180,
        }
    }
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            use_default_rules: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("tandem")
                .join("records.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.heartbeat_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        positive(&mut errors, "sync.heartbeat_secs", self.sync.heartbeat_secs);
        positive(
            &mut errors,
            "sync.max_sync_attempts",
            u64::from(self.sync.max_sync_attempts),
        );

        if self.sync.platform != "auto" && self.sync.platform.parse::<Platform>().is_err() {
            errors.push(ValidationError {
                field: "sync.platform".into(),
                message: format!(
                    "must be one of auto, linux, macos, windows (got {:?})",
                    self.sync.platform
                ),
            });
        }

        let trash = self.sync.trash_dir.trim_matches('/');
        if trash.is_empty() || trash.split('/').any(|c| c == ".." || c == ".") {
            errors.push(ValidationError {
                field: "sync.trash_dir".into(),
                message: "must be a relative folder inside the sync root".into(),
            });
        }

        // Check sync root only when it does not start with `~` (tilde is expanded at runtime).
        let root_str = self.sync.root.to_string_lossy();
        if !root_str.starts_with('~') && !self.sync.root.exists() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("directory does not exist: {}", self.sync.root.display()),
            });
        }

        // --- retry ---
        positive(&mut errors, "retry.unreachable_secs", self.retry.unreachable_secs);
        positive(
            &mut errors,
            "retry.user_action_required_secs",
            self.retry.user_action_required_secs,
        );

        // --- conflicts ---
        if self.conflicts.max_base_name_chars < 8 {
            errors.push(ValidationError {
                field: "conflicts.max_base_name_chars".into(),
                message: "must be at least 8".into(),
            });
        }

        // --- ignore ---
        for (idx, pattern) in self.ignore.patterns.iter().enumerate() {
            if pattern.trim().is_empty() {
                errors.push(ValidationError {
                    field: format!("ignore.patterns[{idx}]"),
                    message: "must not be blank".into(),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "must be one of {VALID_LOG_LEVELS:?} (got {:?})",
                    self.logging.level
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "must be one of {VALID_LOG_FORMATS:?} (got {:?})",
                    self.logging.format
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Config`], starting from the defaults.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder pre-populated with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_platform(mut self, platform: Platform) -> Self {
        self.config.sync.platform = platform.as_str().to_string();
        self
    }

    pub fn sync_heartbeat_secs(mut self, seconds: u64) -> Self {
        self.config.sync.heartbeat_secs = seconds;
        self
    }

    pub fn sync_max_sync_attempts(mut self, attempts: u32) -> Self {
        self.config.sync.max_sync_attempts = attempts;
        self
    }

    pub fn sync_trashing_delay_ms(mut self, ms: u64) -> Self {
        self.config.sync.trashing_delay_ms = ms;
        self
    }

    pub fn sync_transfer_retries(mut self, retries: u32, delay_ms: u64) -> Self {
        self.config.sync.transfer_retries = retries;
        self.config.sync.transfer_retry_delay_ms = delay_ms;
        self
    }

    pub fn sync_trash_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.sync.trash_dir = dir.into();
        self
    }

    // --- retry ---

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    // --- conflicts ---

    pub fn conflicts_max_base_name_chars(mut self, chars: usize) -> Self {
        self.config.conflicts.max_base_name_chars = chars;
        self
    }

    // --- ignore ---

    pub fn ignore_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.ignore.patterns.push(pattern.into());
        self
    }

    pub fn ignore_use_default_rules(mut self, enabled: bool) -> Self {
        self.config.ignore.use_default_rules = enabled;
        self
    }

    // --- store ---

    pub fn store_path(mut self, path: PathBuf) -> Self {
        self.config.store.path = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
