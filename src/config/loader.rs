//! Configuration loading with multi-layer merge

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level flowctl configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global defaults
    #[serde(default)]
    pub defaults: Defaults,

    /// Reconciliation loop settings
    #[serde(default)]
    pub controller: ControllerSettings,

    /// Backoff for transient observation and storage failures
    #[serde(default)]
    pub retry: RetrySettings,

    /// Cron scheduler settings
    #[serde(default)]
    pub cron: CronSettings,

    /// Database location
    #[serde(default)]
    pub store: StoreSettings,
}

/// Global default settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Namespace used when a manifest or command names none
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".into()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ControllerSettings {
    /// Interval between full resync passes, in milliseconds
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,

    /// Time running nodes get to stop after termination, in seconds
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,

    /// Fresh-suffix attempts when a generated name is taken
    #[serde(default = "default_name_collision_retries")]
    pub name_collision_retries: u32,

    /// Working directory for shell steps
    pub working_dir: Option<String>,
}

fn default_resync_interval_ms() -> u64 {
    1000
}

fn default_termination_grace_secs() -> u64 {
    30
}

fn default_name_collision_retries() -> u32 {
    3
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            resync_interval_ms: default_resync_interval_ms(),
            termination_grace_secs: default_termination_grace_secs(),
            name_collision_retries: default_name_collision_retries(),
            working_dir: None,
        }
    }
}

impl ControllerSettings {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CronSettings {
    /// Interval between scheduler evaluations, in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Missed occurrences inspected per evaluation before giving up
    #[serde(default = "default_max_missed_schedules")]
    pub max_missed_schedules: u32,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_missed_schedules() -> u32 {
    100
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_missed_schedules: default_max_missed_schedules(),
        }
    }
}

impl CronSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    /// SQLite database path; `~` is expanded
    pub path: Option<String>,
}

impl StoreSettings {
    /// Resolve the database path, defaulting under the user data directory
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.path {
            return Ok(PathBuf::from(shellexpand::tilde(path).as_ref()));
        }

        let data_dir = dirs::data_dir().context("Could not determine data directory")?;
        Ok(data_dir.join("flowctl").join("flowctl.db"))
    }
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/flowctl/config.toml
    /// 3. .flowctl/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                let user_config = Self::load_file(&user_config_path)
                    .with_context(|| format!("loading {}", user_config_path.display()))?;
                config.merge(user_config);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".flowctl/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".flowctl/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        config.validate().map_err(|errors| {
            anyhow::anyhow!("invalid configuration:\n  {}", errors.join("\n  "))
        })?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/flowctl/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("flowctl/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    ///
    /// A field left at its built-in default in `other` does not override.
    pub fn merge(&mut self, other: Self) {
        if other.defaults.namespace != default_namespace() {
            self.defaults.namespace = other.defaults.namespace;
        }

        let controller = ControllerSettings::default();
        if other.controller.resync_interval_ms != controller.resync_interval_ms {
            self.controller.resync_interval_ms = other.controller.resync_interval_ms;
        }
        if other.controller.termination_grace_secs != controller.termination_grace_secs {
            self.controller.termination_grace_secs = other.controller.termination_grace_secs;
        }
        if other.controller.name_collision_retries != controller.name_collision_retries {
            self.controller.name_collision_retries = other.controller.name_collision_retries;
        }
        if other.controller.working_dir.is_some() {
            self.controller.working_dir = other.controller.working_dir;
        }

        let retry = RetrySettings::default();
        if other.retry.max_retries != retry.max_retries {
            self.retry.max_retries = other.retry.max_retries;
        }
        if other.retry.initial_delay_ms != retry.initial_delay_ms {
            self.retry.initial_delay_ms = other.retry.initial_delay_ms;
        }
        if other.retry.max_delay_ms != retry.max_delay_ms {
            self.retry.max_delay_ms = other.retry.max_delay_ms;
        }
        if other.retry.backoff_multiplier != retry.backoff_multiplier {
            self.retry.backoff_multiplier = other.retry.backoff_multiplier;
        }
        if !other.retry.jitter {
            self.retry.jitter = false;
        }

        let cron = CronSettings::default();
        if other.cron.tick_interval_ms != cron.tick_interval_ms {
            self.cron.tick_interval_ms = other.cron.tick_interval_ms;
        }
        if other.cron.max_missed_schedules != cron.max_missed_schedules {
            self.cron.max_missed_schedules = other.cron.max_missed_schedules;
        }

        if other.store.path.is_some() {
            self.store.path = other.store.path;
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.defaults.namespace.trim().is_empty() {
            errors.push("defaults.namespace must not be empty".to_string());
        }
        if self.controller.resync_interval_ms == 0 {
            errors.push("controller.resync_interval_ms must be positive".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            errors.push("retry.backoff_multiplier must be at least 1.0".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.initial_delay_ms exceeds retry.max_delay_ms".to_string());
        }
        if self.cron.tick_interval_ms == 0 {
            errors.push("cron.tick_interval_ms must be positive".to_string());
        }
        if self.cron.max_missed_schedules == 0 {
            errors.push("cron.max_missed_schedules must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
