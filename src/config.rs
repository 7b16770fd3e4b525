//! Ambient configuration: defaults merged with project and environment
//! overrides via `figment`, mirroring the teacher's hierarchical loader.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pollInterval must be positive")]
    InvalidPollInterval,

    #[error("limits.maxConcurrentTasks must be at least 1")]
    InvalidConcurrencyCap,

    #[error("database path must not be empty")]
    EmptyDatabasePath,

    #[error("logging level {0} is not one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("logging format {0} is not one of json, pretty")]
    InvalidLogFormat(String),

    #[error("timeBasedUsage.dayModeHours and nightModeHours overlap at hour {0}")]
    ModeHoursOverlap(u32),

    #[error("mode hour {0} is outside 0..23")]
    ModeHourOutOfRange(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_concurrent_tasks: u32,
    pub max_tokens_per_task: u64,
    pub max_cost_per_task_e4: i64,
    pub daily_budget_e4: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            max_tokens_per_task: 200_000,
            max_cost_per_task_e4: 500_000,
            daily_budget_e4: 10_000_000,
        }
    }
}

/// Absolute thresholds applied under one mode. Defaults to 80% of
/// `Limits` per §4.3; a configured value overrides the default outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeThresholds {
    pub concurrency_cap: u32,
    pub tokens_threshold: u64,
    pub cost_threshold_e4: i64,
}

impl ModeThresholds {
    fn from_limits_fraction(limits: &Limits, fraction: f64) -> Self {
        Self {
            concurrency_cap: limits.max_concurrent_tasks,
            tokens_threshold: (limits.max_tokens_per_task as f64 * fraction) as u64,
            cost_threshold_e4: (limits.max_cost_per_task_e4 as f64 * fraction) as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBasedUsage {
    pub enabled: bool,
    pub day_mode_hours: Vec<u32>,
    pub night_mode_hours: Vec<u32>,
    pub day_mode_thresholds: ModeThresholds,
    pub night_mode_thresholds: ModeThresholds,
    /// Off-hours is the hour range covered by neither list; its
    /// thresholds are not separately configurable and instead use the
    /// conservative (lower) of the day/night figures per axis.
    #[serde(skip)]
    pub off_hours_thresholds: Option<ModeThresholds>,
}

impl Default for TimeBasedUsage {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            enabled: true,
            day_mode_hours: (9..18).collect(),
            night_mode_hours: (18..24).chain(0..6).collect(),
            day_mode_thresholds: ModeThresholds::from_limits_fraction(&limits, 0.8),
            night_mode_thresholds: ModeThresholds::from_limits_fraction(&limits, 0.8),
            off_hours_thresholds: None,
        }
    }
}

impl TimeBasedUsage {
    /// Off-hours thresholds: the conservative minimum of day/night on
    /// every axis unless explicitly overridden.
    pub fn off_hours(&self) -> ModeThresholds {
        self.off_hours_thresholds.clone().unwrap_or_else(|| ModeThresholds {
            concurrency_cap: self.day_mode_thresholds.concurrency_cap.min(self.night_mode_thresholds.concurrency_cap),
            tokens_threshold: self.day_mode_thresholds.tokens_threshold.min(self.night_mode_thresholds.tokens_threshold),
            cost_threshold_e4: self.day_mode_thresholds.cost_threshold_e4.min(self.night_mode_thresholds.cost_threshold_e4),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".apex/apex.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub poll_interval_ms: u64,
    pub shutdown_drain_ms: u64,
    pub project_path: Option<String>,
    pub limits: Limits,
    pub time_based_usage: TimeBasedUsage,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl Config {
    fn with_field_defaults() -> Self {
        Self {
            poll_interval_ms: 1000,
            shutdown_drain_ms: 5000,
            project_path: None,
            limits: Limits::default(),
            time_based_usage: TimeBasedUsage::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Precedence (lowest to highest): programmatic defaults,
    /// `.apex/config.yaml`, `.apex/local.yaml`, `APEX_`-prefixed env
    /// (double underscore splits nesting).
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::with_field_defaults()))
            .merge(Yaml::file(".apex/config.yaml"))
            .merge(Yaml::file(".apex/local.yaml"))
            .merge(Env::prefixed("APEX_").split("__"))
            .extract()
            .context("failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::with_field_defaults()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if config.limits.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidConcurrencyCap);
        }
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        for &hour in config
            .time_based_usage
            .day_mode_hours
            .iter()
            .chain(&config.time_based_usage.night_mode_hours)
        {
            if hour > 23 {
                return Err(ConfigError::ModeHourOutOfRange(hour));
            }
        }
        for &hour in &config.time_based_usage.day_mode_hours {
            if config.time_based_usage.night_mode_hours.contains(&hour) {
                return Err(ConfigError::ModeHoursOverlap(hour));
            }
        }

        Ok(())
    }
}
