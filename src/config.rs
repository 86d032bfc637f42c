use anyhow::Result;
use chrono::{FixedOffset, Offset, Utc};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::consensus::ThresholdPolicy;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub locale: LocaleConfig,
    pub consensus: ConsensusConfig,
    pub reminders: ReminderConfig,
    pub program_notifier: ProgramNotifierConfig,
    pub daily_reminder: DailyReminderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

/// Offset used for "local" calendar days and quiet hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocaleConfig {
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Fixed threshold, or the floor when `threshold_mode` is "scaled".
    pub follower_count_limit: u32,
    /// "fixed" or "scaled"
    pub threshold_mode: String,
    /// Share of the roster required when scaled.
    pub scaled_ratio: f64,
    /// Ceiling when scaled.
    pub max_follower_count_limit: u32,
    /// Expiry for events whose program has no end time.
    pub default_expiry_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    pub interval_secs: u64,
    pub max_attempts_per_event: u32,
    pub daily_cap: u32,
    pub quiet_start_hour: u32,
    pub quiet_end_hour: u32,
    pub attempt_spacing_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramNotifierConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReminderConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub hour: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "data/crowd_confirm.db".to_string(),
                max_connections: 8,
                busy_timeout_ms: 5000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_path: None,
                format: "text".to_string(),
            },
            locale: LocaleConfig { utc_offset_minutes: 0 },
            consensus: ConsensusConfig {
                follower_count_limit: 3,
                threshold_mode: "fixed".to_string(),
                scaled_ratio: 0.1,
                max_follower_count_limit: 10,
                default_expiry_minutes: 60,
            },
            reminders: ReminderConfig {
                interval_secs: 300,
                max_attempts_per_event: 2,
                daily_cap: 8,
                quiet_start_hour: 22,
                quiet_end_hour: 7,
                attempt_spacing_secs: 600,
            },
            program_notifier: ProgramNotifierConfig { interval_secs: 60 },
            daily_reminder: DailyReminderConfig {
                enabled: true,
                interval_secs: 900,
                hour: 19,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        Self::build(
            Config::builder()
                .add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name("config/local").required(false)),
        )
    }

    /// Load configuration from a single explicit file, still honoring the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from(path).required(true)))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let defaults = Config::try_from(&Self::default())
            .map_err(|e| anyhow::anyhow!("Failed to encode default configuration: {}", e))?;

        // Defaults go first so that every later source overrides them.
        let config = Config::builder()
            .add_source(defaults)
            .add_source(builder.build().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?)
            .add_source(
                Environment::with_prefix("CROWD_CONFIRM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to deserialize configuration: {}", e))?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        if self.locale.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(anyhow::anyhow!("utc_offset_minutes must be within one day"));
        }

        if self.consensus.follower_count_limit == 0 {
            return Err(anyhow::anyhow!("follower_count_limit must be greater than 0"));
        }
        let valid_modes = ["fixed", "scaled"];
        if !valid_modes.contains(&self.consensus.threshold_mode.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid threshold mode: {}. Must be one of: {:?}",
                self.consensus.threshold_mode,
                valid_modes
            ));
        }
        if self.consensus.threshold_mode == "scaled" {
            if !(self.consensus.scaled_ratio > 0.0 && self.consensus.scaled_ratio <= 1.0) {
                return Err(anyhow::anyhow!("scaled_ratio must be in (0, 1]"));
            }
            if self.consensus.max_follower_count_limit < self.consensus.follower_count_limit {
                return Err(anyhow::anyhow!(
                    "max_follower_count_limit must not be below follower_count_limit"
                ));
            }
        }
        if self.consensus.default_expiry_minutes <= 0 {
            return Err(anyhow::anyhow!("default_expiry_minutes must be greater than 0"));
        }

        if self.reminders.interval_secs == 0 || self.program_notifier.interval_secs == 0 {
            return Err(anyhow::anyhow!("worker intervals must be greater than 0"));
        }
        if self.reminders.quiet_start_hour > 23 || self.reminders.quiet_end_hour > 23 {
            return Err(anyhow::anyhow!("quiet hours must be between 0 and 23"));
        }
        if self.reminders.attempt_spacing_secs < 0 {
            return Err(anyhow::anyhow!("attempt_spacing_secs must not be negative"));
        }

        if self.daily_reminder.hour > 23 {
            return Err(anyhow::anyhow!("daily_reminder.hour must be between 0 and 23"));
        }
        if self.daily_reminder.enabled && self.daily_reminder.interval_secs == 0 {
            return Err(anyhow::anyhow!("daily_reminder.interval_secs must be greater than 0"));
        }

        Ok(())
    }

    /// Offset used for local days and quiet hours
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.locale.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Threshold policy described by the consensus section
    pub fn threshold_policy(&self) -> ThresholdPolicy {
        if self.consensus.threshold_mode == "scaled" {
            ThresholdPolicy::Scaled {
                ratio: self.consensus.scaled_ratio,
                min: self.consensus.follower_count_limit,
                max: self.consensus.max_follower_count_limit,
            }
        } else {
            ThresholdPolicy::Fixed(self.consensus.follower_count_limit)
        }
    }

    /// Get log level from environment or config
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.path, "data/crowd_confirm.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.consensus.follower_count_limit, 3);
        assert_eq!(config.reminders.daily_cap, 8);
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AppConfig::default();
        config.database.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_policy_mode() {
        let mut config = AppConfig::default();
        assert_eq!(config.threshold_policy(), ThresholdPolicy::Fixed(3));

        config.consensus.threshold_mode = "scaled".to_string();
        assert!(matches!(config.threshold_policy(), ThresholdPolicy::Scaled { min: 3, max: 10, .. }));
    }
}
