//! Comprehensive unit tests for config.rs module

use std::io::Write;

use crowd_confirm::config::AppConfig;
use crowd_confirm::consensus::ThresholdPolicy;

#[test]
fn test_default_config_values() {
    let config = AppConfig::default();

    assert_eq!(config.database.path, "data/crowd_confirm.db");
    assert_eq!(config.database.max_connections, 8);
    assert_eq!(config.database.busy_timeout_ms, 5000);
}

#[test]
fn test_default_logging_config() {
    let config = AppConfig::default();

    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.file_path, None);
    assert_eq!(config.logging.format, "text");
}

#[test]
fn test_default_reminder_config() {
    let config = AppConfig::default();

    assert_eq!(config.reminders.max_attempts_per_event, 2);
    assert_eq!(config.reminders.daily_cap, 8);
    assert_eq!(config.reminders.quiet_start_hour, 22);
    assert_eq!(config.reminders.quiet_end_hour, 7);
    assert_eq!(config.program_notifier.interval_secs, 60);
    assert_eq!(config.daily_reminder.hour, 19);
}

#[test]
fn test_default_threshold_is_fixed_three() {
    let config = AppConfig::default();
    assert_eq!(config.threshold_policy(), ThresholdPolicy::Fixed(3));
    assert_eq!(config.consensus.default_expiry_minutes, 60);
}

#[test]
fn test_config_validation_success() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_zero_max_connections() {
    let mut config = AppConfig::default();
    config.database.max_connections = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_invalid_log_level() {
    let mut config = AppConfig::default();
    config.logging.level = "invalid".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_valid_log_levels() {
    let valid_levels = vec!["trace", "debug", "info", "warn", "error"];
    for level in valid_levels {
        let mut config = AppConfig::default();
        config.logging.level = level.to_string();
        assert!(config.validate().is_ok(), "Failed for level: {}", level);
    }
}

#[test]
fn test_config_validation_invalid_log_format() {
    let mut config = AppConfig::default();
    config.logging.format = "xml".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_zero_threshold() {
    let mut config = AppConfig::default();
    config.consensus.follower_count_limit = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_scaled_ratio_bounds() {
    let mut config = AppConfig::default();
    config.consensus.threshold_mode = "scaled".to_string();
    config.consensus.scaled_ratio = 0.0;
    assert!(config.validate().is_err());

    config.consensus.scaled_ratio = 0.25;
    assert!(config.validate().is_ok());

    config.consensus.max_follower_count_limit = 1;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_unknown_threshold_mode() {
    let mut config = AppConfig::default();
    config.consensus.threshold_mode = "majority".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_quiet_hours_in_range() {
    let mut config = AppConfig::default();
    config.reminders.quiet_start_hour = 24;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_offset_within_a_day() {
    let mut config = AppConfig::default();
    config.locale.utc_offset_minutes = -300;
    assert!(config.validate().is_ok());
    assert_eq!(config.local_offset().local_minus_utc(), -300 * 60);

    config.locale.utc_offset_minutes = 24 * 60;
    assert!(config.validate().is_err());
}

#[test]
fn test_load_from_file_overrides_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[consensus]
follower_count_limit = 4
threshold_mode = "scaled"
scaled_ratio = 0.5
max_follower_count_limit = 9

[reminders]
daily_cap = 3
"#
    )
    .unwrap();

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(
        config.threshold_policy(),
        ThresholdPolicy::Scaled {
            ratio: 0.5,
            min: 4,
            max: 9
        }
    );
    assert_eq!(config.reminders.daily_cap, 3);
    // Untouched keys keep their defaults
    assert_eq!(config.reminders.max_attempts_per_event, 2);
    assert_eq!(config.database.max_connections, 8);
}

#[test]
fn test_load_from_rejects_invalid_values() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[logging]\nlevel = \"loud\"").unwrap();
    assert!(AppConfig::load_from(file.path()).is_err());
}
