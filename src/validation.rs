use crate::error::{CoreError, Result};

/// Longest device id accepted
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Validation utilities for input sanitization and edge case handling
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a device identifier
    pub fn validate_device_id(device_id: &str) -> Result<()> {
        if device_id.trim().is_empty() {
            return Err(CoreError::Validation("device id cannot be empty".to_string()));
        }

        if device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(CoreError::Validation(format!(
                "device id too long (max {MAX_DEVICE_ID_LEN} characters)"
            )));
        }

        if device_id.chars().any(char::is_control) {
            return Err(CoreError::Validation("device id contains invalid characters".to_string()));
        }

        Ok(())
    }

    /// Validate a positive row id
    pub fn validate_id(field: &str, id: i64) -> Result<()> {
        if id <= 0 {
            return Err(CoreError::Validation(format!("{field} must be positive")));
        }
        Ok(())
    }
}
