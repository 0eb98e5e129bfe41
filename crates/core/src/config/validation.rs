use super::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a timeout is reasonable
    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 86400 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 86400"
            )));
        }
        Ok(())
    }

    /// Validate that a count is reasonable
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate a `host:port` socket address
    pub fn validate_socket_address(address: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(address, field_name)?;

        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be in host:port format"
            )));
        };
        if host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} is missing the host part"
            )));
        }
        match port.parse::<u16>() {
            Ok(_) => Ok(()),
            Err(_) => Err(ConfigError::Validation(format!(
                "{field_name} has an invalid port: {port}"
            ))),
        }
    }

    /// Validate that a value is one of the allowed options
    pub fn validate_one_of(value: &str, allowed: &[&str], field_name: &str) -> ConfigResult<()> {
        if !allowed.contains(&value) {
            return Err(ConfigError::Validation(format!(
                "Invalid {field_name}: {value}. Valid options: {allowed:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_socket_address() {
        assert!(ValidationUtils::validate_socket_address("127.0.0.1:7890", "addr").is_ok());
        assert!(ValidationUtils::validate_socket_address("localhost:0", "addr").is_ok());
        assert!(ValidationUtils::validate_socket_address("", "addr").is_err());
        assert!(ValidationUtils::validate_socket_address("127.0.0.1", "addr").is_err());
        assert!(ValidationUtils::validate_socket_address(":80", "addr").is_err());
        assert!(ValidationUtils::validate_socket_address("host:99999", "addr").is_err());
    }

    #[test]
    fn test_validate_count() {
        assert!(ValidationUtils::validate_count(1, "c", 10).is_ok());
        assert!(ValidationUtils::validate_count(0, "c", 10).is_err());
        assert!(ValidationUtils::validate_count(11, "c", 10).is_err());
    }
}
