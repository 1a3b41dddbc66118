// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # flexcem Configuration System
//!
//! Type-safe configuration loader for the CEM session engine with support for:
//! - TOML file parsing
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flexcem_config::{load_config, FlexcemConfig};
//!
//! // Load configuration with automatic file discovery and overrides
//! let config = load_config(None, None).expect("Failed to load config");
//!
//! println!("Listening on {}:{}", config.server.host, config.server.port);
//! println!("Retry interval: {} ms", config.reliability.retry_interval_ms);
//! ```
//!
//! Every section is optional in the file; missing values fall back to the
//! defaults in [`types`]. Precedence is CLI > environment > file > defaults.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File name searched for by [`find_config_file`]
pub const CONFIG_FILE_NAME: &str = "flexcem_configuration.toml";

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::{apply_cli_overrides, apply_environment_overrides, find_config_file, load_config};
pub use types::*;
pub use validation::{validate_config, ConfigValidationError};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found. Searched: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    ParseError(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = FlexcemConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: FlexcemConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.reliability.max_attempts, config.reliability.max_attempts);
        assert_eq!(parsed.session.control_type_priority, config.session.control_type_priority);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err: ConfigError = toml::from_str::<FlexcemConfig>("[server\nport = 1")
            .unwrap_err()
            .into();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
