// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! Checks that timer values are usable, bounds are non-zero and the control
//! type priority list only names control types the engine knows about.

use crate::{ConfigError, ConfigResult, FlexcemConfig};

/// Control type names accepted in `session.control_type_priority`
pub const KNOWN_CONTROL_TYPES: &[&str] = &[
    "POWER_ENVELOPE_BASED_CONTROL",
    "POWER_PROFILE_BASED_CONTROL",
    "OPERATION_MODE_BASED_CONTROL",
    "FILL_RATE_BASED_CONTROL",
    "DEMAND_DRIVEN_BASED_CONTROL",
    "NOT_CONTROLABLE",
    "PEBC",
    "PPBC",
    "OMBC",
    "FRBC",
    "DDBC",
    "NotControllable",
];

/// Validation errors that can occur during config validation
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    InvalidPortRange { port: u16 },
    MissingRequired { field: String },
    InvalidValue { field: String, reason: String },
    UnknownControlType { name: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPortRange { port } => {
                write!(f, "server.port = {} is outside valid range (1024-65535)", port)
            }
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
            Self::UnknownControlType { name } => {
                write!(f, "Unknown control type in session.control_type_priority: {}", name)
            }
        }
    }
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &FlexcemConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_server(config, &mut errors);
    validate_session(config, &mut errors);
    validate_reliability(config, &mut errors);
    validate_capacities(config, &mut errors);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

fn require_positive(field: &str, value: u64, errors: &mut Vec<ConfigValidationError>) {
    if value == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: field.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
}

fn validate_server(config: &FlexcemConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.server.host.trim().is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "server.host".to_string(),
        });
    }
    if config.server.port < 1024 {
        errors.push(ConfigValidationError::InvalidPortRange {
            port: config.server.port,
        });
    }
    if !config.server.path.starts_with('/') {
        errors.push(ConfigValidationError::InvalidValue {
            field: "server.path".to_string(),
            reason: format!("'{}' must start with '/'", config.server.path),
        });
    }
}

fn validate_session(config: &FlexcemConfig, errors: &mut Vec<ConfigValidationError>) {
    let session = &config.session;

    if session.supported_protocol_versions.is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "session.supported_protocol_versions".to_string(),
        });
    }

    for name in &session.control_type_priority {
        if !KNOWN_CONTROL_TYPES.contains(&name.as_str()) {
            errors.push(ConfigValidationError::UnknownControlType { name: name.clone() });
        }
    }

    require_positive("session.handshake_timeout_ms", session.handshake_timeout_ms, errors);
    require_positive("session.negotiation_timeout_ms", session.negotiation_timeout_ms, errors);
    require_positive("session.description_timeout_ms", session.description_timeout_ms, errors);

    if session.protocol_violation_threshold == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "session.protocol_violation_threshold".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
}

fn validate_reliability(config: &FlexcemConfig, errors: &mut Vec<ConfigValidationError>) {
    let reliability = &config.reliability;

    require_positive("reliability.retry_interval_ms", reliability.retry_interval_ms, errors);
    require_positive(
        "reliability.dedup_retention_window_ms",
        reliability.dedup_retention_window_ms,
        errors,
    );

    if reliability.max_attempts == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "reliability.max_attempts".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if reliability.dedup_max_entries == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "reliability.dedup_max_entries".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    // The reliability layer must be able to give up before the session does
    if config.session.idle_timeout_ms > 0 {
        let give_up_ms = reliability
            .retry_interval_ms
            .saturating_mul(u64::from(reliability.max_attempts));
        if give_up_ms > config.session.idle_timeout_ms {
            errors.push(ConfigValidationError::InvalidValue {
                field: "reliability.retry_interval_ms".to_string(),
                reason: format!(
                    "retry_interval_ms * max_attempts ({} ms) exceeds session.idle_timeout_ms ({} ms)",
                    give_up_ms, config.session.idle_timeout_ms
                ),
            });
        }
    }
}

fn validate_capacities(config: &FlexcemConfig, errors: &mut Vec<ConfigValidationError>) {
    require_positive("instructions.execution_deadline_ms", config.instructions.execution_deadline_ms, errors);

    let capacities = [
        ("session.command_queue_capacity", config.session.command_queue_capacity),
        ("instructions.history_size", config.instructions.history_size),
        ("events.channel_capacity", config.events.channel_capacity),
    ];
    for (field, value) in capacities {
        if value == 0 {
            errors.push(ConfigValidationError::InvalidValue {
                field: field.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
    }

    if !matches!(config.logging.format.as_str(), "text" | "json") {
        errors.push(ConfigValidationError::InvalidValue {
            field: "logging.format".to_string(),
            reason: format!("'{}' is not one of: text, json", config.logging.format),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FlexcemConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = FlexcemConfig::default();
        config.reliability.max_attempts = 0;
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("reliability.max_attempts"));
    }

    #[test]
    fn test_unknown_control_type_rejected() {
        let mut config = FlexcemConfig::default();
        config.session.control_type_priority = vec!["FRBC".to_string(), "TURBO".to_string()];
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("TURBO"));
        assert!(!err.contains("FRBC"));
    }

    #[test]
    fn test_all_errors_are_reported() {
        let mut config = FlexcemConfig::default();
        config.server.port = 80;
        config.session.supported_protocol_versions.clear();
        config.logging.format = "xml".to_string();

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("server.port = 80"));
        assert!(err.contains("session.supported_protocol_versions"));
        assert!(err.contains("logging.format"));
    }

    #[test]
    fn test_retry_budget_must_fit_idle_timeout() {
        let mut config = FlexcemConfig::default();
        config.session.idle_timeout_ms = 1_000;
        assert!(validate_config(&config).is_err());

        config.session.idle_timeout_ms = 0;
        assert!(validate_config(&config).is_ok());
    }
}
