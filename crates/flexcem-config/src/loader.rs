// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! This module implements the 3-tier configuration loading system:
//! 1. TOML file (base defaults)
//! 2. Environment variables (runtime overrides)
//! 3. CLI arguments (explicit user overrides)

use crate::{ConfigError, ConfigResult, FlexcemConfig, CONFIG_FILE_NAME};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Find the flexcem configuration file
///
/// Search order:
/// 1. `FLEXCEM_CONFIG_PATH` environment variable
/// 2. Current working directory: `./flexcem_configuration.toml`
/// 3. Parent directories (up to 5 levels)
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var("FLEXCEM_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by FLEXCEM_CONFIG_PATH not found: {}",
            path.display()
        )));
    }

    let mut search_paths = Vec::new();

    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));

        let mut current = cwd.clone();
        for _ in 0..5 {
            if let Some(parent) = current.parent() {
                search_paths.push(parent.join(CONFIG_FILE_NAME));
                current = parent.to_path_buf();
            }
        }
    }

    for path in &search_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "flexcem configuration file '{}' not found in any of these locations:\n{}\n\nSet FLEXCEM_CONFIG_PATH environment variable to specify custom location.",
        CONFIG_FILE_NAME, search_list
    )))
}

/// Load configuration from TOML file
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, will search for config file.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Errors
///
/// Returns error if config file is not found or contains invalid TOML
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<FlexcemConfig> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config: FlexcemConfig = toml::from_str(&content)?;

    apply_environment_overrides(&mut config);

    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli);
    }

    Ok(config)
}

fn parse_into<T: FromStr>(value: &str, target: &mut T) {
    if let Ok(parsed) = value.parse::<T>() {
        *target = parsed;
    }
}

fn parse_bool(value: &str) -> bool {
    let lowered = value.to_lowercase();
    lowered == "true" || lowered == "1" || lowered == "yes"
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `FLEXCEM_HOST` -> `server.host`
/// - `FLEXCEM_PORT` -> `server.port`
/// - `FLEXCEM_WS_PATH` -> `server.path`
/// - `FLEXCEM_PROTOCOL_VERSIONS` -> `session.supported_protocol_versions` (comma-separated)
/// - `FLEXCEM_CONTROL_TYPE_PRIORITY` -> `session.control_type_priority` (comma-separated)
/// - `FLEXCEM_HANDSHAKE_TIMEOUT_MS` -> `session.handshake_timeout_ms`
/// - `FLEXCEM_IDLE_TIMEOUT_MS` -> `session.idle_timeout_ms`
/// - `FLEXCEM_VIOLATION_THRESHOLD` -> `session.protocol_violation_threshold`
/// - `FLEXCEM_REHYDRATE` -> `session.rehydrate_returning_resources`
/// - `FLEXCEM_RETRY_INTERVAL_MS` -> `reliability.retry_interval_ms`
/// - `FLEXCEM_MAX_ATTEMPTS` -> `reliability.max_attempts`
/// - `FLEXCEM_DEDUP_RETENTION_MS` -> `reliability.dedup_retention_window_ms`
/// - `FLEXCEM_EXECUTION_DEADLINE_MS` -> `instructions.execution_deadline_ms`
/// - `FLEXCEM_GRACE_PERIOD_MS` -> `shutdown.grace_period_ms`
/// - `FLEXCEM_LOG_LEVEL` -> `logging.level`
/// - `FLEXCEM_LOG_FORMAT` -> `logging.format`
pub fn apply_environment_overrides(config: &mut FlexcemConfig) {
    // Server
    if let Ok(value) = env::var("FLEXCEM_HOST") {
        config.server.host = value;
    }
    if let Ok(value) = env::var("FLEXCEM_PORT") {
        parse_into(&value, &mut config.server.port);
    }
    if let Ok(value) = env::var("FLEXCEM_WS_PATH") {
        config.server.path = value;
    }

    // Session
    if let Ok(value) = env::var("FLEXCEM_PROTOCOL_VERSIONS") {
        config.session.supported_protocol_versions = parse_list(&value);
    }
    if let Ok(value) = env::var("FLEXCEM_CONTROL_TYPE_PRIORITY") {
        config.session.control_type_priority = parse_list(&value);
    }
    if let Ok(value) = env::var("FLEXCEM_HANDSHAKE_TIMEOUT_MS") {
        parse_into(&value, &mut config.session.handshake_timeout_ms);
    }
    if let Ok(value) = env::var("FLEXCEM_IDLE_TIMEOUT_MS") {
        parse_into(&value, &mut config.session.idle_timeout_ms);
    }
    if let Ok(value) = env::var("FLEXCEM_VIOLATION_THRESHOLD") {
        parse_into(&value, &mut config.session.protocol_violation_threshold);
    }
    if let Ok(value) = env::var("FLEXCEM_REHYDRATE") {
        config.session.rehydrate_returning_resources = parse_bool(&value);
    }

    // Reliability
    if let Ok(value) = env::var("FLEXCEM_RETRY_INTERVAL_MS") {
        parse_into(&value, &mut config.reliability.retry_interval_ms);
    }
    if let Ok(value) = env::var("FLEXCEM_MAX_ATTEMPTS") {
        parse_into(&value, &mut config.reliability.max_attempts);
    }
    if let Ok(value) = env::var("FLEXCEM_DEDUP_RETENTION_MS") {
        parse_into(&value, &mut config.reliability.dedup_retention_window_ms);
    }

    // Instructions and shutdown
    if let Ok(value) = env::var("FLEXCEM_EXECUTION_DEADLINE_MS") {
        parse_into(&value, &mut config.instructions.execution_deadline_ms);
    }
    if let Ok(value) = env::var("FLEXCEM_GRACE_PERIOD_MS") {
        parse_into(&value, &mut config.shutdown.grace_period_ms);
    }

    // Logging
    if let Ok(value) = env::var("FLEXCEM_LOG_LEVEL") {
        config.logging.level = value;
    }
    if let Ok(value) = env::var("FLEXCEM_LOG_FORMAT") {
        config.logging.format = value;
    }
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - HashMap of CLI arguments (e.g., `{"host": "192.168.1.1", "port": "9000"}`)
pub fn apply_cli_overrides(config: &mut FlexcemConfig, cli_args: &HashMap<String, String>) {
    if let Some(value) = cli_args.get("host") {
        config.server.host = value.clone();
    }
    if let Some(value) = cli_args.get("port") {
        parse_into(value, &mut config.server.port);
    }
    if let Some(value) = cli_args.get("path") {
        config.server.path = value.clone();
    }
    if let Some(value) = cli_args.get("retry_interval_ms") {
        parse_into(value, &mut config.reliability.retry_interval_ms);
    }
    if let Some(value) = cli_args.get("max_attempts") {
        parse_into(value, &mut config.reliability.max_attempts);
    }
    if let Some(value) = cli_args.get("handshake_timeout_ms") {
        parse_into(value, &mut config.session.handshake_timeout_ms);
    }
    if let Some(value) = cli_args.get("violation_threshold") {
        parse_into(value, &mut config.session.protocol_violation_threshold);
    }
    if let Some(value) = cli_args.get("log_level") {
        config.logging.level = value.clone();
    }
    if let Some(value) = cli_args.get("log_format") {
        config.logging.format = value.clone();
    }
}
