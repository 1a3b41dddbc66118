// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization
//!
//! Console output is always installed. With the `file-logging` feature a JSON
//! log file is also written into a timestamped run folder.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` means text
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Settings for [`init_logging`]
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Default level for crates without a debug flag
    pub level: String,
    pub format: LogFormat,
    pub debug_flags: CrateDebugFlags,
    /// Base directory for log files (only used with `file-logging`)
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            debug_flags: CrateDebugFlags::default(),
            log_dir: None,
        }
    }
}

/// Keeps background log writers alive; drop it at process exit to flush
pub struct LoggingGuard {
    #[cfg(feature = "file-logging")]
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    /// Run folder the log file is written to, if file logging is active
    pub fn log_dir(&self) -> Option<&std::path::Path> {
        self.log_dir.as_deref()
    }
}

/// Build the filter directive for a set of options
///
/// `RUST_LOG` takes precedence when set.
pub fn filter_directive(options: &LoggingOptions) -> String {
    std::env::var("RUST_LOG")
        .unwrap_or_else(|_| options.debug_flags.to_filter_string(&options.level))
}

/// Install the global tracing subscriber
///
/// # Errors
///
/// Fails if the filter directive does not parse, the log folder cannot be
/// created, or a global subscriber was already installed.
pub fn init_logging(options: &LoggingOptions) -> Result<LoggingGuard> {
    let directive = filter_directive(options);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow!("Invalid log filter '{}': {}", directive, e))?;

    let mut layers = Vec::new();

    let console_layer = match options.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };
    layers.push(console_layer);

    #[cfg(feature = "file-logging")]
    let (file_guard, log_dir) = match &options.log_dir {
        Some(base) => {
            use anyhow::Context;

            let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
            let run_folder = base.join(format!("run_{}", timestamp));
            std::fs::create_dir_all(&run_folder).with_context(|| {
                format!("Failed to create log directory: {}", run_folder.display())
            })?;

            let appender = tracing_appender::rolling::daily(&run_folder, "flexcem.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_filter = EnvFilter::try_new(&directive)
                .map_err(|e| anyhow!("Invalid log filter '{}': {}", directive, e))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .with_filter(file_filter)
                    .boxed(),
            );
            (Some(guard), Some(run_folder))
        }
        None => (None, None),
    };

    #[cfg(not(feature = "file-logging"))]
    let log_dir: Option<PathBuf> = None;

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(LoggingGuard {
        #[cfg(feature = "file-logging")]
        _file_guard: file_guard,
        log_dir,
    })
}

/// Initialize console logging from debug flags alone
pub fn init_logging_default(debug_flags: &CrateDebugFlags) -> Result<LoggingGuard> {
    init_logging(&LoggingOptions {
        debug_flags: debug_flags.clone(),
        ..LoggingOptions::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_name() {
        assert_eq!(LogFormat::from_name("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_name("text"), LogFormat::Text);
        assert_eq!(LogFormat::from_name("pretty"), LogFormat::Text);
    }

    #[test]
    fn test_invalid_filter_is_an_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let options = LoggingOptions {
            level: "flexcem=loud".to_string(),
            ..LoggingOptions::default()
        };
        assert!(init_logging(&options).is_err());
    }
}
