// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
CEM Server

Runs the session engine behind a WebSocket listener and logs every engine
event until Ctrl-C.

Usage:
  cargo run --bin cem_server -- [--config <flexcem_configuration.toml>] [--<key>=<value> ...] [--debug-<crate>]

Overrides (see `flexcem_config::apply_cli_overrides`):
  --host, --port, --path, --retry_interval_ms, --max_attempts,
  --handshake_timeout_ms, --violation_threshold, --log_level, --log_format

Example:
  cargo run --bin cem_server -- --config flexcem_configuration.toml --port=9000 --debug-flexcem-session
*/

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use flexcem::config::{load_config, validate_config};
use flexcem::observability::{init_logging, parse_debug_flags, LogFormat, LoggingOptions};
use flexcem::session::{EngineEventKind, SessionRegistry};
use flexcem::transports::websocket::server::{WsListener, WsListenerConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

struct Args {
    config_path: Option<PathBuf>,
    overrides: HashMap<String, String>,
    log_dir: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut parsed = Args {
        config_path: None,
        overrides: HashMap::new(),
        log_dir: None,
    };

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow!("--config requires a path"))?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            "--log-dir" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow!("--log-dir requires a path"))?;
                parsed.log_dir = Some(PathBuf::from(path));
            }
            // Handled by parse_debug_flags
            flag if flag.starts_with("--debug-") => {}
            flag => {
                let (key, value) = flag
                    .strip_prefix("--")
                    .and_then(|rest| rest.split_once('='))
                    .ok_or_else(|| anyhow!("Unrecognized argument: {}", flag))?;
                parsed.overrides.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let raw_args: Vec<String> = env::args().collect();
    let args = parse_args(&raw_args)?;

    let config = load_config(args.config_path.as_deref(), Some(&args.overrides))
        .context("Failed to load configuration")?;
    validate_config(&config).context("Invalid configuration")?;

    let _logging = init_logging(&LoggingOptions {
        level: config.logging.level.clone(),
        format: LogFormat::from_name(&config.logging.format),
        debug_flags: parse_debug_flags(),
        log_dir: args.log_dir.clone(),
    })?;

    info!("⚡ flexcem CEM server v{}", env!("CARGO_PKG_VERSION"));

    let registry = SessionRegistry::from_config(&config)?;
    let listener = WsListener::bind(WsListenerConfig {
        address: config.server.bind_address(),
        path: config.server.path.clone(),
        max_message_size: config.server.max_frame_size,
        ..WsListenerConfig::default()
    })
    .await?;
    let server = registry.serve(listener);

    let mut events = registry.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    match &event.kind {
                        EngineEventKind::ProtocolViolation { .. }
                        | EngineEventKind::HandshakeFailed { .. } => warn!("[EVENT] {}", json),
                        EngineEventKind::Telemetry { .. } => debug!("[EVENT] {}", json),
                        _ => info!("[EVENT] {}", json),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[EVENT] Event log fell behind, {} events skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", err);
    }
    info!("Ctrl-C received, shutting down");

    registry.shutdown(config.shutdown.grace_period()).await;
    server.abort();
    event_log.abort();

    info!("✅ Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cem_server")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_config_and_overrides() {
        let parsed = parse_args(&args(&[
            "--config",
            "site.toml",
            "--port=9000",
            "--debug-flexcem-session",
        ]))
        .unwrap();
        assert_eq!(parsed.config_path, Some(PathBuf::from("site.toml")));
        assert_eq!(parsed.overrides.get("port").map(String::as_str), Some("9000"));
        assert_eq!(parsed.overrides.len(), 1);
    }

    #[test]
    fn test_parse_rejects_bare_words() {
        assert!(parse_args(&args(&["serve"])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
    }
}
