// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `flexcem_configuration.toml`. Durations are expressed in milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FlexcemConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub reliability: ReliabilityConfig,
    pub instructions: InstructionConfig,
    pub shutdown: ShutdownConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

/// WebSocket listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request path RMs connect to (`/ws` in the reference deployment)
    pub path: String,
    /// Largest accepted inbound frame in bytes
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/ws".to_string(),
            max_frame_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding a listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-session protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Protocol versions offered in the handshake proposal, most preferred first
    pub supported_protocol_versions: Vec<String>,
    /// Supported control types in descending priority; types not listed are never selected
    pub control_type_priority: Vec<String>,
    pub handshake_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub description_timeout_ms: u64,
    /// Close the session after this long without inbound traffic (0 disables)
    pub idle_timeout_ms: u64,
    /// Consecutive protocol violations tolerated before the session is force-closed
    pub protocol_violation_threshold: u32,
    /// Restore the last known description for an RM that reconnects with the same resource id
    pub rehydrate_returning_resources: bool,
    /// Number of closed-session descriptions kept for rehydration
    pub rehydration_archive_size: usize,
    /// Bounded queue between the registry and a session task
    pub command_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            supported_protocol_versions: vec!["0.1.0".to_string()],
            control_type_priority: vec![
                "FILL_RATE_BASED_CONTROL".to_string(),
                "POWER_PROFILE_BASED_CONTROL".to_string(),
                "OPERATION_MODE_BASED_CONTROL".to_string(),
                "POWER_ENVELOPE_BASED_CONTROL".to_string(),
                "DEMAND_DRIVEN_BASED_CONTROL".to_string(),
                "NOT_CONTROLABLE".to_string(),
            ],
            handshake_timeout_ms: 10_000,
            negotiation_timeout_ms: 30_000,
            description_timeout_ms: 60_000,
            idle_timeout_ms: 300_000,
            protocol_violation_threshold: 5,
            rehydrate_returning_resources: true,
            rehydration_archive_size: 256,
            command_queue_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn description_timeout(&self) -> Duration {
        Duration::from_millis(self.description_timeout_ms)
    }

    /// `None` when idle detection is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// At-least-once delivery and deduplication settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub retry_interval_ms: u64,
    pub max_attempts: u32,
    pub dedup_retention_window_ms: u64,
    pub dedup_max_entries: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 2_000,
            max_attempts: 3,
            dedup_retention_window_ms: 600_000,
            dedup_max_entries: 1_000,
        }
    }
}

impl ReliabilityConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn dedup_retention_window(&self) -> Duration {
        Duration::from_millis(self.dedup_retention_window_ms)
    }
}

/// Instruction dispatch settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstructionConfig {
    /// Time allowed for an instruction to reach a terminal status once it is due
    pub execution_deadline_ms: u64,
    /// Finished instructions remembered per session
    pub history_size: usize,
}

impl Default for InstructionConfig {
    fn default() -> Self {
        Self {
            execution_deadline_ms: 900_000,
            history_size: 100,
        }
    }
}

impl InstructionConfig {
    pub fn execution_deadline(&self) -> Duration {
        Duration::from_millis(self.execution_deadline_ms)
    }
}

/// Process shutdown settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_period_ms: 5_000 }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Engine event fan-out settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { channel_capacity: 1024 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Console output format: "text" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
