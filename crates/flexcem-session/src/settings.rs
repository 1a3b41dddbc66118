// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Engine settings resolved from [`FlexcemConfig`]

use std::time::Duration;

use flexcem_config::FlexcemConfig;
use flexcem_protocol::ControlType;

use crate::error::{EngineError, Result};

/// Typed, validated view of the configuration used by sessions and the registry
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub supported_protocol_versions: Vec<String>,
    pub control_type_priority: Vec<ControlType>,
    pub handshake_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub description_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub protocol_violation_threshold: u32,
    pub retry_interval: Duration,
    pub max_attempts: u32,
    pub dedup_retention_window: Duration,
    pub dedup_max_entries: usize,
    pub instruction_execution_deadline: Duration,
    pub instruction_history_size: usize,
    pub rehydrate_returning_resources: bool,
    pub rehydration_archive_size: usize,
    pub command_queue_capacity: usize,
    pub event_channel_capacity: usize,
    pub shutdown_grace_period: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let priority = vec![
            ControlType::FillRateBased,
            ControlType::PowerProfileBased,
            ControlType::OperationModeBased,
            ControlType::PowerEnvelopeBased,
            ControlType::DemandDrivenBased,
            ControlType::NotControllable,
        ];
        Self::resolve(&FlexcemConfig::default(), priority)
    }
}

impl EngineSettings {
    /// Resolve settings, parsing control type names
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for unknown control type names or zero-sized bounds.
    pub fn from_config(config: &FlexcemConfig) -> Result<Self> {
        let control_type_priority = config
            .session
            .control_type_priority
            .iter()
            .map(|name| {
                name.parse::<ControlType>()
                    .map_err(|e| EngineError::InvalidConfig(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        if config.session.supported_protocol_versions.is_empty() {
            return Err(EngineError::InvalidConfig(
                "session.supported_protocol_versions must not be empty".to_string(),
            ));
        }
        if config.reliability.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "reliability.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self::resolve(config, control_type_priority))
    }

    fn resolve(config: &FlexcemConfig, control_type_priority: Vec<ControlType>) -> Self {
        Self {
            supported_protocol_versions: config.session.supported_protocol_versions.clone(),
            control_type_priority,
            handshake_timeout: config.session.handshake_timeout(),
            negotiation_timeout: config.session.negotiation_timeout(),
            description_timeout: config.session.description_timeout(),
            idle_timeout: config.session.idle_timeout(),
            protocol_violation_threshold: config.session.protocol_violation_threshold.max(1),
            retry_interval: config.reliability.retry_interval(),
            max_attempts: config.reliability.max_attempts,
            dedup_retention_window: config.reliability.dedup_retention_window(),
            dedup_max_entries: config.reliability.dedup_max_entries.max(1),
            instruction_execution_deadline: config.instructions.execution_deadline(),
            instruction_history_size: config.instructions.history_size.max(1),
            rehydrate_returning_resources: config.session.rehydrate_returning_resources,
            rehydration_archive_size: config.session.rehydration_archive_size,
            command_queue_capacity: config.session.command_queue_capacity.max(1),
            event_channel_capacity: config.events.channel_capacity.max(1),
            shutdown_grace_period: config.shutdown.grace_period(),
        }
    }

    /// Rank of a control type, lowest first; `None` for types the CEM does not support
    pub fn priority_rank(&self, control_type: ControlType) -> Option<usize> {
        self.control_type_priority
            .iter()
            .position(|ct| *ct == control_type)
    }

    pub fn supports(&self, control_type: ControlType) -> bool {
        self.priority_rank(control_type).is_some()
    }
}
