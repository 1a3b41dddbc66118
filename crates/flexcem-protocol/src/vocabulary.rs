// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Enumerated protocol values

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flexibility control type a resource can be driven with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    #[serde(rename = "POWER_ENVELOPE_BASED_CONTROL", alias = "PEBC")]
    PowerEnvelopeBased,
    #[serde(rename = "POWER_PROFILE_BASED_CONTROL", alias = "PPBC")]
    PowerProfileBased,
    #[serde(rename = "OPERATION_MODE_BASED_CONTROL", alias = "OMBC")]
    OperationModeBased,
    #[serde(rename = "FILL_RATE_BASED_CONTROL", alias = "FRBC")]
    FillRateBased,
    #[serde(rename = "DEMAND_DRIVEN_BASED_CONTROL", alias = "DDBC")]
    DemandDrivenBased,
    #[serde(rename = "NOT_CONTROLABLE", alias = "NotControllable")]
    NotControllable,
    #[serde(rename = "NO_SELECTION")]
    NoSelection,
}

impl ControlType {
    pub const ALL: [ControlType; 7] = [
        ControlType::PowerEnvelopeBased,
        ControlType::PowerProfileBased,
        ControlType::OperationModeBased,
        ControlType::FillRateBased,
        ControlType::DemandDrivenBased,
        ControlType::NotControllable,
        ControlType::NoSelection,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlType::PowerEnvelopeBased => "POWER_ENVELOPE_BASED_CONTROL",
            ControlType::PowerProfileBased => "POWER_PROFILE_BASED_CONTROL",
            ControlType::OperationModeBased => "OPERATION_MODE_BASED_CONTROL",
            ControlType::FillRateBased => "FILL_RATE_BASED_CONTROL",
            ControlType::DemandDrivenBased => "DEMAND_DRIVEN_BASED_CONTROL",
            ControlType::NotControllable => "NOT_CONTROLABLE",
            ControlType::NoSelection => "NO_SELECTION",
        }
    }

    /// Prefix of the control-type-scoped message types (`FRBC.Instruction`, ...)
    ///
    /// `None` for the two pseudo types that carry no messages of their own.
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            ControlType::PowerEnvelopeBased => Some("PEBC"),
            ControlType::PowerProfileBased => Some("PPBC"),
            ControlType::OperationModeBased => Some("OMBC"),
            ControlType::FillRateBased => Some("FRBC"),
            ControlType::DemandDrivenBased => Some("DDBC"),
            ControlType::NotControllable | ControlType::NoSelection => None,
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ct| ct.prefix() == Some(prefix))
    }

    /// Whether instructions can be issued under this control type
    pub fn is_controllable(&self) -> bool {
        self.prefix().is_some()
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised control type name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown control type: {0}")]
pub struct UnknownControlType(pub String);

impl FromStr for ControlType {
    type Err = UnknownControlType;

    /// Accepts the wire name or the short alias
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "NotControllable" {
            return Ok(ControlType::NotControllable);
        }
        Self::ALL
            .into_iter()
            .find(|ct| ct.as_str() == s || ct.prefix() == Some(s))
            .ok_or_else(|| UnknownControlType(s.to_string()))
    }
}

/// Outcome carried by a `ReceptionStatus` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceptionStatusValue {
    Ok,
    InvalidData,
    InvalidMessage,
    InvalidContent,
    TemporaryError,
    PermanentError,
}

impl ReceptionStatusValue {
    pub fn is_ok(&self) -> bool {
        matches!(self, ReceptionStatusValue::Ok)
    }
}

/// Instruction status as reported by a resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionStatus {
    New,
    Accepted,
    Rejected,
    Revoked,
    Started,
    Succeeded,
    Aborted,
}

/// Request carried by a `SessionRequest` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionRequestType {
    Reconnect,
    Terminate,
}

/// Role announced in a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyManagementRole {
    #[serde(rename = "CEM")]
    Cem,
    #[serde(rename = "RM")]
    Rm,
}
