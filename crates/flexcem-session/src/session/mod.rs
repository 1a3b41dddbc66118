// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection sessions
//!
//! [`machine`] holds the pure protocol state machine; [`actor`] runs one
//! machine per tokio task and exposes it through a [`SessionHandle`].

pub mod actor;
pub mod machine;

pub use actor::SessionHandle;
pub use machine::{SessionAction, SessionMachine};

use flexcem_protocol::ControlType;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::dispatcher::InstructionRecord;
use crate::events::EndReason;

/// Opaque session identifier, stable for the life of one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Handshaking,
    NegotiatingControlType,
    Describing,
    Operational,
    Closing,
    Closed,
}

impl SessionState {
    /// CLOSING or CLOSED
    pub fn is_ending(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// Point-in-time view of a session, published after every step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub peer: String,
    pub state: SessionState,
    pub protocol_version: Option<String>,
    pub control_type: Option<ControlType>,
    pub resource_id: Option<String>,
    pub available_control_types: Vec<ControlType>,
    pub resource_description: Option<Map<String, Value>>,
    pub pending_outbound: usize,
    pub consecutive_violations: u32,
    pub current_instruction: Option<InstructionRecord>,
    /// Set on entering CLOSING
    pub end_reason: Option<EndReason>,
}
