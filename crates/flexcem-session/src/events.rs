// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle and domain events published by sessions
//!
//! Collaborators (schedulers, telemetry sinks) receive these through
//! [`SessionRegistry::subscribe`](crate::SessionRegistry::subscribe).

use flexcem_protocol::{ControlType, MessageId};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::dispatcher::InstructionState;
use crate::session::SessionId;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Peer went away or the connection failed
    TransportClosed,
    /// No inbound traffic within the idle timeout
    IdleTimeout,
    HandshakeFailed,
    NegotiationTimeout,
    DescriptionTimeout,
    /// No advertised control type could be selected
    NegotiationFailed,
    /// Too many consecutive protocol violations
    ProtocolViolations,
    /// RM sent a SessionRequest
    PeerRequested,
    /// Closed through the registry
    ClosedByEngine,
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EndReason::TransportClosed => "transport closed",
            EndReason::IdleTimeout => "idle timeout",
            EndReason::HandshakeFailed => "handshake failed",
            EndReason::NegotiationTimeout => "control type negotiation timed out",
            EndReason::DescriptionTimeout => "system description timed out",
            EndReason::NegotiationFailed => "no selectable control type",
            EndReason::ProtocolViolations => "too many protocol violations",
            EndReason::PeerRequested => "requested by resource manager",
            EndReason::ClosedByEngine => "closed by engine",
            EndReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Event tagged with the session it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEventKind {
    SessionStarted {
        peer: String,
    },
    HandshakeCompleted {
        protocol_version: String,
    },
    /// Emitted at most once per session, always followed by `SessionEnded`
    HandshakeFailed {
        reason: String,
    },
    ControlTypeSelected {
        control_type: ControlType,
    },
    ControlTypeChanged {
        from: Option<ControlType>,
        to: ControlType,
    },
    /// First system description received (or restored for a returning resource)
    ResourceReady {
        resource_id: Option<String>,
        control_type: ControlType,
        description: Map<String, Value>,
        rehydrated: bool,
    },
    ResourceUpdated {
        resource_id: Option<String>,
        description: Map<String, Value>,
    },
    /// Measurements, forecasts and control-type-scoped status messages
    Telemetry {
        message_type: String,
        body: Map<String, Value>,
    },
    InstructionStatusChanged {
        instruction_id: MessageId,
        status: InstructionState,
    },
    ObjectRevoked {
        object_type: String,
        object_id: MessageId,
    },
    ProtocolViolation {
        consecutive: u32,
        reason: String,
    },
    SessionEnded {
        reason: EndReason,
    },
}

impl EngineEventKind {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EngineEventKind::SessionStarted { .. } => "SessionStarted",
            EngineEventKind::HandshakeCompleted { .. } => "HandshakeCompleted",
            EngineEventKind::HandshakeFailed { .. } => "HandshakeFailed",
            EngineEventKind::ControlTypeSelected { .. } => "ControlTypeSelected",
            EngineEventKind::ControlTypeChanged { .. } => "ControlTypeChanged",
            EngineEventKind::ResourceReady { .. } => "ResourceReady",
            EngineEventKind::ResourceUpdated { .. } => "ResourceUpdated",
            EngineEventKind::Telemetry { .. } => "Telemetry",
            EngineEventKind::InstructionStatusChanged { .. } => "InstructionStatusChanged",
            EngineEventKind::ObjectRevoked { .. } => "ObjectRevoked",
            EngineEventKind::ProtocolViolation { .. } => "ProtocolViolation",
            EngineEventKind::SessionEnded { .. } => "SessionEnded",
        }
    }
}
