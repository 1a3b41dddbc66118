// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the session engine

use flexcem_protocol::{ControlType, MessageId, ReceptionStatusValue};

use crate::session::{SessionId, SessionState};

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned when issuing instructions or waiting for their outcome
///
/// Issue-time variants are caller errors: they are returned synchronously
/// and leave the session untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Instructions are only accepted in OPERATIONAL
    #[error("Session {session_id} is not operational (state: {state:?})")]
    SessionNotOperational {
        session_id: SessionId,
        state: SessionState,
    },

    /// The previous instruction has not reached a terminal status
    #[error("Session {session_id} already has instruction {instruction_id} in flight")]
    InstructionInFlight {
        session_id: SessionId,
        instruction_id: MessageId,
    },

    /// Instruction targets a control type other than the session's
    #[error("Session {session_id} uses {active:?}, instruction targets {requested}")]
    ControlTypeMismatch {
        session_id: SessionId,
        active: Option<ControlType>,
        requested: ControlType,
    },

    /// No live session with this id
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Session closed before the instruction finished
    #[error("Session {0} ended")]
    SessionEnded(SessionId),

    /// RM answered the instruction message with a negative reception status
    #[error("Instruction {instruction_id} rejected on reception: {status:?}")]
    Rejected {
        instruction_id: MessageId,
        status: ReceptionStatusValue,
    },

    /// Instruction message was never acknowledged
    #[error("Instruction {instruction_id} was not acknowledged after {attempts} attempts")]
    DeliveryTimeout {
        instruction_id: MessageId,
        attempts: u32,
    },
}

/// Engine-level errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration cannot be turned into engine settings
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No live session with this id
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Session task has exited
    #[error("Session {0} ended")]
    SessionEnded(SessionId),

    /// Operation is not allowed in the session's current state
    #[error("Cannot {operation} session {session_id} in state {state:?}")]
    InvalidState {
        session_id: SessionId,
        state: SessionState,
        operation: &'static str,
    },

    /// Control type was not advertised by the resource manager
    #[error("Session {session_id} does not support control type {control_type}")]
    UnsupportedControlType {
        session_id: SessionId,
        control_type: ControlType,
    },

    /// Registry no longer accepts sessions
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Instruction dispatch error
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] flexcem_transports::TransportError),
}
