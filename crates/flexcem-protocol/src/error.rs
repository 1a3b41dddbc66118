// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for envelope encoding and decoding

use crate::id::MessageId;
use crate::vocabulary::{ControlType, ReceptionStatusValue};

/// Failure to serialize an outbound envelope
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Instructions cannot be addressed to a pseudo control type
    #[error("Control type {0} does not accept instructions")]
    NotControllable(ControlType),
}

/// Failure to turn an inbound frame into a usable message
///
/// Every variant is recoverable: the session answers with a negative
/// reception status and keeps running.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Frame is not JSON, or required envelope fields are missing or mis-shaped
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Present when the `message_id` itself was readable
        message_id: Option<MessageId>,
        reason: String,
    },

    /// `message_type` is outside the protocol vocabulary
    #[error("Unknown message type '{message_type}'")]
    UnknownMessageType {
        message_id: MessageId,
        message_type: String,
    },

    /// Envelope is fine but the body does not match the message type
    #[error("Invalid body for {message_type}: {reason}")]
    InvalidBody {
        message_id: MessageId,
        message_type: String,
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(message_id: Option<MessageId>, reason: impl Into<String>) -> Self {
        DecodeError::MalformedEnvelope {
            message_id,
            reason: reason.into(),
        }
    }

    /// Id of the offending message, when it could be read
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            DecodeError::MalformedEnvelope { message_id, .. } => message_id.as_ref(),
            DecodeError::UnknownMessageType { message_id, .. }
            | DecodeError::InvalidBody { message_id, .. } => Some(message_id),
        }
    }

    /// Reception status the receiver answers with
    pub fn reception_status(&self) -> ReceptionStatusValue {
        match self {
            DecodeError::MalformedEnvelope { .. } | DecodeError::InvalidBody { .. } => {
                ReceptionStatusValue::InvalidData
            }
            DecodeError::UnknownMessageType { .. } => ReceptionStatusValue::InvalidMessage,
        }
    }
}
