// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed view of inbound messages
//!
//! [`Message::from_envelope`] maps an envelope onto a tagged union keyed by
//! `message_type`. Only the fields the session engine acts on are typed;
//! physical flexibility payloads stay opaque JSON.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::envelope::Envelope;
use crate::error::DecodeError;
use crate::id::MessageId;
use crate::vocabulary::{
    ControlType, EnergyManagementRole, InstructionStatus, ReceptionStatusValue,
    SessionRequestType,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Handshake {
    pub role: EnergyManagementRole,
    #[serde(default)]
    pub supported_protocol_versions: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandshakeResponse {
    pub selected_protocol_version: String,
}

/// Announcement of the resource behind the connection
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceManagerDetails {
    pub resource_id: MessageId,
    pub available_control_types: Vec<ControlType>,
    /// Complete body, including fields not typed here
    pub raw: Map<String, Value>,
}

#[derive(Deserialize)]
struct ResourceManagerDetailsFields {
    resource_id: MessageId,
    available_control_types: Vec<ControlType>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SelectControlType {
    pub control_type: ControlType,
}

/// Ack or nack of an earlier message; the subject is the envelope's `subject_id`
#[derive(Debug, Clone, PartialEq)]
pub struct ReceptionStatus {
    pub subject_id: MessageId,
    pub status: ReceptionStatusValue,
    pub diagnostic_label: Option<String>,
}

#[derive(Deserialize)]
struct ReceptionStatusFields {
    status: ReceptionStatusValue,
    #[serde(default)]
    diagnostic_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstructionStatusUpdate {
    pub instruction_id: MessageId,
    pub status_type: InstructionStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RevokeObject {
    /// Revokable object type, e.g. `FRBC.Instruction`
    pub object_type: String,
    pub object_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionRequest {
    pub request: SessionRequestType,
    #[serde(default)]
    pub diagnostic_label: Option<String>,
}

/// Inbound message, one variant per message type
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    HandshakeResponse(HandshakeResponse),
    ResourceManagerDetails(ResourceManagerDetails),
    SelectControlType(SelectControlType),
    ReceptionStatus(ReceptionStatus),
    InstructionStatusUpdate(InstructionStatusUpdate),
    PowerMeasurement(Map<String, Value>),
    PowerForecast(Map<String, Value>),
    RevokeObject(RevokeObject),
    SessionRequest(SessionRequest),
    /// `<CT>.SystemDescription`
    SystemDescription {
        control_type: ControlType,
        body: Map<String, Value>,
    },
    /// `<CT>.Instruction`; only a CEM sends these, so receiving one is a violation
    Instruction {
        control_type: ControlType,
        body: Map<String, Value>,
    },
    /// Any other control-type-scoped message (storage status, usage forecasts, ...)
    ControlTypeScoped {
        control_type: ControlType,
        name: String,
        body: Map<String, Value>,
    },
}

fn typed_body<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(envelope.body.clone())).map_err(|e| {
        DecodeError::InvalidBody {
            message_id: envelope.message_id.clone(),
            message_type: envelope.message_type.clone(),
            reason: e.to_string(),
        }
    })
}

impl Message {
    /// Parse the body of a decoded envelope
    ///
    /// # Errors
    ///
    /// `InvalidBody` when a typed field is missing or has the wrong shape,
    /// `UnknownMessageType` for types outside the vocabulary.
    pub fn from_envelope(envelope: &Envelope) -> Result<Message, DecodeError> {
        let message = match envelope.message_type.as_str() {
            "Handshake" => Message::Handshake(typed_body(envelope)?),
            "HandshakeResponse" => Message::HandshakeResponse(typed_body(envelope)?),
            "ResourceManagerDetails" => {
                let fields: ResourceManagerDetailsFields = typed_body(envelope)?;
                Message::ResourceManagerDetails(ResourceManagerDetails {
                    resource_id: fields.resource_id,
                    available_control_types: fields.available_control_types,
                    raw: envelope.body.clone(),
                })
            }
            "SelectControlType" => Message::SelectControlType(typed_body(envelope)?),
            "ReceptionStatus" => {
                let subject_id =
                    envelope
                        .subject_id
                        .clone()
                        .ok_or_else(|| DecodeError::InvalidBody {
                            message_id: envelope.message_id.clone(),
                            message_type: envelope.message_type.clone(),
                            reason: "ReceptionStatus requires a subject_id".to_string(),
                        })?;
                let fields: ReceptionStatusFields = typed_body(envelope)?;
                Message::ReceptionStatus(ReceptionStatus {
                    subject_id,
                    status: fields.status,
                    diagnostic_label: fields.diagnostic_label,
                })
            }
            "InstructionStatusUpdate" => Message::InstructionStatusUpdate(typed_body(envelope)?),
            "PowerMeasurement" => Message::PowerMeasurement(envelope.body.clone()),
            "PowerForecast" => Message::PowerForecast(envelope.body.clone()),
            "RevokeObject" => Message::RevokeObject(typed_body(envelope)?),
            "SessionRequest" => Message::SessionRequest(typed_body(envelope)?),
            _ => match envelope.scope() {
                Some((control_type, "SystemDescription")) => Message::SystemDescription {
                    control_type,
                    body: envelope.body.clone(),
                },
                Some((control_type, "Instruction")) => Message::Instruction {
                    control_type,
                    body: envelope.body.clone(),
                },
                Some((control_type, name)) if !name.is_empty() => Message::ControlTypeScoped {
                    control_type,
                    name: name.to_string(),
                    body: envelope.body.clone(),
                },
                _ => {
                    return Err(DecodeError::UnknownMessageType {
                        message_id: envelope.message_id.clone(),
                        message_type: envelope.message_type.clone(),
                    })
                }
            },
        };
        Ok(message)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "Handshake",
            Message::HandshakeResponse(_) => "HandshakeResponse",
            Message::ResourceManagerDetails(_) => "ResourceManagerDetails",
            Message::SelectControlType(_) => "SelectControlType",
            Message::ReceptionStatus(_) => "ReceptionStatus",
            Message::InstructionStatusUpdate(_) => "InstructionStatusUpdate",
            Message::PowerMeasurement(_) => "PowerMeasurement",
            Message::PowerForecast(_) => "PowerForecast",
            Message::RevokeObject(_) => "RevokeObject",
            Message::SessionRequest(_) => "SessionRequest",
            Message::SystemDescription { .. } => "SystemDescription",
            Message::Instruction { .. } => "Instruction",
            Message::ControlTypeScoped { .. } => "ControlTypeScoped",
        }
    }
}
