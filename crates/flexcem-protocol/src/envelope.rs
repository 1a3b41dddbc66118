// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Message envelope and its JSON wire codec
//!
//! Wire format: `{"message_id": str, "message_type": str, "subject_id": str|null, "body": {}}`.
//! Bodies are kept as JSON objects so fields this crate does not know about
//! survive a decode/encode cycle.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{DecodeError, EncodeError};
use crate::id::MessageId;
use crate::vocabulary::ControlType;

/// Message types that are not scoped to a control type
pub const COMMON_MESSAGE_TYPES: &[&str] = &[
    "Handshake",
    "HandshakeResponse",
    "ResourceManagerDetails",
    "SelectControlType",
    "ReceptionStatus",
    "InstructionStatusUpdate",
    "PowerMeasurement",
    "PowerForecast",
    "RevokeObject",
    "SessionRequest",
];

/// Whether `message_type` is part of the protocol vocabulary
///
/// Control-type-scoped types (`FRBC.SystemDescription`, `PPBC.PowerProfileDefinition`)
/// are accepted for any name under a known prefix.
pub fn is_known_message_type(message_type: &str) -> bool {
    if COMMON_MESSAGE_TYPES.contains(&message_type) {
        return true;
    }
    match message_type.split_once('.') {
        Some((prefix, name)) => ControlType::from_prefix(prefix).is_some() && !name.is_empty(),
        None => false,
    }
}

/// One protocol message as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub message_type: String,
    /// Message this one answers (acks, nacks, status updates)
    pub subject_id: Option<MessageId>,
    pub body: Map<String, Value>,
}

impl Envelope {
    /// New envelope with a freshly generated message id
    pub fn new(message_type: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            message_id: MessageId::generate(),
            message_type: message_type.into(),
            subject_id: None,
            body,
        }
    }

    pub fn with_subject(mut self, subject_id: MessageId) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    /// `<prefix>.<name>` split for control-type-scoped messages
    pub fn scope(&self) -> Option<(ControlType, &str)> {
        let (prefix, name) = self.message_type.split_once('.')?;
        ControlType::from_prefix(prefix).map(|ct| (ct, name))
    }
}

/// Serialize an envelope to its wire bytes
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse and validate a frame
///
/// # Errors
///
/// - `MalformedEnvelope` when the frame is not a JSON object or a required field
///   is missing or mis-shaped
/// - `UnknownMessageType` when the envelope is well formed but its type is not
///   part of the vocabulary
pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| DecodeError::malformed(None, format!("not valid JSON: {}", e)))?;

    let Value::Object(mut fields) = value else {
        return Err(DecodeError::malformed(None, "envelope is not a JSON object"));
    };

    let message_id = match fields.remove("message_id") {
        Some(Value::String(raw)) => MessageId::parse(raw.clone()).ok_or_else(|| {
            DecodeError::malformed(None, format!("invalid message_id '{}'", raw))
        })?,
        Some(_) => return Err(DecodeError::malformed(None, "message_id is not a string")),
        None => return Err(DecodeError::malformed(None, "missing message_id")),
    };

    let message_type = match fields.remove("message_type") {
        Some(Value::String(raw)) if !raw.is_empty() => raw,
        Some(Value::String(_)) => {
            return Err(DecodeError::malformed(Some(message_id), "message_type is empty"))
        }
        Some(_) => {
            return Err(DecodeError::malformed(
                Some(message_id),
                "message_type is not a string",
            ))
        }
        None => return Err(DecodeError::malformed(Some(message_id), "missing message_type")),
    };

    let subject_id = match fields.remove("subject_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(MessageId::parse(raw.clone()).ok_or_else(|| {
            DecodeError::malformed(Some(message_id.clone()), format!("invalid subject_id '{}'", raw))
        })?),
        Some(_) => {
            return Err(DecodeError::malformed(
                Some(message_id),
                "subject_id is not a string",
            ))
        }
    };

    let body = match fields.remove("body") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(body)) => body,
        Some(_) => return Err(DecodeError::malformed(Some(message_id), "body is not an object")),
    };

    if !is_known_message_type(&message_type) {
        return Err(DecodeError::UnknownMessageType {
            message_id,
            message_type,
        });
    }

    Ok(Envelope {
        message_id,
        message_type,
        subject_id,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_full_envelope() {
        let envelope = decode(&frame(json!({
            "message_id": "m-1",
            "message_type": "FRBC.StorageStatus",
            "subject_id": null,
            "body": {"present_fill_level": 0.4, "vendor_extension": {"x": 1}}
        })))
        .unwrap();

        assert_eq!(envelope.message_id.as_str(), "m-1");
        assert_eq!(envelope.subject_id, None);
        assert_eq!(envelope.body["vendor_extension"], json!({"x": 1}));
        assert_eq!(envelope.scope(), Some((ControlType::FillRateBased, "StorageStatus")));
    }

    #[test]
    fn test_absent_body_is_empty_object() {
        let envelope = decode(&frame(json!({
            "message_id": "m-2",
            "message_type": "PowerMeasurement"
        })))
        .unwrap();
        assert!(envelope.body.is_empty());
    }

    #[test]
    fn test_unknown_fields_survive_reencoding() {
        let original = frame(json!({
            "message_id": "m-3",
            "message_type": "ResourceManagerDetails",
            "subject_id": null,
            "body": {"resource_id": "rm-1", "future_field": [1, 2, 3]}
        }));
        let decoded = decode(&original).unwrap();
        let reencoded: Value = serde_json::from_slice(&encode(&decoded).unwrap()).unwrap();
        assert_eq!(reencoded, serde_json::from_slice::<Value>(&original).unwrap());
    }

    #[test]
    fn test_malformed_envelopes() {
        let cases = [
            b"not json".to_vec(),
            frame(json!([1, 2])),
            frame(json!({"message_type": "Handshake"})),
            frame(json!({"message_id": 5, "message_type": "Handshake"})),
            frame(json!({"message_id": "x", "message_type": "Handshake"})),
        ];
        for case in cases {
            let err = decode(&case).unwrap_err();
            assert!(matches!(err, DecodeError::MalformedEnvelope { message_id: None, .. }));
        }
    }

    #[test]
    fn test_malformed_envelope_keeps_readable_id() {
        let err = decode(&frame(json!({
            "message_id": "m-4",
            "message_type": "Handshake",
            "body": "oops"
        })))
        .unwrap_err();
        assert_eq!(err.message_id().map(MessageId::as_str), Some("m-4"));
        assert_eq!(err.reception_status(), crate::ReceptionStatusValue::InvalidData);
    }

    #[test]
    fn test_unknown_message_type() {
        for message_type in ["Teleport", "XYZ.Instruction", "FRBC."] {
            let err = decode(&frame(json!({
                "message_id": "m-5",
                "message_type": message_type,
                "body": {}
            })))
            .unwrap_err();
            assert!(
                matches!(err, DecodeError::UnknownMessageType { .. }),
                "{} should be unknown",
                message_type
            );
            assert_eq!(err.reception_status(), crate::ReceptionStatusValue::InvalidMessage);
        }
    }
}
