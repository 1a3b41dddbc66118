// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Constructors for the messages a CEM sends

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::envelope::Envelope;
use crate::error::EncodeError;
use crate::id::MessageId;
use crate::vocabulary::{ControlType, ReceptionStatusValue};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Handshake proposal listing the versions the CEM speaks
pub fn handshake(supported_protocol_versions: &[String]) -> Envelope {
    Envelope::new(
        "Handshake",
        object(json!({
            "role": "CEM",
            "supported_protocol_versions": supported_protocol_versions,
        })),
    )
}

/// Answer to an RM-initiated handshake
pub fn handshake_response(selected_protocol_version: &str) -> Envelope {
    Envelope::new(
        "HandshakeResponse",
        object(json!({ "selected_protocol_version": selected_protocol_version })),
    )
}

pub fn select_control_type(control_type: ControlType) -> Envelope {
    Envelope::new(
        "SelectControlType",
        object(json!({ "control_type": control_type })),
    )
}

/// Ack (`Ok`) or nack of `subject_id`
pub fn reception_status(
    subject_id: &MessageId,
    status: ReceptionStatusValue,
    diagnostic_label: Option<&str>,
) -> Envelope {
    let mut body = object(json!({ "status": status }));
    if let Some(label) = diagnostic_label {
        body.insert("diagnostic_label".to_string(), Value::String(label.to_string()));
    }
    Envelope::new("ReceptionStatus", body).with_subject(subject_id.clone())
}

/// `<CT>.Instruction` carrying `payload` plus the instruction id and execution time
///
/// `id` and `execution_time` overwrite same-named keys in the payload.
pub fn instruction(
    control_type: ControlType,
    instruction_id: &MessageId,
    execution_time: DateTime<Utc>,
    payload: &Map<String, Value>,
) -> Result<Envelope, EncodeError> {
    let prefix = control_type
        .prefix()
        .ok_or(EncodeError::NotControllable(control_type))?;

    let mut body = payload.clone();
    body.insert("id".to_string(), Value::String(instruction_id.to_string()));
    body.insert(
        "execution_time".to_string(),
        Value::String(execution_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );

    Ok(Envelope::new(format!("{}.Instruction", prefix), body))
}
