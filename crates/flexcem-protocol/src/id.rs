// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Protocol identifiers
//!
//! Message, instruction and resource ids share one format: 2 to 64 characters
//! from `[A-Za-z0-9-_:]`.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Shortest accepted id
pub const MIN_ID_LEN: usize = 2;
/// Longest accepted id
pub const MAX_ID_LEN: usize = 64;

/// Check a string against the protocol id format
pub fn is_valid_id(value: &str) -> bool {
    (MIN_ID_LEN..=MAX_ID_LEN).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':')
}

/// Validated protocol identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Fresh random id (hyphenated UUID v4)
    pub fn generate() -> Self {
        MessageId(uuid::Uuid::new_v4().to_string())
    }

    /// Validate and wrap an id; `None` if it does not match the id format
    pub fn parse(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        is_valid_id(&value).then_some(MessageId(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        MessageId::parse(value.clone())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid id '{}'", value)))
    }
}
