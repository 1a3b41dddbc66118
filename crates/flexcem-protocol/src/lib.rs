// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # flexcem-protocol
//!
//! Message envelope codec and the message vocabulary spoken between the CEM
//! and resource managers.
//!
//! ```rust
//! use flexcem_protocol::{builders, decode, encode, ControlType, Message};
//!
//! let outbound = builders::select_control_type(ControlType::FillRateBased);
//! let frame = encode(&outbound).unwrap();
//!
//! let envelope = decode(&frame).unwrap();
//! assert!(matches!(Message::from_envelope(&envelope), Ok(Message::SelectControlType(_))));
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod builders;
pub mod envelope;
pub mod error;
pub mod id;
pub mod message;
pub mod vocabulary;

pub use envelope::{decode, encode, is_known_message_type, Envelope};
pub use error::{DecodeError, EncodeError};
pub use id::{is_valid_id, MessageId};
pub use message::*;
pub use vocabulary::*;
