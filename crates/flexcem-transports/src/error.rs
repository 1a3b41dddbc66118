// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Common error type for all transports

use std::fmt;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-agnostic error type
#[derive(Debug)]
pub enum TransportError {
    /// Failed to bind server socket
    BindFailed(String),

    /// Accepting a connection failed; the listener keeps running
    AcceptFailed(String),

    /// Protocol upgrade (e.g. WebSocket handshake) failed for one peer
    HandshakeFailed(String),

    /// Failed to send frame
    SendFailed(String),

    /// Connection closed
    ConnectionClosed,

    /// Listener will not produce further connections
    ListenerClosed,

    /// I/O error
    Io(std::io::Error),

    /// Other error
    Other(String),
}

impl TransportError {
    /// Whether the listener that produced this error can keep accepting
    pub fn is_fatal_for_listener(&self) -> bool {
        matches!(self, Self::ListenerClosed | Self::BindFailed(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindFailed(msg) => write!(f, "Bind failed: {}", msg),
            Self::AcceptFailed(msg) => write!(f, "Accept failed: {}", msg),
            Self::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Self::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ListenerClosed => write!(f, "Listener closed"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
