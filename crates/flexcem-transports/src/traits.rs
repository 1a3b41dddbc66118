// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transport trait definitions
//!
//! A [`Listener`] produces [`Connection`]s; each connection carries whole
//! frames in both directions. Implementations exist for in-memory pairs and
//! WebSocket servers.

use async_trait::async_trait;

use crate::error::TransportResult;

/// One live bidirectional connection to a resource manager
///
/// A connection is owned by exactly one session task, hence `&mut self`.
#[async_trait]
pub trait Connection: Send {
    /// Write one frame
    async fn send(&mut self, frame: Vec<u8>) -> TransportResult<()>;

    /// Next inbound frame, or `None` once the connection is closed
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!` and a
    /// cancelled call must not lose a frame.
    async fn receive(&mut self) -> Option<Vec<u8>>;

    /// Close the connection; closing twice is not an error
    async fn close(&mut self) -> TransportResult<()>;

    /// Human readable peer description for logs
    fn peer(&self) -> String;
}

/// Source of new connections
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next connection
    ///
    /// Errors other than [`TransportError::ListenerClosed`](crate::TransportError::ListenerClosed)
    /// concern a single peer; callers keep accepting.
    async fn accept(&mut self) -> TransportResult<Box<dyn Connection>>;

    /// Address or name the listener is bound to
    fn local_description(&self) -> String;
}
