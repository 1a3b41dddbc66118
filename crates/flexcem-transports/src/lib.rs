// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # flexcem-transports
//!
//! Transport abstraction for the session engine. A transport hands the engine
//! one [`Connection`] per resource manager; the engine never sees sockets.
//!
//! ## Implementations
//!
//! - **memory**: in-process connection pairs, used by tests and embedders
//! - **websocket** (feature `websocket-server`): WebSocket server on tokio-tungstenite,
//!   accepting text and binary frames on a configurable request path
//!
//! ## Example: in-memory pair
//!
//! ```
//! use flexcem_transports::{memory, Connection};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let (mut connection, mut peer) = memory::pair("rm-1");
//! peer.send_raw(b"hello".to_vec()).unwrap();
//! assert_eq!(connection.receive().await, Some(b"hello".to_vec()));
//! # });
//! ```
//!
//! ## Architecture
//!
//! 1. **Error**: [`TransportError`] shared by all implementations
//! 2. **Traits**: [`Connection`] and [`Listener`]
//! 3. **Implementations**: memory, WebSocket

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket-server")]
pub mod websocket;

pub use error::{TransportError, TransportResult};
pub use traits::{Connection, Listener};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::memory::{MemoryConnection, MemoryConnector, MemoryListener, MemoryPeer};
    pub use crate::traits::*;

    #[cfg(feature = "websocket-server")]
    pub use crate::websocket::server::*;
}
