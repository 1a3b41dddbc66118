// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # flexcem - flexibility-control session engine
//!
//! A Customer Energy Manager (CEM) that keeps many concurrent sessions with
//! Resource Managers (RMs): it handshakes, negotiates a control type, keeps
//! the resource description current, delivers instructions at least once and
//! follows their execution status.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! flexcem = "0.1"  # Default: WebSocket transport enabled
//! ```
//!
//! ```rust,no_run
//! use flexcem::prelude::*;
//! use flexcem::transports::websocket::server::{WsListener, WsListenerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SessionRegistry::new(EngineSettings::default());
//! let listener = WsListener::bind(WsListenerConfig::default()).await?;
//! let server = registry.serve(listener);
//!
//! let mut events = registry.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{} {}", event.session_id, event.kind.name());
//! }
//! # server.abort();
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`transport-websocket`** (default): WebSocket server listener
//! - **`file-logging`**: JSON log files next to console output
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Foundation: flexcem-config, flexcem-observability      │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Protocol: flexcem-protocol                             │
//! │  (envelope codec, message vocabulary, builders)         │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  I/O: flexcem-transports                                │
//! │  (Connection/Listener traits, memory, WebSocket)        │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Engine: flexcem-session                                │
//! │  (reliability, session machine, registry, dispatcher)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## License
//!
//! Apache-2.0

pub use flexcem_config as config;
pub use flexcem_observability as observability;
pub use flexcem_protocol as protocol;
pub use flexcem_session as session;
pub use flexcem_transports as transports;

/// Prelude - commonly used types and traits
pub mod prelude {
    pub use crate::config::{load_config, validate_config, FlexcemConfig};
    pub use crate::protocol::{ControlType, InstructionStatus, MessageId, ReceptionStatusValue};
    pub use crate::session::{
        DispatchError, EndReason, EngineError, EngineEvent, EngineEventKind, EngineSettings,
        Instruction, InstructionDispatcher, InstructionState, SessionHandle, SessionId,
        SessionRegistry, SessionSnapshot, SessionState,
    };
    pub use crate::transports::{Connection, Listener};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_facade_imports() {
        use crate::prelude::*;

        let registry_settings = EngineSettings::default();
        assert!(registry_settings.max_attempts >= 1);
        assert!(ControlType::FillRateBased.is_controllable());
    }
}
