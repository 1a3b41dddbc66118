// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # flexcem-session
//!
//! CEM side of an S2-style flexibility-control session engine.
//!
//! Every resource-manager connection becomes a session running in its own
//! task: handshake, control type negotiation, system description, then
//! OPERATIONAL, where instructions flow out and status updates and telemetry
//! flow in. Outbound messages are retried until acknowledged; inbound messages
//! are acknowledged exactly once and processed at most once.
//!
//! ## Architecture
//!
//! 1. **reliability**: time-injected tracker for outbound retries and inbound deduplication
//! 2. **session**: pure state machine plus the task that drives it
//! 3. **registry**: owns the live sessions, accepts connections, fans out events
//! 4. **dispatcher**: instruction issue and per-session instruction bookkeeping
//!
//! ## Example
//!
//! ```no_run
//! use flexcem_session::{EngineSettings, SessionRegistry};
//! use flexcem_transports::memory;
//!
//! # async fn run() -> flexcem_session::Result<()> {
//! let registry = SessionRegistry::new(EngineSettings::default());
//! let mut events = registry.subscribe();
//!
//! let (connection, _rm) = memory::pair("rm-1");
//! let session = registry.accept(Box::new(connection))?;
//! println!("session {} started", session.id());
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}: {}", event.session_id, event.kind.name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod registry;
pub mod reliability;
pub mod session;
pub mod settings;

pub use archive::{ArchivedResource, DescriptionArchive};
pub use dispatcher::{
    Instruction, InstructionDispatcher, InstructionOutcome, InstructionRecord, InstructionState,
    TrackedInstruction,
};
pub use error::{DispatchError, EngineError, Result};
pub use events::{EndReason, EngineEvent, EngineEventKind};
pub use registry::SessionRegistry;
pub use reliability::{Origin, ReliabilityTracker};
pub use session::{SessionHandle, SessionId, SessionSnapshot, SessionState};
pub use settings::EngineSettings;
