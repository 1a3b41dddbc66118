// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # flexcem-observability
//!
//! Logging setup shared by the flexcem binaries and tests, with per-crate
//! debug flag support.
//!
//! ## Features
//! - `file-logging`: JSON log files in a timestamped run folder

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod init;

pub use cli::*;
pub use init::*;

/// Known flexcem crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "flexcem",
    "flexcem-config",
    "flexcem-protocol",
    "flexcem-transports",
    "flexcem-session",
];
