// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! WebSocket transport
//!
//! Resource managers connect to a single request path; every accepted socket
//! becomes one [`Connection`](crate::Connection).

pub mod server;
