// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! WebSocket server implementations

pub mod listener;

pub use listener::{WsConnection, WsListener, WsListenerConfig};
