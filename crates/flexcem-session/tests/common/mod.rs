// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scripted resource manager for session tests

#![allow(dead_code)]

use std::time::Duration;

use flexcem_session::{
    EngineEvent, EngineEventKind, EngineSettings, SessionHandle, SessionId, SessionRegistry,
    SessionState,
};
use flexcem_transports::memory::{self, MemoryPeer};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Upper bound for any single wait; paused time makes this free
pub const WAIT: Duration = Duration::from_secs(3600);

pub fn settings() -> EngineSettings {
    EngineSettings::default()
}

/// Resource manager side of a memory connection
pub struct FakeRm {
    peer: MemoryPeer,
    sent: u32,
}

impl FakeRm {
    pub fn new(peer: MemoryPeer) -> Self {
        Self { peer, sent: 0 }
    }

    /// Send a message with a fresh id and return the id
    pub fn send(&mut self, message_type: &str, body: Value) -> String {
        self.sent += 1;
        let message_id = format!("{}-{}", self.peer.name(), self.sent);
        self.send_with_id(&message_id, message_type, body);
        message_id
    }

    pub fn send_with_id(&self, message_id: &str, message_type: &str, body: Value) {
        self.peer
            .send_json(&json!({
                "message_id": message_id,
                "message_type": message_type,
                "subject_id": null,
                "body": body,
            }))
            .expect("engine side is gone");
    }

    pub fn reply(&mut self, message: &Value, status: &str) {
        self.sent += 1;
        let message_id = format!("{}-{}", self.peer.name(), self.sent);
        self.peer
            .send_json(&json!({
                "message_id": message_id,
                "message_type": "ReceptionStatus",
                "subject_id": message["message_id"],
                "body": {"status": status},
            }))
            .expect("engine side is gone");
    }

    pub fn ack(&mut self, message: &Value) {
        self.reply(message, "OK");
    }

    pub async fn next(&mut self) -> Value {
        timeout(WAIT, self.peer.recv_json())
            .await
            .expect("timed out waiting for the engine")
            .expect("engine closed the connection")
    }

    pub async fn expect(&mut self, message_type: &str) -> Value {
        let message = self.next().await;
        assert_eq!(message["message_type"], message_type, "unexpected message {}", message);
        message
    }

    /// Next message must be a reception status for `subject_id`; returns its status
    pub async fn expect_reply(&mut self, subject_id: &str) -> String {
        let message = self.expect("ReceptionStatus").await;
        assert_eq!(message["subject_id"], subject_id);
        message["body"]["status"].as_str().unwrap_or_default().to_string()
    }

    pub fn try_next(&mut self) -> Option<Value> {
        self.peer
            .try_recv()
            .map(|frame| serde_json::from_slice(&frame).expect("engine sent invalid JSON"))
    }

    /// True once the engine has closed its side
    pub async fn closed(&mut self) -> bool {
        timeout(WAIT, async {
            while self.peer.recv().await.is_some() {}
        })
        .await
        .is_ok()
    }

    pub fn close(&mut self) {
        self.peer.close();
    }
}

pub fn connect(registry: &SessionRegistry, name: &str) -> (SessionHandle, FakeRm) {
    let (connection, peer) = memory::pair(name);
    let handle = registry
        .accept(Box::new(connection))
        .expect("registry refused the connection");
    (handle, FakeRm::new(peer))
}

pub async fn wait_for_state(handle: &SessionHandle, state: SessionState) -> bool {
    timeout(WAIT, handle.wait_for_state(state))
        .await
        .expect("timed out waiting for session state")
}

/// Handshake, announce `control_types`, acknowledge the selection
///
/// Returns after the first selection has been acknowledged.
pub async fn negotiate(
    registry: &SessionRegistry,
    resource_id: &str,
    control_types: &[&str],
) -> (SessionHandle, FakeRm) {
    let (handle, mut rm) = connect(registry, resource_id);

    let proposal = rm.expect("Handshake").await;
    rm.ack(&proposal);
    let response = rm.send("HandshakeResponse", json!({"selected_protocol_version": "0.1.0"}));
    assert_eq!(rm.expect_reply(&response).await, "OK");

    let details = rm.send(
        "ResourceManagerDetails",
        json!({"resource_id": resource_id, "available_control_types": control_types}),
    );
    assert_eq!(rm.expect_reply(&details).await, "OK");
    let selection = rm.expect("SelectControlType").await;
    rm.ack(&selection);

    (handle, rm)
}

/// Bring a session to OPERATIONAL under FRBC (PPBC also advertised)
pub async fn operational(registry: &SessionRegistry, resource_id: &str) -> (SessionHandle, FakeRm) {
    let (handle, mut rm) = negotiate(registry, resource_id, &["FRBC", "PPBC"]).await;
    assert!(wait_for_state(&handle, SessionState::Describing).await);

    let description = rm.send("FRBC.SystemDescription", json!({"actuators": [], "storage": {}}));
    assert_eq!(rm.expect_reply(&description).await, "OK");
    assert!(wait_for_state(&handle, SessionState::Operational).await);
    (handle, rm)
}

/// Next event of `session_id` satisfying `matches`
pub async fn next_event<F>(
    events: &mut broadcast::Receiver<EngineEvent>,
    session_id: &SessionId,
    matches: F,
) -> EngineEventKind
where
    F: Fn(&EngineEventKind) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if &event.session_id == session_id && matches(&event.kind) => {
                    return event.kind
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Events of `session_id` already published, without waiting
pub fn drain_events(
    events: &mut broadcast::Receiver<EngineEvent>,
    session_id: &SessionId,
) -> Vec<EngineEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if &event.session_id == session_id {
            kinds.push(event.kind);
        }
    }
    kinds
}

/// Every event of `session_id` up to and including `SessionEnded`
pub async fn events_until_end(
    events: &mut broadcast::Receiver<EngineEvent>,
    session_id: &SessionId,
) -> Vec<EngineEventKind> {
    let mut kinds = Vec::new();
    loop {
        let kind = next_event(events, session_id, |_| true).await;
        let ended = matches!(kind, EngineEventKind::SessionEnded { .. });
        kinds.push(kind);
        if ended {
            return kinds;
        }
    }
}
