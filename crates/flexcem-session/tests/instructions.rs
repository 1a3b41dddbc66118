// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Instruction dispatch over the in-memory transport

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use flexcem_protocol::ControlType;
use flexcem_session::{
    DispatchError, EngineEventKind, Instruction, InstructionState, SessionId, SessionRegistry,
    SessionState,
};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

fn frbc(payload: Value) -> Instruction {
    let Value::Object(payload) = payload else {
        panic!("payload must be an object");
    };
    Instruction::new(ControlType::FillRateBased, payload)
}

/// Timer wheel resolution is one millisecond
fn assert_close(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed <= expected + Duration::from_millis(5),
        "elapsed {:?}, expected {:?}",
        elapsed,
        expected
    );
}

fn status_update(instruction_id: &str, status: &str) -> Value {
    json!({
        "instruction_id": instruction_id,
        "status_type": status,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[tokio::test(start_paused = true)]
async fn test_instruction_reaches_succeeded() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = operational(&registry, "battery-1").await;
    let dispatcher = registry.dispatcher();

    let tracked = dispatcher
        .issue_tracked(handle.id(), frbc(json!({"actuator_id": "a1", "operation_mode": "charge"})))
        .await
        .unwrap();
    let instruction_id = tracked.instruction_id().as_str().to_string();
    assert_eq!(instruction_id, format!("{}:1", handle.id()));

    let message = rm.expect("FRBC.Instruction").await;
    assert_eq!(message["body"]["id"], instruction_id.as_str());
    assert_eq!(message["body"]["actuator_id"], "a1");
    assert!(message["body"]["execution_time"].as_str().unwrap().ends_with('Z'));
    rm.ack(&message);

    for status in ["ACCEPTED", "STARTED", "SUCCEEDED"] {
        let update = rm.send("InstructionStatusUpdate", status_update(&instruction_id, status));
        assert_eq!(rm.expect_reply(&update).await, "OK");
    }
    assert_eq!(tracked.outcome().await, Ok(InstructionState::Succeeded));

    let mut seen = Vec::new();
    while seen.last() != Some(&InstructionState::Succeeded) {
        if let EngineEventKind::InstructionStatusChanged { status, .. } =
            next_event(&mut events, handle.id(), |kind| {
                matches!(kind, EngineEventKind::InstructionStatusChanged { .. })
            })
            .await
        {
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![
            InstructionState::Sent,
            InstructionState::Acked,
            InstructionState::Accepted,
            InstructionState::Started,
            InstructionState::Succeeded,
        ]
    );
    assert!(handle.snapshot().current_instruction.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_status_update_processed_once() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = operational(&registry, "battery-3").await;

    let tracked = registry
        .dispatcher()
        .issue_tracked(handle.id(), frbc(json!({"actuator_id": "a1"})))
        .await
        .unwrap();
    let instruction_id = tracked.instruction_id().as_str().to_string();
    let message = rm.expect("FRBC.Instruction").await;
    rm.ack(&message);

    let update = status_update(&instruction_id, "ACCEPTED");
    rm.send_with_id("status-1", "InstructionStatusUpdate", update.clone());
    assert_eq!(rm.expect_reply("status-1").await, "OK");
    rm.send_with_id("status-1", "InstructionStatusUpdate", update);
    assert_eq!(rm.expect_reply("status-1").await, "OK");

    let accepted = drain_events(&mut events, handle.id())
        .into_iter()
        .filter(|kind| {
            matches!(
                kind,
                EngineEventKind::InstructionStatusChanged {
                    status: InstructionState::Accepted,
                    ..
                }
            )
        })
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(
        handle.snapshot().current_instruction.map(|current| current.status),
        Some(InstructionState::Accepted)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_instruction_sent_exactly_max_attempts() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "ev-charger").await;
    let retry = registry.settings().retry_interval;
    let max_attempts = registry.settings().max_attempts;

    let tracked = handle.issue_tracked(frbc(json!({}))).await.unwrap();

    let mut arrivals = Vec::new();
    let mut message_ids = Vec::new();
    for _ in 0..max_attempts {
        let message = rm.expect("FRBC.Instruction").await;
        arrivals.push(Instant::now());
        message_ids.push(message["message_id"].clone());
    }
    assert!(message_ids.windows(2).all(|pair| pair[0] == pair[1]));
    for pair in arrivals.windows(2) {
        assert_close(pair[1] - pair[0], retry);
    }

    let instruction_id = tracked.instruction_id().clone();
    assert_eq!(
        tracked.outcome().await,
        Err(DispatchError::DeliveryTimeout {
            instruction_id,
            attempts: max_attempts,
        })
    );
    assert_close(Instant::now() - arrivals[0], retry * max_attempts);
    assert!(rm.try_next().is_none());

    // Delivery failure is instruction-fatal only
    assert_eq!(handle.state(), SessionState::Operational);
    assert!(handle.issue(frbc(json!({}))).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_second_instruction_refused_while_in_flight() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "boiler").await;
    let dispatcher = registry.dispatcher();

    let first = dispatcher.issue(handle.id(), frbc(json!({}))).await.unwrap();
    let message = rm.expect("FRBC.Instruction").await;
    rm.ack(&message);

    let refused = dispatcher.issue(handle.id(), frbc(json!({}))).await;
    assert_eq!(
        refused,
        Err(DispatchError::InstructionInFlight {
            session_id: handle.id().clone(),
            instruction_id: first.clone(),
        })
    );
    assert!(rm.try_next().is_none());

    let update = rm.send("InstructionStatusUpdate", status_update(first.as_str(), "REVOKED"));
    assert_eq!(rm.expect_reply(&update).await, "OK");

    let second = dispatcher.issue(handle.id(), frbc(json!({}))).await.unwrap();
    assert_eq!(second.as_str(), format!("{}:2", handle.id()));
}

#[tokio::test(start_paused = true)]
async fn test_issue_guards() {
    let registry = SessionRegistry::new(settings());
    let dispatcher = registry.dispatcher();

    let stranger = SessionId::from("no-such-session");
    assert_eq!(
        dispatcher.issue(&stranger, frbc(json!({}))).await,
        Err(DispatchError::UnknownSession(stranger.clone()))
    );

    let (handle, mut rm) = connect(&registry, "early");
    rm.expect("Handshake").await;
    assert!(matches!(
        dispatcher.issue(handle.id(), frbc(json!({}))).await,
        Err(DispatchError::SessionNotOperational {
            state: SessionState::Handshaking,
            ..
        })
    ));

    let (handle, _rm) = operational(&registry, "pool-pump").await;
    let ppbc = Instruction::new(ControlType::PowerProfileBased, Map::new());
    assert!(matches!(
        dispatcher.issue(handle.id(), ppbc).await,
        Err(DispatchError::ControlTypeMismatch {
            active: Some(ControlType::FillRateBased),
            requested: ControlType::PowerProfileBased,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_nacked_instruction_is_rejected() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "heat-pump").await;

    let tracked = handle.issue_tracked(frbc(json!({}))).await.unwrap();
    let message = rm.expect("FRBC.Instruction").await;
    rm.reply(&message, "INVALID_CONTENT");

    assert!(matches!(
        tracked.outcome().await,
        Err(DispatchError::Rejected { .. })
    ));
    assert!(handle.snapshot().current_instruction.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_execution_deadline_times_out() {
    let mut settings = settings();
    settings.instruction_execution_deadline = Duration::from_secs(60);
    let registry = SessionRegistry::new(settings);
    let (handle, mut rm) = operational(&registry, "freezer").await;

    let tracked = handle.issue_tracked(frbc(json!({}))).await.unwrap();
    let message = rm.expect("FRBC.Instruction").await;
    rm.ack(&message);

    let started_at = Instant::now();
    assert_eq!(tracked.outcome().await, Ok(InstructionState::TimedOut));
    assert_close(Instant::now() - started_at, Duration::from_secs(60));
    assert_eq!(handle.state(), SessionState::Operational);
}

#[tokio::test(start_paused = true)]
async fn test_revoke_object_aborts_instruction() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = operational(&registry, "dryer").await;

    let tracked = handle.issue_tracked(frbc(json!({}))).await.unwrap();
    let message = rm.expect("FRBC.Instruction").await;
    rm.ack(&message);

    let revoke = rm.send(
        "RevokeObject",
        json!({"object_type": "FRBC.Instruction", "object_id": tracked.instruction_id()}),
    );
    assert_eq!(rm.expect_reply(&revoke).await, "OK");
    assert_eq!(tracked.outcome().await, Ok(InstructionState::Aborted));

    let revoked = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::ObjectRevoked { .. })
    })
    .await;
    assert!(matches!(
        revoked,
        EngineEventKind::ObjectRevoked { object_type, .. } if object_type == "FRBC.Instruction"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_status_for_unknown_instruction_is_declined() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "oven").await;

    let update = rm.send("InstructionStatusUpdate", status_update("someone-else:7", "STARTED"));
    assert_eq!(rm.expect_reply(&update).await, "INVALID_CONTENT");
    assert_eq!(handle.snapshot().consecutive_violations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_closing_session_fails_waiters() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "kettle").await;

    let tracked = handle.issue_tracked(frbc(json!({}))).await.unwrap();
    rm.expect("FRBC.Instruction").await;
    rm.close();

    assert_eq!(
        tracked.outcome().await,
        Err(DispatchError::SessionEnded(handle.id().clone()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_pending_acknowledgments() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "inverter").await;

    let tracked = handle.issue_tracked(frbc(json!({}))).await.unwrap();
    let shutdown = tokio::spawn({
        let registry = registry.clone();
        async move { registry.shutdown(WAIT).await }
    });

    // The session keeps reading acknowledgments while it drains
    let message = rm.expect("FRBC.Instruction").await;
    rm.ack(&message);
    assert!(rm.closed().await);
    shutdown.await.unwrap();

    assert_eq!(
        tracked.outcome().await,
        Err(DispatchError::SessionEnded(handle.id().clone()))
    );
    assert_eq!(handle.snapshot().pending_outbound, 0);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_matching_sessions() {
    let registry = SessionRegistry::new(settings());
    let (first, mut first_rm) = operational(&registry, "battery-a").await;
    let (second, mut second_rm) = operational(&registry, "battery-b").await;
    let (_describing, _rm) = negotiate(&registry, "battery-c", &["FRBC"]).await;

    let results = registry
        .broadcast_instruction(
            |snapshot| snapshot.state == SessionState::Operational,
            frbc(json!({"operation_mode": "idle"})),
        )
        .await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    let targeted: Vec<&SessionId> = results.iter().map(|(id, _)| id).collect();
    assert!(targeted.contains(&first.id()) && targeted.contains(&second.id()));

    first_rm.expect("FRBC.Instruction").await;
    second_rm.expect("FRBC.Instruction").await;
}
