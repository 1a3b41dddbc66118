// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Session lifecycle over the in-memory transport

mod common;

use common::*;
use flexcem_protocol::ControlType;
use flexcem_session::{EndReason, EngineEventKind, SessionRegistry, SessionState};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_handshake_leads_to_describing() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();

    let (handle, _rm) = negotiate(&registry, "heat-pump", &["OMBC", "FRBC", "NOT_CONTROLABLE"]).await;
    assert!(wait_for_state(&handle, SessionState::Describing).await);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.protocol_version.as_deref(), Some("0.1.0"));
    assert_eq!(snapshot.control_type, Some(ControlType::FillRateBased));
    assert_eq!(snapshot.resource_id.as_deref(), Some("heat-pump"));
    assert_eq!(snapshot.pending_outbound, 0);

    let names: Vec<&str> = drain_events(&mut events, handle.id())
        .iter()
        .map(|kind| kind.name())
        .collect();
    assert_eq!(
        names,
        vec!["SessionStarted", "HandshakeCompleted", "ControlTypeSelected"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_description_makes_resource_ready() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, _rm) = operational(&registry, "battery-1").await;

    let ready = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::ResourceReady { .. })
    })
    .await;
    let EngineEventKind::ResourceReady {
        resource_id,
        control_type,
        description,
        rehydrated,
    } = ready
    else {
        unreachable!();
    };
    assert_eq!(resource_id.as_deref(), Some("battery-1"));
    assert_eq!(control_type, ControlType::FillRateBased);
    assert!(description.contains_key("actuators"));
    assert!(!rehydrated);
    assert_eq!(registry.list_active_sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_close_mid_handshake() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = connect(&registry, "flaky");

    rm.expect("Handshake").await;
    rm.close();

    let kinds = events_until_end(&mut events, handle.id()).await;
    let failures = kinds
        .iter()
        .filter(|kind| matches!(kind, EngineEventKind::HandshakeFailed { .. }))
        .count();
    assert_eq!(failures, 1);
    assert_eq!(
        kinds.last(),
        Some(&EngineEventKind::SessionEnded {
            reason: EndReason::TransportClosed
        })
    );

    assert_eq!(handle.state(), SessionState::Closed);
    assert!(registry.get(handle.id()).is_none());
    assert!(registry.list_active_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failed_emitted_once() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = connect(&registry, "old-firmware");

    rm.expect("Handshake").await;
    let response = rm.send("HandshakeResponse", json!({"selected_protocol_version": "0.0.1"}));
    assert_eq!(rm.expect_reply(&response).await, "INVALID_CONTENT");
    assert!(rm.closed().await);

    let kinds = events_until_end(&mut events, handle.id()).await;
    let failures = kinds
        .iter()
        .filter(|kind| matches!(kind, EngineEventKind::HandshakeFailed { .. }))
        .count();
    assert_eq!(failures, 1);
    assert_eq!(
        kinds.last(),
        Some(&EngineEventKind::SessionEnded {
            reason: EndReason::HandshakeFailed
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out_handshake() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = connect(&registry, "silent");

    // Proposal is resent until attempts run out, then the session gives up
    for _ in 0..registry.settings().max_attempts {
        rm.expect("Handshake").await;
    }
    assert!(rm.closed().await);

    let ended = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EngineEventKind::SessionEnded {
            reason: EndReason::HandshakeFailed
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_message_processed_once() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "pv-1").await;
    let mut events = registry.subscribe();

    rm.send_with_id("measure-1", "PowerMeasurement", json!({"values": [{"value": 1200.0}]}));
    assert_eq!(rm.expect_reply("measure-1").await, "OK");
    rm.send_with_id("measure-1", "PowerMeasurement", json!({"values": [{"value": 1200.0}]}));
    assert_eq!(rm.expect_reply("measure-1").await, "OK");

    let telemetry = drain_events(&mut events, handle.id())
        .into_iter()
        .filter(|kind| matches!(kind, EngineEventKind::Telemetry { .. }))
        .count();
    assert_eq!(telemetry, 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_description_processed_once() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "battery-2").await;
    let mut events = registry.subscribe();

    let body = json!({"actuators": [{"id": "a1"}], "storage": {}});
    rm.send_with_id("describe-2", "FRBC.SystemDescription", body.clone());
    assert_eq!(rm.expect_reply("describe-2").await, "OK");
    rm.send_with_id("describe-2", "FRBC.SystemDescription", body);
    assert_eq!(rm.expect_reply("describe-2").await, "OK");

    let updates = drain_events(&mut events, handle.id())
        .into_iter()
        .filter(|kind| matches!(kind, EngineEventKind::ResourceUpdated { .. }))
        .count();
    assert_eq!(updates, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unlisted_control_types_fail_negotiation() {
    let mut frbc_only = settings();
    frbc_only.control_type_priority = vec![ControlType::FillRateBased];
    let registry = SessionRegistry::new(frbc_only);
    let mut events = registry.subscribe();
    let (handle, mut rm) = connect(&registry, "dryer");

    let proposal = rm.expect("Handshake").await;
    rm.ack(&proposal);
    let response = rm.send("HandshakeResponse", json!({"selected_protocol_version": "0.1.0"}));
    assert_eq!(rm.expect_reply(&response).await, "OK");
    let details = rm.send(
        "ResourceManagerDetails",
        json!({"resource_id": "dryer", "available_control_types": ["PPBC", "OMBC"]}),
    );
    assert_eq!(rm.expect_reply(&details).await, "OK");

    let ended = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EngineEventKind::SessionEnded {
            reason: EndReason::NegotiationFailed
        }
    );
    while let Some(message) = rm.try_next() {
        assert_ne!(message["message_type"], "SelectControlType");
    }
    assert!(rm.closed().await);
    handle.closed().await;
    assert_eq!(handle.snapshot().end_reason, Some(EndReason::NegotiationFailed));
}

#[tokio::test(start_paused = true)]
async fn test_replies_follow_arrival_order() {
    let registry = SessionRegistry::new(settings());
    let (_handle, mut rm) = operational(&registry, "ev-1").await;

    let sent: Vec<String> = (0..10)
        .map(|n| rm.send("PowerForecast", json!({"start_time": n})))
        .collect();
    for message_id in &sent {
        assert_eq!(rm.expect_reply(message_id).await, "OK");
    }
}

#[tokio::test(start_paused = true)]
async fn test_wrong_state_and_unknown_types_are_nacked() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "boiler").await;

    let stray = rm.send("SelectControlType", json!({"control_type": "FRBC"}));
    assert_eq!(rm.expect_reply(&stray).await, "TEMPORARY_ERROR");
    let unknown = rm.send("Gossip", json!({}));
    assert_eq!(rm.expect_reply(&unknown).await, "INVALID_MESSAGE");
    let invalid = rm.send("InstructionStatusUpdate", json!({"status_type": "STARTED"}));
    assert_eq!(rm.expect_reply(&invalid).await, "INVALID_DATA");

    assert_eq!(handle.snapshot().consecutive_violations, 3);
    assert_eq!(handle.state(), SessionState::Operational);
}

#[tokio::test(start_paused = true)]
async fn test_violation_threshold_closes_only_offender() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (bad, mut bad_rm) = operational(&registry, "bad-rm").await;
    let (good, mut good_rm) = operational(&registry, "good-rm").await;

    for _ in 0..registry.settings().protocol_violation_threshold {
        let id = bad_rm.send("Gossip", json!({}));
        assert_eq!(bad_rm.expect_reply(&id).await, "INVALID_MESSAGE");
    }
    assert!(bad_rm.closed().await);
    let ended = next_event(&mut events, bad.id(), |kind| {
        matches!(kind, EngineEventKind::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EngineEventKind::SessionEnded {
            reason: EndReason::ProtocolViolations
        }
    );

    let id = good_rm.send("PowerMeasurement", json!({"values": []}));
    assert_eq!(good_rm.expect_reply(&id).await, "OK");
    let active = registry.list_active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(&active[0].session_id, good.id());
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_falls_back_after_nack() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = connect(&registry, "washer");

    let proposal = rm.expect("Handshake").await;
    rm.ack(&proposal);
    let response = rm.send("HandshakeResponse", json!({"selected_protocol_version": "0.1.0"}));
    rm.expect_reply(&response).await;
    let details = rm.send(
        "ResourceManagerDetails",
        json!({"resource_id": "washer", "available_control_types": ["PPBC", "FRBC"]}),
    );
    rm.expect_reply(&details).await;

    let first = rm.expect("SelectControlType").await;
    assert_eq!(first["body"]["control_type"], "FILL_RATE_BASED_CONTROL");
    rm.reply(&first, "PERMANENT_ERROR");

    let second = rm.expect("SelectControlType").await;
    assert_eq!(second["body"]["control_type"], "POWER_PROFILE_BASED_CONTROL");
    rm.ack(&second);

    assert!(wait_for_state(&handle, SessionState::Describing).await);
    assert_eq!(handle.snapshot().control_type, Some(ControlType::PowerProfileBased));
}

#[tokio::test(start_paused = true)]
async fn test_description_timeout_closes_session() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = negotiate(&registry, "slow", &["FRBC"]).await;
    assert!(wait_for_state(&handle, SessionState::Describing).await);

    assert!(rm.closed().await);
    let ended = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EngineEventKind::SessionEnded {
            reason: EndReason::DescriptionTimeout
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let registry = SessionRegistry::new(settings());
    let (handle, mut rm) = operational(&registry, "fridge").await;

    assert!(registry.close(handle.id()).await);
    assert!(rm.closed().await);
    assert!(!registry.close(handle.id()).await);
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_subscriber_still_sees_end_through_handle() {
    let mut small = settings();
    small.event_channel_capacity = 2;
    let registry = SessionRegistry::new(small);
    let mut events = registry.subscribe();
    let (handle, mut rm) = operational(&registry, "freezer").await;

    assert!(registry.close(handle.id()).await);
    assert!(rm.closed().await);
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_))
    ));

    handle.closed().await;
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, SessionState::Closed);
    assert_eq!(snapshot.end_reason, Some(EndReason::ClosedByEngine));
}

#[tokio::test(start_paused = true)]
async fn test_session_request_terminates() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = operational(&registry, "heater").await;

    let request = rm.send("SessionRequest", json!({"request": "TERMINATE"}));
    assert_eq!(rm.expect_reply(&request).await, "OK");
    assert!(rm.closed().await);
    let ended = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EngineEventKind::SessionEnded {
            reason: EndReason::PeerRequested
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_changes_control_type() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = operational(&registry, "dishwasher").await;

    registry
        .renegotiate(handle.id(), ControlType::PowerProfileBased)
        .await
        .unwrap();
    let selection = rm.expect("SelectControlType").await;
    assert_eq!(selection["body"]["control_type"], "POWER_PROFILE_BASED_CONTROL");
    rm.ack(&selection);

    let changed = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::ControlTypeChanged { .. })
    })
    .await;
    assert_eq!(
        changed,
        EngineEventKind::ControlTypeChanged {
            from: Some(ControlType::FillRateBased),
            to: ControlType::PowerProfileBased,
        }
    );
    assert!(wait_for_state(&handle, SessionState::Describing).await);

    let description = rm.send("PPBC.SystemDescription", json!({"power_profiles": []}));
    assert_eq!(rm.expect_reply(&description).await, "OK");
    assert!(wait_for_state(&handle, SessionState::Operational).await);
}

#[tokio::test(start_paused = true)]
async fn test_returning_resource_is_rehydrated() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();

    let (first, _rm) = operational(&registry, "battery-9").await;
    assert!(registry.close(first.id()).await);
    assert!(registry.archive().lookup("battery-9").is_some());

    let (second, _rm) = negotiate(&registry, "battery-9", &["FRBC"]).await;
    assert!(wait_for_state(&second, SessionState::Operational).await);

    let ready = next_event(&mut events, second.id(), |kind| {
        matches!(kind, EngineEventKind::ResourceReady { .. })
    })
    .await;
    assert!(matches!(
        ready,
        EngineEventKind::ResourceReady { rehydrated: true, .. }
    ));
    assert!(second
        .snapshot()
        .resource_description
        .is_some_and(|d| d.contains_key("storage")));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_refuses_new_connections() {
    let registry = SessionRegistry::new(settings());
    let mut events = registry.subscribe();
    let (handle, mut rm) = operational(&registry, "inverter").await;

    registry.shutdown(WAIT).await;
    assert!(rm.closed().await);
    let ended = next_event(&mut events, handle.id(), |kind| {
        matches!(kind, EngineEventKind::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EngineEventKind::SessionEnded {
            reason: EndReason::Shutdown
        }
    );

    let (connection, _peer) = flexcem_transports::memory::pair("late");
    assert!(matches!(
        registry.accept(Box::new(connection)),
        Err(flexcem_session::EngineError::ShuttingDown)
    ));
}
