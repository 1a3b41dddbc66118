// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pure per-session protocol state machine.
//!
//! The machine never performs I/O, never sleeps and never reads the clock: the
//! owning task feeds it inbound frames, commands and timer ticks together with
//! `now`, and executes the [`SessionAction`]s it returns, in order.
//!
//! Every inbound message except `ReceptionStatus` is answered exactly once.
//! The answer is always the first action returned for that frame, so it is
//! written before any message the frame causes the CEM to send.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use flexcem_protocol::{
    builders, decode, encode, ControlType, DecodeError, EnergyManagementRole, Envelope, Handshake,
    HandshakeResponse, Message, MessageId, ReceptionStatus, ReceptionStatusValue,
    ResourceManagerDetails,
};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchivedResource, DescriptionArchive};
use crate::dispatcher::{Instruction, InstructionLedger, InstructionOutcome, StatusChange, StatusUpdate};
use crate::error::{DispatchError, EngineError};
use crate::events::{EndReason, EngineEventKind};
use crate::reliability::{Expired, Origin, ReliabilityTracker};
use crate::session::{SessionId, SessionSnapshot, SessionState};
use crate::settings::EngineSettings;

/// Revoked object ids remembered per session
const REVOKED_OBJECTS_RETAINED: usize = 100;

/// Work for the owning task
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write a frame to the connection
    Send(Vec<u8>),
    /// Publish an event to subscribers
    Emit(EngineEventKind),
    /// Session entered CLOSING; the task decides whether to drain before finishing
    Close(EndReason),
}

/// How an inbound message was handled
enum Disposition {
    Accepted,
    /// Not allowed here; nacked and counted against the peer
    Violation {
        status: ReceptionStatusValue,
        reason: String,
    },
    /// Nacked without counting a violation
    Declined {
        status: ReceptionStatusValue,
        reason: String,
    },
}

pub struct SessionMachine {
    id: SessionId,
    peer: String,
    settings: Arc<EngineSettings>,
    state: SessionState,
    protocol_version: Option<String>,
    control_type: Option<ControlType>,
    details: Option<ResourceManagerDetails>,
    description: Option<Map<String, Value>>,
    candidates: VecDeque<ControlType>,
    pending_selection: Option<ControlType>,
    renegotiating: bool,
    tracker: ReliabilityTracker,
    ledger: InstructionLedger,
    violations: u32,
    phase_deadline: Option<Instant>,
    last_inbound: Instant,
    revoked: VecDeque<MessageId>,
    archive: Option<DescriptionArchive>,
    rehydration: Option<ArchivedResource>,
    handshake_failed_emitted: bool,
    end_reason: Option<EndReason>,
}

impl SessionMachine {
    /// `archive` is `None` when returning resources are not rehydrated
    pub fn new(
        id: SessionId,
        peer: impl Into<String>,
        settings: Arc<EngineSettings>,
        archive: Option<DescriptionArchive>,
        now: Instant,
    ) -> Self {
        let tracker = ReliabilityTracker::new(
            settings.retry_interval,
            settings.max_attempts,
            settings.dedup_retention_window,
            settings.dedup_max_entries,
        );
        let ledger = InstructionLedger::new(
            id.clone(),
            settings.instruction_execution_deadline,
            settings.instruction_history_size,
        );

        Self {
            id,
            peer: peer.into(),
            settings,
            state: SessionState::Connecting,
            protocol_version: None,
            control_type: None,
            details: None,
            description: None,
            candidates: VecDeque::new(),
            pending_selection: None,
            renegotiating: false,
            tracker,
            ledger,
            violations: 0,
            phase_deadline: None,
            last_inbound: now,
            revoked: VecDeque::new(),
            archive,
            rehydration: None,
            handshake_failed_emitted: false,
            end_reason: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn control_type(&self) -> Option<ControlType> {
        self.control_type
    }

    pub fn has_pending_outbound(&self) -> bool {
        self.tracker.pending_count() > 0
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            peer: self.peer.clone(),
            state: self.state,
            protocol_version: self.protocol_version.clone(),
            control_type: self.control_type,
            resource_id: self
                .details
                .as_ref()
                .map(|d| d.resource_id.as_str().to_string()),
            available_control_types: self
                .details
                .as_ref()
                .map(|d| d.available_control_types.clone())
                .unwrap_or_default(),
            resource_description: self.description.clone(),
            pending_outbound: self.tracker.pending_count(),
            consecutive_violations: self.violations,
            current_instruction: self.ledger.in_flight().cloned(),
            end_reason: self.end_reason,
        }
    }

    /// Transport is up: propose a handshake
    pub fn start(&mut self, now: Instant) -> Vec<SessionAction> {
        if self.state != SessionState::Connecting {
            return Vec::new();
        }

        let mut actions = vec![SessionAction::Emit(EngineEventKind::SessionStarted {
            peer: self.peer.clone(),
        })];
        let proposal = builders::handshake(&self.settings.supported_protocol_versions);
        actions.extend(self.send_tracked(proposal, Origin::Handshake, now));

        self.state = SessionState::Handshaking;
        self.phase_deadline = Some(now + self.settings.handshake_timeout);
        info!(session_id = %self.id, "[SESSION] Connected to {}, handshake proposed", self.peer);
        actions
    }

    /// Process one inbound frame
    pub fn handle_frame(&mut self, frame: &[u8], now: Instant) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        self.last_inbound = now;

        let envelope = match decode(frame) {
            Ok(envelope) => envelope,
            Err(err) if self.state.is_ending() => {
                debug!(session_id = %self.id, "[SESSION] Ignoring undecodable frame while closing: {}", err);
                return Vec::new();
            }
            Err(err) => return self.on_decode_error(err, now),
        };

        // Acknowledgments are never acknowledged themselves
        if envelope.message_type == "ReceptionStatus" {
            return match Message::from_envelope(&envelope) {
                Ok(Message::ReceptionStatus(status)) => self.on_reception_status(status, now),
                Ok(_) => Vec::new(),
                Err(err) => {
                    warn!(session_id = %self.id, "[SESSION] Unusable ReceptionStatus: {}", err);
                    if self.state.is_ending() {
                        Vec::new()
                    } else {
                        self.register_violation(err.to_string())
                    }
                }
            };
        }

        // Retransmissions are answered in every state, CLOSING included
        if let Some(status) = self.tracker.seen_status(&envelope.message_id, now) {
            debug!(
                session_id = %self.id,
                "[SESSION] Duplicate {} ({}), repeating {:?}",
                envelope.message_type, envelope.message_id, status
            );
            return self.reply(&envelope.message_id, status, Some("duplicate message"));
        }

        if self.state.is_ending() {
            debug!(
                session_id = %self.id,
                "[SESSION] Dropping {} received while closing", envelope.message_type
            );
            return Vec::new();
        }

        let message = match Message::from_envelope(&envelope) {
            Ok(message) => message,
            Err(err) => return self.on_decode_error(err, now),
        };

        let (disposition, effects) = self.route(message, &envelope.message_type, now);
        let message_id = envelope.message_id;

        let mut actions = Vec::new();
        let mut violation = None;
        match disposition {
            Disposition::Accepted => {
                self.violations = 0;
                self.tracker
                    .record_inbound(message_id.clone(), ReceptionStatusValue::Ok, now);
                actions.extend(self.reply(&message_id, ReceptionStatusValue::Ok, None));
            }
            Disposition::Declined { status, reason } => {
                debug!(session_id = %self.id, "[SESSION] Declined {}: {}", message_id, reason);
                self.tracker.record_inbound(message_id.clone(), status, now);
                actions.extend(self.reply(&message_id, status, Some(&reason)));
            }
            Disposition::Violation { status, reason } => {
                self.tracker.record_inbound(message_id.clone(), status, now);
                actions.extend(self.reply(&message_id, status, Some(&reason)));
                violation = Some(reason);
            }
        }
        actions.extend(effects);
        if let Some(reason) = violation {
            actions.extend(self.register_violation(reason));
        }
        actions
    }

    /// Timer work: retries, phase timeouts, idle detection, instruction deadlines
    pub fn tick(&mut self, now: Instant) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let work = self.tracker.poll(now);
        for frame in work.resend {
            actions.push(SessionAction::Send(frame));
        }
        for expired in work.expired {
            actions.extend(self.on_expired(expired, now));
        }

        if self.state.is_ending() {
            return actions;
        }

        if let Some(deadline) = self.phase_deadline {
            if now >= deadline {
                self.phase_deadline = None;
                match self.state {
                    SessionState::Handshaking => {
                        actions.extend(self.fail_handshake("no handshake response".to_string()));
                    }
                    SessionState::NegotiatingControlType => {
                        actions.extend(self.begin_close(EndReason::NegotiationTimeout));
                    }
                    SessionState::Describing => {
                        actions.extend(self.begin_close(EndReason::DescriptionTimeout));
                    }
                    _ => {}
                }
                if self.state.is_ending() {
                    return actions;
                }
            }
        }

        if let Some(idle) = self.settings.idle_timeout {
            if now.saturating_duration_since(self.last_inbound) >= idle {
                actions.extend(self.begin_close(EndReason::IdleTimeout));
                return actions;
            }
        }

        if let Some(change) = self.ledger.on_tick(now) {
            actions.push(status_event(change));
        }
        actions
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let retries = self.tracker.next_deadline();
        if self.state.is_ending() {
            return retries;
        }

        let idle = self.settings.idle_timeout.map(|idle| self.last_inbound + idle);
        [retries, self.phase_deadline, idle, self.ledger.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Send an instruction under the active control type
    ///
    /// # Errors
    ///
    /// Caller errors only; the session is left untouched when one is returned.
    pub fn issue_instruction(
        &mut self,
        instruction: Instruction,
        waiter: Option<oneshot::Sender<InstructionOutcome>>,
        now: Instant,
    ) -> Result<(MessageId, Vec<SessionAction>), DispatchError> {
        if self.state != SessionState::Operational || self.pending_selection.is_some() {
            return Err(DispatchError::SessionNotOperational {
                session_id: self.id.clone(),
                state: self.state,
            });
        }
        if let Some(record) = self.ledger.in_flight() {
            return Err(DispatchError::InstructionInFlight {
                session_id: self.id.clone(),
                instruction_id: record.instruction_id.clone(),
            });
        }
        let target = instruction.target_control_type;
        let session_id = self.id.clone();
        let active = self.control_type;
        let mismatch = || DispatchError::ControlTypeMismatch {
            session_id: session_id.clone(),
            active,
            requested: target,
        };
        if self.control_type != Some(target) || !target.is_controllable() {
            return Err(mismatch());
        }

        let instruction_id = self.ledger.next_instruction_id()?;
        let envelope = builders::instruction(
            target,
            &instruction_id,
            instruction.execution_time,
            &instruction.payload,
        )
        .map_err(|_| mismatch())?;

        let mut actions = self.send_tracked(
            envelope,
            Origin::Instruction(instruction_id.clone()),
            now,
        );
        let change = self
            .ledger
            .begin(instruction_id.clone(), &instruction, waiter, now, Utc::now());
        actions.push(status_event(change));

        info!(
            session_id = %self.id,
            "[SESSION] Issued instruction {} ({})", instruction_id, target
        );
        Ok((instruction_id, actions))
    }

    /// Select a different advertised control type while OPERATIONAL
    ///
    /// On acknowledgment the session emits `ControlTypeChanged` and waits for
    /// a description of the new type. A rejected selection keeps the current one.
    pub fn renegotiate(
        &mut self,
        control_type: ControlType,
        now: Instant,
    ) -> Result<Vec<SessionAction>, EngineError> {
        if self.state != SessionState::Operational || self.pending_selection.is_some() {
            return Err(EngineError::InvalidState {
                session_id: self.id.clone(),
                state: self.state,
                operation: "renegotiate",
            });
        }
        if let Some(record) = self.ledger.in_flight() {
            return Err(DispatchError::InstructionInFlight {
                session_id: self.id.clone(),
                instruction_id: record.instruction_id.clone(),
            }
            .into());
        }

        let advertised = self
            .details
            .as_ref()
            .is_some_and(|d| d.available_control_types.contains(&control_type));
        if !advertised
            || control_type == ControlType::NoSelection
            || !self.settings.supports(control_type)
        {
            return Err(EngineError::UnsupportedControlType {
                session_id: self.id.clone(),
                control_type,
            });
        }
        if self.control_type == Some(control_type) {
            return Ok(Vec::new());
        }

        info!(
            session_id = %self.id,
            "[SESSION] Renegotiating control type {:?} -> {}", self.control_type, control_type
        );
        self.renegotiating = true;
        self.pending_selection = Some(control_type);
        Ok(self.send_tracked(
            builders::select_control_type(control_type),
            Origin::ControlTypeSelection(control_type),
            now,
        ))
    }

    /// Enter CLOSING; no-op when already ending
    pub fn begin_close(&mut self, reason: EndReason) -> Vec<SessionAction> {
        if self.state.is_ending() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if matches!(self.state, SessionState::Connecting | SessionState::Handshaking)
            && !self.handshake_failed_emitted
        {
            self.handshake_failed_emitted = true;
            actions.push(SessionAction::Emit(EngineEventKind::HandshakeFailed {
                reason: reason.to_string(),
            }));
        }

        info!(session_id = %self.id, "[SESSION] Closing: {}", reason);
        self.state = SessionState::Closing;
        self.end_reason = Some(reason);
        self.phase_deadline = None;
        actions.push(SessionAction::Close(reason));
        actions
    }

    /// Enter CLOSED: cancel outbound work, fail waiters, archive the description
    pub fn finish(&mut self, reason: EndReason) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }

        let cancelled = self.tracker.cancel_all();
        if !cancelled.is_empty() {
            debug!(
                session_id = %self.id,
                "[SESSION] Cancelled {} unacknowledged messages", cancelled.len()
            );
        }
        self.ledger.abandon();

        if let (Some(archive), Some(details), Some(control_type), Some(description)) = (
            &self.archive,
            &self.details,
            self.control_type,
            &self.description,
        ) {
            archive.store(
                details.resource_id.as_str(),
                ArchivedResource {
                    control_type,
                    description: description.clone(),
                },
            );
        }

        let reason = self.end_reason.unwrap_or(reason);
        self.end_reason = Some(reason);
        self.state = SessionState::Closed;
        info!(session_id = %self.id, "[SESSION] Closed: {}", reason);
        vec![SessionAction::Emit(EngineEventKind::SessionEnded { reason })]
    }

    fn route(
        &mut self,
        message: Message,
        message_type: &str,
        now: Instant,
    ) -> (Disposition, Vec<SessionAction>) {
        // Allowed in every live state
        if let Message::SessionRequest(request) = &message {
            info!(
                session_id = %self.id,
                "[SESSION] Resource manager requested {:?}", request.request
            );
            return (Disposition::Accepted, self.begin_close(EndReason::PeerRequested));
        }

        match self.state {
            SessionState::Handshaking => self.on_handshaking(message, now),
            SessionState::NegotiatingControlType => self.on_negotiating(message, now),
            SessionState::Describing => self.on_describing(message, message_type),
            SessionState::Operational => self.on_operational(message, message_type, now),
            SessionState::Connecting | SessionState::Closing | SessionState::Closed => {
                (self.not_allowed(&message), Vec::new())
            }
        }
    }

    fn on_handshaking(&mut self, message: Message, now: Instant) -> (Disposition, Vec<SessionAction>) {
        match message {
            Message::HandshakeResponse(HandshakeResponse {
                selected_protocol_version,
            }) => {
                if self
                    .settings
                    .supported_protocol_versions
                    .contains(&selected_protocol_version)
                {
                    (
                        Disposition::Accepted,
                        self.complete_handshake(selected_protocol_version, now),
                    )
                } else {
                    let reason = format!(
                        "unsupported protocol version {}",
                        selected_protocol_version
                    );
                    (
                        Disposition::Declined {
                            status: ReceptionStatusValue::InvalidContent,
                            reason: reason.clone(),
                        },
                        self.fail_handshake(reason),
                    )
                }
            }
            Message::Handshake(handshake) => self.on_peer_handshake(handshake, now),
            other => (self.not_allowed(&other), Vec::new()),
        }
    }

    /// Resource manager opened the handshake itself
    fn on_peer_handshake(&mut self, handshake: Handshake, now: Instant) -> (Disposition, Vec<SessionAction>) {
        let offered = handshake.supported_protocol_versions.unwrap_or_default();
        let selected = self
            .settings
            .supported_protocol_versions
            .iter()
            .find(|version| offered.contains(version))
            .cloned();

        let reason = match (handshake.role, selected) {
            (EnergyManagementRole::Rm, Some(version)) => {
                let mut actions =
                    self.send_tracked(builders::handshake_response(&version), Origin::Other, now);
                actions.extend(self.complete_handshake(version, now));
                return (Disposition::Accepted, actions);
            }
            (EnergyManagementRole::Rm, None) => {
                format!("no common protocol version in {:?}", offered)
            }
            (EnergyManagementRole::Cem, _) => "peer announced the CEM role".to_string(),
        };

        (
            Disposition::Declined {
                status: ReceptionStatusValue::InvalidContent,
                reason: reason.clone(),
            },
            self.fail_handshake(reason),
        )
    }

    fn complete_handshake(&mut self, version: String, now: Instant) -> Vec<SessionAction> {
        self.tracker.cancel_origin(&Origin::Handshake);
        info!(session_id = %self.id, "[SESSION] Handshake completed (protocol {})", version);
        self.protocol_version = Some(version.clone());
        self.state = SessionState::NegotiatingControlType;
        self.phase_deadline = Some(now + self.settings.negotiation_timeout);
        vec![SessionAction::Emit(EngineEventKind::HandshakeCompleted {
            protocol_version: version,
        })]
    }

    fn fail_handshake(&mut self, reason: String) -> Vec<SessionAction> {
        warn!(session_id = %self.id, "[SESSION] Handshake failed: {}", reason);
        let mut actions = Vec::new();
        if !self.handshake_failed_emitted {
            self.handshake_failed_emitted = true;
            actions.push(SessionAction::Emit(EngineEventKind::HandshakeFailed { reason }));
        }
        actions.extend(self.begin_close(EndReason::HandshakeFailed));
        actions
    }

    fn on_negotiating(&mut self, message: Message, now: Instant) -> (Disposition, Vec<SessionAction>) {
        match message {
            Message::ResourceManagerDetails(details) => {
                if self.pending_selection.is_some() {
                    self.details = Some(details);
                    return (Disposition::Accepted, Vec::new());
                }
                (Disposition::Accepted, self.begin_negotiation(details, now))
            }
            other => (self.not_allowed(&other), Vec::new()),
        }
    }

    fn begin_negotiation(&mut self, details: ResourceManagerDetails, now: Instant) -> Vec<SessionAction> {
        if self.settings.rehydrate_returning_resources {
            self.rehydration = self
                .archive
                .as_ref()
                .and_then(|archive| archive.lookup(details.resource_id.as_str()));
        }

        let mut candidates: Vec<ControlType> = Vec::new();
        for control_type in &details.available_control_types {
            if *control_type != ControlType::NoSelection
                && self.settings.supports(*control_type)
                && !candidates.contains(control_type)
            {
                candidates.push(*control_type);
            }
        }
        // Stable: equal ranks keep the order the resource declared them in
        candidates.sort_by_key(|ct| self.settings.priority_rank(*ct));
        if candidates.iter().any(|ct| ct.is_controllable()) {
            candidates.retain(|ct| ct.is_controllable());
        }

        info!(
            session_id = %self.id,
            "[SESSION] Resource {} offers {:?}, candidates {:?}",
            details.resource_id, details.available_control_types, candidates
        );
        self.details = Some(details);
        self.candidates = candidates.into();
        self.select_next(now)
    }

    fn select_next(&mut self, now: Instant) -> Vec<SessionAction> {
        let Some(control_type) = self.candidates.pop_front() else {
            warn!(session_id = %self.id, "[SESSION] No selectable control type left");
            return self.begin_close(EndReason::NegotiationFailed);
        };

        debug!(session_id = %self.id, "[SESSION] Selecting {}", control_type);
        self.pending_selection = Some(control_type);
        self.send_tracked(
            builders::select_control_type(control_type),
            Origin::ControlTypeSelection(control_type),
            now,
        )
    }

    fn on_selection_acked(&mut self, control_type: ControlType, now: Instant) -> Vec<SessionAction> {
        if self.pending_selection != Some(control_type) {
            return Vec::new();
        }
        self.pending_selection = None;
        self.candidates.clear();

        let previous = self.control_type.replace(control_type);
        let mut actions = Vec::new();
        if self.renegotiating {
            self.renegotiating = false;
            actions.push(SessionAction::Emit(EngineEventKind::ControlTypeChanged {
                from: previous,
                to: control_type,
            }));
        } else {
            actions.push(SessionAction::Emit(EngineEventKind::ControlTypeSelected {
                control_type,
            }));
        }

        let rehydrated = self
            .rehydration
            .take()
            .filter(|archived| archived.control_type == control_type);

        if control_type == ControlType::NotControllable {
            let description = self.details.as_ref().map(|d| d.raw.clone()).unwrap_or_default();
            actions.extend(self.become_operational(description, false));
        } else if let Some(archived) = rehydrated {
            info!(
                session_id = %self.id,
                "[SESSION] Restored archived {} description", control_type
            );
            actions.extend(self.become_operational(archived.description, true));
        } else {
            self.description = None;
            self.state = SessionState::Describing;
            self.phase_deadline = Some(now + self.settings.description_timeout);
        }
        actions
    }

    fn on_selection_failed(
        &mut self,
        control_type: ControlType,
        reason: &str,
        now: Instant,
    ) -> Vec<SessionAction> {
        if self.pending_selection != Some(control_type) {
            return Vec::new();
        }
        self.pending_selection = None;

        if self.renegotiating {
            self.renegotiating = false;
            warn!(
                session_id = %self.id,
                "[SESSION] Switch to {} failed ({}), keeping {:?}",
                control_type, reason, self.control_type
            );
            return Vec::new();
        }

        warn!(
            session_id = %self.id,
            "[SESSION] Selection of {} failed ({}), trying next candidate", control_type, reason
        );
        self.select_next(now)
    }

    fn become_operational(&mut self, description: Map<String, Value>, rehydrated: bool) -> Vec<SessionAction> {
        self.state = SessionState::Operational;
        self.phase_deadline = None;
        self.description = Some(description.clone());

        let Some(control_type) = self.control_type else {
            return Vec::new();
        };
        info!(session_id = %self.id, "[SESSION] Operational under {}", control_type);
        vec![SessionAction::Emit(EngineEventKind::ResourceReady {
            resource_id: self.resource_id(),
            control_type,
            description,
            rehydrated,
        })]
    }

    fn on_describing(&mut self, message: Message, message_type: &str) -> (Disposition, Vec<SessionAction>) {
        match message {
            Message::SystemDescription { control_type, body } => {
                if self.control_type != Some(control_type) {
                    return (self.wrong_control_type(control_type), Vec::new());
                }
                (Disposition::Accepted, self.become_operational(body, false))
            }
            Message::ResourceManagerDetails(details) => {
                self.details = Some(details);
                (Disposition::Accepted, Vec::new())
            }
            other => self.on_telemetry(other, message_type),
        }
    }

    fn on_operational(
        &mut self,
        message: Message,
        message_type: &str,
        now: Instant,
    ) -> (Disposition, Vec<SessionAction>) {
        match message {
            Message::SystemDescription { control_type, body } => {
                if self.control_type != Some(control_type) {
                    return (self.wrong_control_type(control_type), Vec::new());
                }
                self.description = Some(body.clone());
                debug!(session_id = %self.id, "[SESSION] Description updated");
                (
                    Disposition::Accepted,
                    vec![SessionAction::Emit(EngineEventKind::ResourceUpdated {
                        resource_id: self.resource_id(),
                        description: body,
                    })],
                )
            }
            Message::InstructionStatusUpdate(update) => {
                match self.ledger.on_status_update(&update, now) {
                    StatusUpdate::Changed(change) => (Disposition::Accepted, vec![status_event(change)]),
                    StatusUpdate::Unchanged => (Disposition::Accepted, Vec::new()),
                    StatusUpdate::Unknown => (
                        Disposition::Declined {
                            status: ReceptionStatusValue::InvalidContent,
                            reason: format!("unknown instruction {}", update.instruction_id),
                        },
                        Vec::new(),
                    ),
                }
            }
            Message::RevokeObject(revoke) => {
                if self.revoked.contains(&revoke.object_id) {
                    debug!(session_id = %self.id, "[SESSION] {} already revoked", revoke.object_id);
                    return (Disposition::Accepted, Vec::new());
                }
                self.revoked.push_back(revoke.object_id.clone());
                while self.revoked.len() > REVOKED_OBJECTS_RETAINED {
                    self.revoked.pop_front();
                }

                let mut effects = Vec::new();
                if let Some(change) = self.ledger.revoke(&revoke.object_id) {
                    effects.push(status_event(change));
                }
                effects.push(SessionAction::Emit(EngineEventKind::ObjectRevoked {
                    object_type: revoke.object_type,
                    object_id: revoke.object_id,
                }));
                (Disposition::Accepted, effects)
            }
            Message::ResourceManagerDetails(details) => {
                debug!(session_id = %self.id, "[SESSION] Resource details updated");
                self.details = Some(details);
                (Disposition::Accepted, Vec::new())
            }
            other => self.on_telemetry(other, message_type),
        }
    }

    /// Measurements, forecasts and status messages of the active control type
    fn on_telemetry(&mut self, message: Message, message_type: &str) -> (Disposition, Vec<SessionAction>) {
        let body = match message {
            Message::PowerMeasurement(body) | Message::PowerForecast(body) => body,
            Message::ControlTypeScoped {
                control_type, body, ..
            } if self.control_type == Some(control_type) => body,
            other => return (self.not_allowed(&other), Vec::new()),
        };
        (
            Disposition::Accepted,
            vec![SessionAction::Emit(EngineEventKind::Telemetry {
                message_type: message_type.to_string(),
                body,
            })],
        )
    }

    fn on_reception_status(&mut self, status: ReceptionStatus, now: Instant) -> Vec<SessionAction> {
        let Some(delivery) = self.tracker.on_reception_status(&status.subject_id, status.status) else {
            debug!(
                session_id = %self.id,
                "[SESSION] ReceptionStatus for untracked message {}", status.subject_id
            );
            return Vec::new();
        };
        self.violations = 0;

        let reason = status
            .diagnostic_label
            .unwrap_or_else(|| format!("{:?}", status.status));

        match delivery.origin {
            Origin::Handshake => {
                if status.status.is_ok() || self.state != SessionState::Handshaking {
                    Vec::new()
                } else {
                    self.fail_handshake(format!("handshake proposal rejected: {}", reason))
                }
            }
            Origin::ControlTypeSelection(control_type) => {
                if status.status.is_ok() {
                    self.on_selection_acked(control_type, now)
                } else {
                    self.on_selection_failed(control_type, &reason, now)
                }
            }
            Origin::Instruction(instruction_id) => {
                let change = if status.status.is_ok() {
                    self.ledger.on_acked(&instruction_id)
                } else {
                    warn!(
                        session_id = %self.id,
                        "[SESSION] Instruction {} rejected: {}", instruction_id, reason
                    );
                    self.ledger.on_rejected(&instruction_id, status.status)
                };
                change.map(status_event).into_iter().collect()
            }
            Origin::Other => {
                if !status.status.is_ok() {
                    warn!(
                        session_id = %self.id,
                        "[SESSION] Message {} rejected: {}", delivery.message_id, reason
                    );
                }
                Vec::new()
            }
        }
    }

    fn on_expired(&mut self, expired: Expired, now: Instant) -> Vec<SessionAction> {
        warn!(
            session_id = %self.id,
            "[SESSION] Message {} unacknowledged after {} attempts",
            expired.message_id, expired.attempts
        );
        if self.state.is_ending() {
            return Vec::new();
        }

        match expired.origin {
            Origin::Handshake if self.state == SessionState::Handshaking => self.fail_handshake(
                format!("handshake proposal unacknowledged after {} attempts", expired.attempts),
            ),
            Origin::ControlTypeSelection(control_type) => {
                self.on_selection_failed(control_type, "not acknowledged", now)
            }
            Origin::Instruction(instruction_id) => self
                .ledger
                .on_delivery_timeout(&instruction_id, expired.attempts)
                .map(status_event)
                .into_iter()
                .collect(),
            Origin::Handshake | Origin::Other => Vec::new(),
        }
    }

    fn on_decode_error(&mut self, err: DecodeError, now: Instant) -> Vec<SessionAction> {
        let status = err.reception_status();
        let mut actions = Vec::new();
        match err.message_id() {
            Some(message_id) => {
                if let Some(previous) = self.tracker.seen_status(message_id, now) {
                    return self.reply(message_id, previous, Some("duplicate message"));
                }
                self.tracker.record_inbound(message_id.clone(), status, now);
                actions.extend(self.reply(message_id, status, Some(&err.to_string())));
            }
            None => {
                debug!(session_id = %self.id, "[SESSION] Cannot answer frame without message_id");
            }
        }
        actions.extend(self.register_violation(err.to_string()));
        actions
    }

    fn register_violation(&mut self, reason: String) -> Vec<SessionAction> {
        self.violations += 1;
        warn!(
            session_id = %self.id,
            "[SESSION] Protocol violation {}/{}: {}",
            self.violations, self.settings.protocol_violation_threshold, reason
        );

        let mut actions = vec![SessionAction::Emit(EngineEventKind::ProtocolViolation {
            consecutive: self.violations,
            reason,
        })];
        if self.violations >= self.settings.protocol_violation_threshold {
            actions.extend(self.begin_close(EndReason::ProtocolViolations));
        }
        actions
    }

    fn not_allowed(&self, message: &Message) -> Disposition {
        Disposition::Violation {
            status: ReceptionStatusValue::TemporaryError,
            reason: format!("{} not allowed in state {:?}", message.kind(), self.state),
        }
    }

    fn wrong_control_type(&self, control_type: ControlType) -> Disposition {
        Disposition::Violation {
            status: ReceptionStatusValue::InvalidContent,
            reason: format!(
                "description for {} while {:?} is selected",
                control_type, self.control_type
            ),
        }
    }

    fn resource_id(&self) -> Option<String> {
        self.details
            .as_ref()
            .map(|d| d.resource_id.as_str().to_string())
    }

    fn reply(
        &self,
        subject_id: &MessageId,
        status: ReceptionStatusValue,
        diagnostic_label: Option<&str>,
    ) -> Vec<SessionAction> {
        let envelope = builders::reception_status(subject_id, status, diagnostic_label);
        self.frame(&envelope).map(SessionAction::Send).into_iter().collect()
    }

    fn send_tracked(&mut self, envelope: Envelope, origin: Origin, now: Instant) -> Vec<SessionAction> {
        let Some(frame) = self.frame(&envelope) else {
            return Vec::new();
        };
        self.tracker
            .track(envelope.message_id, frame.clone(), origin, now);
        vec![SessionAction::Send(frame)]
    }

    fn frame(&self, envelope: &Envelope) -> Option<Vec<u8>> {
        match encode(envelope) {
            Ok(frame) => Some(frame),
            Err(err) => {
                error!(
                    session_id = %self.id,
                    "[SESSION] Failed to encode {}: {}", envelope.message_type, err
                );
                None
            }
        }
    }
}

fn status_event(change: StatusChange) -> SessionAction {
    SessionAction::Emit(EngineEventKind::InstructionStatusChanged {
        instruction_id: change.instruction_id,
        status: change.status,
    })
}
