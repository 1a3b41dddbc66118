// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Instruction dispatch
//!
//! [`InstructionLedger`] is the per-session bookkeeping (one outstanding
//! instruction, its deadline, a bounded history). It lives inside the session
//! task. [`InstructionDispatcher`] is the caller-facing entry point that routes
//! requests to the right session through the registry.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flexcem_protocol::{
    ControlType, InstructionStatus, InstructionStatusUpdate, MessageId, ReceptionStatusValue,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::registry::SessionRegistry;
use crate::session::{SessionId, SessionSnapshot};

/// Lifecycle of an instruction as seen by the CEM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionState {
    Sent,
    Acked,
    Accepted,
    Rejected,
    Started,
    Succeeded,
    Aborted,
    TimedOut,
}

impl InstructionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstructionState::Rejected
                | InstructionState::Succeeded
                | InstructionState::Aborted
                | InstructionState::TimedOut
        )
    }

    // Forward-only ordering of the non-terminal states
    fn progress(&self) -> u8 {
        match self {
            InstructionState::Sent => 0,
            InstructionState::Acked => 1,
            InstructionState::Accepted => 2,
            InstructionState::Started => 3,
            _ => 4,
        }
    }
}

/// Directive submitted by a scheduling collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub target_control_type: ControlType,
    /// Control-type specific content, passed through untouched
    pub payload: Map<String, Value>,
    pub execution_time: DateTime<Utc>,
}

impl Instruction {
    /// Instruction due immediately
    pub fn new(target_control_type: ControlType, payload: Map<String, Value>) -> Self {
        Self {
            target_control_type,
            payload,
            execution_time: Utc::now(),
        }
    }

    pub fn at(mut self, execution_time: DateTime<Utc>) -> Self {
        self.execution_time = execution_time;
        self
    }
}

/// What the session knows about one instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionRecord {
    pub instruction_id: MessageId,
    pub control_type: ControlType,
    pub execution_time: DateTime<Utc>,
    pub status: InstructionState,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final result delivered to a tracked issuer
pub type InstructionOutcome = Result<InstructionState, DispatchError>;

/// Status transition to publish as an event
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub instruction_id: MessageId,
    pub status: InstructionState,
}

/// How an inbound `InstructionStatusUpdate` was applied
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Changed(StatusChange),
    /// Known instruction, nothing to change (NEW, repeats, late updates)
    Unchanged,
    /// The instruction id was never issued on this session
    Unknown,
}

struct Outstanding {
    record: InstructionRecord,
    deadline: Instant,
    waiter: Option<oneshot::Sender<InstructionOutcome>>,
}

pub struct InstructionLedger {
    session_id: SessionId,
    next_sequence: u64,
    execution_deadline: Duration,
    history_size: usize,
    outstanding: Option<Outstanding>,
    history: VecDeque<InstructionRecord>,
}

impl InstructionLedger {
    pub fn new(session_id: SessionId, execution_deadline: Duration, history_size: usize) -> Self {
        Self {
            session_id,
            next_sequence: 1,
            execution_deadline,
            history_size: history_size.max(1),
            outstanding: None,
            history: VecDeque::new(),
        }
    }

    /// Non-terminal instruction, if any
    pub fn in_flight(&self) -> Option<&InstructionRecord> {
        self.outstanding.as_ref().map(|o| &o.record)
    }

    /// Finished instructions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &InstructionRecord> {
        self.history.iter()
    }

    /// Reserve the next `<session_id>:<sequence>` id
    pub fn next_instruction_id(&mut self) -> Result<MessageId, DispatchError> {
        let candidate = format!("{}:{}", self.session_id, self.next_sequence);
        let id = MessageId::parse(candidate).ok_or_else(|| {
            warn!(
                "[DISPATCH] Session id {} cannot form instruction ids",
                self.session_id
            );
            DispatchError::UnknownSession(self.session_id.clone())
        })?;
        self.next_sequence += 1;
        Ok(id)
    }

    /// Register a just-sent instruction
    ///
    /// The execution deadline counts from the later of now and the requested
    /// execution time, and restarts when the RM reports STARTED.
    pub fn begin(
        &mut self,
        instruction_id: MessageId,
        instruction: &Instruction,
        waiter: Option<oneshot::Sender<InstructionOutcome>>,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) -> StatusChange {
        let until_due = (instruction.execution_time - now_utc)
            .to_std()
            .unwrap_or(Duration::ZERO);

        self.outstanding = Some(Outstanding {
            record: InstructionRecord {
                instruction_id: instruction_id.clone(),
                control_type: instruction.target_control_type,
                execution_time: instruction.execution_time,
                status: InstructionState::Sent,
                issued_at: now_utc,
                updated_at: now_utc,
            },
            deadline: now + until_due + self.execution_deadline,
            waiter,
        });

        StatusChange {
            instruction_id,
            status: InstructionState::Sent,
        }
    }

    fn outstanding_for(&mut self, instruction_id: &MessageId) -> Option<&mut Outstanding> {
        self.outstanding
            .as_mut()
            .filter(|o| &o.record.instruction_id == instruction_id)
    }

    /// Instruction message acknowledged by the RM
    pub fn on_acked(&mut self, instruction_id: &MessageId) -> Option<StatusChange> {
        let outstanding = self.outstanding_for(instruction_id)?;
        if outstanding.record.status != InstructionState::Sent {
            return None;
        }
        outstanding.record.status = InstructionState::Acked;
        outstanding.record.updated_at = Utc::now();
        Some(StatusChange {
            instruction_id: instruction_id.clone(),
            status: InstructionState::Acked,
        })
    }

    /// Instruction message nacked by the RM
    pub fn on_rejected(
        &mut self,
        instruction_id: &MessageId,
        status: ReceptionStatusValue,
    ) -> Option<StatusChange> {
        self.outstanding_for(instruction_id)?;
        let outcome = Err(DispatchError::Rejected {
            instruction_id: instruction_id.clone(),
            status,
        });
        Some(self.finish(InstructionState::Rejected, outcome))
    }

    /// Instruction message never acknowledged
    pub fn on_delivery_timeout(
        &mut self,
        instruction_id: &MessageId,
        attempts: u32,
    ) -> Option<StatusChange> {
        self.outstanding_for(instruction_id)?;
        let outcome = Err(DispatchError::DeliveryTimeout {
            instruction_id: instruction_id.clone(),
            attempts,
        });
        Some(self.finish(InstructionState::TimedOut, outcome))
    }

    /// Apply a status update reported by the RM
    pub fn on_status_update(&mut self, update: &InstructionStatusUpdate, now: Instant) -> StatusUpdate {
        let execution_deadline = self.execution_deadline;
        let Some(outstanding) = self.outstanding_for(&update.instruction_id) else {
            return if self
                .history
                .iter()
                .any(|r| r.instruction_id == update.instruction_id)
            {
                debug!(
                    "[DISPATCH] Late {:?} for finished instruction {}",
                    update.status_type, update.instruction_id
                );
                StatusUpdate::Unchanged
            } else {
                StatusUpdate::Unknown
            };
        };

        let next = match update.status_type {
            InstructionStatus::New => return StatusUpdate::Unchanged,
            InstructionStatus::Accepted => InstructionState::Accepted,
            InstructionStatus::Started => InstructionState::Started,
            InstructionStatus::Rejected => InstructionState::Rejected,
            InstructionStatus::Succeeded => InstructionState::Succeeded,
            InstructionStatus::Aborted | InstructionStatus::Revoked => InstructionState::Aborted,
        };

        if next.is_terminal() {
            return StatusUpdate::Changed(self.finish(next, Ok(next)));
        }

        if next.progress() <= outstanding.record.status.progress() {
            return StatusUpdate::Unchanged;
        }

        outstanding.record.status = next;
        outstanding.record.updated_at = Utc::now();
        if next == InstructionState::Started {
            outstanding.deadline = now + execution_deadline;
        }
        StatusUpdate::Changed(StatusChange {
            instruction_id: update.instruction_id.clone(),
            status: next,
        })
    }

    /// RM revoked an object; aborts the outstanding instruction if it is the one
    pub fn revoke(&mut self, object_id: &MessageId) -> Option<StatusChange> {
        self.outstanding_for(object_id)?;
        Some(self.finish(InstructionState::Aborted, Ok(InstructionState::Aborted)))
    }

    /// Enforce the execution deadline
    pub fn on_tick(&mut self, now: Instant) -> Option<StatusChange> {
        let expired = self.outstanding.as_ref().is_some_and(|o| o.deadline <= now);
        if !expired {
            return None;
        }
        if let Some(outstanding) = &self.outstanding {
            info!(
                "[DISPATCH] Instruction {} missed its execution deadline (last status {:?})",
                outstanding.record.instruction_id, outstanding.record.status
            );
        }
        Some(self.finish(InstructionState::TimedOut, Ok(InstructionState::TimedOut)))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|o| o.deadline)
    }

    /// Session is ending: fail the waiter and archive the record as is
    pub fn abandon(&mut self) {
        if let Some(mut outstanding) = self.outstanding.take() {
            if let Some(waiter) = outstanding.waiter.take() {
                let _ = waiter.send(Err(DispatchError::SessionEnded(self.session_id.clone())));
            }
            self.push_history(outstanding.record);
        }
    }

    fn finish(&mut self, status: InstructionState, outcome: InstructionOutcome) -> StatusChange {
        let mut change = None;
        if let Some(mut outstanding) = self.outstanding.take() {
            outstanding.record.status = status;
            outstanding.record.updated_at = Utc::now();
            if let Some(waiter) = outstanding.waiter.take() {
                // Issuer may have stopped waiting
                let _ = waiter.send(outcome);
            }
            change = Some(StatusChange {
                instruction_id: outstanding.record.instruction_id.clone(),
                status,
            });
            self.push_history(outstanding.record);
        }
        change.unwrap_or_else(|| StatusChange {
            instruction_id: MessageId::generate(),
            status,
        })
    }

    fn push_history(&mut self, record: InstructionRecord) {
        self.history.push_back(record);
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
    }
}

/// Handle to an instruction issued with [`InstructionDispatcher::issue_tracked`]
pub struct TrackedInstruction {
    session_id: SessionId,
    instruction_id: MessageId,
    outcome: oneshot::Receiver<InstructionOutcome>,
}

impl TrackedInstruction {
    pub(crate) fn new(
        session_id: SessionId,
        instruction_id: MessageId,
        outcome: oneshot::Receiver<InstructionOutcome>,
    ) -> Self {
        Self {
            session_id,
            instruction_id,
            outcome,
        }
    }

    pub fn instruction_id(&self) -> &MessageId {
        &self.instruction_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wait for the terminal status
    ///
    /// Resolves with `Ok(state)` for SUCCEEDED, ABORTED, REJECTED (by status
    /// update) and TIMED_OUT (execution deadline); with `Rejected` or
    /// `DeliveryTimeout` when the instruction message itself failed; with
    /// `SessionEnded` if the session closed first.
    pub async fn outcome(self) -> InstructionOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::SessionEnded(self.session_id)),
        }
    }
}

/// Caller-facing instruction entry point
#[derive(Clone)]
pub struct InstructionDispatcher {
    registry: SessionRegistry,
}

impl InstructionDispatcher {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Issue an instruction to one session
    ///
    /// # Errors
    ///
    /// `UnknownSession`, `SessionNotOperational`, `InstructionInFlight`,
    /// `ControlTypeMismatch`; none of them change the session.
    pub async fn issue(
        &self,
        session_id: &SessionId,
        instruction: Instruction,
    ) -> Result<MessageId, DispatchError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| DispatchError::UnknownSession(session_id.clone()))?;
        handle.issue(instruction).await
    }

    /// Issue an instruction and keep a handle to its final outcome
    pub async fn issue_tracked(
        &self,
        session_id: &SessionId,
        instruction: Instruction,
    ) -> Result<TrackedInstruction, DispatchError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| DispatchError::UnknownSession(session_id.clone()))?;
        handle.issue_tracked(instruction).await
    }

    /// Issue the same instruction to every session matching `predicate`
    pub async fn broadcast<F>(
        &self,
        predicate: F,
        instruction: Instruction,
    ) -> Vec<(SessionId, Result<MessageId, DispatchError>)>
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        self.registry.broadcast_instruction(predicate, instruction).await
    }
}
