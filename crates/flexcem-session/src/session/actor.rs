// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Session task: one tokio task owns one [`SessionMachine`] and its connection.
//!
//! Inbound frames, caller commands and timers are handled one at a time in the
//! task loop, so the machine needs no locking and outbound frames are written
//! in the order the machine produced them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use flexcem_protocol::{ControlType, MessageId};
use flexcem_transports::Connection;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::dispatcher::{Instruction, InstructionOutcome, TrackedInstruction};
use crate::error::{DispatchError, EngineError};
use crate::events::{EndReason, EngineEvent, EngineEventKind};
use crate::session::machine::{SessionAction, SessionMachine};
use crate::session::{SessionId, SessionSnapshot, SessionState};

/// Sleep target when the machine has no timer armed
const IDLE_WAKEUP: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) enum SessionCommand {
    Issue {
        instruction: Instruction,
        waiter: Option<oneshot::Sender<InstructionOutcome>>,
        reply: oneshot::Sender<Result<MessageId, DispatchError>>,
    },
    Renegotiate {
        control_type: ControlType,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::Sender<SessionCommand>,
    close_requests: Arc<watch::Sender<Option<EndReason>>>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Issue an instruction, returning its id once it has been queued for sending
    pub async fn issue(&self, instruction: Instruction) -> Result<MessageId, DispatchError> {
        self.submit(instruction, None).await
    }

    /// Issue an instruction and keep a handle to its terminal status
    pub async fn issue_tracked(
        &self,
        instruction: Instruction,
    ) -> Result<TrackedInstruction, DispatchError> {
        let (waiter, outcome) = oneshot::channel();
        let instruction_id = self.submit(instruction, Some(waiter)).await?;
        Ok(TrackedInstruction::new(self.id.clone(), instruction_id, outcome))
    }

    async fn submit(
        &self,
        instruction: Instruction,
        waiter: Option<oneshot::Sender<InstructionOutcome>>,
    ) -> Result<MessageId, DispatchError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Issue {
                instruction,
                waiter,
                reply,
            })
            .await
            .map_err(|_| DispatchError::SessionEnded(self.id.clone()))?;
        response
            .await
            .map_err(|_| DispatchError::SessionEnded(self.id.clone()))?
    }

    /// Switch to another advertised control type
    pub async fn renegotiate(&self, control_type: ControlType) -> Result<(), EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Renegotiate {
                control_type,
                reply,
            })
            .await
            .map_err(|_| EngineError::SessionEnded(self.id.clone()))?;
        response
            .await
            .map_err(|_| EngineError::SessionEnded(self.id.clone()))?
    }

    /// Ask the session to close; only the first request's reason is kept
    pub fn request_close(&self, reason: EndReason) {
        self.close_requests.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Wait until the session reaches `state`; `false` if it closed first
    pub async fn wait_for_state(&self, state: SessionState) -> bool {
        let mut snapshot = self.snapshot.clone();
        let reached = match snapshot
            .wait_for(|s| s.state == state || s.state == SessionState::Closed)
            .await
        {
            Ok(current) => current.state == state,
            // Task is gone, which only happens after CLOSED was published
            Err(_) => state == SessionState::Closed,
        };
        reached
    }

    /// Resolves once the session has reached CLOSED
    ///
    /// Unlike the event stream this cannot miss the transition; the snapshot
    /// read afterwards carries the `end_reason`.
    pub async fn closed(&self) {
        self.wait_for_state(SessionState::Closed).await;
    }
}

/// Called once when the session reaches CLOSED, before `SessionEnded` is published
pub(crate) type ExitHook = Box<dyn FnOnce(&SessionId) + Send>;

pub(crate) struct SessionActor {
    machine: SessionMachine,
    connection: Box<dyn Connection>,
    commands: mpsc::Receiver<SessionCommand>,
    close_requests: watch::Receiver<Option<EndReason>>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<EngineEvent>,
    drain_period: Duration,
    transport_failed: bool,
    on_exit: Option<ExitHook>,
}

impl SessionActor {
    pub(crate) fn new(
        machine: SessionMachine,
        connection: Box<dyn Connection>,
        events: broadcast::Sender<EngineEvent>,
        command_capacity: usize,
        drain_period: Duration,
        on_exit: ExitHook,
    ) -> (Self, SessionHandle) {
        let (command_tx, commands) = mpsc::channel(command_capacity.max(1));
        let (close_tx, close_requests) = watch::channel(None);
        let (snapshot, snapshot_rx) = watch::channel(machine.snapshot());

        let handle = SessionHandle {
            id: machine.id().clone(),
            commands: command_tx,
            close_requests: Arc::new(close_tx),
            snapshot: snapshot_rx,
        };
        let actor = Self {
            machine,
            connection,
            commands,
            close_requests,
            snapshot,
            events,
            drain_period,
            transport_failed: false,
            on_exit: Some(on_exit),
        };
        (actor, handle)
    }

    pub(crate) async fn run(mut self) {
        let actions = self.machine.start(Instant::now());
        let mut closing = self.apply(actions).await;

        while closing.is_none() {
            let wake = self
                .machine
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

            let actions = tokio::select! {
                frame = self.connection.receive() => match frame {
                    Some(frame) => self.machine.handle_frame(&frame, Instant::now()),
                    None => {
                        debug!(session_id = %self.machine.id(), "[SESSION] Transport closed by peer");
                        self.machine.begin_close(EndReason::TransportClosed)
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.machine.begin_close(EndReason::ClosedByEngine),
                },
                changed = self.close_requests.changed() => {
                    let requested = *self.close_requests.borrow_and_update();
                    match (changed, requested) {
                        (Ok(()), Some(reason)) => self.machine.begin_close(reason),
                        (Ok(()), None) => Vec::new(),
                        // Every handle is gone
                        (Err(_), _) => self.machine.begin_close(EndReason::ClosedByEngine),
                    }
                },
                _ = sleep_until(wake) => self.machine.tick(Instant::now()),
            };
            closing = self.apply(actions).await;
        }

        let reason = closing.unwrap_or(EndReason::ClosedByEngine);
        if reason == EndReason::Shutdown {
            self.drain().await;
        }
        self.finish(reason).await;
    }

    fn on_command(&mut self, command: SessionCommand) -> Vec<SessionAction> {
        match command {
            SessionCommand::Issue {
                instruction,
                waiter,
                reply,
            } => match self
                .machine
                .issue_instruction(instruction, waiter, Instant::now())
            {
                Ok((instruction_id, actions)) => {
                    let _ = reply.send(Ok(instruction_id));
                    actions
                }
                Err(err) => {
                    debug!(session_id = %self.machine.id(), "[SESSION] Instruction refused: {}", err);
                    let _ = reply.send(Err(err));
                    Vec::new()
                }
            },
            SessionCommand::Renegotiate {
                control_type,
                reply,
            } => match self.machine.renegotiate(control_type, Instant::now()) {
                Ok(actions) => {
                    let _ = reply.send(Ok(()));
                    actions
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                    Vec::new()
                }
            },
        }
    }

    /// Execute actions in order; returns the close reason if the session entered CLOSING
    async fn apply(&mut self, actions: Vec<SessionAction>) -> Option<EndReason> {
        let mut queue: VecDeque<SessionAction> = actions.into();
        let mut closing = None;

        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Send(frame) => {
                    if self.transport_failed {
                        continue;
                    }
                    if let Err(err) = self.connection.send(frame).await {
                        warn!(session_id = %self.machine.id(), "[SESSION] Send failed: {}", err);
                        self.transport_failed = true;
                        queue.extend(self.machine.begin_close(EndReason::TransportClosed));
                    }
                }
                SessionAction::Emit(kind) => self.emit(kind),
                SessionAction::Close(reason) => closing = Some(reason),
            }
        }

        self.publish_snapshot();
        closing
    }

    /// Keep handling acknowledgments until nothing is pending or the drain period ends
    async fn drain(&mut self) {
        let give_up = Instant::now() + self.drain_period;

        while self.machine.has_pending_outbound() && !self.transport_failed {
            let wake = self
                .machine
                .next_deadline()
                .map_or(give_up, |deadline| deadline.min(give_up));

            let actions = tokio::select! {
                frame = self.connection.receive() => match frame {
                    Some(frame) => self.machine.handle_frame(&frame, Instant::now()),
                    None => break,
                },
                _ = sleep_until(wake) => {
                    let now = Instant::now();
                    if now >= give_up {
                        debug!(session_id = %self.machine.id(), "[SESSION] Drain period over");
                        break;
                    }
                    self.machine.tick(now)
                },
            };
            self.apply(actions).await;
        }
    }

    async fn finish(&mut self, reason: EndReason) {
        let actions = self.machine.finish(reason);
        self.publish_snapshot();

        if let Some(on_exit) = self.on_exit.take() {
            on_exit(self.machine.id());
        }
        for action in actions {
            if let SessionAction::Emit(kind) = action {
                self.emit(kind);
            }
        }

        self.commands.close();
        if let Err(err) = self.connection.close().await {
            debug!(session_id = %self.machine.id(), "[SESSION] Close failed: {}", err);
        }
    }

    fn emit(&self, kind: EngineEventKind) {
        debug!(session_id = %self.machine.id(), "[SESSION] Event {}", kind.name());
        // No subscribers is fine
        let _ = self.events.send(EngineEvent {
            session_id: self.machine.id().clone(),
            kind,
        });
    }

    fn publish_snapshot(&self) {
        let snapshot = self.machine.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
