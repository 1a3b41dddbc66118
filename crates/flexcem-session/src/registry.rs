// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Session registry
//!
//! Owns the set of live sessions. Each accepted connection gets its own
//! session task; the registry only keeps a handle to it and removes the entry
//! when the task reports that the session has closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flexcem_config::FlexcemConfig;
use flexcem_protocol::{ControlType, MessageId};
use flexcem_transports::{Connection, Listener};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::archive::DescriptionArchive;
use crate::dispatcher::{Instruction, InstructionDispatcher};
use crate::error::{DispatchError, EngineError, Result};
use crate::events::{EndReason, EngineEvent};
use crate::session::actor::SessionActor;
use crate::session::{SessionHandle, SessionId, SessionMachine, SessionSnapshot};
use crate::settings::EngineSettings;

struct SessionEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

struct RegistryInner {
    settings: Arc<EngineSettings>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    events: broadcast::Sender<EngineEvent>,
    archive: DescriptionArchive,
    shutting_down: AtomicBool,
    shutdown_signal: watch::Sender<bool>,
}

/// Registry of live sessions
///
/// Cheap to clone; clones share the same session set.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(settings: EngineSettings) -> Self {
        info!(
            "[REGISTRY] Initializing session registry (retry={:?} x {}, violation threshold={})",
            settings.retry_interval, settings.max_attempts, settings.protocol_violation_threshold
        );
        let (events, _) = broadcast::channel(settings.event_channel_capacity);
        let (shutdown_signal, _) = watch::channel(false);
        let archive = DescriptionArchive::new(settings.rehydration_archive_size);

        Self {
            inner: Arc::new(RegistryInner {
                settings: Arc::new(settings),
                sessions: RwLock::new(HashMap::new()),
                events,
                archive,
                shutting_down: AtomicBool::new(false),
                shutdown_signal,
            }),
        }
    }

    /// Build a registry from loaded configuration
    pub fn from_config(config: &FlexcemConfig) -> Result<Self> {
        Ok(Self::new(EngineSettings::from_config(config)?))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Start a session on an established connection
    ///
    /// # Arguments
    /// * `connection` - Transport connection; the session task takes ownership
    ///
    /// # Errors
    /// `ShuttingDown` once [`shutdown`](Self::shutdown) has started; the
    /// connection is closed in that case.
    pub fn accept(&self, mut connection: Box<dyn Connection>) -> Result<SessionHandle> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            warn!("[REGISTRY] Refusing {} during shutdown", connection.peer());
            tokio::spawn(async move {
                let _ = connection.close().await;
            });
            return Err(EngineError::ShuttingDown);
        }

        let session_id = SessionId::generate();
        let peer = connection.peer();
        let settings = Arc::clone(&self.inner.settings);
        let archive = settings
            .rehydrate_returning_resources
            .then(|| self.inner.archive.clone());
        let machine = SessionMachine::new(
            session_id.clone(),
            peer.clone(),
            Arc::clone(&settings),
            archive,
            Instant::now(),
        );

        let registry = Arc::downgrade(&self.inner);
        let (actor, handle) = SessionActor::new(
            machine,
            connection,
            self.inner.events.clone(),
            settings.command_queue_capacity,
            settings.shutdown_grace_period,
            Box::new(move |id: &SessionId| deregister(&registry, id)),
        );

        // Insert under the lock so a session that ends immediately cannot
        // deregister before it is registered
        let mut sessions = self.inner.sessions.write();
        let task = tokio::spawn(actor.run());
        sessions.insert(
            session_id.clone(),
            SessionEntry {
                handle: handle.clone(),
                task,
            },
        );
        info!(
            "[REGISTRY] ✓ Session {} accepted from {} (total sessions: {})",
            session_id,
            peer,
            sessions.len()
        );
        Ok(handle)
    }

    /// Accept connections from `listener` until it fails or shutdown starts
    pub fn serve<L>(&self, mut listener: L) -> JoinHandle<()>
    where
        L: Listener + 'static,
    {
        let registry = self.clone();
        let mut shutdown = self.inner.shutdown_signal.subscribe();

        tokio::spawn(async move {
            info!("[REGISTRY] Serving sessions on {}", listener.local_description());
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(connection) => {
                            if let Err(err) = registry.accept(connection) {
                                debug!("[REGISTRY] Connection not accepted: {}", err);
                            }
                        }
                        Err(err) if err.is_fatal_for_listener() => {
                            error!("[REGISTRY] Listener failed: {}", err);
                            break;
                        }
                        Err(err) => warn!("[REGISTRY] Accept failed: {}", err),
                    },
                    _ = shutdown.changed() => {}
                }
            }
            info!("[REGISTRY] Stopped serving on {}", listener.local_description());
        })
    }

    /// Snapshots of sessions that are not closing, ordered by session id
    pub fn list_active_sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|entry| entry.handle.snapshot())
            .filter(|snapshot| !snapshot.state.is_ending())
            .collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|entry| entry.handle.clone())
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.get(session_id).map(|handle| handle.snapshot())
    }

    pub fn active_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Close a session and wait until it has ended
    ///
    /// Idempotent: returns `false` when no such session is registered.
    pub async fn close(&self, session_id: &SessionId) -> bool {
        let Some(handle) = self.get(session_id) else {
            return false;
        };
        handle.request_close(EndReason::ClosedByEngine);
        handle.closed().await;
        true
    }

    /// Switch a session to another advertised control type
    pub async fn renegotiate(&self, session_id: &SessionId, control_type: ControlType) -> Result<()> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.clone()))?;
        handle.renegotiate(control_type).await
    }

    /// Issue `instruction` to every session whose snapshot matches `predicate`
    ///
    /// Sessions are addressed concurrently; each gets its own result.
    pub async fn broadcast_instruction<F>(
        &self,
        predicate: F,
        instruction: Instruction,
    ) -> Vec<(SessionId, std::result::Result<MessageId, DispatchError>)>
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let targets: Vec<SessionHandle> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|entry| predicate(&entry.handle.snapshot()))
            .map(|entry| entry.handle.clone())
            .collect();

        debug!("[REGISTRY] Broadcasting instruction to {} sessions", targets.len());
        join_all(targets.into_iter().map(|handle| {
            let instruction = instruction.clone();
            async move {
                let result = handle.issue(instruction).await;
                (handle.id().clone(), result)
            }
        }))
        .await
    }

    /// Lifecycle and domain events from every session
    ///
    /// Delivery is best effort: a subscriber that falls more than
    /// `event_channel_capacity` events behind gets `RecvError::Lagged` and
    /// the skipped events are gone, `SessionEnded` included. To learn reliably
    /// that a session finished, await [`SessionHandle::closed`] and read
    /// `end_reason` from its final snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn dispatcher(&self) -> InstructionDispatcher {
        InstructionDispatcher::new(self.clone())
    }

    /// Descriptions kept for returning resources
    pub fn archive(&self) -> &DescriptionArchive {
        &self.inner.archive
    }

    /// Close every session and stop accepting new ones
    ///
    /// Sessions drain pending acknowledgments for at most the configured
    /// shutdown grace period; tasks still running after `grace` are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_signal.send_replace(true);

        let entries: Vec<SessionEntry> = self
            .inner
            .sessions
            .write()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        info!("[REGISTRY] Shutting down {} sessions", entries.len());

        let mut aborts = Vec::with_capacity(entries.len());
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            entry.handle.request_close(EndReason::Shutdown);
            aborts.push(entry.task.abort_handle());
            tasks.push(entry.task);
        }

        if tokio::time::timeout(grace, join_all(tasks)).await.is_err() {
            let stragglers = aborts.iter().filter(|abort| !abort.is_finished()).count();
            warn!("[REGISTRY] Aborting {} sessions after grace period", stragglers);
            for abort in aborts {
                abort.abort();
            }
        }
        info!("[REGISTRY] Shutdown complete");
    }
}

fn deregister(registry: &Weak<RegistryInner>, session_id: &SessionId) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let mut sessions = inner.sessions.write();
    if sessions.remove(session_id).is_some() {
        info!(
            "[REGISTRY] ✓ Session {} removed (total sessions: {})",
            session_id,
            sessions.len()
        );
    }
}
