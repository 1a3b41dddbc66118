// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! At-least-once delivery of outbound messages, at-most-once processing of
//! inbound ones.
//!
//! The tracker never sleeps and never reads the clock: callers pass `now` and
//! use [`ReliabilityTracker::next_deadline`] to decide when to call
//! [`ReliabilityTracker::poll`] again. This keeps every bookkeeping step inside
//! the owning session task.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use flexcem_protocol::{ControlType, MessageId, ReceptionStatusValue};
use tokio::time::Instant;

/// What an outbound message was sent for; returned when its fate is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Handshake,
    ControlTypeSelection(ControlType),
    /// Carries the instruction id (not the message id)
    Instruction(MessageId),
    Other,
}

#[derive(Debug)]
struct PendingOutbound {
    frame: Vec<u8>,
    origin: Origin,
    sent_at: Instant,
    next_attempt_at: Instant,
    attempt_count: u32,
    order: u64,
}

#[derive(Debug, Clone, Copy)]
struct SeenInbound {
    received_at: Instant,
    status: ReceptionStatusValue,
}

/// Result of a reception status matching a pending message
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub origin: Origin,
    pub status: ReceptionStatusValue,
    pub attempts: u32,
}

/// Message that exhausted its attempts without a reception status
#[derive(Debug, Clone, PartialEq)]
pub struct Expired {
    pub message_id: MessageId,
    pub origin: Origin,
    pub attempts: u32,
}

/// Work produced by [`ReliabilityTracker::poll`]
#[derive(Debug, Default)]
pub struct RetryWork {
    /// Frames to write again, oldest first
    pub resend: Vec<Vec<u8>>,
    pub expired: Vec<Expired>,
}

#[derive(Debug)]
pub struct ReliabilityTracker {
    retry_interval: Duration,
    max_attempts: u32,
    retention_window: Duration,
    max_seen: usize,
    pending: HashMap<MessageId, PendingOutbound>,
    next_order: u64,
    seen: HashMap<MessageId, SeenInbound>,
    seen_order: VecDeque<(MessageId, Instant)>,
}

impl ReliabilityTracker {
    pub fn new(
        retry_interval: Duration,
        max_attempts: u32,
        retention_window: Duration,
        max_seen: usize,
    ) -> Self {
        Self {
            retry_interval,
            max_attempts: max_attempts.max(1),
            retention_window,
            max_seen: max_seen.max(1),
            pending: HashMap::new(),
            next_order: 0,
            seen: HashMap::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Record a message that has just been written for the first time
    pub fn track(&mut self, message_id: MessageId, frame: Vec<u8>, origin: Origin, now: Instant) {
        let order = self.next_order;
        self.next_order += 1;
        self.pending.insert(
            message_id,
            PendingOutbound {
                frame,
                origin,
                sent_at: now,
                next_attempt_at: now + self.retry_interval,
                attempt_count: 1,
                order,
            },
        );
    }

    /// Status an inbound id was answered with, if it is still within the retention window
    ///
    /// `Some` means the message is a duplicate and must not be processed again.
    pub fn seen_status(&self, message_id: &MessageId, now: Instant) -> Option<ReceptionStatusValue> {
        self.seen.get(message_id).and_then(|entry| {
            (now.saturating_duration_since(entry.received_at) <= self.retention_window)
                .then_some(entry.status)
        })
    }

    /// Remember the status an inbound message was answered with
    pub fn record_inbound(&mut self, message_id: MessageId, status: ReceptionStatusValue, now: Instant) {
        let entry = SeenInbound {
            received_at: now,
            status,
        };
        if self.seen.insert(message_id.clone(), entry).is_some() {
            self.seen_order.retain(|(seen_id, _)| seen_id != &message_id);
        }
        self.seen_order.push_back((message_id, now));
        self.prune_seen(now);
    }

    /// Match a reception status against the pending set
    ///
    /// Returns `None` for unknown or already settled subjects (late acks of a
    /// resent message, acks for messages we never tracked).
    pub fn on_reception_status(
        &mut self,
        subject_id: &MessageId,
        status: ReceptionStatusValue,
    ) -> Option<Delivery> {
        self.pending.remove(subject_id).map(|pending| Delivery {
            message_id: subject_id.clone(),
            origin: pending.origin,
            status,
            attempts: pending.attempt_count,
        })
    }

    /// Resend due messages and expire the ones out of attempts
    pub fn poll(&mut self, now: Instant) -> RetryWork {
        let mut due: Vec<(u64, MessageId)> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.next_attempt_at <= now)
            .map(|(id, pending)| (pending.order, id.clone()))
            .collect();
        due.sort_unstable_by_key(|(order, _)| *order);

        let mut work = RetryWork::default();
        for (_, message_id) in due {
            let exhausted = self
                .pending
                .get(&message_id)
                .is_some_and(|pending| pending.attempt_count >= self.max_attempts);

            if exhausted {
                if let Some(pending) = self.pending.remove(&message_id) {
                    work.expired.push(Expired {
                        message_id,
                        origin: pending.origin,
                        attempts: pending.attempt_count,
                    });
                }
            } else if let Some(pending) = self.pending.get_mut(&message_id) {
                pending.attempt_count += 1;
                pending.next_attempt_at = now + self.retry_interval;
                work.resend.push(pending.frame.clone());
            }
        }

        self.prune_seen(now);
        work
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.next_attempt_at).min()
    }

    /// Drop every pending message with the given origin, returning their ids
    pub fn cancel_origin(&mut self, origin: &Origin) -> Vec<MessageId> {
        let ids: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, pending)| &pending.origin == origin)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids
    }

    /// Drop every pending message (session teardown)
    pub fn cancel_all(&mut self) -> Vec<(MessageId, Origin)> {
        let mut drained: Vec<(u64, MessageId, Origin)> = self
            .pending
            .drain()
            .map(|(id, pending)| (pending.order, id, pending.origin))
            .collect();
        drained.sort_unstable_by_key(|(order, _, _)| *order);
        drained.into_iter().map(|(_, id, origin)| (id, origin)).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.pending.contains_key(message_id)
    }

    /// Attempts made so far for a pending message
    pub fn attempts(&self, message_id: &MessageId) -> Option<u32> {
        self.pending.get(message_id).map(|p| p.attempt_count)
    }

    /// Age of the oldest pending message
    pub fn oldest_pending_age(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|p| now.saturating_duration_since(p.sent_at))
            .max()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Evict inbound ids older than the retention window, then the oldest
    /// ones beyond the size bound
    pub fn prune_seen(&mut self, now: Instant) {
        while let Some((id, received_at)) = self.seen_order.front() {
            let too_old = now.saturating_duration_since(*received_at) > self.retention_window;
            let too_many = self.seen.len() > self.max_seen;
            if !too_old && !too_many {
                break;
            }
            let id = id.clone();
            self.seen_order.pop_front();
            self.seen.remove(&id);
        }
    }
}
