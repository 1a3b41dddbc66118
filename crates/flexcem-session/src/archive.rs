// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Descriptions of resources whose sessions have ended
//!
//! When a resource manager reconnects with the same `resource_id` and the same
//! control type is agreed again, the new session starts OPERATIONAL from the
//! archived description instead of waiting for a fresh one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use flexcem_protocol::ControlType;
use parking_lot::Mutex;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedResource {
    pub control_type: ControlType,
    pub description: Map<String, Value>,
}

#[derive(Debug, Default)]
struct ArchiveInner {
    entries: HashMap<String, ArchivedResource>,
    order: VecDeque<String>,
}

/// Bounded, shared archive keyed by resource id; the oldest entry is evicted first
#[derive(Debug, Clone)]
pub struct DescriptionArchive {
    inner: Arc<Mutex<ArchiveInner>>,
    capacity: usize,
}

impl DescriptionArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ArchiveInner::default())),
            capacity,
        }
    }

    pub fn store(&self, resource_id: &str, resource: ArchivedResource) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.insert(resource_id.to_string(), resource).is_some() {
            inner.order.retain(|id| id != resource_id);
        }
        inner.order.push_back(resource_id.to_string());

        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn lookup(&self, resource_id: &str) -> Option<ArchivedResource> {
        self.inner.lock().entries.get(resource_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
