// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and write types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!                                  │
//!                    (channels     │  (declare failed)
//!                     declared)    │─────────────────→ Failed
//!                                  ↓
//!                              Running
//!                                  │
//!                        shutdown()│
//!                                  ↓
//!                           ShuttingDown ──→ Stopped
//! ```
//!
//! Writes are accepted only in `Running`.

use crate::channel::ReplicationChannel;
use crate::record::{ApplyOutcome, OperationRecord};
use crate::store::StoreAdapter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to accept writes.
    Created,

    /// Declaring channels and spawning consumers.
    Starting,

    /// Accepting writes. Consumers (async mode) are applying records.
    Running,

    /// `shutdown()` called. Consumers are finishing their in-flight message.
    ShuttingDown,

    /// Shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start. Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// What a successful write did.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    /// The record as applied, identifiers pinned.
    pub record: OperationRecord,
    /// Primary store result.
    pub outcome: ApplyOutcome,
    /// Message ids per replication channel (async mode only).
    pub published: Vec<(String, String)>,
}

/// A secondary store fed by one replication channel.
#[derive(Clone)]
pub struct ReplicationTarget {
    pub store: Arc<dyn StoreAdapter>,
    pub channel: Arc<dyn ReplicationChannel>,
    /// Where records that cannot be applied are quarantined.
    pub dead_letter: Arc<dyn ReplicationChannel>,
}

impl ReplicationTarget {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        channel: Arc<dyn ReplicationChannel>,
        dead_letter: Arc<dyn ReplicationChannel>,
    ) -> Self {
        Self {
            store,
            channel,
            dead_letter,
        }
    }
}

impl std::fmt::Debug for ReplicationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationTarget")
            .field("store", &self.store.name())
            .field("channel", &self.channel.name())
            .field("dead_letter", &self.dead_letter.name())
            .finish()
    }
}

/// Per-consumer counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    applied: AtomicU64,
    already_applied: AtomicU64,
    redelivered: AtomicU64,
    quarantined: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerCounts {
    pub applied: u64,
    pub already_applied: u64,
    pub redelivered: u64,
    pub quarantined: u64,
}

impl ConsumerStats {
    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_already_applied(&self) {
        self.already_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_quarantined(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn quarantined(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConsumerCounts {
        ConsumerCounts {
            applied: self.applied.load(Ordering::Relaxed),
            already_applied: self.already_applied.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            quarantined: self.quarantined(),
        }
    }
}
