// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fault-injecting wrappers around the in-process store and channel.
//!
//! # Example
//! ```rust,ignore
//! let store = Arc::new(FaultyStore::new("secondary"));
//! store.fail_next(2);
//!
//! // First two applies fail with a connection error, then succeed
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use store_replication::channel::{ChannelFuture, Delivery, MemoryChannel, ReplicationChannel};
use store_replication::error::{ApplyError, ReplicationError};
use store_replication::record::{ApplyOutcome, Document, Filter, OperationRecord};
use store_replication::store::{BoxFuture, MemoryStore, StoreAdapter, StoreTransaction};

/// A [`MemoryStore`] whose applies can be made to fail.
pub struct FaultyStore {
    inner: MemoryStore,
    fail_next: AtomicUsize,
    reject_all: AtomicBool,
    applies: AtomicUsize,
}

impl FaultyStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryStore::new(name),
            fail_next: AtomicUsize::new(0),
            reject_all: AtomicBool::new(false),
            applies: AtomicUsize::new(0),
        }
    }

    /// Shared handle to the underlying store, for assertions.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail the next `n` applies with a transient connection error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject every apply with a permanent error until cleared.
    pub fn reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Number of apply attempts, failed ones included.
    pub fn apply_attempts(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn injected_fault(&self) -> Option<ApplyError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if self.reject_all.load(Ordering::SeqCst) {
            return Some(ApplyError::Malformed("injected permanent failure".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        consumed.then(|| ApplyError::connection(self.inner.name(), "injected transient failure"))
    }
}

impl StoreAdapter for FaultyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn apply<'a>(&'a self, record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            if let Some(e) = self.injected_fault() {
                return Err(e);
            }
            self.inner.apply(record).await
        })
    }

    fn begin(&self) -> BoxFuture<'_, Box<dyn StoreTransaction>> {
        self.inner.begin()
    }

    fn find<'a>(&'a self, target: &'a str, filter: &'a Filter) -> BoxFuture<'a, Vec<Document>> {
        self.inner.find(target, filter)
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        self.inner.ping()
    }
}

/// A [`MemoryChannel`] whose publishes can be made to fail.
pub struct FlakyChannel {
    inner: MemoryChannel,
    pass_publishes: AtomicUsize,
    fail_publishes: AtomicUsize,
}

impl FlakyChannel {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryChannel::new(name),
            pass_publishes: AtomicUsize::new(0),
            fail_publishes: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryChannel {
        &self.inner
    }

    /// Fail the next `n` publishes.
    pub fn fail_publishes(&self, n: usize) {
        self.fail_publishes_after(0, n);
    }

    /// Let `ok` publishes through, then fail the `n` after them.
    pub fn fail_publishes_after(&self, ok: usize, n: usize) {
        self.pass_publishes.store(ok, Ordering::SeqCst);
        self.fail_publishes.store(n, Ordering::SeqCst);
    }
}

impl ReplicationChannel for FlakyChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn declare(&self) -> ChannelFuture<'_, ()> {
        self.inner.declare()
    }

    fn publish<'a>(&'a self, payload: &'a [u8]) -> ChannelFuture<'a, String> {
        Box::pin(async move {
            let passed = self
                .pass_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let injected = !passed
                && self
                    .fail_publishes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if injected {
                return Err(ReplicationError::channel(self.inner.name(), "injected publish failure"));
            }
            self.inner.publish(payload).await
        })
    }

    fn receive(&self, block: Duration) -> ChannelFuture<'_, Option<Delivery>> {
        self.inner.receive(block)
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()> {
        self.inner.ack(delivery)
    }

    fn nack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()> {
        self.inner.nack(delivery)
    }

    fn depth(&self) -> ChannelFuture<'_, u64> {
        self.inner.depth()
    }

    fn oldest_pending_age(&self) -> ChannelFuture<'_, Option<Duration>> {
        self.inner.oldest_pending_age()
    }
}
