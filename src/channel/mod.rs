// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication channels.
//!
//! A channel carries serialized [`OperationRecord`](crate::record::OperationRecord)s
//! from the producer to exactly one consumer. Publish is append-only; each
//! message is claimed by one consumer until it is acknowledged (removed) or
//! negatively acknowledged (redelivered).
//!
//! # Channels
//!
//! | Name | Carries |
//! |------|---------|
//! | `db_replication` | primary → document secondary |
//! | `pg_replication` | primary → relational secondary |
//! | `db_sync_status` | [`SyncStatusEvent`]s, never consumed by the core |
//! | `<channel>.dead_letter` | [`DeadLetter`] envelopes for quarantined records |
//!
//! # Implementations
//!
//! - [`memory::MemoryChannel`]: in-process FIFO, durable for the process lifetime
//! - [`redis::RedisChannel`]: Redis Streams consumer group

pub mod memory;
pub mod redis;

pub use self::memory::MemoryChannel;
pub use self::redis::RedisChannel;

use crate::error::Result;
use crate::record::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Suffix appended to a channel name to form its dead-letter channel.
pub const DEAD_LETTER_SUFFIX: &str = ".dead_letter";

/// Boxed future returned by channel operations.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Name of the dead-letter channel for `channel`.
pub fn dead_letter_name(channel: &str) -> String {
    format!("{}{}", channel, DEAD_LETTER_SUFFIX)
}

/// One claimed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub id: String,
    /// Serialized record.
    pub payload: Vec<u8>,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: u32,
    /// Set when the broker rejected the payload (e.g. digest mismatch).
    pub defect: Option<String>,
}

impl Delivery {
    /// A clean first delivery.
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload,
            delivery_count: 1,
            defect: None,
        }
    }
}

/// A durable, single-consumer message channel.
pub trait ReplicationChannel: Send + Sync + 'static {
    /// Channel name (used in logs, metrics and errors).
    fn name(&self) -> &str;

    /// Make sure the channel exists. Also makes previously claimed but
    /// unacknowledged messages deliverable again.
    fn declare(&self) -> ChannelFuture<'_, ()>;

    /// Durably append a payload. Returns the message id.
    fn publish<'a>(&'a self, payload: &'a [u8]) -> ChannelFuture<'a, String>;

    /// Claim the next message, waiting up to `block`. `None` on timeout.
    fn receive(&self, block: Duration) -> ChannelFuture<'_, Option<Delivery>>;

    /// Permanently remove a claimed message.
    fn ack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()>;

    /// Return a claimed message for redelivery, ahead of newer messages.
    fn nack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()>;

    /// Count of not-yet-acknowledged messages.
    fn depth(&self) -> ChannelFuture<'_, u64>;

    /// Age of the oldest not-yet-acknowledged message.
    fn oldest_pending_age(&self) -> ChannelFuture<'_, Option<Duration>>;
}

/// Envelope published to a dead-letter channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Channel the record was consumed from.
    pub channel: String,
    /// Message id on that channel.
    pub message_id: String,
    /// Short machine-readable reason (`max_deliveries`, `undecodable`, ...).
    pub reason: String,
    /// Last error seen.
    pub error: String,
    pub delivery_count: u32,
    /// Original payload bytes, hex-encoded on the wire.
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub quarantined_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Build an envelope for a delivery.
    pub fn new(channel: &str, delivery: &Delivery, reason: &str, error: impl ToString) -> Self {
        Self {
            channel: channel.to_string(),
            message_id: delivery.id.clone(),
            reason: reason.to_string(),
            error: error.to_string(),
            delivery_count: delivery.delivery_count,
            payload: delivery.payload.clone(),
            quarantined_at: Utc::now(),
        }
    }
}

/// Status of one consumed record, published to the sync-status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Applied,
    AlreadyApplied,
    Quarantined,
}

/// Informational event on the sync-status channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusEvent {
    pub channel: String,
    pub message_id: String,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<OperationKind>,
    pub at: DateTime<Utc>,
}
