// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication core.
//!
//! Two layers:
//!
//! - [`ApplyError`]: a single store write failed. Local to one adapter call.
//! - [`ReplicationError`]: what the engines surface to their callers.
//!
//! # Error Categories
//!
//! | Error Type | Write applied? | Retryable | Description |
//! |------------|----------------|-----------|-------------|
//! | `Apply` | No | Depends on source | Primary write failed, nothing happened |
//! | `Publish` | **Yes** | Yes | Primary write stands, replication not queued |
//! | `ReplicationApply` | n/a | Yes | Background consumer failed (never seen by writers) |
//! | `MirrorDivergence` | No | Yes | Mirror write aborted, secondary may be diverged |
//! | `Redis` / `Channel` | No | Yes | Broker unreachable or command failed |
//! | `Codec` | No | No | Record could not be serialized |
//! | `Config` | No | No | Configuration invalid |
//! | `InvalidState` | No | No | Engine state machine violation |
//! | `Shutdown` | No | No | Engine is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! Use [`ReplicationError::write_applied()`] to tell "your write did not happen"
//! apart from "your write happened but replication state is uncertain".

use crate::mirror::{MirrorStage, SecondaryState};
use crate::record::{ApplyOutcome, OperationKind};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// A single store write (or probe) failed.
///
/// Adapters must not leave partial writes behind when returning one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// The store could not be reached or the command failed in transit.
    #[error("connection error ({store}): {message}")]
    Connection { store: String, message: String },

    /// An insert collided with an existing identifier.
    #[error("duplicate key in '{target}': id {id}")]
    DuplicateKey { target: String, id: String },

    /// The record is structurally invalid for this store.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// The record's `kind` tag is outside the closed set.
    #[error("unknown operation kind: '{0}'")]
    UnknownOperationKind(String),

    /// Begin/commit/rollback of a native transaction failed.
    #[error("transaction error ({store}): {message}")]
    Transaction { store: String, message: String },

    /// The store is being protected by an open circuit breaker.
    #[error("store unavailable ({store}): {message}")]
    Unavailable { store: String, message: String },
}

impl ApplyError {
    /// Create a connection error.
    pub fn connection(store: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            store: store.into(),
            message: message.to_string(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(store: impl Into<String>, message: impl ToString) -> Self {
        Self::Transaction {
            store: store.into(),
            message: message.to_string(),
        }
    }

    /// Check if retrying the same record could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Transaction { .. } => true,
            Self::Unavailable { .. } => true,
            Self::DuplicateKey { .. } => false, // Constraint, not transient
            Self::Malformed(_) => false,
            Self::UnknownOperationKind(_) => false,
        }
    }

    /// Check if this is a uniqueness violation on the identifier.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

/// Errors surfaced by the replication engines.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The write failed against a store; nothing was applied.
    #[error("Apply error on {store}: {source}")]
    Apply {
        store: String,
        #[source]
        source: ApplyError,
    },

    /// The primary write succeeded but the record could not be durably queued.
    ///
    /// The primary write is NOT rolled back. `outcome` is what the primary
    /// returned; replication for this write is not guaranteed.
    ///
    /// For a batch, `queued` lists the ids of the records already published
    /// to every channel, in order. Records after them were not queued.
    #[error("Primary write applied but replication to '{channel}' is not queued: {source}")]
    Publish {
        channel: String,
        outcome: ApplyOutcome,
        queued: Vec<serde_json::Value>,
        #[source]
        source: Box<ReplicationError>,
    },

    /// The background consumer failed to apply a dequeued record.
    ///
    /// Never returned to a writer; handled by redelivery inside the consumer.
    #[error("Replication apply error ({channel}): {source}")]
    ReplicationApply {
        channel: String,
        #[source]
        source: ApplyError,
    },

    /// A mirrored write was aborted after the secondary was involved.
    ///
    /// The primary transaction has been rolled back. `secondary` says whether
    /// the secondary was left untouched, compensated, or may be diverged.
    #[error("Mirror divergence at {stage} on '{target}' ({kind}): {detail}; secondary {secondary}")]
    MirrorDivergence {
        stage: MirrorStage,
        target: String,
        kind: OperationKind,
        detail: String,
        secondary: SecondaryState,
    },

    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Broker-agnostic channel failure.
    #[error("Channel error ({channel}): {message}")]
    Channel { channel: String, message: String },

    /// A record could not be serialized.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a store error with the store's name.
    pub fn apply(store: impl Into<String>, source: ApplyError) -> Self {
        Self::Apply {
            store: store.into(),
            source,
        }
    }

    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a channel error.
    pub fn channel(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Apply { source, .. } => source.is_retryable(),
            Self::Publish { .. } => true,
            Self::ReplicationApply { source, .. } => source.is_retryable(),
            Self::MirrorDivergence { .. } => true, // Caller retries the whole write
            Self::Redis { .. } => true,
            Self::Channel { .. } => true,
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Did the caller's write land on the primary?
    ///
    /// Only a publish failure leaves the primary write in place; every other
    /// error means the write did not happen.
    pub fn write_applied(&self) -> bool {
        matches!(self, Self::Publish { .. })
    }

    /// Is the secondary's state uncertain after this error?
    pub fn replication_uncertain(&self) -> bool {
        match self {
            Self::Publish { .. } => true,
            Self::MirrorDivergence { secondary, .. } => *secondary == SecondaryState::Diverged,
            _ => false,
        }
    }

    /// Primary outcome carried by a partial-success error.
    pub fn primary_outcome(&self) -> Option<&ApplyOutcome> {
        match self {
            Self::Publish { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    /// Batch records queued before a publish failure.
    pub fn queued_ids(&self) -> &[serde_json::Value] {
        match self {
            Self::Publish { queued, .. } => queued,
            _ => &[],
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_error_retryable() {
        assert!(ApplyError::connection("primary", "connection reset").is_retryable());
        assert!(ApplyError::transaction("primary", "busy").is_retryable());
        assert!(!ApplyError::Malformed("no target".into()).is_retryable());
        assert!(!ApplyError::UnknownOperationKind("upsert".into()).is_retryable());
        assert!(!ApplyError::DuplicateKey {
            target: "products".into(),
            id: "p1".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_duplicate_key_detection() {
        let err = ApplyError::DuplicateKey {
            target: "products".into(),
            id: "p1".into(),
        };
        assert!(err.is_duplicate_key());
        assert!(err.to_string().contains("p1"));
        assert!(!ApplyError::Malformed("x".into()).is_duplicate_key());
    }

    #[test]
    fn test_unknown_kind_formatting() {
        let err = ApplyError::UnknownOperationKind("replace".into());
        assert!(err.to_string().contains("replace"));
    }

    #[test]
    fn test_publish_error_means_write_applied() {
        let err = ReplicationError::Publish {
            channel: "db_replication".into(),
            outcome: ApplyOutcome::inserted(serde_json::json!("p1")),
            queued: Vec::new(),
            source: Box::new(ReplicationError::redis_msg("XADD", "connection refused")),
        };
        assert!(err.write_applied());
        assert!(err.replication_uncertain());
        assert!(err.is_retryable());
        assert_eq!(
            err.primary_outcome().map(|o| o.inserted_ids.len()),
            Some(1)
        );
        assert!(err.to_string().contains("db_replication"));
        assert!(err.queued_ids().is_empty());
    }

    #[test]
    fn test_apply_error_means_write_not_applied() {
        let err = ReplicationError::apply("primary", ApplyError::Malformed("empty set".into()));
        assert!(!err.write_applied());
        assert!(!err.replication_uncertain());
        assert!(!err.is_retryable());
        assert!(err.primary_outcome().is_none());
    }

    #[test]
    fn test_mirror_divergence_uncertainty_follows_secondary_state() {
        let diverged = ReplicationError::MirrorDivergence {
            stage: MirrorStage::Compared,
            target: "carts".into(),
            kind: OperationKind::Update,
            detail: "results differ".into(),
            secondary: SecondaryState::Diverged,
        };
        assert!(!diverged.write_applied());
        assert!(diverged.replication_uncertain());

        let compensated = ReplicationError::MirrorDivergence {
            stage: MirrorStage::Compared,
            target: "carts".into(),
            kind: OperationKind::Update,
            detail: "results differ".into(),
            secondary: SecondaryState::Compensated,
        };
        assert!(!compensated.replication_uncertain());
        assert!(compensated.to_string().contains("carts"));
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Running".to_string(),
            actual: "Stopped".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Running"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_redis_error_formatting() {
        let err = ReplicationError::Redis {
            operation: "XREADGROUP".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Redis error"));
        assert!(msg.contains("XREADGROUP"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_retryable_shutdown_and_config() {
        assert!(!ReplicationError::Shutdown.is_retryable());
        assert!(!ReplicationError::Config("bad url".into()).is_retryable());
        assert!(!ReplicationError::Codec("bad json".into()).is_retryable());
    }
}
