// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Store Replication
//!
//! Keeps a secondary store (or a heterogeneous relational store) consistent
//! with a primary data store, using one of two write paths.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            store-replication                              │
//! │                                                                           │
//! │  async mode                                                               │
//! │  ┌─────────┐   ┌────────────────┐   ┌──────────┐   ┌──────────────────┐   │
//! │  │ primary │──►│ AsyncReplicator│──►│ channel  │──►│ Consumer (1/chan)│   │
//! │  │ apply   │   │ (publish)      │   │ (Redis)  │   │ apply + ack/nack │   │
//! │  └─────────┘   └────────────────┘   └──────────┘   └────────┬─────────┘   │
//! │                                                             ▼             │
//! │                                          secondary / <chan>.dead_letter   │
//! │                                                                           │
//! │  mirror mode                                                              │
//! │  ┌───────────────────┐   ┌───────────────┐   ┌─────────┐   ┌───────────┐  │
//! │  │ primary tx: apply │──►│secondary apply│──►│ compare │──►│commit/abort│ │
//! │  └───────────────────┘   └───────────────┘   └─────────┘   └───────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Write Paths
//!
//! 1. **Async (queue-mediated)**: the write lands on the primary, the
//!    [`OperationRecord`] is durably published, and a background consumer
//!    applies it to the secondary with at-least-once delivery.
//! 2. **Mirror (transaction-mirrored)**: the write is applied to both stores
//!    inside the caller's call and committed only if both report the same
//!    [`ApplyOutcome`].
//!
//! Reads always go to the primary.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use store_replication::channel::{dead_letter_name, MemoryChannel};
//! use store_replication::store::MemoryStore;
//! use store_replication::{DeploymentMode, OperationRecord, ReplicationConfig, ReplicationEngine, ReplicationTarget};
//!
//! #[tokio::main]
//! async fn main() -> store_replication::Result<()> {
//!     let target = ReplicationTarget::new(
//!         Arc::new(MemoryStore::new("secondary")),
//!         Arc::new(MemoryChannel::new("db_replication")),
//!         Arc::new(MemoryChannel::new(dead_letter_name("db_replication"))),
//!     );
//!     let mut engine = ReplicationEngine::asynchronous(
//!         ReplicationConfig::default(),
//!         Arc::new(MemoryStore::new("primary")),
//!         vec![target],
//!     )?;
//!     engine.start().await?;
//!
//!     let mut product = serde_json::Map::new();
//!     product.insert("name".into(), "Widget".into());
//!     engine.write(OperationRecord::insert("products", product)).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod metrics;
pub mod mirror;
pub mod record;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use channel::{Delivery, ReplicationChannel};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{DeploymentMode, ReplicationConfig};
pub use coordinator::{EngineState, ReplicationEngine, ReplicationTarget, WriteReceipt};
pub use error::{ApplyError, ReplicationError, Result};
pub use health::{HealthReporter, HealthSnapshot};
pub use mirror::{MirrorEngine, MirrorStage, SecondaryState};
pub use record::{ApplyOutcome, Document, Filter, OperationKind, OperationRecord};
pub use store::{StoreAdapter, StoreTransaction};
