// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The entry point that ties together:
//! - The primary write path via [`AsyncReplicator`] or [`MirrorEngine`]
//! - One background [`Consumer`] per replication target (async mode)
//! - On-demand health via [`HealthReporter`]
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────── async ────────────┐
//! write() ──→ primary ──→ publish ──→ channel ──→ consumer ──→ secondary
//!    │
//!    └──────────── mirror ──→ primary tx + secondary apply ──→ compare ──→ commit/abort
//! ```
//!
//! Reads always go to the primary. Writes are accepted only while the
//! engine is `Running`; see [`EngineState`] for the lifecycle.

mod consumer;
mod producer;
mod types;

pub use consumer::{Consumer, DeliveryOutcome};
pub use producer::AsyncReplicator;
pub use types::{ConsumerCounts, ConsumerStats, EngineState, ReplicationTarget, WriteReceipt};

use crate::channel::ReplicationChannel;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{DeploymentMode, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::health::{HealthReporter, HealthSnapshot};
use crate::metrics;
use crate::mirror::MirrorEngine;
use crate::record::{Document, Filter, OperationRecord};
use crate::resilience::RateLimiter;
use crate::store::StoreAdapter;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Write path selected by the deployment mode.
enum Strategy {
    Async {
        replicator: AsyncReplicator,
        targets: Vec<ReplicationTarget>,
    },
    Mirror(MirrorEngine),
}

/// The replication engine.
///
/// Built with [`asynchronous()`](Self::asynchronous) or
/// [`mirrored()`](Self::mirrored) from already-connected store and channel
/// handles. The engine starts in `Created`; call [`start()`](Self::start)
/// before writing.
pub struct ReplicationEngine {
    config: ReplicationConfig,

    strategy: Strategy,

    /// Consumers waiting to be spawned by `start()`.
    pending_consumers: Vec<Consumer>,

    /// Per-channel consumer counters, kept after spawn.
    stats: Vec<(String, Arc<ConsumerStats>)>,

    /// Informational status channel, declared at start.
    sync_status: Option<Arc<dyn ReplicationChannel>>,

    health: HealthReporter,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Consumer task handles
    handles: Vec<JoinHandle<()>>,
}

impl ReplicationEngine {
    /// Queue-mediated engine: primary write, durable publish, background apply.
    ///
    /// Each target gets its own consumer and secondary circuit breaker.
    pub fn asynchronous(
        config: ReplicationConfig,
        primary: Arc<dyn StoreAdapter>,
        targets: Vec<ReplicationTarget>,
    ) -> Result<Self> {
        config.validate()?;
        if config.mode != DeploymentMode::Async {
            return Err(ReplicationError::Config(format!(
                "asynchronous engine needs mode 'async', config says '{}'",
                config.mode
            )));
        }
        if targets.is_empty() {
            return Err(ReplicationError::Config(
                "asynchronous engine needs at least one replication target".to_string(),
            ));
        }

        let retry = config.consumer.retry_config();
        let block_timeout = config.consumer.block_timeout_duration();
        let rate_limiter = config
            .consumer
            .rate_limit_config()
            .map(|c| Arc::new(RateLimiter::new(c)));

        let mut health = HealthReporter::new(config.mode, config.health.probe_timeout_duration())
            .with_store(Arc::clone(&primary));
        let mut consumers = Vec::with_capacity(targets.len());
        let mut stats = Vec::with_capacity(targets.len());

        for target in &targets {
            let circuit = Arc::new(CircuitBreaker::new(
                format!("secondary:{}", target.channel.name()),
                config.mirror.circuit_config(),
            ));
            let mut consumer = Consumer::new(target.clone(), circuit, retry.clone()).with_block_timeout(block_timeout);
            if let Some(limiter) = &rate_limiter {
                consumer = consumer.with_rate_limiter(Arc::clone(limiter));
            }

            health = health
                .with_store(Arc::clone(&target.store))
                .with_channel(Arc::clone(&target.channel), Some(Arc::clone(&target.dead_letter)));
            stats.push((target.channel.name().to_string(), consumer.stats()));
            consumers.push(consumer);
        }

        let channels = targets.iter().map(|t| Arc::clone(&t.channel)).collect();
        let replicator = AsyncReplicator::new(primary, channels);

        Ok(Self::assemble(
            config,
            Strategy::Async { replicator, targets },
            consumers,
            stats,
            health,
        ))
    }

    /// Transaction-mirrored engine: blocking dual-write with compare-then-commit.
    pub fn mirrored(
        config: ReplicationConfig,
        primary: Arc<dyn StoreAdapter>,
        secondary: Arc<dyn StoreAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        if config.mode != DeploymentMode::Mirror {
            return Err(ReplicationError::Config(format!(
                "mirrored engine needs mode 'mirror', config says '{}'",
                config.mode
            )));
        }

        let circuit = Arc::new(CircuitBreaker::new(
            format!("secondary:{}", secondary.name()),
            config.mirror.circuit_config(),
        ));
        let health = HealthReporter::new(config.mode, config.health.probe_timeout_duration())
            .with_store(Arc::clone(&primary))
            .with_store(Arc::clone(&secondary));
        let mirror = MirrorEngine::new(primary, secondary, circuit).with_compensation(config.mirror.compensate);

        Ok(Self::assemble(config, Strategy::Mirror(mirror), Vec::new(), Vec::new(), health))
    }

    fn assemble(
        config: ReplicationConfig,
        strategy: Strategy,
        pending_consumers: Vec<Consumer>,
        stats: Vec<(String, Arc<ConsumerStats>)>,
        health: HealthReporter,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_engine_state("Created");

        Self {
            config,
            strategy,
            pending_consumers,
            stats,
            sync_status: None,
            health,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Publish consumer status events to `channel` (async mode).
    ///
    /// Must be called before [`start()`](Self::start).
    #[must_use]
    pub fn with_sync_status(mut self, channel: Arc<dyn ReplicationChannel>) -> Self {
        self.pending_consumers = self
            .pending_consumers
            .into_iter()
            .map(|c| c.with_sync_status(Arc::clone(&channel)))
            .collect();
        self.sync_status = Some(channel);
        self
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn mode(&self) -> DeploymentMode {
        self.config.mode
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Counters for every consumer, keyed by channel name.
    pub fn consumer_stats(&self) -> Vec<(String, ConsumerCounts)> {
        self.stats
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the engine.
    ///
    /// 1. Declares every replication, dead-letter and status channel
    /// 2. Spawns one consumer task per target (async mode)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(mode = %self.config.mode, consumers = self.pending_consumers.len(), "Starting replication engine");
        self.set_state(EngineState::Starting);

        if let Err(e) = self.declare_channels().await {
            error!(error = %e, "Failed to declare replication channels");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        for consumer in self.pending_consumers.drain(..) {
            debug!(channel = consumer.target().channel.name(), "Spawning consumer");
            let shutdown_rx = self.shutdown_rx.clone();
            self.handles.push(tokio::spawn(consumer.run(shutdown_rx)));
        }

        self.set_state(EngineState::Running);
        info!(tasks = self.handles.len(), "Replication engine running");
        Ok(())
    }

    async fn declare_channels(&self) -> Result<()> {
        if let Strategy::Async { targets, .. } = &self.strategy {
            for target in targets {
                target.channel.declare().await?;
                target.dead_letter.declare().await?;
            }
        }
        if let Some(status) = &self.sync_status {
            status.declare().await?;
        }
        Ok(())
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Reject new writes
    /// 2. Signal every consumer to stop
    /// 3. Wait for consumers to finish their in-flight message (with timeout)
    ///
    /// Unacknowledged messages stay on their channel and are redelivered on
    /// the next start.
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for consumers to drain");
        }

        let drain_timeout = self.config.shutdown_timeout_duration();
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Consumer stopped gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Consumer panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Consumer timed out during shutdown (message will be redelivered)");
                }
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            EngineState::Running => Ok(()),
            EngineState::ShuttingDown | EngineState::Stopped => Err(ReplicationError::Shutdown),
            other => Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Apply one record through the configured write path.
    pub async fn write(&self, record: OperationRecord) -> Result<WriteReceipt> {
        self.ensure_running()?;
        match &self.strategy {
            Strategy::Async { replicator, .. } => replicator.write(record).await,
            Strategy::Mirror(mirror) => mirror.write(record).await,
        }
    }

    /// Insert several documents.
    ///
    /// Async mode applies them in one primary transaction and publishes them
    /// in order. Mirror mode mirrors them one by one and stops at the first
    /// failure; earlier documents stay committed.
    pub async fn insert_many(&self, target: &str, documents: Vec<Document>) -> Result<Vec<WriteReceipt>> {
        self.ensure_running()?;
        match &self.strategy {
            Strategy::Async { replicator, .. } => replicator.insert_many(target, documents).await,
            Strategy::Mirror(mirror) => {
                let mut receipts = Vec::with_capacity(documents.len());
                for document in documents {
                    receipts.push(mirror.write(OperationRecord::insert(target, document)).await?);
                }
                Ok(receipts)
            }
        }
    }

    /// Read matching documents from the primary.
    pub async fn find(&self, target: &str, filter: &Filter) -> Result<Vec<Document>> {
        match &self.strategy {
            Strategy::Async { replicator, .. } => replicator.find(target, filter).await,
            Strategy::Mirror(mirror) => mirror.find(target, filter).await,
        }
    }

    /// Read the first matching document from the primary.
    pub async fn find_one(&self, target: &str, filter: &Filter) -> Result<Option<Document>> {
        match &self.strategy {
            Strategy::Async { replicator, .. } => replicator.find_one(target, filter).await,
            Strategy::Mirror(mirror) => mirror.find_one(target, filter).await,
        }
    }

    /// Probe stores and channels.
    ///
    /// `healthy` additionally requires the engine to be `Running`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let status = engine.status().await;
    /// if status.healthy {
    ///     HttpResponse::Ok().json(&status)
    /// } else {
    ///     HttpResponse::ServiceUnavailable().json(&status)
    /// }
    /// ```
    pub async fn status(&self) -> HealthSnapshot {
        let state = self.state();
        let mut snapshot = self.health.status().await;
        snapshot.state = Some(state);
        snapshot.healthy = snapshot.healthy && state == EngineState::Running;
        snapshot
    }
}
