// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consume and apply: one long-lived consumer per replication channel.
//!
//! Each consumer holds exactly one message at a time:
//! 1. Receive the next message (blocking with timeout)
//! 2. Decode the Operation Record
//! 3. Apply it to the secondary through the circuit breaker
//! 4. Ack on success, nack on failure
//!
//! # Delivery outcomes
//!
//! | Situation | Action |
//! |-----------|--------|
//! | Applied | ack |
//! | Insert hit `DuplicateKey` | ack (already applied by an earlier delivery) |
//! | Transient failure | nack, back off, redeliver |
//! | Transient failure, deliveries exhausted | dead-letter, ack |
//! | Permanent failure (malformed, unknown kind) | dead-letter, ack |
//! | Undecodable or corrupt payload | dead-letter, ack |
//! | Circuit open | hold the message, back off, retry (no delivery consumed) |
//!
//! A record is never dropped: if the dead-letter publish fails the message is
//! nacked and stays on its channel.
//!
//! # Graceful Shutdown
//!
//! The consumer uses `tokio::select!` so a blocked receive or a backoff sleep
//! returns immediately on shutdown. An apply already in progress finishes
//! first; an unacknowledged message is redelivered after restart.

use super::types::{ConsumerStats, ReplicationTarget};
use crate::channel::{DeadLetter, Delivery, SyncStatus, SyncStatusEvent};
use crate::channel::ReplicationChannel;
use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::error::{ApplyError, ReplicationError, Result};
use crate::metrics;
use crate::record::{ApplyOutcome, OperationKind, OperationRecord};
use crate::resilience::{RateLimiter, RetryConfig};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Applied to the secondary and acknowledged.
    Applied,
    /// Duplicate insert on redelivery; acknowledged.
    AlreadyApplied,
    /// Failed; nacked for redelivery after `retry_in`.
    Requeued { retry_in: Duration },
    /// Circuit open; still held, retry the same delivery after `retry_in`.
    Deferred { retry_in: Duration },
    /// Moved to the dead-letter channel and acknowledged.
    Quarantined,
}

/// Result of one guarded apply, as seen by the circuit breaker.
///
/// Only transient failures count against the circuit.
enum Attempt {
    Applied(ApplyOutcome),
    Duplicate,
    Rejected(ApplyError),
}

/// Background consumer for one replication target.
pub struct Consumer {
    target: ReplicationTarget,
    circuit: Arc<CircuitBreaker>,
    retry: RetryConfig,
    block_timeout: Duration,
    rate_limiter: Option<Arc<RateLimiter>>,
    sync_status: Option<Arc<dyn ReplicationChannel>>,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    pub fn new(target: ReplicationTarget, circuit: Arc<CircuitBreaker>, retry: RetryConfig) -> Self {
        Self {
            target,
            circuit,
            retry,
            block_timeout: Duration::from_secs(5),
            rate_limiter: None,
            sync_status: None,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    #[must_use]
    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Publish a [`SyncStatusEvent`] for every applied or quarantined record.
    #[must_use]
    pub fn with_sync_status(mut self, channel: Arc<dyn ReplicationChannel>) -> Self {
        self.sync_status = Some(channel);
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    pub fn target(&self) -> &ReplicationTarget {
        &self.target
    }

    fn channel_name(&self) -> &str {
        self.target.channel.name()
    }

    /// Handle one delivery: apply, then ack, nack or quarantine.
    ///
    /// `Err` means the message could not be settled (ack/nack/dead-letter
    /// failed); it stays on the channel.
    pub async fn process(&self, delivery: &Delivery) -> Result<DeliveryOutcome> {
        if let Some(defect) = &delivery.defect {
            return self.quarantine(delivery, "integrity", defect.clone(), None).await;
        }

        let record = match OperationRecord::decode(&delivery.payload) {
            Ok(record) => record,
            Err(e) => {
                metrics::record_error("consumer", "decode");
                return self.quarantine(delivery, "undecodable", e.to_string(), None).await;
            }
        };

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let start = Instant::now();
        let store = &self.target.store;
        let guarded = &record;
        let result = self
            .circuit
            .call(|| async move {
                match store.apply(guarded).await {
                    Ok(outcome) => Ok(Attempt::Applied(outcome)),
                    Err(e) if e.is_duplicate_key() && guarded.kind() == OperationKind::Insert => {
                        Ok(Attempt::Duplicate)
                    }
                    Err(e) if !e.is_retryable() => Ok(Attempt::Rejected(e)),
                    Err(e) => Err(e),
                }
            })
            .await;

        match result {
            Ok(Attempt::Applied(outcome)) => {
                self.target.channel.ack(delivery).await?;
                self.stats.record_applied();
                metrics::record_apply(self.channel_name(), "applied", start.elapsed());
                debug!(
                    stream_id = %delivery.id,
                    target = %record.target,
                    kind = %record.kind(),
                    matched = outcome.matched,
                    modified = outcome.modified,
                    deleted = outcome.deleted,
                    "Applied record to secondary"
                );
                self.publish_status(delivery, SyncStatus::Applied, Some(&record)).await;
                Ok(DeliveryOutcome::Applied)
            }
            Ok(Attempt::Duplicate) => {
                self.target.channel.ack(delivery).await?;
                self.stats.record_already_applied();
                metrics::record_duplicate_tolerated(self.channel_name());
                metrics::record_apply(self.channel_name(), "already_applied", start.elapsed());
                debug!(
                    stream_id = %delivery.id,
                    target = %record.target,
                    delivery_count = delivery.delivery_count,
                    "Insert already applied, acknowledging redelivery"
                );
                self.publish_status(delivery, SyncStatus::AlreadyApplied, Some(&record)).await;
                Ok(DeliveryOutcome::AlreadyApplied)
            }
            Ok(Attempt::Rejected(e)) => {
                metrics::record_apply(self.channel_name(), "failed", start.elapsed());
                let err = ReplicationError::ReplicationApply {
                    channel: self.channel_name().to_string(),
                    source: e,
                };
                self.quarantine(delivery, "rejected", err.to_string(), Some(&record)).await
            }
            Err(CircuitError::Rejected) => {
                let retry_in = self.retry.delay_for_attempt(delivery.delivery_count as usize);
                debug!(
                    stream_id = %delivery.id,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Secondary circuit open, holding delivery"
                );
                Ok(DeliveryOutcome::Deferred { retry_in })
            }
            Err(CircuitError::Inner(e)) => {
                metrics::record_apply(self.channel_name(), "failed", start.elapsed());
                metrics::record_error("consumer", "apply");
                let err = ReplicationError::ReplicationApply {
                    channel: self.channel_name().to_string(),
                    source: e,
                };

                if self.retry.exhausted(delivery.delivery_count) {
                    return self.quarantine(delivery, "max_deliveries", err.to_string(), Some(&record)).await;
                }

                let retry_in = self.retry.delay_for_attempt(delivery.delivery_count as usize);
                warn!(
                    stream_id = %delivery.id,
                    target = %record.target,
                    delivery_count = delivery.delivery_count,
                    retry_in_ms = retry_in.as_millis() as u64,
                    error = %err,
                    "Secondary apply failed, requeueing"
                );
                self.target.channel.nack(delivery).await?;
                self.stats.record_redelivered();
                metrics::record_redelivery(self.channel_name(), delivery.delivery_count);
                Ok(DeliveryOutcome::Requeued { retry_in })
            }
        }
    }

    /// Move a delivery to the dead-letter channel, then ack it.
    async fn quarantine(
        &self,
        delivery: &Delivery,
        reason: &str,
        error: String,
        record: Option<&OperationRecord>,
    ) -> Result<DeliveryOutcome> {
        let letter = DeadLetter::new(self.channel_name(), delivery, reason, &error);
        let payload = serde_json::to_vec(&letter)?;

        if let Err(e) = self.target.dead_letter.publish(&payload).await {
            error!(
                stream_id = %delivery.id,
                dead_letter = self.target.dead_letter.name(),
                error = %e,
                "Dead-letter publish failed, leaving record on channel"
            );
            self.target.channel.nack(delivery).await?;
            return Err(e);
        }
        self.target.channel.ack(delivery).await?;

        self.stats.record_quarantined();
        metrics::record_quarantine(self.channel_name(), reason);
        error!(
            stream_id = %delivery.id,
            reason,
            delivery_count = delivery.delivery_count,
            error = %error,
            "Record quarantined"
        );
        self.publish_status(delivery, SyncStatus::Quarantined, record).await;
        Ok(DeliveryOutcome::Quarantined)
    }

    async fn publish_status(&self, delivery: &Delivery, status: SyncStatus, record: Option<&OperationRecord>) {
        let Some(channel) = &self.sync_status else {
            return;
        };
        let event = SyncStatusEvent {
            channel: self.channel_name().to_string(),
            message_id: delivery.id.clone(),
            status,
            target: record.map(|r| r.target.clone()),
            kind: record.map(|r| r.kind()),
            at: Utc::now(),
        };
        let published = match serde_json::to_vec(&event) {
            Ok(payload) => channel.publish(&payload).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            warn!(sync_status = channel.name(), error = %e, "Failed to publish sync status");
        }
    }

    /// Refresh depth and lag gauges (called when idle).
    async fn report_depth(&self) {
        match self.target.channel.depth().await {
            Ok(depth) => metrics::set_pending_depth(self.channel_name(), depth),
            Err(e) => trace!(error = %e, "Depth probe failed"),
        }
        if let Ok(age) = self.target.channel.oldest_pending_age().await {
            let lag_ms = age.map_or(0, |a| a.as_millis().min(u64::MAX as u128) as u64);
            metrics::record_replication_lag_ms(self.channel_name(), lag_ms);
        }
    }

    /// Run until shutdown is signaled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!(
            "consumer",
            channel = %self.channel_name(),
            store = %self.target.store.name()
        );

        async move {
            info!("Starting replication consumer");
            let mut receive_errors: usize = 0;

            'consume: loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let started = Instant::now();
                let received = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break 'consume,
                    r = self.target.channel.receive(self.block_timeout) => r,
                };

                let delivery = match received {
                    Ok(Some(delivery)) => {
                        receive_errors = 0;
                        metrics::record_channel_read_latency(self.channel_name(), started.elapsed());
                        delivery
                    }
                    Ok(None) => {
                        self.report_depth().await;
                        continue;
                    }
                    Err(e) => {
                        receive_errors += 1;
                        metrics::record_error("consumer", "receive");
                        let delay = self.retry.delay_for_attempt(receive_errors);
                        warn!(error = %e, attempt = receive_errors, "Receive failed, backing off");
                        if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
                            break;
                        }
                        continue;
                    }
                };

                loop {
                    match self.process(&delivery).await {
                        Ok(DeliveryOutcome::Deferred { retry_in }) => {
                            if !sleep_or_shutdown(retry_in, &mut shutdown_rx).await {
                                break 'consume;
                            }
                        }
                        Ok(DeliveryOutcome::Requeued { retry_in }) => {
                            if !sleep_or_shutdown(retry_in, &mut shutdown_rx).await {
                                break 'consume;
                            }
                            break;
                        }
                        Ok(_) => break,
                        Err(e) => {
                            metrics::record_error("consumer", "settle");
                            warn!(stream_id = %delivery.id, error = %e, "Could not settle delivery");
                            if !sleep_or_shutdown(self.retry.initial_delay, &mut shutdown_rx).await {
                                break 'consume;
                            }
                            break;
                        }
                    }
                }
            }

            let counts = self.stats.snapshot();
            info!(
                applied = counts.applied,
                already_applied = counts.already_applied,
                redelivered = counts.redelivered,
                quarantined = counts.quarantined,
                "Replication consumer stopped"
            );
        }
        .instrument(span)
        .await
    }
}

/// Sleep for `delay`. Returns `false` if shutdown was signaled first.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
    }
}
