// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Produce on write: primary apply, then durable publish.
//!
//! ```text
//! write(record)
//!   ├─ pin identifiers, validate, encode
//!   ├─ primary.apply(record)        ── fails → Apply (nothing happened)
//!   └─ for each target channel:
//!        channel.publish(payload)   ── fails → Publish (primary write stands)
//! ```
//!
//! The record is encoded before the primary write so a codec failure never
//! leaves an unreplicated primary write behind.

use super::types::WriteReceipt;
use crate::channel::ReplicationChannel;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::record::{ApplyOutcome, Document, Filter, OperationRecord};
use crate::store::{apply_all, StoreAdapter};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Primary writer that queues every successful write for replication.
pub struct AsyncReplicator {
    primary: Arc<dyn StoreAdapter>,
    channels: Vec<Arc<dyn ReplicationChannel>>,
}

impl AsyncReplicator {
    /// Publish to every channel in `channels` after each primary write.
    pub fn new(primary: Arc<dyn StoreAdapter>, channels: Vec<Arc<dyn ReplicationChannel>>) -> Self {
        Self { primary, channels }
    }

    pub fn primary(&self) -> &Arc<dyn StoreAdapter> {
        &self.primary
    }

    /// Apply `record` to the primary and queue it on every target channel.
    pub async fn write(&self, record: OperationRecord) -> Result<WriteReceipt> {
        let record = record.assign_identity();
        record
            .validate()
            .map_err(|e| ReplicationError::apply(self.primary.name(), e))?;
        let payload = record.encode()?;

        let outcome = self.apply_primary(&record).await?;
        let published = self.publish(&payload, &outcome).await?;

        Ok(WriteReceipt {
            record,
            outcome,
            published,
        })
    }

    /// Insert `documents` in one primary transaction, then publish one record
    /// per document, each publish awaited before the next.
    ///
    /// Identifiers are pinned before the primary write. On a publish failure
    /// the returned `Publish` error carries the combined primary outcome and
    /// the ids of the records queued before it.
    pub async fn insert_many(&self, target: &str, documents: Vec<Document>) -> Result<Vec<WriteReceipt>> {
        let records: Vec<OperationRecord> = documents
            .into_iter()
            .map(|doc| OperationRecord::insert(target, doc).assign_identity())
            .collect();

        let mut payloads = Vec::with_capacity(records.len());
        for record in &records {
            record
                .validate()
                .map_err(|e| ReplicationError::apply(self.primary.name(), e))?;
            payloads.push(record.encode()?);
        }

        let start = Instant::now();
        let outcomes = match apply_all(self.primary.as_ref(), &records).await {
            Ok(outcomes) => {
                metrics::record_primary_write(target, "insert_many", true, start.elapsed());
                outcomes
            }
            Err(e) => {
                metrics::record_primary_write(target, "insert_many", false, start.elapsed());
                return Err(ReplicationError::apply(self.primary.name(), e));
            }
        };

        let mut combined = ApplyOutcome::default();
        for outcome in &outcomes {
            combined.absorb(outcome.clone());
        }

        let mut receipts: Vec<WriteReceipt> = Vec::with_capacity(records.len());
        for ((record, outcome), payload) in records.into_iter().zip(outcomes).zip(&payloads) {
            let published = match self.publish(payload, &combined).await {
                Ok(published) => published,
                Err(ReplicationError::Publish {
                    channel, outcome, source, ..
                }) => {
                    let queued: Vec<_> = receipts
                        .iter()
                        .filter_map(|r| r.record.pinned_id().cloned())
                        .collect();
                    warn!(
                        target,
                        queued = queued.len(),
                        total = payloads.len(),
                        "Batch publish stopped partway"
                    );
                    return Err(ReplicationError::Publish {
                        channel,
                        outcome,
                        queued,
                        source,
                    });
                }
                Err(e) => return Err(e),
            };
            receipts.push(WriteReceipt {
                record,
                outcome,
                published,
            });
        }

        debug!(target, count = receipts.len(), "Batch inserted and queued");
        Ok(receipts)
    }

    /// Read matching documents from the primary.
    pub async fn find(&self, target: &str, filter: &Filter) -> Result<Vec<Document>> {
        self.primary
            .find(target, filter)
            .await
            .map_err(|e| ReplicationError::apply(self.primary.name(), e))
    }

    /// Read the first matching document from the primary.
    pub async fn find_one(&self, target: &str, filter: &Filter) -> Result<Option<Document>> {
        self.primary
            .find_one(target, filter)
            .await
            .map_err(|e| ReplicationError::apply(self.primary.name(), e))
    }

    async fn apply_primary(&self, record: &OperationRecord) -> Result<ApplyOutcome> {
        let start = Instant::now();
        let kind = record.kind();
        match self.primary.apply(record).await {
            Ok(outcome) => {
                metrics::record_primary_write(&record.target, kind.as_str(), true, start.elapsed());
                Ok(outcome)
            }
            Err(e) => {
                metrics::record_primary_write(&record.target, kind.as_str(), false, start.elapsed());
                Err(ReplicationError::apply(self.primary.name(), e))
            }
        }
    }

    /// Publish to every channel. `outcome` is reported on partial success.
    async fn publish(&self, payload: &[u8], outcome: &ApplyOutcome) -> Result<Vec<(String, String)>> {
        let mut published = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            match channel.publish(payload).await {
                Ok(id) => {
                    metrics::record_publish(channel.name(), true);
                    published.push((channel.name().to_string(), id));
                }
                Err(e) => {
                    metrics::record_publish(channel.name(), false);
                    warn!(
                        channel = channel.name(),
                        error = %e,
                        "Primary write applied but publish failed; replication not queued"
                    );
                    return Err(ReplicationError::Publish {
                        channel: channel.name().to_string(),
                        outcome: outcome.clone(),
                        queued: Vec::new(),
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(published)
    }
}
