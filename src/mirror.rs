// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronous mirror engine: blocking dual-write with compare-then-commit.
//!
//! Each write runs as a small saga, start to finish inside the caller's call:
//!
//! ```text
//! Started ─→ PrimaryApplied ─→ SecondaryApplied ─→ Compared ─→ Committed
//!    │              │                  │                │
//!    └──────────────┴──────────────────┴────────────────┴─→ Aborted
//! ```
//!
//! - `Started`: a native transaction is opened on the primary.
//! - `PrimaryApplied`: the record is applied inside that transaction.
//! - `SecondaryApplied`: the same record is applied to the secondary, through
//!   the secondary circuit breaker. The secondary pre-image of the matched
//!   documents is captured first.
//! - `Compared`: the two [`ApplyOutcome`]s must be structurally equal.
//! - `Committed`: the primary transaction commits.
//!
//! On abort the primary transaction is rolled back, so the primary never
//! changes. The secondary has no shared transaction; if it was modified the
//! engine issues compensating writes (delete inserted ids, restore the
//! pre-image) and reports the result as [`SecondaryState`] inside
//! [`ReplicationError::MirrorDivergence`].
//!
//! The primary transaction stays open across the secondary round trip.
//! Concurrent writers serialize on the primary's own transaction discipline.

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::coordinator::WriteReceipt;
use crate::error::{ApplyError, ReplicationError, Result};
use crate::health::{probe_store, StoreHealth};
use crate::metrics;
use crate::record::{id_filter, ApplyOutcome, Document, Filter, OperationRecord, Payload, ID_FIELD};
use crate::store::{apply_all, StoreAdapter, StoreTransaction};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Last stage a mirrored write reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MirrorStage {
    Started,
    PrimaryApplied,
    SecondaryApplied,
    Compared,
    Committed,
    Aborted,
}

impl MirrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStage::Started => "Started",
            MirrorStage::PrimaryApplied => "PrimaryApplied",
            MirrorStage::SecondaryApplied => "SecondaryApplied",
            MirrorStage::Compared => "Compared",
            MirrorStage::Committed => "Committed",
            MirrorStage::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for MirrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the secondary after an aborted mirrored write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryState {
    /// The secondary was never modified.
    Untouched,
    /// The secondary was modified and compensating writes restored it.
    Compensated,
    /// The secondary may differ from the primary; needs external repair.
    Diverged,
}

impl std::fmt::Display for SecondaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecondaryState::Untouched => write!(f, "untouched"),
            SecondaryState::Compensated => write!(f, "compensated"),
            SecondaryState::Diverged => write!(f, "diverged"),
        }
    }
}

/// Result of one guarded secondary apply.
enum Attempt {
    Applied(ApplyOutcome),
    Rejected(ApplyError),
}

/// Dual-write engine over a primary and one secondary.
pub struct MirrorEngine {
    primary: Arc<dyn StoreAdapter>,
    secondary: Arc<dyn StoreAdapter>,
    circuit: Arc<CircuitBreaker>,
    compensate: bool,
}

impl MirrorEngine {
    pub fn new(primary: Arc<dyn StoreAdapter>, secondary: Arc<dyn StoreAdapter>, circuit: Arc<CircuitBreaker>) -> Self {
        Self {
            primary,
            secondary,
            circuit,
            compensate: true,
        }
    }

    /// Enable or disable compensating writes after an abort.
    #[must_use]
    pub fn with_compensation(mut self, compensate: bool) -> Self {
        self.compensate = compensate;
        self
    }

    pub fn primary(&self) -> &Arc<dyn StoreAdapter> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<dyn StoreAdapter> {
        &self.secondary
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Apply `record` to both stores; commit only if both agree.
    ///
    /// Returns `Apply` when nothing happened anywhere (invalid record, primary
    /// failure, open secondary circuit) and `MirrorDivergence` once the
    /// secondary has been involved. In both cases the primary is unchanged.
    pub async fn write(&self, record: OperationRecord) -> Result<WriteReceipt> {
        let record = record.assign_identity();
        record
            .validate()
            .map_err(|e| ReplicationError::apply(self.primary.name(), e))?;

        let start = Instant::now();
        let result = self.run_saga(&record).await;

        let (stage, outcome) = match &result {
            Ok(_) => (MirrorStage::Committed, "committed"),
            Err(ReplicationError::MirrorDivergence { stage, .. }) => (*stage, "aborted"),
            Err(_) => (MirrorStage::Started, "aborted"),
        };
        metrics::record_mirror_outcome(&record.target, stage.as_str(), outcome, start.elapsed());

        let outcome = result?;
        debug!(target = %record.target, kind = %record.kind(), "Mirrored write committed");
        Ok(WriteReceipt {
            record,
            outcome,
            published: Vec::new(),
        })
    }

    async fn run_saga(&self, record: &OperationRecord) -> Result<ApplyOutcome> {
        if self.circuit.is_open() {
            return Err(self.secondary_unavailable());
        }

        // Started
        let mut tx = self
            .primary
            .begin()
            .await
            .map_err(|e| ReplicationError::apply(self.primary.name(), e))?;

        // PrimaryApplied
        let primary_outcome = match tx.apply(record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.rollback_primary(tx).await;
                return Err(ReplicationError::apply(self.primary.name(), e));
            }
        };

        let pre_image = match self.capture_pre_image(record).await {
            Ok(docs) => docs,
            Err(e) => {
                self.rollback_primary(tx).await;
                return Err(self.divergence(
                    MirrorStage::PrimaryApplied,
                    record,
                    format!("secondary pre-image read failed: {}", e),
                    SecondaryState::Untouched,
                ));
            }
        };

        // SecondaryApplied
        let secondary_outcome = match self.apply_secondary(record).await {
            Ok(Attempt::Applied(outcome)) => outcome,
            Ok(Attempt::Rejected(e)) | Err(CircuitError::Inner(e)) => {
                self.rollback_primary(tx).await;
                warn!(
                    target = %record.target,
                    kind = %record.kind(),
                    error = %e,
                    "Secondary apply failed, mirrored write aborted"
                );
                return Err(self.divergence(
                    MirrorStage::PrimaryApplied,
                    record,
                    format!("secondary apply failed: {}", e),
                    SecondaryState::Untouched,
                ));
            }
            Err(CircuitError::Rejected) => {
                self.rollback_primary(tx).await;
                return Err(self.secondary_unavailable());
            }
        };

        // Compared
        if primary_outcome != secondary_outcome {
            self.rollback_primary(tx).await;
            let secondary = self.compensate(record, &secondary_outcome, &pre_image).await;
            return Err(self.divergence(
                MirrorStage::Compared,
                record,
                format!(
                    "results differ: primary {:?}, secondary {:?}",
                    primary_outcome, secondary_outcome
                ),
                secondary,
            ));
        }

        // Committed
        if let Err(e) = tx.commit().await {
            let secondary = self.compensate(record, &secondary_outcome, &pre_image).await;
            return Err(self.divergence(
                MirrorStage::Compared,
                record,
                format!("primary commit failed: {}", e),
                secondary,
            ));
        }

        Ok(primary_outcome)
    }

    async fn apply_secondary(&self, record: &OperationRecord) -> std::result::Result<Attempt, CircuitError<ApplyError>> {
        let secondary = self.secondary.as_ref();
        self.circuit
            .call(|| async move {
                match secondary.apply(record).await {
                    Ok(outcome) => Ok(Attempt::Applied(outcome)),
                    Err(e) if !e.is_retryable() => Ok(Attempt::Rejected(e)),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Secondary documents the record is about to change.
    async fn capture_pre_image(&self, record: &OperationRecord) -> std::result::Result<Vec<Document>, ApplyError> {
        let (filter, many) = match &record.payload {
            Payload::Insert { .. } => return Ok(Vec::new()),
            Payload::Update { filter, many, .. } | Payload::Delete { filter, many } => (filter, *many),
        };

        let mut docs = self.secondary.find(&record.target, filter).await?;
        if !many {
            docs.truncate(1);
        }
        Ok(docs)
    }

    /// Undo the secondary's side of an aborted write.
    async fn compensate(&self, record: &OperationRecord, applied: &ApplyOutcome, pre_image: &[Document]) -> SecondaryState {
        let touched = applied.modified > 0
            || applied.deleted > 0
            || !applied.inserted_ids.is_empty()
            || applied.upserted_id.is_some();
        if !touched {
            return SecondaryState::Untouched;
        }
        if !self.compensate {
            warn!(target = %record.target, "Compensation disabled, secondary left diverged");
            return SecondaryState::Diverged;
        }

        let Some(undo) = undo_records(&record.target, applied, pre_image) else {
            error!(target = %record.target, "Pre-image document has no id, cannot compensate");
            metrics::record_compensation(&record.target, false);
            return SecondaryState::Diverged;
        };

        match apply_all(self.secondary.as_ref(), &undo).await {
            Ok(_) => {
                metrics::record_compensation(&record.target, true);
                debug!(target = %record.target, writes = undo.len(), "Secondary compensated");
                SecondaryState::Compensated
            }
            Err(e) => {
                metrics::record_compensation(&record.target, false);
                error!(
                    target = %record.target,
                    kind = %record.kind(),
                    error = %e,
                    "Compensation failed, secondary diverged"
                );
                SecondaryState::Diverged
            }
        }
    }

    async fn rollback_primary(&self, tx: Box<dyn StoreTransaction>) {
        if let Err(e) = tx.rollback().await {
            error!(store = self.primary.name(), error = %e, "Primary rollback failed");
        }
    }

    fn secondary_unavailable(&self) -> ReplicationError {
        ReplicationError::apply(
            self.secondary.name(),
            ApplyError::Unavailable {
                store: self.secondary.name().to_string(),
                message: format!("circuit '{}' is open", self.circuit.name()),
            },
        )
    }

    fn divergence(
        &self,
        stage: MirrorStage,
        record: &OperationRecord,
        detail: String,
        secondary: SecondaryState,
    ) -> ReplicationError {
        ReplicationError::MirrorDivergence {
            stage,
            target: record.target.clone(),
            kind: record.kind(),
            detail,
            secondary,
        }
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

    /// Ping both stores independently of the write path.
    pub async fn health_check(&self, timeout: Duration) -> Vec<StoreHealth> {
        let (primary, secondary) = futures::join!(
            probe_store(self.primary.as_ref(), timeout),
            probe_store(self.secondary.as_ref(), timeout)
        );
        vec![primary, secondary]
    }
}

/// Writes that restore the secondary to `pre_image`.
///
/// `None` when a pre-image document has no identifier.
fn undo_records(target: &str, applied: &ApplyOutcome, pre_image: &[Document]) -> Option<Vec<OperationRecord>> {
    let mut undo = Vec::new();

    for id in applied.inserted_ids.iter().chain(applied.upserted_id.iter()) {
        undo.push(OperationRecord::delete(target, id_filter(id.clone())));
    }

    for doc in pre_image {
        let id = doc.get(ID_FIELD)?;
        undo.push(OperationRecord::delete(target, id_filter(id.clone())));
        undo.push(OperationRecord::insert(target, doc.clone()));
    }

    Some(undo)
}
