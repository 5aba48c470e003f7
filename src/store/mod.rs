// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store adapter traits.
//!
//! A store adapter applies [`OperationRecord`]s against one concrete store and
//! reports an [`ApplyOutcome`]. Each storage technology translates the generic
//! record into its own native writes; the record shape never changes.
//!
//! # Implementations
//!
//! - [`memory::MemoryStore`]: in-process document store (native transactions,
//!   unique `id`)
//! - [`sqlite::SqliteStore`]: relational store, parameterised SQL built from
//!   the record's field map
//!
//! # Example
//!
//! ```rust,no_run
//! use store_replication::store::{StoreAdapter, BoxFuture};
//! use store_replication::record::{ApplyOutcome, Document, Filter, OperationRecord};
//! use store_replication::store::StoreTransaction;
//!
//! struct Remote;
//!
//! impl StoreAdapter for Remote {
//!     fn name(&self) -> &str { "remote" }
//!     fn apply<'a>(&'a self, _record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome> {
//!         Box::pin(async move { Ok(ApplyOutcome::default()) })
//!     }
//!     fn begin(&self) -> BoxFuture<'_, Box<dyn StoreTransaction>> {
//!         Box::pin(async move { unimplemented!() })
//!     }
//!     fn find<'a>(&'a self, _target: &'a str, _filter: &'a Filter) -> BoxFuture<'a, Vec<Document>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!     fn ping(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::ApplyError;
use crate::record::{ApplyOutcome, Document, Filter, OperationRecord};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApplyError>> + Send + 'a>>;

/// A store that can apply operation records.
///
/// `apply` is all-or-nothing: on error the store is unchanged.
pub trait StoreAdapter: Send + Sync + 'static {
    /// Name used in logs, metrics and errors.
    fn name(&self) -> &str;

    /// Apply one record atomically.
    fn apply<'a>(&'a self, record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome>;

    /// Open a native transaction.
    fn begin(&self) -> BoxFuture<'_, Box<dyn StoreTransaction>>;

    /// All documents in `target` matching `filter`, in natural order.
    fn find<'a>(&'a self, target: &'a str, filter: &'a Filter) -> BoxFuture<'a, Vec<Document>>;

    /// First document in `target` matching `filter`.
    fn find_one<'a>(&'a self, target: &'a str, filter: &'a Filter) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move { Ok(self.find(target, filter).await?.into_iter().next()) })
    }

    /// Lightweight liveness probe.
    fn ping(&self) -> BoxFuture<'_, ()>;
}

/// An open transaction against one store.
///
/// Dropping without `commit` discards staged changes.
pub trait StoreTransaction: Send {
    /// Apply a record inside the transaction.
    fn apply<'a>(&'a mut self, record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome>;

    /// Make staged changes visible.
    fn commit(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// Discard staged changes.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Apply `records` in one transaction; nothing is applied if any fails.
pub async fn apply_all(
    store: &dyn StoreAdapter,
    records: &[OperationRecord],
) -> Result<Vec<ApplyOutcome>, ApplyError> {
    let mut tx = store.begin().await?;
    let mut outcomes = Vec::with_capacity(records.len());

    for record in records {
        match tx.apply(record).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        store = store.name(),
                        error = %rollback_err,
                        "Rollback after failed batch apply failed"
                    );
                }
                return Err(e);
            }
        }
    }

    tx.commit().await?;
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{id_filter, Document};
    use serde_json::json;

    fn product(id: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("id".into(), json!(id));
        doc.insert("name".into(), json!("Widget"));
        doc
    }

    #[tokio::test]
    async fn test_apply_all_commits_batch() {
        let store = MemoryStore::new("primary");
        let records = vec![
            OperationRecord::insert("products", product("a")),
            OperationRecord::insert("products", product("b")),
        ];

        let outcomes = apply_all(&store, &records).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(store.find("products", &Filter::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_all_rolls_back_on_failure() {
        let store = MemoryStore::new("primary");
        let records = vec![
            OperationRecord::insert("products", product("a")),
            OperationRecord::insert("products", product("a")),
        ];

        let err = apply_all(&store, &records).await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(store.find("products", &Filter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_find_one() {
        let store = MemoryStore::new("primary");
        store
            .apply(&OperationRecord::insert("products", product("a")))
            .await
            .unwrap();

        let found = store.find_one("products", &id_filter(json!("a"))).await.unwrap();
        assert_eq!(found.and_then(|d| d.get("name").cloned()), Some(json!("Widget")));

        let missing = store.find_one("products", &id_filter(json!("zz"))).await.unwrap();
        assert!(missing.is_none());
    }
}
