// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process document store.
//!
//! Collections are ordered lists of documents with a uniqueness constraint on
//! `id`. Natural order is insertion order, so "first match" is stable.
//!
//! Transactions take the store's write lock for their whole lifetime and stage
//! changes on a copy, swapped in on commit. Concurrent writers queue on that
//! lock, the same discipline a primary store's native transaction gives.
//!
//! [`MemoryStore::set_online`] simulates an outage: every call fails with
//! [`ApplyError::Connection`] until the store is brought back.

use super::{BoxFuture, StoreAdapter, StoreTransaction};
use crate::error::ApplyError;
use crate::record::{
    id_key, matches, new_id, ApplyOutcome, Document, Filter, OperationRecord, Payload, ID_FIELD,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

type Collections = HashMap<String, Vec<Document>>;

/// Document store held in process memory.
///
/// Cloning shares the underlying data.
#[derive(Clone)]
pub struct MemoryStore {
    name: String,
    data: Arc<RwLock<Collections>>,
    online: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(RwLock::new(HashMap::new())),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Take the store offline (or back online).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of documents in a collection.
    pub async fn count(&self, target: &str) -> usize {
        self.data.read().await.get(target).map_or(0, Vec::len)
    }

    /// Copy of every collection, for comparisons in tests and tooling.
    pub async fn snapshot(&self) -> HashMap<String, Vec<Document>> {
        self.data.read().await.clone()
    }

    fn check_online(&self) -> Result<(), ApplyError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(ApplyError::connection(&self.name, "store offline"))
        }
    }
}

impl StoreAdapter for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            self.check_online()?;
            let mut data = self.data.write().await;
            let outcome = apply_record(&mut data, &self.name, record)?;
            debug!(store = %self.name, target = %record.target, kind = %record.kind(), "Applied record");
            Ok(outcome)
        })
    }

    fn begin(&self) -> BoxFuture<'_, Box<dyn StoreTransaction>> {
        Box::pin(async move {
            self.check_online()?;
            let guard = Arc::clone(&self.data).write_owned().await;
            let staged = guard.clone();
            Ok(Box::new(MemoryTransaction {
                name: self.name.clone(),
                online: Arc::clone(&self.online),
                guard,
                staged,
            }) as Box<dyn StoreTransaction>)
        })
    }

    fn find<'a>(&'a self, target: &'a str, filter: &'a Filter) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            self.check_online()?;
            let data = self.data.read().await;
            Ok(data
                .get(target)
                .map(|docs| docs.iter().filter(|d| matches(d, filter)).cloned().collect())
                .unwrap_or_default())
        })
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.check_online() })
    }
}

/// Open transaction on a [`MemoryStore`].
struct MemoryTransaction {
    name: String,
    online: Arc<AtomicBool>,
    guard: OwnedRwLockWriteGuard<Collections>,
    staged: Collections,
}

impl StoreTransaction for MemoryTransaction {
    fn apply<'a>(&'a mut self, record: &'a OperationRecord) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            if !self.online.load(Ordering::SeqCst) {
                return Err(ApplyError::connection(&self.name, "store offline"));
            }
            apply_record(&mut self.staged, &self.name, record)
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let MemoryTransaction {
                name,
                online,
                mut guard,
                staged,
            } = *self;
            if !online.load(Ordering::SeqCst) {
                return Err(ApplyError::transaction(name, "store offline during commit"));
            }
            *guard = staged;
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

/// Apply one record to a set of collections. Leaves them untouched on error.
fn apply_record(
    data: &mut Collections,
    store: &str,
    record: &OperationRecord,
) -> Result<ApplyOutcome, ApplyError> {
    record.validate()?;

    match &record.payload {
        Payload::Insert { document } => {
            let mut document = document.clone();
            let id = document
                .entry(ID_FIELD.to_string())
                .or_insert_with(new_id)
                .clone();
            let docs = data.entry(record.target.clone()).or_default();
            ensure_unique(docs, &record.target, &id)?;
            docs.push(document);
            Ok(ApplyOutcome::inserted(id))
        }

        Payload::Update {
            filter,
            set,
            upsert,
            upsert_id,
            many,
        } => {
            let docs = data.entry(record.target.clone()).or_default();
            let positions = matching_positions(docs, filter, *many);

            if positions.is_empty() {
                if !*upsert {
                    return Ok(ApplyOutcome::updated(0, 0));
                }
                let id = upsert_id
                    .clone()
                    .or_else(|| filter.get(ID_FIELD).cloned())
                    .unwrap_or_else(new_id);
                ensure_unique(docs, &record.target, &id)?;

                let mut document = filter.clone();
                document.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
                document.insert(ID_FIELD.to_string(), id.clone());
                docs.push(document);
                debug!(store, target = %record.target, id = %id_key(&id), "Upsert inserted");
                return Ok(ApplyOutcome::upserted(id));
            }

            let mut modified = 0;
            for &pos in &positions {
                let doc = &mut docs[pos];
                let mut changed = false;
                for (field, value) in set {
                    if doc.get(field) != Some(value) {
                        doc.insert(field.clone(), value.clone());
                        changed = true;
                    }
                }
                if changed {
                    modified += 1;
                }
            }
            Ok(ApplyOutcome::updated(positions.len() as u64, modified))
        }

        Payload::Delete { filter, many } => {
            let Some(docs) = data.get_mut(&record.target) else {
                return Ok(ApplyOutcome::deleted(0));
            };
            let positions = matching_positions(docs, filter, *many);
            // Remove from the back so earlier positions stay valid
            for &pos in positions.iter().rev() {
                docs.remove(pos);
            }
            Ok(ApplyOutcome::deleted(positions.len() as u64))
        }
    }
}

fn matching_positions(docs: &[Document], filter: &Filter, many: bool) -> Vec<usize> {
    let iter = docs
        .iter()
        .enumerate()
        .filter(|(_, d)| matches(d, filter))
        .map(|(i, _)| i);
    if many {
        iter.collect()
    } else {
        iter.take(1).collect()
    }
}

fn ensure_unique(docs: &[Document], target: &str, id: &Value) -> Result<(), ApplyError> {
    if docs.iter().any(|d| d.get(ID_FIELD) == Some(id)) {
        return Err(ApplyError::DuplicateKey {
            target: target.to_string(),
            id: id_key(id),
        });
    }
    Ok(())
}
