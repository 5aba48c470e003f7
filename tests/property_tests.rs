// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;
use store_replication::channel::redis::{compute_content_hash, parse_stream_id_timestamp};
use store_replication::record::{id_filter, Document, Filter};
use store_replication::resilience::RetryConfig;
use store_replication::store::{MemoryStore, SqliteStore, StoreAdapter};
use store_replication::{ApplyError, ApplyOutcome, OperationRecord};

// =============================================================================
// Operation record decoding
// =============================================================================

proptest! {
    /// Arbitrary bytes never panic the decoder
    #[test]
    fn decode_arbitrary_bytes_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = OperationRecord::decode(&data);
    }

    /// Any tag outside the closed set is rejected as an unknown kind
    #[test]
    fn decode_unknown_kind_rejected(kind in "[a-z]{1,12}") {
        prop_assume!(!["insert", "update", "delete"].contains(&kind.as_str()));
        let payload = json!({"kind": kind, "target": "products", "document": {"id": 1}}).to_string();

        let err = OperationRecord::decode(payload.as_bytes()).unwrap_err();
        prop_assert_eq!(err, ApplyError::UnknownOperationKind(kind));
    }

    /// Pinning identity is idempotent and keeps explicit ids
    #[test]
    fn assign_identity_idempotent(id in prop::option::of(0i64..1000), upsert in any::<bool>()) {
        let mut filter = Filter::new();
        if let Some(id) = id {
            filter.insert("id".into(), json!(id));
        }
        let mut set = Document::new();
        set.insert("v".into(), json!(1));
        let mut record = OperationRecord::update("carts", filter, set);
        if upsert {
            record = record.upsert();
        }

        let once = record.assign_identity();
        let twice = once.clone().assign_identity();
        prop_assert_eq!(&once, &twice);
        if let (true, Some(id)) = (upsert, id) {
            prop_assert_eq!(once.pinned_id(), Some(&json!(id)));
        }
    }
}

// =============================================================================
// Store adapter equivalence (document vs relational)
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert { id: i64, v: i64 },
    UpdateWhere { v: i64, w: i64, many: bool },
    UpsertById { id: i64, v: i64 },
    DeleteWhere { v: i64, many: bool },
}

impl Op {
    fn record(&self) -> OperationRecord {
        let one = |k: &str, value: i64| {
            let mut map = Document::new();
            map.insert(k.to_string(), json!(value));
            map
        };
        let record = match *self {
            Op::Insert { id, v } => {
                let mut document = one("id", id);
                document.insert("v".into(), json!(v));
                OperationRecord::insert("items", document)
            }
            Op::UpdateWhere { v, w, many } => {
                let record = OperationRecord::update("items", one("v", v), one("w", w));
                if many {
                    record.many()
                } else {
                    record
                }
            }
            Op::UpsertById { id, v } => OperationRecord::update("items", id_filter(json!(id)), one("v", v)).upsert(),
            Op::DeleteWhere { v, many } => {
                let record = OperationRecord::delete("items", one("v", v));
                if many {
                    record.many()
                } else {
                    record
                }
            }
        };
        record.assign_identity()
    }
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..5, 0i64..3).prop_map(|(id, v)| Op::Insert { id, v }),
        (0i64..3, 0i64..3, any::<bool>()).prop_map(|(v, w, many)| Op::UpdateWhere { v, w, many }),
        (0i64..5, 0i64..3).prop_map(|(id, v)| Op::UpsertById { id, v }),
        (0i64..3, any::<bool>()).prop_map(|(v, many)| Op::DeleteWhere { v, many }),
    ]
}

/// Comparable view of an apply result.
fn summarize(result: Result<ApplyOutcome, ApplyError>) -> Result<ApplyOutcome, &'static str> {
    result.map_err(|e| if e.is_duplicate_key() { "duplicate" } else { "other" })
}

/// Drop NULL columns a relational row carries for fields the document never had.
fn strip_nulls(docs: Vec<Document>) -> Vec<Document> {
    docs.into_iter()
        .map(|d| d.into_iter().filter(|(_, v)| !v.is_null()).collect())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The same record sequence yields the same outcomes and final rows
    /// on the document store and the relational store
    #[test]
    fn memory_and_sqlite_agree(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let memory = MemoryStore::new("documents");
            let sqlite = SqliteStore::in_memory("relational").await.unwrap();

            for op in &ops {
                let record = op.record();
                let left = summarize(memory.apply(&record).await);
                let right = summarize(sqlite.apply(&record).await);
                prop_assert_eq!(left, right, "diverged on {:?}", op);
            }

            let left = memory.find("items", &Filter::new()).await.unwrap();
            let right = strip_nulls(sqlite.find("items", &Filter::new()).await.unwrap());
            prop_assert_eq!(left, right);
            Ok(())
        })?;
    }

    /// Inserting the same identified record twice changes nothing the second time
    #[test]
    fn insert_is_idempotent_by_identity(id in 0i64..1000, name in "[a-zA-Z ]{0,16}") {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new("secondary");
            let mut document = Document::new();
            document.insert("id".into(), json!(id));
            document.insert("name".into(), Value::String(name));
            let record = OperationRecord::insert("products", document);

            prop_assert_eq!(store.apply(&record).await.unwrap(), ApplyOutcome::inserted(json!(id)));
            let before = store.snapshot().await;
            prop_assert!(store.apply(&record).await.unwrap_err().is_duplicate_key());
            prop_assert_eq!(store.snapshot().await, before);
            Ok(())
        })?;
    }
}

// =============================================================================
// Redelivery backoff
// =============================================================================

proptest! {
    /// Delays never exceed the ceiling and never shrink between attempts
    #[test]
    fn backoff_bounded_and_monotonic(
        initial_ms in 1u64..1000,
        max_ms in 1u64..60_000,
        factor in 1.0f64..4.0,
        attempt in 1usize..200,
    ) {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms.max(initial_ms)),
            backoff_factor: factor,
            max_deliveries: None,
        };

        let current = config.delay_for_attempt(attempt);
        let next = config.delay_for_attempt(attempt + 1);
        prop_assert!(current <= config.max_delay);
        prop_assert!(next >= current);
    }

    /// A bounded config is exhausted exactly from `max` deliveries on
    #[test]
    fn exhaustion_threshold(max in 1u32..50, count in 0u32..100) {
        let config = RetryConfig { max_deliveries: Some(max), ..RetryConfig::default() };
        prop_assert_eq!(config.exhausted(count), count >= max);
        prop_assert!(!RetryConfig::unbounded().exhausted(count));
    }
}

// =============================================================================
// Stream ID and digest properties
// =============================================================================

proptest! {
    /// Timestamp parsing recovers the millisecond part
    #[test]
    fn stream_id_timestamp_parsing(ts in 0u64..u64::MAX, seq in 0u64..1000u64) {
        prop_assert_eq!(parse_stream_id_timestamp(&format!("{}-{}", ts, seq)), Some(ts));
    }

    /// Digest is deterministic, 64 hex chars, and sensitive to any change
    #[test]
    fn content_hash_properties(data in prop::collection::vec(any::<u8>(), 1..2048), flip in any::<prop::sample::Index>()) {
        let hash = compute_content_hash(&data);
        prop_assert_eq!(hash.len(), 64);
        prop_assert_eq!(&hash, &compute_content_hash(&data));

        let mut tampered = data.clone();
        let i = flip.index(tampered.len());
        tampered[i] ^= 0x01;
        prop_assert_ne!(hash, compute_content_hash(&tampered));
    }
}
