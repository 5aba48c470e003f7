// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Fault-injecting store and channel wrappers
//! - Document helpers

#![allow(dead_code)]

pub mod containers;
pub mod faulty;

pub use containers::*;
pub use faulty::*;

use std::time::Duration;
use store_replication::store::MemoryStore;
use store_replication::Document;

/// Build a document from a JSON object literal.
pub fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Poll until `store` holds `expected` documents in `target`.
pub async fn wait_for_count(store: &MemoryStore, target: &str, expected: usize) {
    for _ in 0..300 {
        if store.count(target).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "store never reached {} documents in '{}' (has {})",
        expected,
        target,
        store.count(target).await
    );
}
