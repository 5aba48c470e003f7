// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for operation record decoding.
//!
//! `OperationRecord::decode` must never panic, and anything it accepts must
//! re-encode to a payload that decodes to the same record.

#![no_main]

use libfuzzer_sys::fuzz_target;
use store_replication::OperationRecord;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = OperationRecord::decode(data) {
        let _ = record.validate();
        let encoded = record.encode().expect("decoded record re-encodes");
        let again = OperationRecord::decode(&encoded).expect("re-encoded record decodes");
        assert_eq!(record, again);
    }
});
