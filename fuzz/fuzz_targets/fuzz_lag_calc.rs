// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for lag calculation.
//!
//! This tests that `calculate_lag_ms` and `parse_stream_id_timestamp`
//! never panic on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use store_replication::channel::redis::{calculate_lag_ms, parse_stream_id_timestamp};

fuzz_target!(|data: (&str, &str)| {
    let (oldest, latest) = data;

    let _ = parse_stream_id_timestamp(oldest);
    let _ = parse_stream_id_timestamp(latest);
    let _ = calculate_lag_ms(oldest, latest);
});
