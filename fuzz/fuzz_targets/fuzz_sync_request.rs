// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for the inbound sync path.
//!
//! Arbitrary bytes are decoded as a `SyncRequest`, validated and merged into
//! a table. Nothing here may panic, and a cell claiming the local node must
//! never reach the self cell.

#![no_main]

use counter_replication::counter::Counter;
use counter_replication::protocol::{self, SyncRequest};
use counter_replication::store::CounterTable;
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let Ok(request) = serde_json::from_slice::<SyncRequest>(data) else {
        return;
    };

    let table = CounterTable::new(None);
    let (existing, _) = table.get_or_create("x");
    existing.update(1);
    let before = existing.self_snapshot();

    if protocol::validate(&request).is_err() {
        return;
    }

    let mut changed: Vec<Arc<Counter>> = Vec::new();
    let stats = protocol::merge_inbound(&table, "local", &request, |c| changed.push(c));
    assert_eq!(stats.changed, changed.len());
    assert_eq!(existing.self_snapshot(), before);

    // Replaying the same request is a no-op
    let replay = protocol::merge_inbound(&table, "local", &request, |_| {});
    assert_eq!(replay.changed, 0);

    for counter in table.snapshot() {
        let _ = counter.aggregate();
    }
});
