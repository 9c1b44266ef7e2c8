// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync protocol: wire messages, outbound build and inbound merge.
//!
//! # Outbound (peer link → wire)
//!
//! ```text
//! buffer (dirty names) ──drain──► build_outbound ──► SyncRequest ──► peer
//!                                      ▲                               │
//!                          SyncCursor (name, origin) → version         │
//!                                      └──────── commit on Code == 0 ◄─┘
//! ```
//!
//! The buffer is only a "needs a look" marker: cell data is read from the
//! live [`Counter`] at build time, so a counter drained from the buffer for a
//! send that later fails is not lost. Its cells are still above the cursor and
//! the link re-buffers it.
//!
//! A cell is sent only if its version is above the cursor for
//! `(name, origin node)`. Cells that originate at the receiving peer are never
//! sent back to it.
//!
//! # Inbound (wire → table)
//!
//! Each entry is merged cell by cell with last-writer-wins. Cells claiming to
//! come from the local node are ignored, so a remote echo can never overwrite
//! local authoritative data. Counters that changed are handed back to the
//! caller for re-propagation.

use crate::clock;
use crate::counter::Counter;
use crate::store::CounterTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Response code: merge applied.
pub const SYNC_CODE_SUCCESS: i64 = 0;

/// Response code: request rejected as malformed, nothing applied.
pub const SYNC_CODE_MALFORMED: i64 = 1;

// =============================================================================
// Wire types
// =============================================================================

/// `Hello` request. Carries nothing; the caller only wants the peer's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {}

/// `Hello` response: the answering node's ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    #[serde(rename = "ID")]
    pub id: String,
}

/// One origin node's contribution to one counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNodeValue {
    #[serde(rename = "Value")]
    pub value: i64,
    #[serde(rename = "Version")]
    pub version: i64,
}

/// One counter's entry in a sync message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncVariable {
    #[serde(rename = "NodesValues", default)]
    pub nodes_values: HashMap<String, SyncNodeValue>,
    #[serde(rename = "TTL", default)]
    pub ttl: i64,
    #[serde(rename = "TTLVersion", default)]
    pub ttl_version: i64,
}

/// `Sync` request: the sender's ID and the counters it is pushing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "Variables", default)]
    pub variables: HashMap<String, SyncVariable>,
}

impl SyncRequest {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Total number of cells carried across all entries.
    pub fn cell_count(&self) -> usize {
        self.variables.values().map(|v| v.nodes_values.len()).sum()
    }
}

/// `Sync` response. `Code == 0` is success; anything else means "resend later".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "Code")]
    pub code: i64,
}

impl SyncResponse {
    pub fn success() -> Self {
        Self { code: SYNC_CODE_SUCCESS }
    }

    pub fn malformed() -> Self {
        Self { code: SYNC_CODE_MALFORMED }
    }

    pub fn is_success(&self) -> bool {
        self.code == SYNC_CODE_SUCCESS
    }
}

// =============================================================================
// Anti-entropy cursor
// =============================================================================

/// Highest version of each `(counter, origin node)` pair a peer has acknowledged,
/// plus the highest acknowledged `ttl_version` per counter.
///
/// Entries only move forward. A missing entry reads as `-1` ("never sent").
#[derive(Debug, Default)]
pub struct SyncCursor {
    cells: HashMap<String, HashMap<String, i64>>,
    ttls: HashMap<String, i64>,
}

impl SyncCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sent(&self, name: &str, origin: &str) -> i64 {
        self.cells
            .get(name)
            .and_then(|nodes| nodes.get(origin))
            .copied()
            .unwrap_or(-1)
    }

    pub fn last_sent_ttl(&self, name: &str) -> i64 {
        self.ttls.get(name).copied().unwrap_or(-1)
    }

    fn advance(&mut self, name: &str, origin: &str, version: i64) {
        let slot = self
            .cells
            .entry(name.to_string())
            .or_default()
            .entry(origin.to_string())
            .or_insert(-1);
        *slot = (*slot).max(version);
    }

    fn advance_ttl(&mut self, name: &str, ttl_version: i64) {
        let slot = self.ttls.entry(name.to_string()).or_insert(-1);
        *slot = (*slot).max(ttl_version);
    }

    /// Drop everything known about `name`.
    pub fn forget(&mut self, name: &str) {
        self.cells.remove(name);
        self.ttls.remove(name);
    }

    /// Number of counters tracked.
    pub fn len(&self) -> usize {
        self.cells.len().max(self.ttls.len())
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.ttls.is_empty()
    }
}

// =============================================================================
// Outbound build
// =============================================================================

/// A built outbound message plus what to do with the cursor once it is acknowledged.
#[derive(Debug, Default)]
pub struct OutboundBatch {
    /// The message to send. Empty means "skip the network call".
    pub request: SyncRequest,
    /// Counters whose entries made it into `request`, for re-buffering on failure.
    pub included: Vec<Arc<Counter>>,
    cell_marks: Vec<(String, String, i64)>,
    ttl_marks: Vec<(String, i64, i64)>,
}

impl OutboundBatch {
    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
    }
}

/// Build the outbound message for one peer from counters drained out of its buffer.
///
/// `remote_node_id` is the peer's self-reported ID; its own cells are never echoed to it.
pub fn build_outbound(
    local_node_id: &str,
    remote_node_id: &str,
    drained: impl IntoIterator<Item = Arc<Counter>>,
    cursor: &SyncCursor,
) -> OutboundBatch {
    let mut batch = OutboundBatch {
        request: SyncRequest {
            node_id: local_node_id.to_string(),
            variables: HashMap::new(),
        },
        ..Default::default()
    };

    for counter in drained {
        let name = counter.name();
        let mut entry = SyncVariable::default();

        // A never-written self cell carries nothing worth sending
        let own = counter.self_snapshot();
        if own.version > 0 && own.version > cursor.last_sent(name, local_node_id) {
            entry.nodes_values.insert(
                local_node_id.to_string(),
                SyncNodeValue {
                    value: own.value,
                    version: own.version,
                },
            );
        }

        for (origin, cell) in counter.snapshot_remote() {
            if origin == remote_node_id || origin == local_node_id {
                continue;
            }
            if cell.version > cursor.last_sent(name, &origin) {
                entry.nodes_values.insert(
                    origin,
                    SyncNodeValue {
                        value: cell.value,
                        version: cell.version,
                    },
                );
            }
        }

        let ttl = counter.ttl();
        let ttl_changed = ttl.ttl_version > 0 && ttl.ttl_version > cursor.last_sent_ttl(name);
        if entry.nodes_values.is_empty() && !ttl_changed {
            continue;
        }

        entry.ttl = ttl.ttl;
        entry.ttl_version = ttl.ttl_version;

        for (origin, value) in &entry.nodes_values {
            batch
                .cell_marks
                .push((name.to_string(), origin.clone(), value.version));
        }
        batch
            .ttl_marks
            .push((name.to_string(), ttl.ttl_version, ttl.ttl));
        batch.request.variables.insert(name.to_string(), entry);
        batch.included.push(counter);
    }

    batch
}

/// Whether [`build_outbound`] would send anything for `counter` against `cursor`.
pub fn is_outstanding(
    local_node_id: &str,
    remote_node_id: &str,
    counter: &Counter,
    cursor: &SyncCursor,
) -> bool {
    let name = counter.name();

    let own = counter.self_snapshot();
    if own.version > 0 && own.version > cursor.last_sent(name, local_node_id) {
        return true;
    }

    let ttl = counter.ttl();
    if ttl.ttl_version > 0 && ttl.ttl_version > cursor.last_sent_ttl(name) {
        return true;
    }

    counter.snapshot_remote().into_iter().any(|(origin, cell)| {
        origin != remote_node_id
            && origin != local_node_id
            && cell.version > cursor.last_sent(name, &origin)
    })
}

/// Advance the cursor for everything in an acknowledged batch.
///
/// Counters whose acknowledged TTL has already passed are forgotten
/// entirely; the peer now holds the tombstone and will collect it.
pub fn commit(cursor: &mut SyncCursor, batch: &OutboundBatch) {
    for (name, origin, version) in &batch.cell_marks {
        cursor.advance(name, origin, *version);
    }
    let now = clock::now_nanos();
    for (name, ttl_version, ttl) in &batch.ttl_marks {
        if *ttl != 0 && *ttl < now {
            cursor.forget(name);
        } else {
            cursor.advance_ttl(name, *ttl_version);
        }
    }
}

// =============================================================================
// Inbound merge
// =============================================================================

/// Outcome of merging one inbound request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeStats {
    /// Entries in the request.
    pub variables: usize,
    /// Counters that changed and were handed to `on_changed`.
    pub changed: usize,
    /// Counters created by this request.
    pub created: usize,
    /// Cells ignored because they claimed the local node as origin.
    pub self_cells_ignored: usize,
}

/// Reject requests that cannot be attributed or keyed.
pub fn validate(request: &SyncRequest) -> std::result::Result<(), String> {
    if request.node_id.is_empty() {
        return Err("empty sender node id".to_string());
    }
    if request.variables.keys().any(|name| name.is_empty()) {
        return Err("empty counter name".to_string());
    }
    if request
        .variables
        .values()
        .any(|v| v.nodes_values.keys().any(|node| node.is_empty()))
    {
        return Err("empty origin node id".to_string());
    }
    Ok(())
}

/// Merge a validated request into `table`.
///
/// `on_changed` is called once per counter whose state changed, so the
/// caller can push it back onto its fan-out.
pub fn merge_inbound(
    table: &CounterTable,
    local_node_id: &str,
    request: &SyncRequest,
    mut on_changed: impl FnMut(Arc<Counter>),
) -> MergeStats {
    let mut stats = MergeStats {
        variables: request.variables.len(),
        ..Default::default()
    };

    for (name, entry) in &request.variables {
        let (counter, created) = table.get_or_create(name);
        if created {
            stats.created += 1;
        }

        let mut changed = false;
        for (origin, cell) in &entry.nodes_values {
            if origin == local_node_id {
                stats.self_cells_ignored += 1;
                continue;
            }
            changed |= counter.merge_remote(origin, cell.value, cell.version);
        }
        changed |= counter.merge_ttl(entry.ttl, entry.ttl_version);

        if changed {
            stats.changed += 1;
            on_changed(counter);
        }
    }

    stats
}
