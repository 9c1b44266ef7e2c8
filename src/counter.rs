// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! A replicated PN-counter.
//!
//! A [`Counter`] is the sum of this node's own [`CounterCell`] and the last
//! known cell of every remote node that ever reported a value for it:
//!
//! ```text
//! aggregate = self.value + Σ remote[node].value
//! ```
//!
//! Remote cells only ever change through [`CounterCell::apply_if_newer`], so
//! re-applying the same or an older `(value, version)` pair is a no-op. That is
//! what makes the aggregate converge regardless of delivery order or
//! duplication.
//!
//! # TTL
//!
//! `ttl` is an absolute expiry in epoch nanoseconds (`0` = never). It carries
//! its own `ttl_version` and merges with the same last-writer-wins rule as a
//! cell.
//!
//! # Read cache
//!
//! With [`Counter::with_read_cache`], [`Counter::get`] serves the aggregate
//! from a snapshot for up to the configured window. The snapshot is
//! invalidated by time only: a read right after a local write may return the
//! previous aggregate for at most one window. [`Counter::aggregate`] always
//! recomputes.

use crate::cell::{CellSnapshot, CounterCell};
use crate::clock;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A consistent copy of a counter's TTL pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtlSnapshot {
    pub ttl: i64,
    pub ttl_version: i64,
}

impl TtlSnapshot {
    /// True when a TTL is set and lies strictly before `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.ttl != 0 && self.ttl < now
    }
}

struct AggregateCache {
    window: Duration,
    slot: Mutex<Option<(Instant, i64)>>,
}

/// A named counter: local cell, remote cells, TTL.
pub struct Counter {
    name: String,
    self_cell: CounterCell,
    remote: RwLock<HashMap<String, CounterCell>>,
    ttl: Mutex<TtlSnapshot>,
    cache: Option<AggregateCache>,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.name)
            .field("self", &self.self_cell.snapshot())
            .field("remote_nodes", &self.remote.read().len())
            .field("ttl", &*self.ttl.lock())
            .finish()
    }
}

impl Counter {
    /// Create an empty counter with no TTL and no read cache.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            self_cell: CounterCell::new(),
            remote: RwLock::new(HashMap::new()),
            ttl: Mutex::new(TtlSnapshot::default()),
            cache: None,
        }
    }

    /// Create an empty counter whose `get()` is cached for `window`.
    pub fn with_read_cache(name: impl Into<String>, window: Duration) -> Self {
        Self {
            cache: Some(AggregateCache {
                window,
                slot: Mutex::new(None),
            }),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aggregate value, possibly served from the read cache.
    pub fn get(&self) -> i64 {
        let Some(cache) = &self.cache else {
            return self.aggregate();
        };

        let mut slot = cache.slot.lock();
        if let Some((at, value)) = *slot {
            if at.elapsed() < cache.window {
                return value;
            }
        }
        let value = self.aggregate();
        *slot = Some((Instant::now(), value));
        value
    }

    /// Aggregate value, always recomputed.
    pub fn aggregate(&self) -> i64 {
        let remote = self.remote.read();
        remote
            .values()
            .fold(self.self_cell.value(), |acc, cell| acc.wrapping_add(cell.value()))
    }

    /// Apply a local delta. Returns this node's new contribution.
    pub fn update(&self, delta: i64) -> i64 {
        self.self_cell.update(delta)
    }

    /// Set the TTL (epoch nanos, `0` clears it) with a fresh `ttl_version`.
    ///
    /// Also touches the self cell so the change is picked up by the next
    /// outbound build even on peers whose TTL cursor is ahead.
    pub fn update_ttl(&self, ttl: i64) {
        {
            let mut state = self.ttl.lock();
            state.ttl = ttl;
            state.ttl_version = clock::next_version(state.ttl_version);
        }
        self.self_cell.touch();
    }

    /// Merge one remote node's cell. Returns true if anything changed.
    ///
    /// The first report of a node always counts as a change, even at value 0,
    /// so that its existence is gossiped on.
    pub fn merge_remote(&self, node_id: &str, value: i64, version: i64) -> bool {
        if let Some(cell) = self.remote.read().get(node_id) {
            return cell.apply_if_newer(value, version);
        }

        let mut remote = self.remote.write();
        match remote.get(node_id) {
            // Raced with another merge between the locks
            Some(cell) => cell.apply_if_newer(value, version),
            None => {
                remote.insert(node_id.to_string(), CounterCell::with_state(value, version));
                true
            }
        }
    }

    /// Merge a remote TTL pair. Returns true if it applied.
    pub fn merge_ttl(&self, ttl: i64, ttl_version: i64) -> bool {
        let mut state = self.ttl.lock();
        if ttl_version > state.ttl_version {
            state.ttl = ttl;
            state.ttl_version = ttl_version;
            true
        } else {
            false
        }
    }

    pub fn ttl(&self) -> TtlSnapshot {
        *self.ttl.lock()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.ttl().is_expired_at(now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(clock::now_nanos())
    }

    pub fn self_snapshot(&self) -> CellSnapshot {
        self.self_cell.snapshot()
    }

    /// Value copies of all remote cells.
    pub fn snapshot_remote(&self) -> HashMap<String, CellSnapshot> {
        self.remote
            .read()
            .iter()
            .map(|(node, cell)| (node.clone(), cell.snapshot()))
            .collect()
    }

    /// Number of remote nodes that have reported a value.
    pub fn remote_len(&self) -> usize {
        self.remote.read().len()
    }
}
