// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One node's contribution to one counter.
//!
//! A [`CounterCell`] holds a `(value, version)` pair. The pair is updated as a
//! unit under a tiny mutex so a reader never pairs a new value with an old
//! version (which would let a peer accept a value under a version that a
//! later, different value also carries).

use crate::clock;
use parking_lot::Mutex;

/// A consistent copy of a cell's `(value, version)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellSnapshot {
    pub value: i64,
    pub version: i64,
}

/// An atomically updatable `(value, version)` pair.
#[derive(Debug, Default)]
pub struct CounterCell {
    state: Mutex<CellSnapshot>,
}

impl CounterCell {
    /// A fresh cell at `(0, 0)`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cell seeded with a known pair (used when a remote node is first seen).
    pub fn with_state(value: i64, version: i64) -> Self {
        Self {
            state: Mutex::new(CellSnapshot { value, version }),
        }
    }

    pub fn value(&self) -> i64 {
        self.state.lock().value
    }

    pub fn version(&self) -> i64 {
        self.state.lock().version
    }

    pub fn snapshot(&self) -> CellSnapshot {
        *self.state.lock()
    }

    /// Add `delta` and stamp a fresh version. Returns the new value.
    pub fn update(&self, delta: i64) -> i64 {
        let mut state = self.state.lock();
        state.value = state.value.wrapping_add(delta);
        state.version = clock::next_version(state.version);
        state.value
    }

    /// Stamp a fresh version without changing the value.
    pub fn touch(&self) -> i64 {
        let mut state = self.state.lock();
        state.version = clock::next_version(state.version);
        state.version
    }

    /// Overwrite the pair iff `version` is strictly newer. Returns whether it applied.
    pub fn apply_if_newer(&self, value: i64, version: i64) -> bool {
        let mut state = self.state.lock();
        if version > state.version {
            state.value = value;
            state.version = version;
            true
        } else {
            false
        }
    }
}
