// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The local counter table.
//!
//! Membership (insert/delete) goes through one read/write lock. Value updates
//! happen on the `Arc<Counter>` after the lock is released, so hot increments
//! never hold the table lock.

use crate::counter::Counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Name-keyed table of live counters.
pub struct CounterTable {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    read_cache: Option<Duration>,
}

impl CounterTable {
    /// Create an empty table. `read_cache` enables per-counter aggregate caching.
    pub fn new(read_cache: Option<Duration>) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            read_cache,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Counter>> {
        self.counters.read().get(name).cloned()
    }

    /// Find-or-create. Returns the counter and whether it was created.
    pub fn get_or_create(&self, name: &str) -> (Arc<Counter>, bool) {
        if let Some(counter) = self.get(name) {
            return (counter, false);
        }

        let mut counters = self.counters.write();
        if let Some(counter) = counters.get(name) {
            return (Arc::clone(counter), false);
        }
        let counter = Arc::new(match self.read_cache {
            Some(window) => Counter::with_read_cache(name, window),
            None => Counter::new(name),
        });
        counters.insert(name.to_string(), Arc::clone(&counter));
        (counter, true)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Counter>> {
        self.counters.write().remove(name)
    }

    /// Remove `name` only if it is still expired at removal time.
    pub fn remove_if_expired(&self, name: &str, now: i64) -> bool {
        let mut counters = self.counters.write();
        match counters.get(name) {
            Some(counter) if counter.is_expired_at(now) => {
                counters.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Two-phase expiry sweep: collect candidates under the read lock, then
    /// delete under the write lock, re-checking each candidate against a fresh
    /// `now` so an entry refreshed in between survives.
    pub fn sweep_expired(&self, now: impl Fn() -> i64) -> Vec<String> {
        let scan_at = now();
        let candidates: Vec<String> = self
            .counters
            .read()
            .iter()
            .filter(|(_, c)| c.is_expired_at(scan_at))
            .map(|(name, _)| name.clone())
            .collect();

        if candidates.is_empty() {
            return candidates;
        }

        let delete_at = now();
        let mut counters = self.counters.write();
        candidates
            .into_iter()
            .filter(|name| match counters.get(name) {
                Some(c) if c.is_expired_at(delete_at) => {
                    counters.remove(name);
                    true
                }
                _ => false,
            })
            .collect()
    }

    /// All counters currently in the table.
    pub fn snapshot(&self) -> Vec<Arc<Counter>> {
        self.counters.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.read().is_empty()
    }
}
