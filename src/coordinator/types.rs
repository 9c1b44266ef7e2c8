// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core state and result types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                shutdown()
//! Created ───────────→ Running ───────────────→ ShuttingDown ──→ Stopped
//!    │                                                              ↑
//!    └─────────────────────── shutdown() ───────────────────────────┘
//! ```
//!
//! - **Created**: after `ReplicationCore::new()`. Local API and inbound sync
//!   already work; changes queue on the fan-out until start.
//! - **Running**: links, fan-out dispatcher, GC and discovery are live.
//! - **ShuttingDown**: links stopping, tasks draining.
//! - **Stopped**: terminal. The local API still answers; nothing replicates.

use std::collections::HashMap;

/// State of the replication core.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::ReplicationCore::start) to begin replication.
    Created,

    /// Running and replicating.
    Running,

    /// Shutting down. Links are stopped, background tasks are draining.
    ShuttingDown,

    /// Stopped. Not restartable.
    Stopped,
}

impl std::fmt::Display for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreState::Created => write!(f, "Created"),
            CoreState::Running => write!(f, "Running"),
            CoreState::ShuttingDown => write!(f, "ShuttingDown"),
            CoreState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Result of [`ReplicationCore::all()`](super::ReplicationCore::all).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllCounters {
    /// Counters with no TTL or a TTL in the future.
    pub live: HashMap<String, i64>,
    /// Counters past their TTL that GC has not removed yet.
    pub expired: HashMap<String, i64>,
}

/// Per-link health, for status endpoints. Collected without network I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHealth {
    pub addr: String,
    /// Set once `Hello` succeeded.
    pub remote_node_id: Option<String>,
    pub connected: bool,
    pub buffered: usize,
    pub failure_count: u64,
    /// `u64::MAX` if the link never succeeded.
    pub millis_since_success: u64,
}
