// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Counter Replication
//!
//! An eventually consistent, replicated key → integer counter store.
//!
//! ## Architecture
//!
//! Every node keeps a table of PN-counters. A counter's value is the sum of
//! one cell per node that ever wrote to it; each cell carries a version and
//! merges by last-writer-wins, so merges are idempotent and order-free.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            ReplicationCore                               │
//! │                                                                          │
//! │  upsert / update_ttl / delete          Sync (inbound, SyncHandler)       │
//! │            │                                    │                        │
//! │            ▼                                    ▼                        │
//! │  ┌──────────────────┐  changed   ┌─────────────────────────────────┐     │
//! │  │   CounterTable   │──────────► │ fan-out queue → dispatcher      │     │
//! │  │ (Counter = cells)│            └─────────────────────────────────┘     │
//! │  └──────────────────┘                   │            │                   │
//! │            ▲                            ▼            ▼                   │
//! │            │ GC sweep            ┌───────────┐ ┌───────────┐             │
//! │                                  │ PeerLink  │ │ PeerLink  │  ...        │
//! │                                  │ buffer +  │ │ buffer +  │             │
//! │                                  │ cursor    │ │ cursor    │             │
//! │                                  └─────┬─────┘ └─────┬─────┘             │
//! └────────────────────────────────────────┼─────────────┼───────────────────┘
//!                                          ▼             ▼
//!                                 PeerClient::sync (Hello, Sync RPCs)
//! ```
//!
//! Each link sends only the cells whose version moved past what that peer
//! last acknowledged, so steady-state traffic is proportional to what
//! changed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use counter_replication::{LocalNetwork, PeerConfig, ReplicationConfig, ReplicationCore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = LocalNetwork::new();
//!     let mut config = ReplicationConfig::for_testing("node-a");
//!     config.peers.push(PeerConfig::new("node-b:7946"));
//!
//!     let mut core = ReplicationCore::new(config, Arc::new(network.clone()))
//!         .expect("valid config");
//!     network.register("node-a:7946", core.handler());
//!     core.start().await.expect("Failed to start");
//!
//!     core.upsert("requests", 1);
//!
//!     core.shutdown().await;
//! }
//! ```

pub mod cell;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod counter;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod protocol;
pub mod resilience;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::{BusyPolicy, PeerConfig, ReplicationConfig, ReplicationSettings};
pub use coordinator::{
    AllCounters, CoreHandle, CoreState, PeerHealth, PeerProvider, ReplicationCore,
};
pub use counter::Counter;
pub use error::{ReplicationError, Result};
pub use peer::{PeerLink, PeerManager, PeerState, SyncOutcome};
pub use transport::{LocalNetwork, PeerClient, PeerConnector, SyncHandler, TransportError};
