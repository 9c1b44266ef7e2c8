// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication core.
//!
//! The orchestrator that ties together:
//! - The local counter table via [`crate::store::CounterTable`]
//! - Peer links via [`crate::peer::PeerManager`]
//! - The fan-out dispatcher that feeds changed counters to every link
//! - Expiry GC and peer-set reconciliation
//!
//! # Architecture
//!
//! ```text
//!  local API (upsert / update_ttl / delete)      inbound Sync (SyncHandler)
//!                 │                                      │ merge_inbound
//!                 └──────────────┬───────────────────────┘
//!                                ▼
//!                         CounterTable ── changed counter ──► fan-out queue
//!                                                                  │
//!                                                 dispatcher (for_each_concurrent)
//!                                                                  │
//!                                     PeerLink ◄──── PeerLink ◄────┘
//! ```
//!
//! Inbound merges re-enqueue what changed, so a node relays state it learned
//! from one peer to the others.

mod fanout;
mod maintenance;
mod types;

pub use maintenance::PeerProvider;
pub use types::{AllCounters, CoreState, PeerHealth};

use crate::clock;
use crate::config::ReplicationConfig;
use crate::counter::Counter;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::{LinkContext, LinkRegistry, PeerManager};
use crate::protocol::{self, HelloResponse, SyncRequest, SyncResponse};
use crate::store::CounterTable;
use crate::transport::{PeerConnector, SyncHandler};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared between the core and the handles it gives to transports.
struct CoreShared {
    local_node_id: String,
    table: Arc<CounterTable>,
    fanout_tx: mpsc::Sender<Arc<Counter>>,
    read_only: AtomicBool,
}

impl CoreShared {
    /// Queue a changed counter for every peer. Never blocks.
    fn enqueue(&self, counter: Arc<Counter>) {
        if self.read_only.load(Ordering::Acquire) {
            return;
        }

        match self.fanout_tx.try_send(counter) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(counter)) => {
                error!(counter = %counter.name(), "Fan-out queue full, update dropped");
                metrics::record_fanout_dropped("queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(counter)) => {
                debug!(counter = %counter.name(), "Fan-out closed, update dropped");
                metrics::record_fanout_dropped("closed");
            }
        }
    }

    fn hello(&self) -> HelloResponse {
        HelloResponse {
            id: self.local_node_id.clone(),
        }
    }

    fn handle_sync(&self, request: SyncRequest) -> SyncResponse {
        if let Err(reason) = protocol::validate(&request) {
            warn!(remote_node_id = %request.node_id, reason = %reason, "Rejecting malformed sync");
            metrics::record_sync_rejected("malformed");
            return SyncResponse::malformed();
        }

        let stats = protocol::merge_inbound(&self.table, &self.local_node_id, &request, |counter| {
            self.enqueue(counter)
        });

        metrics::record_variables_received(&request.node_id, stats.variables);
        if stats.created > 0 {
            metrics::set_counters(self.table.len());
        }
        if stats.self_cells_ignored > 0 {
            warn!(
                remote_node_id = %request.node_id,
                cells = stats.self_cells_ignored,
                "Ignored cells claiming the local node as origin"
            );
        }
        debug!(
            remote_node_id = %request.node_id,
            variables = stats.variables,
            changed = stats.changed,
            created = stats.created,
            "Merged inbound sync"
        );

        SyncResponse::success()
    }
}

/// Inbound RPC handle for a [`ReplicationCore`].
///
/// Cheap to clone, and outlives nothing: it keeps the counter table alive but
/// not the core's background tasks. Register it with whatever server the
/// embedding service runs.
#[derive(Clone)]
pub struct CoreHandle {
    shared: Arc<CoreShared>,
}

impl SyncHandler for CoreHandle {
    fn hello(&self) -> HelloResponse {
        self.shared.hello()
    }

    fn sync(&self, request: SyncRequest) -> SyncResponse {
        self.shared.handle_sync(request)
    }
}

/// The replication core.
///
/// Owns the local counter table and replicates every change to its peers.
/// The local API is synchronous and works in every state; replication only
/// runs between [`start()`](Self::start) and [`shutdown()`](Self::shutdown).
pub struct ReplicationCore {
    config: ReplicationConfig,

    shared: Arc<CoreShared>,

    /// Core state (broadcast to watchers)
    state_tx: watch::Sender<CoreState>,

    /// Core state receiver (for internal use)
    state_rx: watch::Receiver<CoreState>,

    /// Shutdown signal for the dispatcher, GC and discovery tasks
    shutdown_tx: watch::Sender<bool>,

    shutdown_rx: watch::Receiver<bool>,

    peers: Arc<PeerManager>,

    /// Taken by the dispatcher at start
    fanout_rx: Option<mpsc::Receiver<Arc<Counter>>>,

    peer_provider: Option<PeerProvider>,

    handles: Vec<JoinHandle<()>>,
}

impl ReplicationCore {
    /// Create a core in the `Created` state.
    ///
    /// An empty `local_node_id` is replaced with a random UUID.
    pub fn new(mut config: ReplicationConfig, connector: Arc<dyn PeerConnector>) -> Result<Self> {
        config.validate()?;
        if config.local_node_id.is_empty() {
            config.local_node_id = uuid::Uuid::new_v4().to_string();
            info!(node_id = %config.local_node_id, "Generated local node id");
        }

        let settings = &config.settings;
        let table = Arc::new(CounterTable::new(settings.read_cache.window()));
        let (fanout_tx, fanout_rx) = mpsc::channel(settings.fanout.channel_capacity);
        let (state_tx, state_rx) = watch::channel(CoreState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(LinkContext {
            local_node_id: config.local_node_id.clone(),
            settings: settings.peer_link.clone(),
            connector,
            table: Arc::clone(&table),
            registry: Arc::new(LinkRegistry::new()),
        });

        let shared = Arc::new(CoreShared {
            local_node_id: config.local_node_id.clone(),
            table,
            fanout_tx,
            read_only: AtomicBool::new(settings.read_only),
        });

        Ok(Self {
            config,
            shared,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            peers: Arc::new(PeerManager::new(ctx)),
            fanout_rx: Some(fanout_rx),
            peer_provider: None,
            handles: Vec::new(),
        })
    }

    /// Replace the static peer list with a provider polled every
    /// `discovery.interval`.
    pub fn with_peer_provider(mut self, provider: PeerProvider) -> Self {
        self.peer_provider = Some(provider);
        self
    }

    // =========================================================================
    // Local API
    // =========================================================================

    /// Current aggregate of `name`.
    ///
    /// An expired counter is removed on the spot and reported as `Expired`.
    pub fn get(&self, name: &str) -> Result<i64> {
        let counter = self
            .shared
            .table
            .get(name)
            .ok_or_else(|| ReplicationError::NotExists(name.to_string()))?;

        if counter.is_expired() {
            if self.shared.table.remove_if_expired(name, clock::now_nanos()) {
                debug!(counter = %name, "Removed expired counter on read");
            }
            return Err(ReplicationError::Expired(name.to_string()));
        }
        Ok(counter.get())
    }

    /// Add `delta` to this node's contribution, creating the counter if needed.
    /// Returns the new aggregate.
    pub fn upsert(&self, name: &str, delta: i64) -> i64 {
        let (counter, created) = self.shared.table.get_or_create(name);
        counter.update(delta);
        let value = counter.aggregate();
        if created {
            metrics::set_counters(self.shared.table.len());
        }
        self.shared.enqueue(counter);
        value
    }

    /// Set an absolute expiry on `name`.
    pub fn update_ttl(&self, name: &str, ttl: DateTime<Utc>) -> Result<()> {
        let ttl = clock::to_nanos(ttl);
        if ttl < clock::now_nanos() {
            return Err(ReplicationError::TtlInPast {
                name: name.to_string(),
            });
        }

        let counter = self
            .shared
            .table
            .get(name)
            .ok_or_else(|| ReplicationError::NotExists(name.to_string()))?;
        counter.update_ttl(ttl);
        self.shared.enqueue(counter);
        Ok(())
    }

    /// Expire `name` everywhere and drop it locally.
    ///
    /// The tombstone (a TTL one second in the past) is replicated; peers drop
    /// the counter on their next read or GC sweep.
    pub fn delete(&self, name: &str) -> Result<()> {
        let counter = self
            .shared
            .table
            .get(name)
            .ok_or_else(|| ReplicationError::NotExists(name.to_string()))?;

        counter.update_ttl(clock::now_nanos() - 1_000_000_000);
        self.shared.enqueue(counter);
        self.shared.table.remove(name);
        metrics::set_counters(self.shared.table.len());
        debug!(counter = %name, "Counter deleted");
        Ok(())
    }

    /// Every counter in the table, split by expiry.
    pub fn all(&self) -> AllCounters {
        let now = clock::now_nanos();
        let mut all = AllCounters::default();
        for counter in self.shared.table.snapshot() {
            let value = counter.get();
            let name = counter.name().to_string();
            if counter.is_expired_at(now) {
                all.expired.insert(name, value);
            } else {
                all.live.insert(name, value);
            }
        }
        all
    }

    /// Direct access to a counter, expired or not.
    pub fn counter(&self, name: &str) -> Option<Arc<Counter>> {
        self.shared.table.get(name)
    }

    /// A handle to register with the inbound RPC server.
    pub fn handler(&self) -> Arc<dyn SyncHandler> {
        Arc::new(CoreHandle {
            shared: Arc::clone(&self.shared),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn local_node_id(&self) -> &str {
        &self.shared.local_node_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Get current core state.
    pub fn state(&self) -> CoreState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<CoreState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), CoreState::Running)
    }

    /// True when local changes are not replicated.
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::Acquire)
    }

    /// Get the peer manager (for diagnostics).
    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    /// Links that completed `Hello`, by remote node ID.
    pub fn registry(&self) -> &Arc<LinkRegistry> {
        self.peers.registry()
    }

    /// Per-link health. Performs no network I/O.
    pub fn peer_health(&self) -> Vec<PeerHealth> {
        self.peers
            .all()
            .into_iter()
            .map(|link| PeerHealth {
                addr: link.addr().to_string(),
                remote_node_id: link.remote_node_id(),
                connected: link.is_connected(),
                buffered: link.buffer_len(),
                failure_count: link.failure_count(),
                millis_since_success: link.millis_since_success(),
            })
            .collect()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn set_state(&self, state: CoreState) {
        self.state_tx.send_replace(state);
        metrics::set_core_state(&state.to_string());
    }

    /// Start replication.
    ///
    /// 1. Spawns the fan-out dispatcher and the GC task
    /// 2. Unless read-only, links the peers: from the provider if one is
    ///    installed (plus a discovery task), else from the static config
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != CoreState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        let Some(fanout_rx) = self.fanout_rx.take() else {
            return Err(ReplicationError::Internal("fan-out receiver already taken".to_string()));
        };

        let settings = &self.config.settings;
        info!(
            node_id = %self.shared.local_node_id,
            peer_count = self.config.peers.len(),
            read_only = self.is_read_only(),
            "Starting replication core"
        );

        self.handles.push(tokio::spawn(fanout::run_dispatcher(
            fanout_rx,
            Arc::clone(self.peers.registry()),
            settings.fanout.dispatch_timeout_duration(),
            settings.fanout.max_concurrent,
            self.shutdown_rx.clone(),
        )));

        self.handles.push(tokio::spawn(maintenance::run_gc(
            Arc::clone(&self.shared.table),
            settings.gc.interval_duration(),
            self.shutdown_rx.clone(),
        )));

        if self.is_read_only() {
            info!("Read-only node, no peer links started");
        } else if let Some(provider) = self.peer_provider.clone() {
            maintenance::reconcile(provider.as_ref(), &self.peers);
            self.handles.push(tokio::spawn(maintenance::run_discovery(
                provider,
                Arc::clone(&self.peers),
                settings.discovery.interval_duration(),
                self.shutdown_rx.clone(),
            )));
        } else {
            for peer in &self.config.peers {
                self.peers.add_peer(peer.clone());
            }
        }

        self.set_state(CoreState::Running);
        metrics::set_counters(self.shared.table.len());
        info!(peers = self.peers.len(), "Replication core running");
        Ok(())
    }

    /// Stop replicating. Idempotent.
    ///
    /// Local writes keep working afterwards but are no longer sent anywhere.
    ///
    /// Shutdown sequence:
    /// 1. Switch to read-only so nothing new enters the fan-out
    /// 2. Signal the dispatcher, GC and discovery tasks and stop every link
    /// 3. Wait for all tasks (bounded)
    pub async fn shutdown(&mut self) {
        if self.state() == CoreState::Stopped {
            return;
        }

        info!("Shutting down replication core");
        self.shared.read_only.store(true, Ordering::Release);
        self.set_state(CoreState::ShuttingDown);

        self.shutdown_tx.send_replace(true);
        self.peers.stop_all();

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        if tokio::time::timeout(DRAIN_TIMEOUT, self.peers.join_all())
            .await
            .is_err()
        {
            warn!("Peer links did not exit in time");
        }
        metrics::set_registered_peers(0);

        self.set_state(CoreState::Stopped);
        info!("Replication core stopped");
    }
}

impl SyncHandler for ReplicationCore {
    fn hello(&self) -> HelloResponse {
        self.shared.hello()
    }

    fn sync(&self, request: SyncRequest) -> SyncResponse {
        self.shared.handle_sync(request)
    }
}

impl std::fmt::Debug for ReplicationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCore")
            .field("local_node_id", &self.shared.local_node_id)
            .field("state", &self.state())
            .field("counters", &self.shared.table.len())
            .field("peers", &self.peers.len())
            .finish()
    }
}
