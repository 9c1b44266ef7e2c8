// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer links: one outbound replication channel per remote address.
//!
//! # Link Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected → Stopped
//!      ↑             ↓                       ▲
//!      └─── Backoff ←┘          stop() ──────┘ (from any state)
//! ```
//!
//! While connecting, the link dials through its [`PeerConnector`] and calls
//! `Hello` to learn the remote node ID. Once connected it registers itself in
//! the [`LinkRegistry`] under that ID (from then on the fan-out pushes dirty
//! counters to it), buffers every existing counter for catch-up, and syncs.
//!
//! # Buffering and Sync Triggers
//!
//! ```text
//! fan-out ──enqueue──► dirty channel ──► buffer (name → counter)
//!                                           │
//!           ticker (+ cursor rescan) ───────┤
//!           len(buffer) > max_buffer_size ──┤──► try_sync (single-flight)
//!           retry scheduler ────────────────┘
//! ```
//!
//! At most one sync per link is in flight. A trigger that finds one running
//! follows the configured [`BusyPolicy`]. A failed sync puts the counters it
//! carried back into the buffer; the cursor only moves on `Code == 0`.
//! Each tick also rescans the table for live counters above the cursor, which
//! picks up updates the fan-out dropped while the link stayed connected.

use crate::clock;
use crate::config::{BusyPolicy, PeerConfig, PeerLinkConfig};
use crate::counter::Counter;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::protocol::{self, OutboundBatch, SyncCursor};
use crate::resilience::SingleFlight;
use crate::store::CounterTable;
use crate::transport::{PeerClient, PeerConnector};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// State of a peer link.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Not connected (initial state, or between connect attempts).
    Disconnected,
    /// Dial + `Hello` in progress.
    Connecting,
    /// Handshake done, registered for fan-out.
    Connected,
    /// Terminal.
    Stopped,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Disconnected => "Disconnected",
            PeerState::Connecting => "Connecting",
            PeerState::Connected => "Connected",
            PeerState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a call to [`PeerLink::try_sync`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Acknowledged; carries the number of counter entries sent.
    Sent(usize),
    /// Nothing new for this peer; no network call.
    Empty,
    /// Handshake not done yet.
    NotConnected,
    /// Another sync was in flight and the trigger was dropped.
    Busy,
    /// Another sync was in flight and a retry was queued.
    Deferred,
}

/// Everything a link needs from its owner.
pub struct LinkContext {
    pub local_node_id: String,
    pub settings: PeerLinkConfig,
    pub connector: Arc<dyn PeerConnector>,
    pub table: Arc<CounterTable>,
    pub registry: Arc<LinkRegistry>,
}

// =============================================================================
// Registry (remote node ID → connected link)
// =============================================================================

/// Links that completed `Hello`, keyed by remote node ID. The fan-out reads this.
#[derive(Default)]
pub struct LinkRegistry {
    links: DashMap<String, Arc<PeerLink>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, remote_node_id: &str, link: Arc<PeerLink>) {
        let addr = link.addr().to_string();
        if let Some(previous) = self.links.insert(remote_node_id.to_string(), link) {
            if previous.addr() != addr {
                warn!(
                    remote_node_id = %remote_node_id,
                    peer_addr = %addr,
                    previous_addr = %previous.addr(),
                    "Node reachable via two addresses, latest link wins"
                );
            }
        }
        metrics::set_registered_peers(self.links.len());
    }

    fn unregister(&self, remote_node_id: &str, link: &PeerLink) {
        // Only remove our own entry; another link may have taken the ID over
        self.links
            .remove_if(remote_node_id, |_, current| std::ptr::eq(Arc::as_ptr(current), link));
        metrics::set_registered_peers(self.links.len());
    }

    pub fn get(&self, remote_node_id: &str) -> Option<Arc<PeerLink>> {
        self.links.get(remote_node_id).map(|r| r.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<PeerLink>> {
        self.links.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

// =============================================================================
// PeerLink
// =============================================================================

/// Outbound replication to one peer address.
pub struct PeerLink {
    config: PeerConfig,
    ctx: Arc<LinkContext>,
    state: RwLock<PeerState>,
    remote_node_id: RwLock<Option<String>>,
    client: RwLock<Option<Arc<dyn PeerClient>>>,
    /// Counters with changes not yet acknowledged, by name.
    buffer: Mutex<HashMap<String, Arc<Counter>>>,
    cursor: Mutex<SyncCursor>,
    flight: SingleFlight,
    retries_left: AtomicU32,
    stopped: AtomicBool,
    dirty_tx: Mutex<Option<mpsc::Sender<Arc<Counter>>>>,
    dirty_rx: Mutex<Option<mpsc::Receiver<Arc<Counter>>>>,
    retry_tx: mpsc::Sender<()>,
    retry_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    /// Consecutive failed connects or syncs
    failure_count: AtomicU64,
    /// Epoch millis of the last successful handshake or sync
    last_success: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerLink {
    /// Create a link (not started).
    pub fn new(config: PeerConfig, ctx: Arc<LinkContext>) -> Arc<Self> {
        let (dirty_tx, dirty_rx) = mpsc::channel(ctx.settings.channel_capacity.max(1));
        let (retry_tx, retry_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        let max_retries = ctx.settings.max_retries;

        Arc::new(Self {
            config,
            ctx,
            state: RwLock::new(PeerState::Disconnected),
            remote_node_id: RwLock::new(None),
            client: RwLock::new(None),
            buffer: Mutex::new(HashMap::new()),
            cursor: Mutex::new(SyncCursor::new()),
            flight: SingleFlight::new(),
            retries_left: AtomicU32::new(max_retries),
            stopped: AtomicBool::new(false),
            dirty_tx: Mutex::new(Some(dirty_tx)),
            dirty_rx: Mutex::new(Some(dirty_rx)),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
            shutdown_tx,
            failure_count: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The node ID reported by `Hello`, once connected.
    pub fn remote_node_id(&self) -> Option<String> {
        self.remote_node_id.read().clone()
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Counters waiting for the next sync.
    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Counters tracked by the anti-entropy cursor.
    pub fn cursor_len(&self) -> usize {
        self.cursor.lock().len()
    }

    /// Get consecutive failure count.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Get milliseconds since last success.
    pub fn millis_since_success(&self) -> u64 {
        let last = self.last_success.load(Ordering::Acquire);
        if last == 0 {
            return u64::MAX;
        }
        epoch_millis().saturating_sub(last)
    }

    fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.last_success.store(epoch_millis(), Ordering::Release);
    }

    fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::AcqRel);
    }

    fn set_state(&self, next: PeerState) {
        let previous = {
            let mut state = self.state.write();
            if *state == PeerState::Stopped || *state == next {
                return;
            }
            std::mem::replace(&mut *state, next)
        };
        metrics::clear_peer_state(&self.config.addr, previous.as_str());
        metrics::record_peer_state(&self.config.addr, next.as_str());
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the link's tasks. Calling it twice, or after `stop()`, does nothing.
    pub fn start(self: &Arc<Self>) {
        let dirty_rx = self.dirty_rx.lock().take();
        let retry_rx = self.retry_rx.lock().take();
        let (Some(dirty_rx), Some(retry_rx)) = (dirty_rx, retry_rx) else {
            return;
        };

        // Subscribe before checking the flag so a concurrent stop() is never missed
        let main_shutdown = self.shutdown_tx.subscribe();
        let retry_shutdown = self.shutdown_tx.subscribe();
        if self.is_stopped() {
            return;
        }

        let span = info_span!("peer_link", peer_addr = %self.config.addr);
        let main = tokio::spawn(
            Arc::clone(self)
                .run(dirty_rx, main_shutdown)
                .instrument(span.clone()),
        );
        let retry = tokio::spawn(
            Arc::clone(self)
                .run_retry_scheduler(retry_rx, retry_shutdown)
                .instrument(span),
        );
        self.tasks.lock().extend([main, retry]);
    }

    /// Stop the link. Idempotent.
    ///
    /// Cancels the connect loop and tickers, closes the dirty channel, closes
    /// the client and unregisters from fan-out. A sync already in flight is
    /// left to finish.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown_tx.send_replace(true);
        self.dirty_tx.lock().take();

        let client = self.client.write().take();
        if let Some(client) = client {
            client.close();
        }

        let remote = self.remote_node_id();
        if let Some(remote) = remote {
            self.ctx.registry.unregister(&remote, self);
        }

        self.set_state(PeerState::Stopped);
        info!(peer_addr = %self.config.addr, "Peer link stopped");
    }

    /// Wait for the link's tasks to exit (after `stop()`).
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Hand a changed counter to this link. Waits if the channel is full.
    pub async fn enqueue(&self, counter: Arc<Counter>) -> Result<()> {
        let tx = self.dirty_tx.lock().clone();
        let Some(tx) = tx else {
            return Err(ReplicationError::Shutdown);
        };
        tx.send(counter).await.map_err(|_| ReplicationError::Shutdown)
    }

    async fn run(
        self: Arc<Self>,
        dirty_rx: mpsc::Receiver<Arc<Counter>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting peer link");

        let Some((client, remote_node_id)) = self.connect_loop(&mut shutdown_rx).await else {
            debug!("Peer link stopped before connecting");
            return;
        };

        if self.on_connected(client, remote_node_id) {
            self.connected_loop(dirty_rx, shutdown_rx).await;
        }
        debug!("Peer link task exiting");
    }

    /// Dial and `Hello` until it works or the link is stopped.
    async fn connect_loop(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<(Arc<dyn PeerClient>, String)> {
        let retry = self.ctx.settings.connect_retry();
        let mut attempt = 0usize;

        loop {
            if *shutdown_rx.borrow() || self.is_stopped() {
                return None;
            }

            attempt += 1;
            self.set_state(PeerState::Connecting);

            match self.handshake(retry.connection_timeout).await {
                Ok(connected) => {
                    metrics::record_peer_connection(&self.config.addr, true);
                    if attempt > 1 {
                        info!(
                            remote_node_id = %connected.1,
                            attempt,
                            "Connected to peer after retry"
                        );
                    } else {
                        info!(remote_node_id = %connected.1, "Connected to peer");
                    }
                    return Some(connected);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Connection attempt failed, retrying");
                }
            }

            self.record_failure();
            metrics::record_peer_connection(&self.config.addr, false);
            self.set_state(PeerState::Disconnected);

            if !retry.should_retry(attempt) {
                warn!(attempt, "Giving up on peer");
                return None;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(retry.delay_for_attempt(attempt)) => {}
            }
        }
    }

    /// Dial, then `Hello`. Each step gets its own `limit`; a client that
    /// connected but never answered is closed before it is dropped.
    async fn handshake(&self, limit: Duration) -> Result<(Arc<dyn PeerClient>, String)> {
        let addr = self.config.addr.as_str();
        let timed_out = |step: &str| {
            ReplicationError::peer_connection(
                addr,
                format!("{step} timed out after {}ms", limit.as_millis()),
            )
        };

        let client = timeout(limit, self.ctx.connector.connect(addr))
            .await
            .map_err(|_| timed_out("connect"))?
            .map_err(|e| ReplicationError::peer_connection(addr, e.to_string()))?;

        let hello = match timeout(limit, client.hello()).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                client.close();
                return Err(ReplicationError::peer_connection(addr, e.to_string()));
            }
            Err(_) => {
                client.close();
                return Err(timed_out("hello"));
            }
        };

        if hello.id.is_empty() {
            client.close();
            return Err(ReplicationError::peer_connection(
                addr,
                "peer returned an empty node id",
            ));
        }
        Ok((client, hello.id))
    }

    /// Returns false if the link must not proceed to the connected loop.
    fn on_connected(self: &Arc<Self>, client: Arc<dyn PeerClient>, remote_node_id: String) -> bool {
        if remote_node_id == self.ctx.local_node_id {
            warn!(
                remote_node_id = %remote_node_id,
                "Peer reports the local node id, stopping link"
            );
            client.close();
            self.stop();
            return false;
        }

        *self.remote_node_id.write() = Some(remote_node_id.clone());
        *self.client.write() = Some(client);
        self.record_success();
        self.set_state(PeerState::Connected);
        self.ctx.registry.register(&remote_node_id, Arc::clone(self));

        // stop() may have run while we were registering
        if self.is_stopped() {
            self.ctx.registry.unregister(&remote_node_id, self);
            let client = self.client.write().take();
            if let Some(client) = client {
                client.close();
            }
            return false;
        }

        let existing = self.ctx.table.snapshot();
        let count = existing.len();
        {
            let mut buffer = self.buffer.lock();
            for counter in existing {
                buffer.insert(counter.name().to_string(), counter);
            }
        }
        debug!(variables = count, "Buffered existing counters for catch-up");

        self.request_sync();
        true
    }

    async fn connected_loop(
        self: &Arc<Self>,
        mut dirty_rx: mpsc::Receiver<Arc<Counter>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.ctx.settings.sync_interval_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; catch-up already triggered a sync
        ticker.tick().await;

        let max_buffer_size = self.ctx.settings.max_buffer_size;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                maybe = dirty_rx.recv() => match maybe {
                    Some(counter) => {
                        // While a sync is in flight the next trigger picks these up
                        let buffered = self.buffer_counter(counter);
                        if buffered > max_buffer_size && !self.flight.is_busy() {
                            self.request_sync();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.buffer_outstanding();
                    self.request_sync();
                }
            }
        }
    }

    /// Re-buffer every live counter holding data this peer has not acknowledged.
    ///
    /// Covers updates the fan-out dropped while the link stayed connected.
    /// Skipped while a sync is in flight, since its cursor is not committed yet.
    fn buffer_outstanding(&self) -> usize {
        if self.flight.is_busy() {
            return 0;
        }
        let Some(remote_node_id) = self.remote_node_id() else {
            return 0;
        };

        let now = clock::now_nanos();
        let counters = self.ctx.table.snapshot();
        let outstanding: Vec<Arc<Counter>> = {
            let cursor = self.cursor.lock();
            counters
                .into_iter()
                .filter(|c| !c.is_expired_at(now))
                .filter(|c| {
                    protocol::is_outstanding(&self.ctx.local_node_id, &remote_node_id, c, &cursor)
                })
                .collect()
        };

        let count = outstanding.len();
        if count > 0 {
            let mut buffer = self.buffer.lock();
            for counter in outstanding {
                buffer.entry(counter.name().to_string()).or_insert(counter);
            }
            debug!(variables = count, "Re-buffered outstanding counters");
        }
        count
    }

    fn buffer_counter(&self, counter: Arc<Counter>) -> usize {
        let mut buffer = self.buffer.lock();
        buffer.insert(counter.name().to_string(), counter);
        buffer.len()
    }

    async fn run_retry_scheduler(
        self: Arc<Self>,
        mut retry_rx: mpsc::Receiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let delay = self.ctx.settings.retry_delay_duration();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                maybe = retry_rx.recv() => {
                    if maybe.is_none() {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match self.try_sync().await {
                        Ok(outcome) => debug!(?outcome, "Deferred sync retry"),
                        Err(ReplicationError::Shutdown) => break,
                        Err(e) => warn!(error = %e, "Deferred sync failed, will retry"),
                    }
                }
            }
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Fire a sync attempt in the background.
    pub fn request_sync(self: &Arc<Self>) {
        let link = Arc::clone(self);
        tokio::spawn(
            async move {
                match link.try_sync().await {
                    Ok(_) | Err(ReplicationError::Shutdown) => {}
                    Err(e) => warn!(error = %e, "Sync failed, will retry"),
                }
            }
            .in_current_span(),
        );
    }

    /// Drain the buffer and push it to the peer.
    ///
    /// At most one call per link does network I/O at a time; the others
    /// return [`SyncOutcome::Busy`] or [`SyncOutcome::Deferred`].
    pub async fn try_sync(&self) -> Result<SyncOutcome> {
        if self.is_stopped() {
            return Err(ReplicationError::Shutdown);
        }

        let client = self.client.read().clone();
        let remote_node_id = self.remote_node_id();
        let (Some(client), Some(remote_node_id)) = (client, remote_node_id) else {
            return Ok(SyncOutcome::NotConnected);
        };

        let Some(_flight) = self.flight.try_acquire() else {
            return Ok(self.on_busy());
        };
        self.retries_left
            .store(self.ctx.settings.max_retries, Ordering::Release);

        let drained: Vec<Arc<Counter>> = self.buffer.lock().drain().map(|(_, c)| c).collect();
        if drained.is_empty() {
            return Ok(SyncOutcome::Empty);
        }

        let mut batch = {
            let cursor = self.cursor.lock();
            protocol::build_outbound(&self.ctx.local_node_id, &remote_node_id, drained, &cursor)
        };
        if batch.is_empty() {
            debug!("Nothing new for peer");
            return Ok(SyncOutcome::Empty);
        }

        let request = std::mem::take(&mut batch.request);
        let variables = request.variables.len();
        let addr = self.config.addr.as_str();
        let sync_timeout = self.ctx.settings.sync_timeout_duration();

        let started = Instant::now();
        let response = timeout(sync_timeout, client.sync(request)).await;
        let elapsed = started.elapsed();

        match response {
            Ok(Ok(response)) if response.is_success() => {
                protocol::commit(&mut self.cursor.lock(), &batch);
                self.record_success();
                metrics::record_sync_response(addr, response.code, elapsed);
                metrics::record_variables_sent(addr, variables);
                debug!(
                    variables,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Sync acknowledged"
                );
                Ok(SyncOutcome::Sent(variables))
            }
            Ok(Ok(response)) => {
                metrics::record_sync_response(addr, response.code, elapsed);
                self.on_failed(batch);
                Err(ReplicationError::SyncRejected {
                    peer_addr: addr.to_string(),
                    code: response.code,
                })
            }
            Ok(Err(e)) => {
                metrics::record_sync_error(addr, elapsed);
                self.on_failed(batch);
                Err(ReplicationError::transport(addr, e.to_string()))
            }
            Err(_) => {
                metrics::record_sync_error(addr, elapsed);
                self.on_failed(batch);
                Err(ReplicationError::transport(
                    addr,
                    format!("sync timed out after {}ms", sync_timeout.as_millis()),
                ))
            }
        }
    }

    /// Put what a failed sync carried back into the buffer.
    fn on_failed(&self, batch: OutboundBatch) {
        self.record_failure();
        let mut buffer = self.buffer.lock();
        for counter in batch.included {
            buffer.entry(counter.name().to_string()).or_insert(counter);
        }
    }

    fn on_busy(&self) -> SyncOutcome {
        match self.ctx.settings.busy_policy {
            BusyPolicy::Skip => {
                metrics::record_sync_skipped(&self.config.addr, "busy");
                SyncOutcome::Busy
            }
            BusyPolicy::DeferredRetry => {
                let reserved = self
                    .retries_left
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok();
                if !reserved {
                    metrics::record_sync_skipped(&self.config.addr, "retry_exhausted");
                    return SyncOutcome::Busy;
                }
                if self.retry_tx.try_send(()).is_err() {
                    // A retry is already queued
                    self.retries_left.fetch_add(1, Ordering::AcqRel);
                }
                SyncOutcome::Deferred
            }
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("addr", &self.config.addr)
            .field("remote_node_id", &self.remote_node_id())
            .field("state", &self.state())
            .field("buffered", &self.buffer_len())
            .finish()
    }
}

// =============================================================================
// PeerManager (address → link)
// =============================================================================

/// Manager for all peer links, keyed by address.
pub struct PeerManager {
    links: DashMap<String, Arc<PeerLink>>,
    ctx: Arc<LinkContext>,
}

impl PeerManager {
    pub fn new(ctx: Arc<LinkContext>) -> Self {
        Self {
            links: DashMap::new(),
            ctx,
        }
    }

    /// The registry of connected links.
    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.ctx.registry
    }

    /// Create and start a link for `config`. Returns `None` if the address is already linked.
    pub fn add_peer(&self, config: PeerConfig) -> Option<Arc<PeerLink>> {
        let addr = config.addr.clone();
        let link = match self.links.entry(addr.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                let link = PeerLink::new(config, Arc::clone(&self.ctx));
                slot.insert(Arc::clone(&link));
                link
            }
        };
        link.start();
        info!(peer_addr = %addr, "Peer link added");
        Some(link)
    }

    /// Stop and remove the link for `addr`.
    pub fn remove_peer(&self, addr: &str) -> bool {
        match self.links.remove(addr) {
            Some((_, link)) => {
                link.stop();
                info!(peer_addr = %addr, "Peer link removed");
                true
            }
            None => false,
        }
    }

    /// Make the set of links match `desired`. Returns `(added, removed)` addresses.
    pub fn reconcile(&self, desired: &[PeerConfig]) -> (Vec<String>, Vec<String>) {
        let wanted: HashSet<&str> = desired.iter().map(|p| p.addr.as_str()).collect();

        let stale: Vec<String> = self
            .links
            .iter()
            .filter(|entry| !wanted.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        let removed: Vec<String> = stale
            .into_iter()
            .filter(|addr| self.remove_peer(addr))
            .collect();

        let added: Vec<String> = desired
            .iter()
            .filter_map(|peer| self.add_peer(peer.clone()).map(|_| peer.addr.clone()))
            .collect();

        (added, removed)
    }

    /// Get a link by address.
    pub fn get(&self, addr: &str) -> Option<Arc<PeerLink>> {
        self.links.get(addr).map(|r| r.value().clone())
    }

    /// Get all links.
    pub fn all(&self) -> Vec<Arc<PeerLink>> {
        self.links.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Stop every link.
    pub fn stop_all(&self) {
        for link in self.all() {
            link.stop();
        }
    }

    /// Wait for every link's tasks to exit.
    pub async fn join_all(&self) {
        for link in self.all() {
            link.join().await;
        }
    }
}

/// Get current epoch milliseconds.
fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::protocol::{HelloResponse, SyncRequest, SyncResponse};
    use crate::transport::{LocalNetwork, SyncHandler};
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    struct Recorder {
        id: String,
        code: AtomicI64,
        requests: Mutex<Vec<SyncRequest>>,
    }

    impl Recorder {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                code: AtomicI64::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    impl SyncHandler for Recorder {
        fn hello(&self) -> HelloResponse {
            HelloResponse { id: self.id.clone() }
        }

        fn sync(&self, request: SyncRequest) -> SyncResponse {
            self.requests.lock().push(request);
            SyncResponse {
                code: self.code.load(Ordering::SeqCst),
            }
        }
    }

    fn settings() -> PeerLinkConfig {
        PeerLinkConfig {
            // Tests drive syncs explicitly
            sync_interval: "1h".to_string(),
            ..ReplicationConfig::for_testing("unused").settings.peer_link
        }
    }

    fn context(
        network: &LocalNetwork,
        table: Arc<CounterTable>,
        settings: PeerLinkConfig,
    ) -> Arc<LinkContext> {
        Arc::new(LinkContext {
            local_node_id: "node-a".to_string(),
            settings,
            connector: Arc::new(network.clone()),
            table,
            registry: Arc::new(LinkRegistry::new()),
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn connected_link(
        settings: PeerLinkConfig,
        table: Arc<CounterTable>,
    ) -> (Arc<PeerLink>, Arc<Recorder>, LocalNetwork) {
        let network = LocalNetwork::new();
        let recorder = Recorder::new("node-b");
        network.register("b:1", recorder.clone());

        let link = PeerLink::new(PeerConfig::new("b:1"), context(&network, table, settings));
        link.start();
        assert!(wait_until(|| link.is_connected()).await);
        // Let the catch-up sync spawned on connect run to completion
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(wait_until(|| !link.flight.is_busy()).await);
        (link, recorder, network)
    }

    #[test]
    fn test_peer_state_display() {
        assert_eq!(PeerState::Connected.to_string(), "Connected");
        assert_eq!(PeerState::Stopped.as_str(), "Stopped");
    }

    #[test]
    fn test_new_link_initial_state() {
        let network = LocalNetwork::new();
        let table = Arc::new(CounterTable::new(None));
        let link = PeerLink::new(PeerConfig::new("b:1"), context(&network, table, settings()));

        assert_eq!(link.state(), PeerState::Disconnected);
        assert!(link.remote_node_id().is_none());
        assert_eq!(link.failure_count(), 0);
        assert_eq!(link.millis_since_success(), u64::MAX);
        assert_eq!(link.buffer_len(), 0);
    }

    #[tokio::test]
    async fn test_connect_registers_and_catches_up() {
        let table = Arc::new(CounterTable::new(None));
        let (existing, _) = table.get_or_create("x");
        existing.update(5);

        let (link, recorder, _network) = connected_link(settings(), Arc::clone(&table)).await;
        assert!(wait_until(|| recorder.count() == 1).await);

        let request = recorder.requests.lock()[0].clone();
        assert_eq!(request.node_id, "node-a");
        assert_eq!(request.variables["x"].nodes_values["node-a"].value, 5);

        assert_eq!(link.remote_node_id().as_deref(), Some("node-b"));
        assert!(link.ctx.registry.get("node-b").is_some());
        assert!(link.millis_since_success() < 60_000);
        link.stop();
    }

    #[tokio::test]
    async fn test_second_sync_is_empty() {
        let table = Arc::new(CounterTable::new(None));
        table.get_or_create("x").0.update(1);

        let (link, recorder, _network) = connected_link(settings(), table).await;
        assert!(wait_until(|| recorder.count() == 1 && !link.flight.is_busy()).await);

        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Empty);
        assert_eq!(recorder.count(), 1);
        link.stop();
    }

    #[tokio::test]
    async fn test_enqueued_change_is_sent() {
        let table = Arc::new(CounterTable::new(None));
        let (link, recorder, _network) = connected_link(settings(), Arc::clone(&table)).await;

        let (counter, _) = table.get_or_create("y");
        counter.update(3);
        link.enqueue(Arc::clone(&counter)).await.unwrap();
        assert!(wait_until(|| link.buffer_len() == 1).await);

        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Sent(1));
        assert_eq!(link.buffer_len(), 0);
        assert_eq!(link.cursor_len(), 1);
        link.stop();
    }

    #[tokio::test]
    async fn test_self_peer_stops_link() {
        let network = LocalNetwork::new();
        let recorder = Recorder::new("node-a");
        network.register("self:1", recorder.clone());

        let table = Arc::new(CounterTable::new(None));
        let ctx = context(&network, table, settings());
        let link = PeerLink::new(PeerConfig::new("self:1"), Arc::clone(&ctx));
        link.start();

        assert!(wait_until(|| link.is_stopped()).await);
        assert_eq!(link.state(), PeerState::Stopped);
        assert!(ctx.registry.is_empty());
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn test_connect_retries_until_peer_appears() {
        let network = LocalNetwork::new();
        let table = Arc::new(CounterTable::new(None));
        let link = PeerLink::new(PeerConfig::new("late:1"), context(&network, table, settings()));
        link.start();

        assert!(wait_until(|| link.failure_count() >= 2).await);
        assert!(!link.is_connected());

        network.register("late:1", Recorder::new("node-late"));
        assert!(wait_until(|| link.is_connected()).await);
        assert_eq!(link.failure_count(), 0);
        link.stop();
    }

    #[tokio::test]
    async fn test_rejected_sync_rebuffers() {
        let table = Arc::new(CounterTable::new(None));
        let (link, recorder, _network) = connected_link(settings(), Arc::clone(&table)).await;
        recorder.code.store(1, Ordering::SeqCst);

        let (counter, _) = table.get_or_create("x");
        counter.update(1);
        link.enqueue(counter).await.unwrap();
        assert!(wait_until(|| link.buffer_len() == 1).await);

        let err = link.try_sync().await.unwrap_err();
        assert!(matches!(err, ReplicationError::SyncRejected { code: 1, .. }));
        assert!(err.is_retryable());
        assert_eq!(link.buffer_len(), 1);
        assert_eq!(link.cursor_len(), 0);
        assert_eq!(link.failure_count(), 1);

        recorder.code.store(0, Ordering::SeqCst);
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Sent(1));
        link.stop();
    }

    #[tokio::test]
    async fn test_transport_failure_rebuffers() {
        let table = Arc::new(CounterTable::new(None));
        let (link, _recorder, network) = connected_link(settings(), Arc::clone(&table)).await;

        let (counter, _) = table.get_or_create("x");
        counter.update(1);
        link.enqueue(counter).await.unwrap();
        assert!(wait_until(|| link.buffer_len() == 1).await);

        network.set_partitioned("b:1", true);
        let err = link.try_sync().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { .. }));
        assert_eq!(link.buffer_len(), 1);

        network.set_partitioned("b:1", false);
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Sent(1));
        link.stop();
    }

    #[tokio::test]
    async fn test_threshold_triggers_sync_without_tick() {
        let table = Arc::new(CounterTable::new(None));
        let settings = PeerLinkConfig {
            max_buffer_size: 2,
            ..settings()
        };
        let (link, recorder, _network) = connected_link(settings, Arc::clone(&table)).await;

        for name in ["a", "b", "c"] {
            let (counter, _) = table.get_or_create(name);
            counter.update(1);
            link.enqueue(counter).await.unwrap();
        }

        assert!(wait_until(|| recorder.count() == 1).await);
        assert_eq!(recorder.requests.lock()[0].variables.len(), 3);
        link.stop();
    }

    #[tokio::test]
    async fn test_busy_skip() {
        let table = Arc::new(CounterTable::new(None));
        let settings = PeerLinkConfig {
            busy_policy: BusyPolicy::Skip,
            ..settings()
        };
        let (link, _recorder, _network) = connected_link(settings, table).await;

        let _held = link.flight.try_acquire().unwrap();
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Busy);
        link.stop();
    }

    #[tokio::test]
    async fn test_busy_deferred_retry_is_bounded() {
        let table = Arc::new(CounterTable::new(None));
        let settings = PeerLinkConfig {
            busy_policy: BusyPolicy::DeferredRetry,
            max_retries: 1,
            retry_delay: "1h".to_string(),
            ..settings()
        };
        let (link, _recorder, _network) = connected_link(settings, table).await;

        let held = link.flight.try_acquire().unwrap();
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Deferred);
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Busy);
        drop(held);

        // A sync that actually runs resets the retry budget
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Empty);
        let _held = link.flight.try_acquire().unwrap();
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Deferred);
        link.stop();
    }

    #[tokio::test]
    async fn test_threshold_does_not_spend_retries_while_in_flight() {
        let table = Arc::new(CounterTable::new(None));
        let settings = PeerLinkConfig {
            max_buffer_size: 1,
            busy_policy: BusyPolicy::DeferredRetry,
            max_retries: 3,
            retry_delay: "1h".to_string(),
            ..settings()
        };
        let (link, _recorder, _network) = connected_link(settings, Arc::clone(&table)).await;

        let held = link.flight.try_acquire().unwrap();
        for i in 0..5 {
            let (counter, _) = table.get_or_create(&format!("c{i}"));
            counter.update(1);
            link.enqueue(counter).await.unwrap();
        }
        assert!(wait_until(|| link.buffer_len() == 5).await);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(link.retries_left.load(Ordering::Acquire), 3);
        drop(held);
        link.stop();
    }

    #[tokio::test]
    async fn test_rescan_finds_counters_never_enqueued() {
        let table = Arc::new(CounterTable::new(None));
        let (link, recorder, _network) = connected_link(settings(), Arc::clone(&table)).await;

        // Written locally but never handed to the link
        let (counter, _) = table.get_or_create("missed");
        counter.update(4);
        let (expired, _) = table.get_or_create("expired");
        expired.update(1);
        expired.update_ttl(clock::now_nanos() - 1_000_000_000);

        assert_eq!(link.buffer_outstanding(), 1);
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Sent(1));
        assert_eq!(recorder.count(), 1);

        // Acknowledged, so the next pass has nothing to add
        assert_eq!(link.buffer_outstanding(), 0);
        assert_eq!(link.try_sync().await.unwrap(), SyncOutcome::Empty);
        link.stop();
    }

    #[tokio::test]
    async fn test_ticker_repairs_missed_update() {
        let table = Arc::new(CounterTable::new(None));
        let settings = PeerLinkConfig {
            sync_interval: "20ms".to_string(),
            ..settings()
        };
        let (link, recorder, _network) = connected_link(settings, Arc::clone(&table)).await;

        let (counter, _) = table.get_or_create("x");
        counter.update(9);

        assert!(wait_until(|| recorder.count() >= 1).await);
        let requests = recorder.requests.lock().clone();
        let value = requests
            .iter()
            .filter_map(|r| r.variables.get("x"))
            .filter_map(|v| v.nodes_values.get("node-a"))
            .map(|cell| cell.value)
            .last();
        assert_eq!(value, Some(9));

        // Nothing new, so later ticks stay quiet
        let sent = recorder.count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.count(), sent);
        link.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let table = Arc::new(CounterTable::new(None));
        let (link, _recorder, _network) = connected_link(settings(), Arc::clone(&table)).await;

        link.stop();
        link.stop();
        assert_eq!(link.state(), PeerState::Stopped);
        assert!(link.ctx.registry.is_empty());

        let (counter, _) = table.get_or_create("x");
        assert!(matches!(link.enqueue(counter).await, Err(ReplicationError::Shutdown)));
        assert!(matches!(link.try_sync().await, Err(ReplicationError::Shutdown)));

        tokio::time::timeout(Duration::from_secs(2), link.join())
            .await
            .expect("link tasks exit after stop");
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let network = LocalNetwork::new();
        let table = Arc::new(CounterTable::new(None));
        let link = PeerLink::new(PeerConfig::new("b:1"), context(&network, table, settings()));
        link.stop();
        link.start();
        link.join().await;
        assert_eq!(link.state(), PeerState::Stopped);
    }

    #[tokio::test]
    async fn test_peer_manager_reconcile() {
        let network = LocalNetwork::new();
        let table = Arc::new(CounterTable::new(None));
        let manager = PeerManager::new(context(&network, table, settings()));

        assert!(manager.add_peer(PeerConfig::new("a:1")).is_some());
        assert!(manager.add_peer(PeerConfig::new("a:1")).is_none());
        assert!(manager.add_peer(PeerConfig::new("b:1")).is_some());
        let old_b = manager.get("b:1").unwrap();

        let (added, removed) =
            manager.reconcile(&[PeerConfig::new("b:1"), PeerConfig::new("c:1")]);
        assert_eq!(added, vec!["c:1".to_string()]);
        assert_eq!(removed, vec!["a:1".to_string()]);
        assert_eq!(manager.len(), 2);
        assert!(manager.get("a:1").is_none());
        assert!(Arc::ptr_eq(&old_b, &manager.get("b:1").unwrap()));

        manager.stop_all();
        assert!(manager.all().iter().all(|l| l.is_stopped()));
        manager.join_all().await;
    }

    #[tokio::test]
    async fn test_peer_manager_remove_nonexistent() {
        let network = LocalNetwork::new();
        let table = Arc::new(CounterTable::new(None));
        let manager = PeerManager::new(context(&network, table, settings()));
        assert!(!manager.remove_peer("nope:1"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_epoch_millis() {
        assert!(epoch_millis() > 1_577_836_800_000);
    }
}
