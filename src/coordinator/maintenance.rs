// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic background work: expiry GC and peer-set reconciliation.
//!
//! Both tasks tick on a fixed interval, skip missed ticks, and exit as soon as
//! the core's shutdown signal flips.

use crate::clock;
use crate::config::PeerConfig;
use crate::metrics;
use crate::peer::PeerManager;
use crate::store::CounterTable;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, Instrument};

/// Returns the peer addresses that should currently be linked.
///
/// Polled on every discovery tick; whatever it returns replaces the current
/// set of links.
pub type PeerProvider = Arc<dyn Fn() -> Vec<PeerConfig> + Send + Sync>;

/// Remove expired counters every `interval`.
pub(crate) async fn run_gc(
    table: Arc<CounterTable>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("gc");

    async move {
        let _ = shutdown_rx.borrow_and_update();
        info!(interval_ms = interval.as_millis() as u64, "Starting GC task");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick is immediate; an empty table at startup has nothing to sweep
        timer.tick().await;

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("GC task stopping");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            sweep(&table);
        }
    }
    .instrument(span)
    .await
}

/// One GC pass. Returns the names that were removed.
pub(crate) fn sweep(table: &CounterTable) -> Vec<String> {
    let started = Instant::now();
    let collected = table.sweep_expired(clock::now_nanos);
    let elapsed = started.elapsed();

    metrics::record_gc_sweep(collected.len(), elapsed);
    metrics::set_counters(table.len());

    if collected.is_empty() {
        debug!(elapsed_us = elapsed.as_micros() as u64, "GC sweep found nothing");
    } else {
        info!(
            collected = collected.len(),
            remaining = table.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "GC removed expired counters"
        );
    }
    collected
}

/// Reconcile the link set against `provider` every `interval`.
pub(crate) async fn run_discovery(
    provider: PeerProvider,
    peers: Arc<PeerManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("discovery");

    async move {
        let _ = shutdown_rx.borrow_and_update();
        info!(interval_ms = interval.as_millis() as u64, "Starting peer discovery task");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The core reconciled once before spawning us
        timer.tick().await;

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Peer discovery task stopping");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            reconcile(provider.as_ref(), &peers);
        }
    }
    .instrument(span)
    .await
}

/// One reconciliation pass.
pub(crate) fn reconcile(
    provider: &(dyn Fn() -> Vec<PeerConfig> + Send + Sync),
    peers: &PeerManager,
) {
    let desired = provider();
    let (added, removed) = peers.reconcile(&desired);

    if added.is_empty() && removed.is_empty() {
        debug!(peers = peers.len(), "Peer set unchanged");
    } else {
        info!(?added, ?removed, peers = peers.len(), "Peer set reconciled");
    }
}
