// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fan-out: every changed counter to every connected peer link.
//!
//! ```text
//! upsert / update_ttl / delete / inbound merge
//!        │ try_send (never blocks; full queue = drop + error!)
//!        ▼
//!  bounded queue ──► dispatcher ──for_each_concurrent──► link.enqueue (timeout)
//! ```
//!
//! A dropped update is not lost state: the counter's cells stay above each
//! link's cursor, and each link's ticker re-buffers whatever its peer has not
//! acknowledged.

use crate::counter::Counter;
use crate::metrics;
use crate::peer::LinkRegistry;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

/// Run the dispatcher until shutdown or until every sender is gone.
pub(crate) async fn run_dispatcher(
    mut rx: mpsc::Receiver<Arc<Counter>>,
    registry: Arc<LinkRegistry>,
    dispatch_timeout: Duration,
    max_concurrent: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("fanout");

    async move {
        let _ = shutdown_rx.borrow_and_update();
        info!(
            dispatch_timeout_ms = dispatch_timeout.as_millis() as u64,
            max_concurrent, "Starting fan-out dispatcher"
        );

        loop {
            let counter = tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                maybe = rx.recv() => match maybe {
                    Some(counter) => counter,
                    None => break,
                },
            };

            dispatch(&registry, counter, dispatch_timeout, max_concurrent).await;
        }

        info!("Fan-out dispatcher stopped");
    }
    .instrument(span)
    .await
}

/// Push one counter to every registered link. Returns how many accepted it.
pub(crate) async fn dispatch(
    registry: &LinkRegistry,
    counter: Arc<Counter>,
    dispatch_timeout: Duration,
    max_concurrent: usize,
) -> usize {
    let links = registry.all();
    if links.is_empty() {
        return 0;
    }

    let delivered = AtomicUsize::new(0);
    futures::stream::iter(links)
        .for_each_concurrent(max_concurrent.max(1), |link| {
            let counter = Arc::clone(&counter);
            let delivered = &delivered;
            async move {
                let name = counter.name().to_string();
                match timeout(dispatch_timeout, link.enqueue(counter)).await {
                    Ok(Ok(())) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(_)) => {
                        debug!(
                            peer_addr = %link.addr(),
                            counter = %name,
                            "Link closed, update dropped"
                        );
                        metrics::record_fanout_dropped("closed");
                    }
                    Err(_) => {
                        warn!(
                            peer_addr = %link.addr(),
                            counter = %name,
                            timeout_ms = dispatch_timeout.as_millis() as u64,
                            "Peer link not draining, update dropped"
                        );
                        metrics::record_fanout_dropped("timeout");
                    }
                }
            }
        })
        .await;

    delivered.into_inner()
}
