// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport seams.
//!
//! The engine never talks to a socket directly. Outbound calls go through a
//! [`PeerClient`] obtained from a [`PeerConnector`]; inbound calls arrive at a
//! [`SyncHandler`] (which [`ReplicationCore`](crate::ReplicationCore) provides).
//! Whatever RPC framework the embedding service uses only has to implement
//! these traits.
//!
//! [`LocalNetwork`] wires handlers and clients together in-process. It is what
//! the tests use for multi-node clusters, and it can simulate partitions.
//!
//! # Example
//!
//! ```rust,no_run
//! use counter_replication::transport::{BoxFuture, PeerClient};
//! use counter_replication::protocol::{HelloResponse, SyncRequest, SyncResponse};
//!
//! struct HttpClient { /* ... */ }
//!
//! impl PeerClient for HttpClient {
//!     fn hello(&self) -> BoxFuture<'_, HelloResponse> {
//!         Box::pin(async move { Ok(HelloResponse { id: "remote".into() }) })
//!     }
//!
//!     fn sync(&self, _request: SyncRequest) -> BoxFuture<'_, SyncResponse> {
//!         Box::pin(async move { Ok(SyncResponse::success()) })
//!     }
//! }
//! ```

use crate::protocol::{HelloResponse, SyncRequest, SyncResponse};
use dashmap::{DashMap, DashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// Opaque transport failure (connection refused, reset, decode error...).
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Outbound RPC client for one peer.
pub trait PeerClient: Send + Sync + 'static {
    /// Ask the peer for its node ID.
    fn hello(&self) -> BoxFuture<'_, HelloResponse>;

    /// Push a batch of counter state.
    fn sync(&self, request: SyncRequest) -> BoxFuture<'_, SyncResponse>;

    /// Release the underlying connection. Called once when the link stops.
    fn close(&self) {}
}

/// Opens [`PeerClient`]s by address.
pub trait PeerConnector: Send + Sync + 'static {
    fn connect(&self, addr: &str) -> BoxFuture<'_, Arc<dyn PeerClient>>;
}

/// Inbound RPC surface of a node.
///
/// Both calls are synchronous: a sync merge only takes short in-memory locks.
pub trait SyncHandler: Send + Sync + 'static {
    fn hello(&self) -> HelloResponse;

    fn sync(&self, request: SyncRequest) -> SyncResponse;
}

// =============================================================================
// In-process network
// =============================================================================

/// An in-process "network" mapping addresses to handlers.
///
/// Clients resolve their handler on every call, so unregistering an address
/// behaves like the remote process going away, and re-registering like it
/// coming back.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<LocalNetworkInner>,
}

#[derive(Default)]
struct LocalNetworkInner {
    handlers: DashMap<String, Arc<dyn SyncHandler>>,
    partitioned: DashSet<String>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handler` reachable at `addr`.
    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn SyncHandler>) {
        self.inner.handlers.insert(addr.into(), handler);
    }

    pub fn unregister(&self, addr: &str) {
        self.inner.handlers.remove(addr);
    }

    /// Cut (`true`) or heal (`false`) all traffic to `addr`.
    pub fn set_partitioned(&self, addr: &str, partitioned: bool) {
        if partitioned {
            self.inner.partitioned.insert(addr.to_string());
        } else {
            self.inner.partitioned.remove(addr);
        }
    }

    pub fn is_partitioned(&self, addr: &str) -> bool {
        self.inner.partitioned.contains(addr)
    }

    fn resolve(&self, addr: &str) -> TransportResult<Arc<dyn SyncHandler>> {
        if self.is_partitioned(addr) {
            return Err(TransportError(format!("{addr}: network partitioned")));
        }
        self.inner
            .handlers
            .get(addr)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| TransportError(format!("{addr}: connection refused")))
    }
}

impl PeerConnector for LocalNetwork {
    fn connect(&self, addr: &str) -> BoxFuture<'_, Arc<dyn PeerClient>> {
        let addr = addr.to_string();
        Box::pin(async move {
            self.resolve(&addr)?;
            let client: Arc<dyn PeerClient> = Arc::new(LocalClient {
                network: self.clone(),
                addr,
            });
            Ok(client)
        })
    }
}

struct LocalClient {
    network: LocalNetwork,
    addr: String,
}

impl PeerClient for LocalClient {
    fn hello(&self) -> BoxFuture<'_, HelloResponse> {
        Box::pin(async move { Ok(self.network.resolve(&self.addr)?.hello()) })
    }

    fn sync(&self, request: SyncRequest) -> BoxFuture<'_, SyncResponse> {
        Box::pin(async move { Ok(self.network.resolve(&self.addr)?.sync(request)) })
    }

    fn close(&self) {
        tracing::trace!(peer_addr = %self.addr, "Local client closed");
    }
}
