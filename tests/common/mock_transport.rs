// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock transport for testing.
//!
//! Records every `Hello` and `Sync` call for assertions. Failures, response
//! codes and latency are configurable at runtime.

use counter_replication::protocol::{HelloResponse, SyncRequest, SyncResponse};
use counter_replication::transport::{
    BoxFuture, PeerClient, PeerConnector, TransportError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A mock peer that answers `Hello` with a fixed id and records syncs.
///
/// # Example
/// ```rust,ignore
/// let peer = MockPeerClient::new("node-b");
/// peer.set_failing(true);   // every call errors
/// peer.set_code(1);         // or: answer Sync with a non-zero code
///
/// // Use in tests...
///
/// assert_eq!(peer.sync_count(), 3);
/// ```
pub struct MockPeerClient {
    id: Mutex<String>,
    /// Recorded sync() calls
    requests: Mutex<Vec<SyncRequest>>,
    hello_calls: AtomicUsize,
    close_calls: AtomicUsize,
    failing: AtomicBool,
    code: AtomicI64,
    /// Artificial latency for sync() in milliseconds
    delay_ms: AtomicU64,
    /// Artificial latency for hello() in milliseconds
    hello_delay_ms: AtomicU64,
}

impl MockPeerClient {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Mutex::new(id.to_string()),
            requests: Mutex::new(Vec::new()),
            hello_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            code: AtomicI64::new(0),
            delay_ms: AtomicU64::new(0),
            hello_delay_ms: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn set_id(&self, id: &str) {
        *self.id.lock() = id.to_string();
    }

    /// Make every call fail at the transport level.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Code returned from sync() when not failing.
    pub fn set_code(&self, code: i64) {
        self.code.store(code, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_hello_delay(&self, delay: Duration) {
        self.hello_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().clone()
    }

    pub fn sync_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn hello_count(&self) -> usize {
        self.hello_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Latest value of `origin`'s cell for `name` across all recorded requests.
    pub fn last_value(&self, name: &str, origin: &str) -> Option<i64> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| r.variables.get(name))
            .filter_map(|v| v.nodes_values.get(origin))
            .max_by_key(|cell| cell.version)
            .map(|cell| cell.value)
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TransportError("mock: injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// The connector hands out the shared client; tests keep their own `Arc`.
struct SharedClient(Arc<MockPeerClient>);

impl PeerClient for SharedClient {
    fn hello(&self) -> BoxFuture<'_, HelloResponse> {
        Box::pin(async move {
            self.0.hello_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.0.hello_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.0.check()?;
            Ok(HelloResponse {
                id: self.0.id.lock().clone(),
            })
        })
    }

    fn sync(&self, request: SyncRequest) -> BoxFuture<'_, SyncResponse> {
        Box::pin(async move {
            let delay = self.0.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.0.check()?;
            self.0.requests.lock().push(request);
            Ok(SyncResponse {
                code: self.0.code.load(Ordering::SeqCst),
            })
        })
    }

    fn close(&self) {
        self.0.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector over a fixed set of [`MockPeerClient`]s, by address.
#[derive(Default)]
pub struct MockConnector {
    peers: Mutex<HashMap<String, Arc<MockPeerClient>>>,
    connects: AtomicUsize,
    refusing: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, addr: &str, peer: Arc<MockPeerClient>) {
        self.peers.lock().insert(addr.to_string(), peer);
    }

    /// Refuse every dial.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl PeerConnector for MockConnector {
    fn connect(&self, addr: &str) -> BoxFuture<'_, Arc<dyn PeerClient>> {
        let addr = addr.to_string();
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refusing.load(Ordering::SeqCst) {
                return Err(TransportError(format!("{addr}: connection refused")));
            }
            let peer = self
                .peers
                .lock()
                .get(&addr)
                .cloned()
                .ok_or_else(|| TransportError(format!("{addr}: unknown address")))?;
            let client: Arc<dyn PeerClient> = Arc::new(SharedClient(peer));
            Ok(client)
        })
    }
}
