// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording mock transport with failure injection
//! - Cluster helpers over `LocalNetwork`

#![allow(dead_code)] // Each test binary uses a different subset

pub mod mock_transport;

pub use mock_transport::*;

use counter_replication::{LocalNetwork, PeerConfig, ReplicationConfig, ReplicationCore};
use std::sync::Arc;
use std::time::Duration;

/// Address a test node is registered under.
pub fn addr(id: &str) -> String {
    format!("{id}:7946")
}

/// Test config for `id` peering with every other id in `all`.
pub fn node_config(id: &str, all: &[&str]) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(id);
    config.peers = all
        .iter()
        .filter(|other| **other != id)
        .map(|other| PeerConfig::new(addr(other)))
        .collect();
    config
}

/// Build and register (but don't start) a fully meshed cluster.
pub fn cluster(network: &LocalNetwork, ids: &[&str]) -> Vec<ReplicationCore> {
    cluster_with(network, ids, |_| {})
}

/// Like [`cluster`], letting the caller adjust each config.
pub fn cluster_with(
    network: &LocalNetwork,
    ids: &[&str],
    mut tweak: impl FnMut(&mut ReplicationConfig),
) -> Vec<ReplicationCore> {
    ids.iter()
        .map(|id| {
            let mut config = node_config(id, ids);
            tweak(&mut config);
            let core = ReplicationCore::new(config, Arc::new(network.clone())).unwrap();
            network.register(addr(id), core.handler());
            core
        })
        .collect()
}

pub async fn start_all(cores: &mut [ReplicationCore]) {
    for core in cores.iter_mut() {
        core.start().await.unwrap();
    }
}

pub async fn shutdown_all(cores: &mut [ReplicationCore]) {
    for core in cores.iter_mut() {
        core.shutdown().await;
    }
}

/// Poll `condition` every 10ms for up to `within`.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// True when every core reports `expected` for `name`.
pub fn all_read(cores: &[ReplicationCore], name: &str, expected: i64) -> bool {
    cores.iter().all(|c| c.get(name).ok() == Some(expected))
}
