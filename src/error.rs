// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the counter replication engine.
//!
//! Errors fall into two groups: those surfaced synchronously to the embedding
//! application (unknown counter, bad TTL) and those produced by replication
//! to peers, which are logged and retried on the next cycle.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `NotExists` | No | Counter is not in the local table |
//! | `Expired` | No | Counter TTL has passed (it was removed on read) |
//! | `TtlInPast` | No | `update_ttl` called with an instant before now |
//! | `PeerConnection` | Yes | Dial or `Hello` handshake failed |
//! | `Transport` | Yes | `Sync` call failed or timed out |
//! | `SyncRejected` | Yes | Peer answered `Sync` with a non-zero code |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Core or link state machine violation |
//! | `Shutdown` | No | Core or link is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Retryable errors never reach the embedding application: peer links log
//! them and resend on the next tick. [`ReplicationError::is_retryable()`]
//! exists so tests and hosts can classify errors the same way.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur in the counter store or during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The named counter does not exist locally.
    ///
    /// Not retryable - the caller asked for something that isn't there.
    #[error("counter not exists: {0}")]
    NotExists(String),

    /// The named counter exists but its TTL has passed.
    ///
    /// The entry is removed from the table as a side effect of the read.
    /// Not retryable.
    #[error("counter expired: {0}")]
    Expired(String),

    /// `update_ttl` was given an instant that is already in the past.
    ///
    /// Use `delete` to expire a counter immediately.
    /// Not retryable.
    #[error("TTL is in the past for counter {name}")]
    TtlInPast { name: String },

    /// Peer dial or `Hello` handshake failure.
    ///
    /// Retryable - the connect loop tries again on its next interval.
    #[error("Peer connection error ({peer_addr}): {message}")]
    PeerConnection { peer_addr: String, message: String },

    /// `Sync` call to a peer failed at the transport level (or timed out).
    ///
    /// Retryable - the cursor is not advanced, the data is resent.
    #[error("Transport error ({peer_addr}): {message}")]
    Transport { peer_addr: String, message: String },

    /// Peer answered `Sync` with a non-zero application code.
    ///
    /// Treated exactly like a transport failure for retry purposes.
    #[error("Sync rejected by {peer_addr} with code {code}")]
    SyncRejected { peer_addr: String, code: i64 },

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on a core that is already running).
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Not retryable - the core or link is terminating.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for a peer address.
    pub fn transport(peer_addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer_addr: peer_addr.into(),
            message: message.into(),
        }
    }

    /// Create a connection error for a peer address.
    pub fn peer_connection(peer_addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PeerConnection {
            peer_addr: peer_addr.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PeerConnection { .. } => true,
            Self::Transport { .. } => true,
            Self::SyncRejected { .. } => true,
            Self::NotExists(_) => false,
            Self::Expired(_) => false,
            Self::TtlInPast { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// True for the "not found" family (`NotExists` and `Expired`).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotExists(_) | Self::Expired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_peer_connection() {
        let err = ReplicationError::peer_connection("10.0.0.2:7001", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("10.0.0.2:7001"));
    }

    #[test]
    fn test_is_retryable_transport() {
        let err = ReplicationError::transport("peer-a", "deadline exceeded");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn test_is_retryable_sync_rejected() {
        let err = ReplicationError::SyncRejected {
            peer_addr: "peer-a".to_string(),
            code: 1,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("code 1"));
    }

    #[test]
    fn test_not_retryable_not_exists() {
        let err = ReplicationError::NotExists("hits".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_not_found());
        assert!(err.to_string().contains("hits"));
    }

    #[test]
    fn test_not_retryable_expired() {
        let err = ReplicationError::Expired("hits".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_not_retryable_ttl_in_past() {
        let err = ReplicationError::TtlInPast {
            name: "sessions".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("sessions"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("fanout.channel_capacity must be > 0".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!ReplicationError::Shutdown.is_retryable());
    }

    #[test]
    fn test_not_retryable_internal() {
        let err = ReplicationError::Internal("unexpected".to_string());
        assert!(!err.is_retryable());
    }
}
