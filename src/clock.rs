// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wall-clock helpers for versions and TTLs.
//!
//! Versions and TTLs are both UTC nanoseconds since the Unix epoch, stored as
//! `i64`. `0` means "never written" for versions and "no expiry" for TTLs.

use chrono::{DateTime, Utc};

/// Current UTC time in nanoseconds since the epoch.
pub fn now_nanos() -> i64 {
    to_nanos(Utc::now())
}

/// Convert a UTC instant to epoch nanoseconds.
///
/// Instants outside the `i64` nanosecond range (after 2262) saturate.
pub fn to_nanos(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Produce a version strictly greater than `previous`.
///
/// Uses wall-clock time when it has moved forward, otherwise `previous + 1`,
/// so a clock step backwards never yields a stale version.
pub fn next_version(previous: i64) -> i64 {
    now_nanos().max(previous.saturating_add(1))
}
