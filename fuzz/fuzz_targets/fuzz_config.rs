// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for configuration loading.
//!
//! Any input must either be rejected with an error or produce a config whose
//! duration accessors and backoff schedule are usable.

#![no_main]

use counter_replication::ReplicationConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let Ok(config) = ReplicationConfig::from_json_str(data) else {
        return;
    };

    let link = &config.settings.peer_link;
    let _ = link.sync_interval_duration();
    let _ = link.sync_timeout_duration();
    let retry = link.connect_retry();
    for attempt in [0, 1, 2, 64, usize::MAX] {
        assert!(retry.delay_for_attempt(attempt) <= retry.max_delay.max(retry.initial_delay));
    }
    let _ = config.settings.read_cache.window();
    let _ = config.settings.gc.interval_duration();
});
