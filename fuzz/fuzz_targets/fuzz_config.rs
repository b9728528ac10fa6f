//! Fuzz target for configuration parsing.
//!
//! This tests that `RouterConfig::from_json` rejects malformed documents
//! with an error instead of panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shard_router::RouterConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(json) = std::str::from_utf8(data) {
        // Should never panic
        if let Ok(config) = RouterConfig::from_json(json) {
            let _ = config.validate();
        }
    }
});
