// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over
/// `default_filter`. Returns an error if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

/// Idempotent subscriber setup for tests
pub fn init_for_testing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
