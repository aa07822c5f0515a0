// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Retry helpers built on `backoff`.

use crate::config::RetryConfig;
use backoff::ExponentialBackoffBuilder;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl RetryConfig {
    /// Backoff that never gives up on its own
    pub fn unbounded_backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_delay_ms))
            .with_max_interval(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.factor)
            .with_randomization_factor(0.1)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op` until it succeeds, treating every error as transient.
///
/// Returns `None` as soon as `cancel` fires, whether that happens during an
/// attempt or while waiting between attempts.
pub async fn retry_until_cancelled<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let retry = backoff::future::retry_notify(
        config.unbounded_backoff(),
        || {
            let fut = op();
            async move { fut.await.map_err(backoff::Error::transient) }
        },
        |e: E, wait: Duration| {
            warn!("Retrying '{}' in {:?} after error: {}", operation, wait, e);
        },
    );

    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = retry => result.ok(),
    }
}
