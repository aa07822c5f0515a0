// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{TxManagerError, TxManagerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tx_manager_config::Config;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TxManagerConfig {
    // Namespace used for ids of transactions submitted through the manager
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub persistence: WriterConfig,
    #[serde(default)]
    pub confirmations: ConfirmationsConfig,
    #[serde(default)]
    pub policy_engine: PolicyEngineConfig,
}

impl Config for TxManagerConfig {}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            manager: ManagerConfig::default(),
            persistence: WriterConfig::default(),
            confirmations: ConfirmationsConfig::default(),
            policy_engine: PolicyEngineConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

impl TxManagerConfig {
    pub fn validate(&self) -> TxManagerResult<()> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(TxManagerError::InvalidConfig(format!(
                "namespace '{}' must be non-empty and must not contain ':'",
                self.namespace
            )));
        }
        if self.manager.max_inflight == 0 {
            return Err(TxManagerError::InvalidConfig(
                "manager.max-inflight must be at least 1".to_string(),
            ));
        }
        if self.manager.policy_loop_interval_ms == 0 {
            return Err(TxManagerError::InvalidConfig(
                "manager.policy-loop-interval-ms must be at least 1".to_string(),
            ));
        }
        if self.confirmations.poll_interval_ms == 0 {
            return Err(TxManagerError::InvalidConfig(
                "confirmations.poll-interval-ms must be at least 1".to_string(),
            ));
        }
        if self.persistence.writer_count == 0 {
            return Err(TxManagerError::InvalidConfig(
                "persistence.writer-count must be at least 1".to_string(),
            ));
        }
        if self.persistence.batch_size == 0 {
            return Err(TxManagerError::InvalidConfig(
                "persistence.batch-size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Control loop tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManagerConfig {
    // Maximum size of the inflight working set
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    // Heartbeat between policy loop cycles
    #[serde(default = "default_policy_loop_interval_ms")]
    pub policy_loop_interval_ms: u64,
    // Minimum gap between two policy engine invocations for one transaction.
    // Defaults to the loop interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_cycle_min_interval_ms: Option<u64>,
    // Retained entries in each transaction's error history
    #[serde(default = "default_error_history_count")]
    pub error_history_count: usize,
    // Wake the loop as soon as a receipt or confirmation arrives instead of
    // waiting for the next heartbeat
    #[serde(default = "default_inflight_update_signal")]
    pub inflight_update_signal: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            policy_loop_interval_ms: default_policy_loop_interval_ms(),
            policy_cycle_min_interval_ms: None,
            error_history_count: default_error_history_count(),
            inflight_update_signal: default_inflight_update_signal(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_inflight() -> usize {
    100
}

fn default_policy_loop_interval_ms() -> u64 {
    10_000
}

fn default_error_history_count() -> usize {
    25
}

fn default_inflight_update_signal() -> bool {
    true
}

impl ManagerConfig {
    pub fn policy_loop_interval(&self) -> Duration {
        Duration::from_millis(self.policy_loop_interval_ms)
    }

    pub fn policy_cycle_min_interval(&self) -> Duration {
        Duration::from_millis(
            self.policy_cycle_min_interval_ms
                .unwrap_or(self.policy_loop_interval_ms),
        )
    }
}

/// Exponential backoff used when reading the pending backlog
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_factor() -> f64 {
    2.0
}

/// Batching behaviour of the transaction writer
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WriterConfig {
    #[serde(default = "default_writer_count")]
    pub writer_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            writer_count: default_writer_count(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            channel_size: default_channel_size(),
        }
    }
}

fn default_writer_count() -> usize {
    5
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    10
}

fn default_channel_size() -> usize {
    1000
}

impl WriterConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Block-confirmation tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfirmationsConfig {
    // Blocks required on top of the receipt block before a transaction is confirmed
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl Default for ConfirmationsConfig {
    fn default() -> Self {
        Self {
            required_confirmations: default_required_confirmations(),
            poll_interval_ms: default_poll_interval_ms(),
            channel_size: default_channel_size(),
        }
    }
}

fn default_required_confirmations() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl ConfirmationsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which policy engine to build and its engine-specific settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyEngineConfig {
    #[serde(default = "default_policy_engine_name")]
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            name: default_policy_engine_name(),
            config: serde_json::Value::Null,
        }
    }
}

fn default_policy_engine_name() -> String {
    "simple".to_string()
}
