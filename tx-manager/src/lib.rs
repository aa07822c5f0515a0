// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-flight transaction manager
//!
//! Keeps a bounded window of pending transactions, drives each one through a
//! pluggable policy engine, tracks submitted hashes until they are confirmed
//! and persists every state change before announcing it.

pub mod config;
pub mod confirmations;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod notifications;
pub mod persistence;
pub mod policy;
pub mod retry;
pub mod telemetry;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

pub use config::TxManagerConfig;
pub use error::{TxManagerError, TxManagerResult};
pub use manager::{TxManager, TxManagerHandle};
pub use node::{run_tx_manager, run_tx_manager_with_policy_engines, TxManagerNode};
