// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Confirmation tracking
//!
//! The control loop registers each submitted hash with a
//! [`ConfirmationTracker`] and learns asynchronously, through callbacks, when
//! a receipt is available and when the receipt block is deep enough to be
//! final. For one hash the receipt callback always fires before the
//! confirmed callback.

mod block_confirmations;

pub use block_confirmations::BlockConfirmationTracker;

use crate::error::TxManagerResult;
use crate::types::{BlockInfo, TransactionReceipt};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Invoked with the tracked hash and its receipt
pub type ReceiptCallback = Arc<dyn Fn(&str, &TransactionReceipt) + Send + Sync>;

/// Invoked with the tracked hash and the blocks confirming it
pub type ConfirmedCallback = Arc<dyn Fn(&str, &[BlockInfo]) + Send + Sync>;

#[derive(Clone)]
pub struct TrackedTransaction {
    pub hash: String,
    pub on_receipt: ReceiptCallback,
    pub on_confirmed: ConfirmedCallback,
}

impl fmt::Debug for TrackedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedTransaction")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Notification {
    NewTransaction(TrackedTransaction),
    RemovedTransaction { hash: String },
}

impl Notification {
    pub fn hash(&self) -> &str {
        match self {
            Notification::NewTransaction(tx) => &tx.hash,
            Notification::RemovedTransaction { hash } => hash,
        }
    }
}

/// Watches submitted hashes for receipts and confirmation depth
#[async_trait]
pub trait ConfirmationTracker: Send + Sync {
    /// Fails only when the tracker is no longer running. Transient chain
    /// errors are absorbed by the tracker itself.
    async fn notify(&self, notification: Notification) -> TxManagerResult<()>;
}

/// Read access to the chain, as needed for confirmation tracking
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_latest_block_number(&self) -> TxManagerResult<u64>;

    /// `None` until the transaction is mined
    async fn get_transaction_receipt(&self, hash: &str)
        -> TxManagerResult<Option<TransactionReceipt>>;

    /// `None` when the block is not yet available
    async fn get_block_info(&self, block_number: u64) -> TxManagerResult<Option<BlockInfo>>;
}
