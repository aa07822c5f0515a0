// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable transaction storage
//!
//! The control loop only sees [`TransactionPersistence`]: an ordered view of
//! the pending backlog plus an upsert of a transaction's current state. Behind
//! it, writes are funnelled through a [`TransactionWriter`] that batches and
//! compacts operations before handing them to a [`TransactionStore`].
//!
//! ```text
//!  write_transaction() ──▶ TransactionWriter ──(hash(id) % N)──▶ worker N
//!         ▲                                                        │
//!         │ oneshot result                       batch + compact   ▼
//!         └───────────────────────────────────── TransactionStore::apply_batch
//! ```
//!
//! A write returns only once the batch holding it has been applied, so
//! callers observe synchronous durability.

mod memory;
mod writer;

pub use memory::MemoryStore;
pub use writer::TransactionWriter;

use crate::error::TxManagerResult;
use crate::types::{Sequence, TransactionRecord, TxUpdates};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Storage contract consumed by the control loop
#[async_trait]
pub trait TransactionPersistence: Send + Sync {
    /// Pending transactions strictly after (or before, when descending) the
    /// `after` cursor, ordered by sequence, at most `limit` of them.
    async fn list_transactions_pending(
        &self,
        after: Option<Sequence>,
        limit: usize,
        direction: SortDirection,
    ) -> TxManagerResult<Vec<TransactionRecord>>;

    /// Upsert the current state of `record`. `is_new` inserts and assigns a
    /// sequence; otherwise the existing record is overwritten.
    async fn write_transaction(&self, record: &TransactionRecord, is_new: bool)
        -> TxManagerResult<()>;

    async fn get_transaction_by_id(&self, id: &str) -> TxManagerResult<Option<TransactionRecord>>;
}

/// A compacted set of writes applied to the store in one call
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub inserts: Vec<TransactionRecord>,
    pub updates: Vec<(String, TxUpdates)>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backing store underneath the writer
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Apply every insert and update in the batch, or none of them
    async fn apply_batch(&self, batch: WriteBatch) -> TxManagerResult<()>;

    async fn list_transactions_pending(
        &self,
        after: Option<Sequence>,
        limit: usize,
        direction: SortDirection,
    ) -> TxManagerResult<Vec<TransactionRecord>>;

    async fn get_transaction_by_id(&self, id: &str) -> TxManagerResult<Option<TransactionRecord>>;
}

/// Reads straight from the store, writes through the batching writer
pub struct BatchedPersistence {
    store: Arc<dyn TransactionStore>,
    writer: TransactionWriter,
}

impl BatchedPersistence {
    pub fn new(store: Arc<dyn TransactionStore>, writer: TransactionWriter) -> Self {
        Self { store, writer }
    }
}

#[async_trait]
impl TransactionPersistence for BatchedPersistence {
    async fn list_transactions_pending(
        &self,
        after: Option<Sequence>,
        limit: usize,
        direction: SortDirection,
    ) -> TxManagerResult<Vec<TransactionRecord>> {
        self.store
            .list_transactions_pending(after, limit, direction)
            .await
    }

    async fn write_transaction(
        &self,
        record: &TransactionRecord,
        is_new: bool,
    ) -> TxManagerResult<()> {
        if is_new {
            self.writer.insert(record.clone()).await
        } else {
            self.writer
                .update(record.id.clone(), TxUpdates::from_record(record))
                .await
        }
    }

    async fn get_transaction_by_id(&self, id: &str) -> TxManagerResult<Option<TransactionRecord>> {
        self.store.get_transaction_by_id(id).await
    }
}
