// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory transaction store

use super::{SortDirection, TransactionPersistence, TransactionStore, WriteBatch};
use crate::error::{TxManagerError, TxManagerResult};
use crate::types::{Sequence, TransactionRecord, TxStatus, TxUpdates};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct StoreInner {
    /// Records ordered by sequence, the pagination order of the pending list
    by_sequence: BTreeMap<Sequence, TransactionRecord>,
    sequence_by_id: HashMap<String, Sequence>,
    last_sequence: u64,
}

/// Store keeping every transaction in memory.
///
/// Sequences are dense and start at 1. Nothing survives a restart, so this
/// serves tests and single-process deployments that re-submit on boot.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_sequence.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl StoreInner {
    /// Check the whole batch before touching anything
    fn validate(&self, batch: &WriteBatch) -> TxManagerResult<()> {
        let mut inserted = HashSet::new();
        for record in &batch.inserts {
            if self.sequence_by_id.contains_key(&record.id) || !inserted.insert(record.id.as_str())
            {
                return Err(TxManagerError::Conflict(record.id.clone()));
            }
        }
        for (id, _) in &batch.updates {
            if !self.sequence_by_id.contains_key(id) && !inserted.contains(id.as_str()) {
                return Err(TxManagerError::NotFound(id.clone()));
            }
        }
        Ok(())
    }

    fn insert(&mut self, mut record: TransactionRecord) {
        self.last_sequence += 1;
        let sequence = Sequence(self.last_sequence);
        record.sequence = Some(sequence);
        self.sequence_by_id.insert(record.id.clone(), sequence);
        self.by_sequence.insert(sequence, record);
    }

    fn update(&mut self, id: &str, updates: &TxUpdates) {
        if let Some(record) = self
            .sequence_by_id
            .get(id)
            .and_then(|sequence| self.by_sequence.get_mut(sequence))
        {
            updates.apply_to(record);
        }
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn apply_batch(&self, batch: WriteBatch) -> TxManagerResult<()> {
        let mut inner = self.inner.write().await;
        inner.validate(&batch)?;

        let (inserts, updates) = (batch.inserts.len(), batch.updates.len());
        for record in batch.inserts {
            inner.insert(record);
        }
        for (id, txu) in &batch.updates {
            inner.update(id, txu);
        }
        debug!(
            "[MemoryStore] Applied batch: inserts={}, updates={}, last_sequence={}",
            inserts, updates, inner.last_sequence
        );
        Ok(())
    }

    async fn list_transactions_pending(
        &self,
        after: Option<Sequence>,
        limit: usize,
        direction: SortDirection,
    ) -> TxManagerResult<Vec<TransactionRecord>> {
        let inner = self.inner.read().await;
        let pending = |(_, record): (&Sequence, &TransactionRecord)| {
            (record.status == TxStatus::Pending).then(|| record.clone())
        };
        let records = match (direction, after) {
            (SortDirection::Ascending, Some(after)) => inner
                .by_sequence
                .range((Bound::Excluded(after), Bound::Unbounded))
                .filter_map(pending)
                .take(limit)
                .collect(),
            (SortDirection::Ascending, None) => inner
                .by_sequence
                .iter()
                .filter_map(pending)
                .take(limit)
                .collect(),
            (SortDirection::Descending, Some(after)) => inner
                .by_sequence
                .range(..after)
                .rev()
                .filter_map(pending)
                .take(limit)
                .collect(),
            (SortDirection::Descending, None) => inner
                .by_sequence
                .iter()
                .rev()
                .filter_map(pending)
                .take(limit)
                .collect(),
        };
        Ok(records)
    }

    async fn get_transaction_by_id(&self, id: &str) -> TxManagerResult<Option<TransactionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sequence_by_id
            .get(id)
            .and_then(|sequence| inner.by_sequence.get(sequence))
            .cloned())
    }
}

/// Unbatched persistence, each write applied directly
#[async_trait]
impl TransactionPersistence for MemoryStore {
    async fn list_transactions_pending(
        &self,
        after: Option<Sequence>,
        limit: usize,
        direction: SortDirection,
    ) -> TxManagerResult<Vec<TransactionRecord>> {
        TransactionStore::list_transactions_pending(self, after, limit, direction).await
    }

    async fn write_transaction(
        &self,
        record: &TransactionRecord,
        is_new: bool,
    ) -> TxManagerResult<()> {
        let batch = if is_new {
            WriteBatch {
                inserts: vec![record.clone()],
                updates: vec![],
            }
        } else {
            WriteBatch {
                inserts: vec![],
                updates: vec![(record.id.clone(), TxUpdates::from_record(record))],
            }
        };
        self.apply_batch(batch).await
    }

    async fn get_transaction_by_id(&self, id: &str) -> TxManagerResult<Option<TransactionRecord>> {
        TransactionStore::get_transaction_by_id(self, id).await
    }
}
