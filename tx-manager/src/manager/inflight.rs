// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bounded working set of pending transactions

use crate::config::RetryConfig;
use crate::persistence::{SortDirection, TransactionPersistence};
use crate::retry::retry_until_cancelled;
use crate::types::{BlockInfo, Sequence, TransactionReceipt, TransactionRecord};
use crate::utils::lock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fields written by confirmation callbacks and read by the policy loop
#[derive(Debug, Clone)]
pub(crate) struct ConfirmationSlot {
    /// Hash the callbacks were registered for
    pub hash: String,
    pub receipt: Option<TransactionReceipt>,
    pub confirmations: Vec<BlockInfo>,
    pub confirmed: bool,
}

impl ConfirmationSlot {
    pub fn new(hash: String) -> Self {
        Self {
            hash,
            receipt: None,
            confirmations: Vec::new(),
            confirmed: false,
        }
    }
}

/// Confirmation slots by transaction id, one lock for the whole manager
pub(crate) type SharedConfirmations = Arc<Mutex<HashMap<String, ConfirmationSlot>>>;

/// Working set entry, owned by the policy loop
#[derive(Debug)]
pub(crate) struct PendingState {
    pub record: TransactionRecord,
    pub last_policy_cycle: Option<Instant>,
    /// Terminal status persisted, drop at the next refill
    pub remove: bool,
    /// Hash currently registered with the confirmation tracker
    pub tracking_hash: Option<String>,
    /// The last write of this record failed
    pub needs_write: bool,
}

impl PendingState {
    pub fn new(record: TransactionRecord) -> Self {
        Self {
            record,
            last_policy_cycle: None,
            remove: false,
            tracking_hash: None,
            needs_write: false,
        }
    }

    pub fn policy_due(&self, min_interval: Duration) -> bool {
        self.last_policy_cycle
            .map_or(true, |last| last.elapsed() >= min_interval)
    }
}

pub(crate) struct InflightSet {
    entries: Vec<PendingState>,
    capacity: usize,
}

impl InflightSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[PendingState] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [PendingState] {
        &mut self.entries
    }

    /// Drop entries flagged for removal along with their confirmation slots
    pub fn compact(&mut self, slots: &SharedConfirmations) -> usize {
        let before = self.entries.len();
        let mut slots = lock(slots);
        self.entries.retain(|pending| {
            if pending.remove {
                slots.remove(&pending.record.id);
            }
            !pending.remove
        });
        before - self.entries.len()
    }

    fn last_sequence(&self) -> Option<Sequence> {
        self.entries.last().and_then(|pending| pending.record.sequence)
    }

    /// Compact, then top the set up from the pending backlog.
    ///
    /// The backlog read is retried until it succeeds. Returns `false` when
    /// `cancel` fires first, in which case only the compaction took effect.
    pub async fn refill(
        &mut self,
        persistence: &dyn TransactionPersistence,
        retry: &RetryConfig,
        slots: &SharedConfirmations,
        cancel: &CancellationToken,
    ) -> bool {
        let removed = self.compact(slots);
        let spaces = self.capacity.saturating_sub(self.entries.len());
        if spaces == 0 {
            debug!(
                "[PolicyLoop] Inflight set full: size={}, removed={}",
                self.entries.len(),
                removed
            );
            return true;
        }

        let after = self.last_sequence();
        let records = match retry_until_cancelled(retry, cancel, "list pending transactions", || {
            persistence.list_transactions_pending(after, spaces, SortDirection::Ascending)
        })
        .await
        {
            Some(records) => records,
            None => return false,
        };

        let known: HashSet<String> = self.entries.iter().map(|p| p.record.id.clone()).collect();
        let mut added = 0;
        for record in records.into_iter().take(spaces) {
            if known.contains(&record.id) {
                continue;
            }
            self.entries.push(PendingState::new(record));
            added += 1;
        }
        debug!(
            "[PolicyLoop] Inflight set refilled: removed={}, added={}, size={}, after={:?}",
            removed,
            added,
            self.entries.len(),
            after.map(|s| s.to_string())
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockPersistence;
    use crate::types::TxStatus;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
        }
    }

    fn ids(set: &InflightSet) -> Vec<u64> {
        set.entries()
            .iter()
            .map(|p| p.record.sequence.unwrap().0)
            .collect()
    }

    #[tokio::test]
    async fn test_refill_compacts_and_pages_after_last_sequence() {
        let persistence = MockPersistence::new();
        let records = persistence.seed(3).await;
        let slots = SharedConfirmations::default();
        let cancel = CancellationToken::new();

        let mut set = InflightSet::new(2);
        assert!(set.refill(&persistence, &fast_retry(), &slots, &cancel).await);
        assert_eq!(ids(&set), vec![1, 2]);

        // at capacity: no backlog query
        let calls = persistence.list_calls().len();
        assert!(set.refill(&persistence, &fast_retry(), &slots, &cancel).await);
        assert_eq!(persistence.list_calls().len(), calls);

        // tx 1 completes and is flagged
        persistence.set_status(&records[0].id, TxStatus::Succeeded).await;
        set.entries_mut()[0].remove = true;
        lock(&slots).insert(records[0].id.clone(), ConfirmationSlot::new("0x01".into()));

        assert!(set.refill(&persistence, &fast_retry(), &slots, &cancel).await);
        assert_eq!(ids(&set), vec![2, 3]);
        assert_eq!(persistence.list_calls().last(), Some(&(Some(Sequence(2)), 1)));
        assert!(lock(&slots).is_empty());
    }

    #[tokio::test]
    async fn test_refill_retries_transient_failures() {
        let persistence = MockPersistence::new();
        persistence.seed(1).await;
        persistence.fail_lists(3);
        let slots = SharedConfirmations::default();

        let mut set = InflightSet::new(5);
        assert!(
            set.refill(&persistence, &fast_retry(), &slots, &CancellationToken::new())
                .await
        );
        assert_eq!(set.len(), 1);
        assert_eq!(persistence.list_calls().len(), 4);
    }

    #[tokio::test]
    async fn test_refill_reports_cancellation() {
        let persistence = MockPersistence::new();
        persistence.seed(1).await;
        persistence.fail_lists(usize::MAX);
        let slots = SharedConfirmations::default();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let mut set = InflightSet::new(5);
        assert!(!set.refill(&persistence, &fast_retry(), &slots, &cancel).await);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_policy_due() {
        let mut pending = PendingState::new(TransactionRecord::new(
            "ns1",
            Default::default(),
            "0x".to_string(),
            1,
        ));
        assert!(pending.policy_due(Duration::from_secs(60)));
        pending.last_policy_cycle = Some(Instant::now());
        assert!(!pending.policy_due(Duration::from_secs(60)));
        assert!(pending.policy_due(Duration::ZERO));
    }
}
