// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The serialized policy loop
//!
//! One task owns the inflight set. Each cycle optionally refills the set,
//! then walks it in sequence order running the decision step for every
//! entry. Confirmation callbacks never touch the set; they write into the
//! shared confirmation slots and wake the loop.

use super::inflight::{ConfirmationSlot, InflightSet, PendingState, SharedConfirmations};
use super::Signals;
use crate::config::ManagerConfig;
use crate::confirmations::{
    ConfirmationTracker, ConfirmedCallback, Notification, ReceiptCallback, TrackedTransaction,
};
use crate::error::TxManagerResult;
use crate::metrics::TxManagerMetrics;
use crate::notifications::{NotificationSink, TransactionUpdateReply};
use crate::persistence::TransactionPersistence;
use crate::policy::PolicyEngine;
use crate::types::BlockInfo;
use crate::utils::{lock, now_ms, short_hash};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleTrigger {
    Stale,
    Update,
    Timer,
}

impl CycleTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            CycleTrigger::Stale => "stale",
            CycleTrigger::Update => "update",
            CycleTrigger::Timer => "timer",
        }
    }
}

/// Everything the decision step needs apart from the inflight set itself
pub(crate) struct PolicyContext {
    pub config: ManagerConfig,
    pub persistence: Arc<dyn TransactionPersistence>,
    pub confirmations: Arc<dyn ConfirmationTracker>,
    pub policy_engine: Arc<dyn PolicyEngine>,
    pub notifier: Arc<dyn NotificationSink>,
    pub metrics: Option<Arc<TxManagerMetrics>>,
    pub signals: Signals,
    pub slots: SharedConfirmations,
}

pub(crate) struct PolicyLoop {
    pub ctx: PolicyContext,
    pub inflight: InflightSet,
}

impl PolicyLoop {
    pub fn new(ctx: PolicyContext) -> Self {
        let inflight = InflightSet::new(ctx.config.max_inflight);
        Self { ctx, inflight }
    }

    pub async fn run(
        mut self,
        mut stale_rx: mpsc::Receiver<()>,
        mut update_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        info!(
            "[PolicyLoop] Starting: max_inflight={}, interval={:?}, policy_min_interval={:?}",
            self.ctx.config.max_inflight,
            self.ctx.config.policy_loop_interval(),
            self.ctx.config.policy_cycle_min_interval()
        );
        // populate the set straight away
        self.ctx.signals.mark_inflight_stale();

        loop {
            let timer = tokio::time::sleep(self.ctx.config.policy_loop_interval());
            let trigger = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = stale_rx.recv() => CycleTrigger::Stale,
                _ = update_rx.recv() => CycleTrigger::Update,
                _ = timer => CycleTrigger::Timer,
            };
            self.cycle(trigger, &cancel).await;
        }
        info!(
            "[PolicyLoop] Cancelled, abandoning {} inflight transactions",
            self.inflight.len()
        );
    }

    /// Run one cycle. Returns `false` when a refill was cut short by
    /// cancellation, in which case no entry was processed.
    pub async fn cycle(&mut self, trigger: CycleTrigger, cancel: &CancellationToken) -> bool {
        if let Some(metrics) = &self.ctx.metrics {
            metrics
                .policy_loop_cycles
                .with_label_values(&[trigger.as_str()])
                .inc();
        }

        if trigger == CycleTrigger::Stale {
            let started = Instant::now();
            let refilled = self
                .inflight
                .refill(
                    self.ctx.persistence.as_ref(),
                    &self.ctx.config.retry,
                    &self.ctx.slots,
                    cancel,
                )
                .await;
            if let Some(metrics) = &self.ctx.metrics {
                let outcome = if refilled { "ok" } else { "cancelled" };
                metrics
                    .inflight_refill_latency
                    .with_label_values(&[outcome])
                    .observe(started.elapsed().as_secs_f64());
                metrics.inflight_transactions.set(self.inflight.len() as i64);
            }
            if !refilled {
                return false;
            }
        }

        for pending in self.inflight.entries_mut() {
            if pending.remove {
                continue;
            }
            if let Err(e) = self.ctx.exec_policy(pending).await {
                error!(
                    "[PolicyLoop] Failed policy cycle for transaction {} hash={:?}: {}",
                    pending.record.id, pending.record.transaction_hash, e
                );
            }
        }
        true
    }
}

impl PolicyContext {
    /// Decision step for one working set entry
    pub async fn exec_policy(&self, pending: &mut PendingState) -> TxManagerResult<()> {
        let (confirmed, confirmations) = self.take_confirmation_state(pending);

        let mut updated = pending.needs_write;
        let mut completed = false;
        let mut policy_failed = false;

        if confirmed {
            if let Some(confirmations) = confirmations {
                pending.record.confirmations = confirmations;
            }
            // already terminal means the previous write of the transition failed
            if pending.record.is_terminal() || pending.record.complete_from_receipt().is_some() {
                updated = true;
                completed = true;
                info!(
                    "[PolicyLoop] Transaction {} completed: status={}, hash={:?}",
                    pending.record.id, pending.record.status, pending.record.transaction_hash
                );
            } else {
                warn!(
                    "[PolicyLoop] Transaction {} confirmed without a receipt, waiting",
                    pending.record.id
                );
            }
        } else if pending.policy_due(self.config.policy_cycle_min_interval()) {
            match self.policy_engine.execute(&mut pending.record).await {
                Err(e) => {
                    error!(
                        "[PolicyLoop] Policy engine returned error for transaction {} reason={}: {}",
                        pending.record.id, e.reason, e.message
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .policy_engine_errors
                            .with_label_values(&[e.reason.as_str()])
                            .inc();
                    }
                    pending.record.add_error(
                        e.reason,
                        e.message,
                        self.config.error_history_count,
                        now_ms(),
                    );
                    policy_failed = true;
                }
                Ok(changed) => {
                    if pending.record.first_submit_ms.is_some()
                        && pending.record.transaction_hash.is_some()
                        && pending.record.transaction_hash != pending.tracking_hash
                    {
                        self.track_submitted_transaction(pending).await;
                    }
                    pending.last_policy_cycle = Some(Instant::now());
                    updated |= changed;
                }
            }
        }

        if !(updated || policy_failed) {
            return Ok(());
        }

        pending.record.touch_updated(now_ms());
        if let Err(e) = self
            .persistence
            .write_transaction(&pending.record, false)
            .await
        {
            pending.needs_write = true;
            if let Some(metrics) = &self.metrics {
                metrics
                    .persistence_write_errors
                    .with_label_values(&[e.error_type()])
                    .inc();
            }
            error!(
                "[PolicyLoop] Failed to update transaction {} (status={}): {}",
                pending.record.id, pending.record.status, e
            );
            return Err(e);
        }
        pending.needs_write = false;

        if completed {
            pending.remove = true;
            if let Some(metrics) = &self.metrics {
                metrics
                    .transactions_completed
                    .with_label_values(&[pending.record.status.as_str()])
                    .inc();
            }
            self.signals.mark_inflight_stale();
        }
        self.notifier
            .send_reply(TransactionUpdateReply::from_record(&pending.record));
        Ok(())
    }

    /// Copy what the callbacks delivered into the record. Returns whether the
    /// transaction is confirmed and, if so, its confirming blocks.
    fn take_confirmation_state(
        &self,
        pending: &mut PendingState,
    ) -> (bool, Option<Vec<BlockInfo>>) {
        let slots = lock(&self.slots);
        let Some(slot) = slots.get(&pending.record.id) else {
            return (false, None);
        };
        if slot.receipt.is_some() {
            pending.record.receipt = slot.receipt.clone();
        }
        if slot.confirmed {
            (true, Some(slot.confirmations.clone()))
        } else {
            (false, None)
        }
    }

    /// Point the confirmation tracker at the record's current hash.
    ///
    /// On failure the tracked hash is left as it was, so the next cycle tries
    /// again.
    async fn track_submitted_transaction(&self, pending: &mut PendingState) {
        let Some(new_hash) = pending.record.transaction_hash.clone() else {
            return;
        };
        let id = pending.record.id.clone();

        if let Some(old_hash) = &pending.tracking_hash {
            if let Err(e) = self
                .confirmations
                .notify(Notification::RemovedTransaction {
                    hash: old_hash.clone(),
                })
                .await
            {
                info!(
                    "[PolicyLoop] Error detected notifying confirmation tracker: {}",
                    e
                );
                return;
            }
        }

        lock(&self.slots).insert(id.clone(), ConfirmationSlot::new(new_hash.clone()));
        let tracked = TrackedTransaction {
            hash: new_hash.clone(),
            on_receipt: self.receipt_callback(id.clone()),
            on_confirmed: self.confirmed_callback(id.clone()),
        };
        match self
            .confirmations
            .notify(Notification::NewTransaction(tracked))
            .await
        {
            Ok(()) => {
                debug!(
                    "[PolicyLoop] Tracking transaction {} hash={}",
                    id,
                    short_hash(&new_hash)
                );
                pending.tracking_hash = Some(new_hash);
            }
            Err(e) => {
                info!(
                    "[PolicyLoop] Error detected notifying confirmation tracker: {}",
                    e
                );
            }
        }
    }

    fn receipt_callback(&self, id: String) -> ReceiptCallback {
        let slots = self.slots.clone();
        let signals = self.signals.clone();
        Arc::new(move |hash, receipt| {
            {
                let mut slots = lock(&slots);
                match slots.get_mut(&id) {
                    Some(slot) if slot.hash == hash => slot.receipt = Some(receipt.clone()),
                    _ => return,
                }
            }
            debug!(
                "[PolicyLoop] Receipt received for transaction {} hash={} block={}",
                id,
                short_hash(hash),
                receipt.block_number
            );
            signals.mark_inflight_update();
        })
    }

    fn confirmed_callback(&self, id: String) -> ConfirmedCallback {
        let slots = self.slots.clone();
        let signals = self.signals.clone();
        Arc::new(move |hash, blocks| {
            {
                let mut slots = lock(&slots);
                match slots.get_mut(&id) {
                    Some(slot) if slot.hash == hash => {
                        slot.confirmed = true;
                        slot.confirmations = blocks.to_vec();
                    }
                    _ => return,
                }
            }
            debug!(
                "[PolicyLoop] Confirmed transaction {} hash={}",
                id,
                short_hash(hash)
            );
            signals.mark_inflight_update();
        })
    }
}
