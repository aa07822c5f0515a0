// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction manager
//!
//! Owns the policy loop and hands out a cloneable [`TxManagerHandle`] for
//! submitting transactions and waking the loop.
//!
//! Wake-ups are single-slot channels fed with `try_send`: any number of raises
//! before the loop runs collapse into one pending trigger, and raising never
//! blocks the caller.

mod inflight;
mod policy_loop;


use crate::config::ManagerConfig;
use crate::confirmations::ConfirmationTracker;
use crate::error::TxManagerResult;
use crate::metrics::TxManagerMetrics;
use crate::notifications::NotificationSink;
use crate::persistence::TransactionPersistence;
use crate::policy::PolicyEngine;
use crate::types::{TransactionHeaders, TransactionRecord};
use crate::utils::now_ms;
use inflight::SharedConfirmations;
use policy_loop::{PolicyContext, PolicyLoop};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

/// Coalesced wake signals into the policy loop
#[derive(Clone)]
pub(crate) struct Signals {
    stale: mpsc::Sender<()>,
    update: mpsc::Sender<()>,
    update_enabled: bool,
}

impl Signals {
    pub fn new(update_enabled: bool) -> (Self, mpsc::Receiver<()>, mpsc::Receiver<()>) {
        let (stale, stale_rx) = mpsc::channel(1);
        let (update, update_rx) = mpsc::channel(1);
        let signals = Self {
            stale,
            update,
            update_enabled,
        };
        (signals, stale_rx, update_rx)
    }

    /// The inflight set should be compacted and refilled
    pub fn mark_inflight_stale(&self) {
        if self.stale.try_send(()).is_err() {
            trace!("[PolicyLoop] Stale signal already pending");
        }
    }

    /// Something changed, run a cycle without refilling
    pub fn mark_inflight_update(&self) {
        if self.update_enabled && self.update.try_send(()).is_err() {
            trace!("[PolicyLoop] Update signal already pending");
        }
    }
}

pub struct TxManager {
    namespace: String,
    config: ManagerConfig,
    persistence: Arc<dyn TransactionPersistence>,
    confirmations: Arc<dyn ConfirmationTracker>,
    policy_engine: Arc<dyn PolicyEngine>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Option<Arc<TxManagerMetrics>>,
}

impl TxManager {
    pub fn new(
        namespace: &str,
        config: ManagerConfig,
        persistence: Arc<dyn TransactionPersistence>,
        confirmations: Arc<dyn ConfirmationTracker>,
        policy_engine: Arc<dyn PolicyEngine>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            config,
            persistence,
            confirmations,
            policy_engine,
            notifier,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<TxManagerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the policy loop. It runs until `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> (TxManagerHandle, JoinHandle<()>) {
        let (policy_loop, handle, stale_rx, update_rx) = self.build();
        info!("[TxManager] Starting transaction manager for namespace '{}'", handle.namespace);
        let join = tokio::spawn(policy_loop.run(stale_rx, update_rx, cancel));
        (handle, join)
    }

    fn build(
        self,
    ) -> (
        PolicyLoop,
        TxManagerHandle,
        mpsc::Receiver<()>,
        mpsc::Receiver<()>,
    ) {
        let (signals, stale_rx, update_rx) = Signals::new(self.config.inflight_update_signal);
        let handle = TxManagerHandle {
            namespace: self.namespace,
            persistence: self.persistence.clone(),
            signals: signals.clone(),
        };
        let policy_loop = PolicyLoop::new(PolicyContext {
            config: self.config,
            persistence: self.persistence,
            confirmations: self.confirmations,
            policy_engine: self.policy_engine,
            notifier: self.notifier,
            metrics: self.metrics,
            signals,
            slots: SharedConfirmations::default(),
        });
        (policy_loop, handle, stale_rx, update_rx)
    }
}

/// Client side of a running manager
#[derive(Clone)]
pub struct TxManagerHandle {
    namespace: String,
    persistence: Arc<dyn TransactionPersistence>,
    signals: Signals,
}

impl TxManagerHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mark_inflight_stale(&self) {
        self.signals.mark_inflight_stale();
    }

    pub fn mark_inflight_update(&self) {
        self.signals.mark_inflight_update();
    }

    /// Durably record a new pending transaction and wake the loop to pick it
    /// up. Returns the stored record, sequence included.
    pub async fn submit_transaction(
        &self,
        headers: TransactionHeaders,
        transaction_data: String,
    ) -> TxManagerResult<TransactionRecord> {
        let record = TransactionRecord::new(&self.namespace, headers, transaction_data, now_ms());
        self.persistence.write_transaction(&record, true).await?;
        info!("[TxManager] Accepted transaction {}", record.id);
        self.mark_inflight_stale();

        let stored = self.persistence.get_transaction_by_id(&record.id).await?;
        Ok(stored.unwrap_or(record))
    }

    pub async fn get_transaction(&self, id: &str) -> TxManagerResult<Option<TransactionRecord>> {
        self.persistence.get_transaction_by_id(id).await
    }
}
