// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block-counting confirmation tracker
//!
//! A single task owns the set of watched hashes. Registrations arrive over a
//! channel; on every poll tick the task asks the chain for missing receipts
//! and, for hashes that already have one, whether the head is far enough past
//! the receipt block.
//!
//! A receipt is dropped again when the block at its height no longer carries
//! the receipt's block hash, so a reorged-out transaction is re-queried and
//! may deliver a fresh receipt before it is confirmed.

use super::{ChainReader, ConfirmationTracker, Notification, TrackedTransaction};
use crate::config::ConfirmationsConfig;
use crate::error::{TxManagerError, TxManagerResult};
use crate::metrics::TxManagerMetrics;
use crate::types::{BlockInfo, TransactionReceipt};
use crate::utils::short_hash;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// upper bound on the confirming-block buffer allocated up front
const MAX_BLOCKS_HINT: usize = 1024;

pub struct BlockConfirmationTracker {
    tx: mpsc::Sender<Notification>,
}

impl BlockConfirmationTracker {
    pub fn start(
        chain: Arc<dyn ChainReader>,
        config: &ConfirmationsConfig,
        cancel: CancellationToken,
        metrics: Option<Arc<TxManagerMetrics>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_size.max(1));
        let worker = TrackerWorker {
            chain,
            required_confirmations: config.required_confirmations,
            poll_interval: config.poll_interval(),
            tracked: HashMap::new(),
            metrics,
        };
        let handle = tokio::spawn(worker.run(rx, cancel));
        (Self { tx }, handle)
    }
}

#[async_trait]
impl ConfirmationTracker for BlockConfirmationTracker {
    async fn notify(&self, notification: Notification) -> TxManagerResult<()> {
        let hash = notification.hash().to_string();
        self.tx.send(notification).await.map_err(|_| {
            TxManagerError::ConfirmationsUnavailable(format!(
                "confirmation tracker stopped, dropped notification for {}",
                short_hash(&hash)
            ))
        })
    }
}

struct TrackedState {
    tx: TrackedTransaction,
    receipt: Option<TransactionReceipt>,
}

enum PollOutcome {
    Waiting,
    Confirmed(Vec<BlockInfo>),
}

struct TrackerWorker {
    chain: Arc<dyn ChainReader>,
    required_confirmations: u64,
    poll_interval: Duration,
    tracked: HashMap<String, TrackedState>,
    metrics: Option<Arc<TxManagerMetrics>>,
}

impl TrackerWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Notification>, cancel: CancellationToken) {
        info!(
            "[Confirmations] Starting tracker: required_confirmations={}, poll_interval={:?}",
            self.required_confirmations, self.poll_interval
        );
        // a zero period panics in tokio
        let mut interval = time::interval(self.poll_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("[Confirmations] Tracker cancelled");
                    break;
                }
                notification = rx.recv() => match notification {
                    Some(notification) => self.handle_notification(notification),
                    None => break,
                },
                _ = interval.tick() => self.poll().await,
            }
        }
    }

    fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::NewTransaction(tx) => {
                debug!("[Confirmations] Tracking {}", short_hash(&tx.hash));
                self.tracked
                    .insert(tx.hash.clone(), TrackedState { tx, receipt: None });
            }
            Notification::RemovedTransaction { hash } => {
                if self.tracked.remove(&hash).is_some() {
                    debug!("[Confirmations] Stopped tracking {}", short_hash(&hash));
                }
            }
        }
        self.update_gauge();
    }

    async fn poll(&mut self) {
        if self.tracked.is_empty() {
            return;
        }
        let latest = match self.chain.get_latest_block_number().await {
            Ok(latest) => latest,
            Err(e) => {
                self.record_chain_error("get_latest_block_number");
                warn!("[Confirmations] Failed to get latest block: {}", e);
                return;
            }
        };

        let hashes: Vec<String> = self.tracked.keys().cloned().collect();
        for hash in hashes {
            match self.poll_one(&hash, latest).await {
                Ok(PollOutcome::Waiting) => {}
                Ok(PollOutcome::Confirmed(blocks)) => {
                    if let Some(state) = self.tracked.remove(&hash) {
                        debug!(
                            "[Confirmations] {} confirmed by {} blocks",
                            short_hash(&hash),
                            blocks.len()
                        );
                        (state.tx.on_confirmed)(&hash, &blocks);
                    }
                }
                Err(e) => {
                    warn!(
                        "[Confirmations] Failed to check {}: {}",
                        short_hash(&hash),
                        e
                    );
                }
            }
        }
        self.update_gauge();
    }

    async fn poll_one(&mut self, hash: &str, latest: u64) -> TxManagerResult<PollOutcome> {
        let Some(receipt) = self.current_receipt(hash).await? else {
            return Ok(PollOutcome::Waiting);
        };

        // the receipt block must still be canonical
        match self.get_block(receipt.block_number).await? {
            Some(block) if block.block_hash == receipt.block_hash => {}
            Some(block) => {
                info!(
                    "[Confirmations] Receipt for {} was in block {} ({}), now {}; re-querying",
                    short_hash(hash),
                    receipt.block_number,
                    short_hash(&receipt.block_hash),
                    short_hash(&block.block_hash)
                );
                if let Some(state) = self.tracked.get_mut(hash) {
                    state.receipt = None;
                }
                return Ok(PollOutcome::Waiting);
            }
            None => return Ok(PollOutcome::Waiting),
        }

        let Some(target) = receipt
            .block_number
            .checked_add(self.required_confirmations)
        else {
            return Ok(PollOutcome::Waiting);
        };
        if latest < target {
            return Ok(PollOutcome::Waiting);
        }

        let mut blocks = Vec::with_capacity(
            usize::try_from(self.required_confirmations)
                .unwrap_or(MAX_BLOCKS_HINT)
                .min(MAX_BLOCKS_HINT),
        );
        let mut parent_hash = receipt.block_hash.clone();
        for number in receipt.block_number + 1..=target {
            let Some(block) = self.get_block(number).await? else {
                return Ok(PollOutcome::Waiting);
            };
            if block.parent_hash != parent_hash {
                // chain is moving under us, try again next tick
                return Ok(PollOutcome::Waiting);
            }
            parent_hash = block.block_hash.clone();
            blocks.push(block);
        }
        Ok(PollOutcome::Confirmed(blocks))
    }

    /// Returns the receipt for `hash`, fetching and announcing it on first sight
    async fn current_receipt(&mut self, hash: &str) -> TxManagerResult<Option<TransactionReceipt>> {
        if let Some(receipt) = self.tracked.get(hash).and_then(|s| s.receipt.clone()) {
            return Ok(Some(receipt));
        }
        let fetched = self
            .chain
            .get_transaction_receipt(hash)
            .await
            .inspect_err(|_| self.record_chain_error("get_transaction_receipt"))?;
        let Some(receipt) = fetched else {
            return Ok(None);
        };
        let Some(state) = self.tracked.get_mut(hash) else {
            return Ok(None);
        };
        debug!(
            "[Confirmations] Receipt for {} in block {}",
            short_hash(hash),
            receipt.block_number
        );
        state.receipt = Some(receipt.clone());
        (state.tx.on_receipt)(hash, &receipt);
        Ok(Some(receipt))
    }

    async fn get_block(&self, number: u64) -> TxManagerResult<Option<BlockInfo>> {
        self.chain
            .get_block_info(number)
            .await
            .inspect_err(|_| self.record_chain_error("get_block_info"))
    }

    fn record_chain_error(&self, method: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .chain_reader_errors
                .with_label_values(&[method])
                .inc();
        }
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.tracked_transactions.set(self.tracked.len() as i64);
        }
    }
}
