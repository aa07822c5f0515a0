// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Batching transaction writer
//!
//! Operations are routed to one of N workers by a hash of the transaction
//! id, so all writes for one transaction are applied in submission order by
//! a single worker. Each worker collects up to `batch_size` operations, or
//! whatever arrived within `batch_timeout` of the first one, compacts them
//! and applies the result to the store in one call.

use super::{TransactionStore, WriteBatch};
use crate::config::WriterConfig;
use crate::error::{TxManagerError, TxManagerResult};
use crate::metrics::TxManagerMetrics;
use crate::types::{TransactionRecord, TxUpdates};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum WriteKind {
    Insert(TransactionRecord),
    Update(String, TxUpdates),
}

impl WriteKind {
    fn id(&self) -> &str {
        match self {
            WriteKind::Insert(record) => &record.id,
            WriteKind::Update(id, _) => id,
        }
    }
}

struct WriteOp {
    kind: WriteKind,
    done: oneshot::Sender<TxManagerResult<()>>,
}

/// Compacted operation together with every caller waiting on it
struct PendingWrite {
    kind: WriteKind,
    waiters: Vec<oneshot::Sender<TxManagerResult<()>>>,
}

impl PendingWrite {
    fn to_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::default();
        match &self.kind {
            WriteKind::Insert(record) => batch.inserts.push(record.clone()),
            WriteKind::Update(id, txu) => batch.updates.push((id.clone(), txu.clone())),
        }
        batch
    }

    fn complete(self, result: TxManagerResult<()>) {
        for waiter in self.waiters {
            // caller may have gone away, nothing to do then
            let _ = waiter.send(result.clone());
        }
    }
}

/// Handle used to submit writes to the worker pool
#[derive(Clone)]
pub struct TransactionWriter {
    senders: Vec<mpsc::Sender<WriteOp>>,
}

impl TransactionWriter {
    /// Spawn the workers. They stop once `cancel` fires, after which every
    /// write fails with [`TxManagerError::WriterStopped`].
    pub fn start(
        store: Arc<dyn TransactionStore>,
        config: &WriterConfig,
        cancel: CancellationToken,
        metrics: Option<Arc<TxManagerMetrics>>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let worker_count = config.writer_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(config.channel_size.max(1));
            senders.push(tx);
            let worker = WriterWorker {
                index,
                store: store.clone(),
                batch_size: config.batch_size.max(1),
                batch_timeout: config.batch_timeout(),
                metrics: metrics.clone(),
            };
            handles.push(tokio::spawn(worker.run(rx, cancel.clone())));
        }
        info!(
            "[TxWriter] Started {} writers: batch_size={}, batch_timeout={:?}",
            worker_count,
            config.batch_size,
            config.batch_timeout()
        );

        (Self { senders }, handles)
    }

    pub async fn insert(&self, record: TransactionRecord) -> TxManagerResult<()> {
        self.submit(WriteKind::Insert(record)).await
    }

    pub async fn update(&self, id: String, updates: TxUpdates) -> TxManagerResult<()> {
        self.submit(WriteKind::Update(id, updates)).await
    }

    async fn submit(&self, kind: WriteKind) -> TxManagerResult<()> {
        let sender = &self.senders[self.route(kind.id())];
        let (done, result) = oneshot::channel();
        sender
            .send(WriteOp { kind, done })
            .await
            .map_err(|_| TxManagerError::WriterStopped)?;
        result.await.map_err(|_| TxManagerError::WriterStopped)?
    }

    fn route(&self, id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }
}

struct WriterWorker {
    index: usize,
    store: Arc<dyn TransactionStore>,
    batch_size: usize,
    batch_timeout: Duration,
    metrics: Option<Arc<TxManagerMetrics>>,
}

impl WriterWorker {
    async fn run(self, mut rx: mpsc::Receiver<WriteOp>, cancel: CancellationToken) {
        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                op = rx.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };

            let mut ops = vec![first];
            let deadline = Instant::now() + self.batch_timeout;
            while ops.len() < self.batch_size {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    op = rx.recv() => match op {
                        Some(op) => ops.push(op),
                        None => break,
                    },
                }
            }

            self.flush(ops).await;
        }
        // queued ops are dropped with the receiver, their callers see WriterStopped
        info!("[TxWriter-{}] Writer exiting", self.index);
    }

    async fn flush(&self, ops: Vec<WriteOp>) {
        let op_count = ops.len();
        let pending = compact(ops);
        if pending.is_empty() {
            return;
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .writer_batch_size
                .with_label_values(&[&self.index.to_string()])
                .observe(pending.len() as f64);
        }

        let mut batch = WriteBatch::default();
        for write in &pending {
            let single = write.to_batch();
            batch.inserts.extend(single.inserts);
            batch.updates.extend(single.updates);
        }

        match self.store.apply_batch(batch).await {
            Ok(()) => {
                debug!(
                    "[TxWriter-{}] Flushed {} ops as {} writes",
                    self.index,
                    op_count,
                    pending.len()
                );
                for write in pending {
                    write.complete(Ok(()));
                }
            }
            Err(e) if pending.len() == 1 => {
                self.record_batch_error();
                for write in pending {
                    write.complete(Err(e.clone()));
                }
            }
            Err(e) => {
                // one bad write must not fail its neighbours, apply them one by one
                self.record_batch_error();
                warn!(
                    "[TxWriter-{}] Batch of {} writes failed, applying individually: {}",
                    self.index,
                    pending.len(),
                    e
                );
                for write in pending {
                    let result = self.store.apply_batch(write.to_batch()).await;
                    if result.is_err() {
                        self.record_batch_error();
                    }
                    write.complete(result);
                }
            }
        }
    }

    fn record_batch_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.writer_batch_errors.inc();
        }
    }
}

/// Fold operations on the same transaction together.
///
/// An update following an insert or update of the same id is folded into it.
/// A second insert of an id is answered with a conflict straight away.
fn compact(ops: Vec<WriteOp>) -> Vec<PendingWrite> {
    let mut pending: Vec<PendingWrite> = Vec::with_capacity(ops.len());
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for WriteOp { kind, done } in ops {
        let existing = index_by_id.get(kind.id()).copied();
        match (existing, kind) {
            (Some(i), WriteKind::Update(_, txu)) => {
                let write = &mut pending[i];
                match &mut write.kind {
                    WriteKind::Insert(record) => txu.apply_to(record),
                    WriteKind::Update(_, merged) => merged.merge(&txu),
                }
                write.waiters.push(done);
            }
            (Some(_), WriteKind::Insert(record)) => {
                let _ = done.send(Err(TxManagerError::Conflict(record.id)));
            }
            (None, kind) => {
                index_by_id.insert(kind.id().to_string(), pending.len());
                pending.push(PendingWrite {
                    kind,
                    waiters: vec![done],
                });
            }
        }
    }
    pending
}
