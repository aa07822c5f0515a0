// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Best-effort transaction update notifications

use crate::types::{TransactionRecord, TxStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionUpdateType {
    TransactionSuccess,
    TransactionFailed,
    TransactionUpdate,
}

impl From<TxStatus> for TransactionUpdateType {
    fn from(status: TxStatus) -> Self {
        match status {
            TxStatus::Succeeded => TransactionUpdateType::TransactionSuccess,
            TxStatus::Failed => TransactionUpdateType::TransactionFailed,
            TxStatus::Pending => TransactionUpdateType::TransactionUpdate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyHeaders {
    pub request_id: String,
    #[serde(rename = "type")]
    pub update_type: TransactionUpdateType,
}

/// Snapshot of a transaction sent to subscribers after every persisted change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdateReply {
    pub headers: ReplyHeaders,
    #[serde(flatten)]
    pub transaction: TransactionRecord,
}

impl TransactionUpdateReply {
    pub fn from_record(record: &TransactionRecord) -> Self {
        Self {
            headers: ReplyHeaders {
                request_id: record.id.clone(),
                update_type: record.status.into(),
            },
            transaction: record.clone(),
        }
    }
}

/// Fire-and-forget sink. Implementations must never block the caller and
/// must tolerate having nobody listening.
pub trait NotificationSink: Send + Sync {
    fn send_reply(&self, reply: TransactionUpdateReply);
}

/// Fans replies out to any number of subscribers. Slow subscribers lag and
/// lose the oldest replies rather than holding up the sender.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<TransactionUpdateReply>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionUpdateReply> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn send_reply(&self, reply: TransactionUpdateReply) {
        let request_id = reply.headers.request_id.clone();
        if self.tx.send(reply).is_err() {
            trace!("[Notifier] No subscribers for update of {}", request_id);
        }
    }
}
