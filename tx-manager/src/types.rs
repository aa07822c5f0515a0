// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction record model shared by the control loop, persistence and
//! notification layers.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Monotonic position of a transaction in the store, used as a pagination
/// cursor. Assigned once on insert and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012}", self.0)
    }
}

/// Lifecycle status of a managed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TxStatus {
    /// Terminal states are final, nothing transitions out of them
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Succeeded | TxStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "Pending",
            TxStatus::Succeeded => "Succeeded",
            TxStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure reason reported by policy engines and connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    #[default]
    Unknown,
    InvalidInputs,
    TransactionReverted,
    NonceTooLow,
    TransactionUnderpriced,
    InsufficientFunds,
    NotFound,
    KnownTransaction,
    DownstreamDown,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::Unknown => "UNKNOWN",
            ErrorReason::InvalidInputs => "INVALID_INPUTS",
            ErrorReason::TransactionReverted => "TRANSACTION_REVERTED",
            ErrorReason::NonceTooLow => "NONCE_TOO_LOW",
            ErrorReason::TransactionUnderpriced => "TRANSACTION_UNDERPRICED",
            ErrorReason::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorReason::NotFound => "NOT_FOUND",
            ErrorReason::KnownTransaction => "KNOWN_TRANSACTION",
            ErrorReason::DownstreamDown => "DOWNSTREAM_DOWN",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a transaction's error history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub time_ms: u64,
    pub mapped_reason: ErrorReason,
    pub error: String,
}

/// Bounded error history, newest entry first.
///
/// The retention limit is configuration, not part of the record, so it is
/// supplied on every insert. Inserting into a full history evicts the oldest
/// entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorHistory(VecDeque<ErrorRecord>);

impl ErrorHistory {
    pub fn push(&mut self, record: ErrorRecord, limit: usize) {
        self.0.push_front(record);
        self.0.truncate(limit);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.0.iter()
    }
}

/// Chain-reported outcome of a mined transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub block_number: u64,
    pub transaction_index: u64,
    pub block_hash: String,
    pub success: bool,
    /// Chain specific detail, opaque to the manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<serde_json::Value>,
}

/// A block counted towards a transaction's confirmation depth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub block_number: u64,
    pub block_hash: String,
    pub parent_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHeaders {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// The durable unit of work tracked from submission to a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// `namespace:uuid`
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
    pub status: TxStatus,
    pub headers: TransactionHeaders,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<serde_json::Value>,
    pub transaction_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_info: Option<serde_json::Value>,
    pub created_ms: u64,
    pub updated_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_submit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_submit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_history: ErrorHistory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
    #[serde(default)]
    pub confirmations: Vec<BlockInfo>,
}

/// Generate a new `namespace:uuid` identifier
pub fn new_namespaced_id(namespace: &str) -> String {
    format!("{}:{}", namespace, Uuid::new_v4())
}

impl TransactionRecord {
    pub fn new(
        namespace: &str,
        headers: TransactionHeaders,
        transaction_data: String,
        now_ms: u64,
    ) -> Self {
        Self {
            id: new_namespaced_id(namespace),
            sequence: None,
            status: TxStatus::Pending,
            headers,
            gas_price: None,
            transaction_data,
            transaction_hash: None,
            policy_info: None,
            created_ms: now_ms,
            updated_ms: now_ms,
            first_submit_ms: None,
            last_submit_ms: None,
            error_message: None,
            error_history: ErrorHistory::default(),
            receipt: None,
            confirmations: Vec::new(),
        }
    }

    /// Namespace part of the id, or an empty string when the id is not a
    /// valid namespaced UUID.
    pub fn namespace(&self) -> &str {
        match self.id.split_once(':') {
            Some((ns, uuid)) if !ns.is_empty() && Uuid::parse_str(uuid).is_ok() => ns,
            _ => "",
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a (re)submission under `hash`. The first submission time is set
    /// once; the last submission time only moves forward.
    pub fn record_submission(&mut self, hash: String, now_ms: u64) {
        self.transaction_hash = Some(hash);
        if self.first_submit_ms.is_none() {
            self.first_submit_ms = Some(now_ms);
        }
        self.last_submit_ms = Some(self.last_submit_ms.map_or(now_ms, |t| t.max(now_ms)));
    }

    pub fn touch_updated(&mut self, now_ms: u64) {
        self.updated_ms = self.updated_ms.max(now_ms);
    }

    /// Push a new error to the front of the history and surface its message
    pub fn add_error(&mut self, reason: ErrorReason, message: String, limit: usize, now_ms: u64) {
        self.error_message = Some(message.clone());
        self.error_history.push(
            ErrorRecord {
                time_ms: now_ms,
                mapped_reason: reason,
                error: message,
            },
            limit,
        );
    }

    /// Move a pending transaction to its terminal status according to the
    /// attached receipt. Returns `None` (and changes nothing) when there is no
    /// receipt yet or the transaction is already terminal.
    pub fn complete_from_receipt(&mut self) -> Option<TxStatus> {
        if self.is_terminal() {
            return None;
        }
        let success = self.receipt.as_ref()?.success;
        if success {
            self.status = TxStatus::Succeeded;
            self.error_message = None;
        } else {
            self.status = TxStatus::Failed;
            self.error_message = Some("transaction reverted on chain".to_string());
        }
        Some(self.status)
    }
}

/// Sparse set of field updates for a stored transaction.
///
/// Several updates to the same transaction can be merged into one, later
/// values overwriting earlier ones field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxUpdates {
    pub status: Option<TxStatus>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub nonce: Option<u64>,
    pub gas: Option<u64>,
    pub value: Option<String>,
    pub gas_price: Option<serde_json::Value>,
    pub transaction_data: Option<String>,
    pub transaction_hash: Option<String>,
    pub policy_info: Option<serde_json::Value>,
    pub updated_ms: Option<u64>,
    pub first_submit_ms: Option<u64>,
    pub last_submit_ms: Option<u64>,
    /// `Some(None)` clears the surfaced error
    pub error_message: Option<Option<String>>,
    pub error_history: Option<ErrorHistory>,
    pub receipt: Option<TransactionReceipt>,
    pub confirmations: Option<Vec<BlockInfo>>,
}

macro_rules! merge_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

impl TxUpdates {
    /// Full-state update carrying every mutable field of `record`
    pub fn from_record(record: &TransactionRecord) -> Self {
        Self {
            status: Some(record.status),
            from: Some(record.headers.from.clone()),
            to: record.headers.to.clone(),
            nonce: record.headers.nonce,
            gas: record.headers.gas,
            value: record.headers.value.clone(),
            gas_price: record.gas_price.clone(),
            transaction_data: Some(record.transaction_data.clone()),
            transaction_hash: record.transaction_hash.clone(),
            policy_info: record.policy_info.clone(),
            updated_ms: Some(record.updated_ms),
            first_submit_ms: record.first_submit_ms,
            last_submit_ms: record.last_submit_ms,
            error_message: Some(record.error_message.clone()),
            error_history: Some(record.error_history.clone()),
            receipt: record.receipt.clone(),
            confirmations: Some(record.confirmations.clone()),
        }
    }

    pub fn merge(&mut self, other: &TxUpdates) {
        merge_fields!(
            self,
            other,
            status,
            from,
            to,
            nonce,
            gas,
            value,
            gas_price,
            transaction_data,
            transaction_hash,
            policy_info,
            updated_ms,
            first_submit_ms,
            last_submit_ms,
            error_message,
            error_history,
            receipt,
            confirmations,
        );
    }

    pub fn apply_to(&self, record: &mut TransactionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(from) = &self.from {
            record.headers.from = from.clone();
        }
        if self.to.is_some() {
            record.headers.to = self.to.clone();
        }
        if self.nonce.is_some() {
            record.headers.nonce = self.nonce;
        }
        if self.gas.is_some() {
            record.headers.gas = self.gas;
        }
        if self.value.is_some() {
            record.headers.value = self.value.clone();
        }
        if self.gas_price.is_some() {
            record.gas_price = self.gas_price.clone();
        }
        if let Some(data) = &self.transaction_data {
            record.transaction_data = data.clone();
        }
        if self.transaction_hash.is_some() {
            record.transaction_hash = self.transaction_hash.clone();
        }
        if self.policy_info.is_some() {
            record.policy_info = self.policy_info.clone();
        }
        if let Some(updated) = self.updated_ms {
            record.touch_updated(updated);
        }
        if record.first_submit_ms.is_none() {
            record.first_submit_ms = self.first_submit_ms;
        }
        if let Some(last) = self.last_submit_ms {
            record.last_submit_ms = Some(record.last_submit_ms.map_or(last, |t| t.max(last)));
        }
        if let Some(message) = &self.error_message {
            record.error_message = message.clone();
        }
        if let Some(history) = &self.error_history {
            record.error_history = history.clone();
        }
        if self.receipt.is_some() {
            record.receipt = self.receipt.clone();
        }
        if let Some(confirmations) = &self.confirmations {
            record.confirmations = confirmations.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TransactionRecord {
        TransactionRecord::new(
            "ns1",
            TransactionHeaders {
                from: "0xaaaa".to_string(),
                to: Some("0xbbbb".to_string()),
                ..Default::default()
            },
            "0x".to_string(),
            1_000,
        )
    }

    #[test]
    fn test_sequence_display_is_zero_padded() {
        assert_eq!(Sequence(12345).to_string(), "000000012345");
        assert!(Sequence(1) < Sequence(2));
    }

    #[test]
    fn test_namespace() {
        let mut tx = record();
        assert_eq!(tx.namespace(), "ns1");

        tx.id = "not a valid ID".to_string();
        assert_eq!(tx.namespace(), "");

        tx.id = "ns1:not-a-uuid".to_string();
        assert_eq!(tx.namespace(), "");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TxStatus::Pending.is_terminal());
        assert!(TxStatus::Succeeded.is_terminal());
        assert!(TxStatus::Failed.is_terminal());
    }

    #[test]
    fn test_error_history_is_bounded_newest_first() {
        let mut tx = record();
        for attempt in 1..=3 {
            tx.add_error(
                ErrorReason::InsufficientFunds,
                format!("attempt{}", attempt),
                2,
                attempt,
            );
        }

        let errors: Vec<_> = tx.error_history.iter().map(|e| e.error.as_str()).collect();
        assert_eq!(errors, vec!["attempt3", "attempt2"]);
        assert_eq!(tx.error_message.as_deref(), Some("attempt3"));
        assert!(tx
            .error_history
            .iter()
            .all(|e| e.mapped_reason == ErrorReason::InsufficientFunds));
    }

    #[test]
    fn test_error_history_length_tracks_failure_count() {
        let mut tx = record();
        for count in 1..=10usize {
            tx.add_error(ErrorReason::Unknown, "boom".to_string(), 4, count as u64);
            assert_eq!(tx.error_history.len(), count.min(4));
        }
    }

    #[test]
    fn test_zero_retention_keeps_message_only() {
        let mut tx = record();
        tx.add_error(ErrorReason::NotFound, "gone".to_string(), 0, 5);
        assert!(tx.error_history.is_empty());
        assert_eq!(tx.error_message.as_deref(), Some("gone"));
    }

    #[test]
    fn test_first_submit_set_once() {
        let mut tx = record();
        tx.record_submission("0x01".to_string(), 2_000);
        tx.record_submission("0x02".to_string(), 3_000);

        assert_eq!(tx.first_submit_ms, Some(2_000));
        assert_eq!(tx.last_submit_ms, Some(3_000));
        assert_eq!(tx.transaction_hash.as_deref(), Some("0x02"));

        // clocks going backwards never move last submit back
        tx.record_submission("0x03".to_string(), 2_500);
        assert_eq!(tx.last_submit_ms, Some(3_000));
    }

    #[test]
    fn test_complete_from_receipt() {
        let mut tx = record();
        assert_eq!(tx.complete_from_receipt(), None);
        assert_eq!(tx.status, TxStatus::Pending);

        tx.receipt = Some(TransactionReceipt {
            block_number: 10,
            transaction_index: 0,
            block_hash: "0xb10".to_string(),
            success: false,
            extra_info: None,
        });
        assert_eq!(tx.complete_from_receipt(), Some(TxStatus::Failed));
        assert!(tx.error_message.is_some());

        // terminal is final
        tx.receipt.as_mut().unwrap().success = true;
        assert_eq!(tx.complete_from_receipt(), None);
        assert_eq!(tx.status, TxStatus::Failed);
    }

    #[test]
    fn test_tx_updates_merge() {
        let mut txu = TxUpdates::default();
        let txu2 = TxUpdates {
            status: Some(TxStatus::Pending),
            from: Some("1111".to_string()),
            to: Some("2222".to_string()),
            nonce: Some(3333),
            gas: Some(4444),
            value: Some("5555".to_string()),
            gas_price: Some(serde_json::json!({"some": "stuff"})),
            transaction_data: Some("xxxx".to_string()),
            transaction_hash: Some("yyyy".to_string()),
            policy_info: Some(serde_json::json!({"more": "stuff"})),
            updated_ms: Some(1),
            first_submit_ms: Some(2),
            last_submit_ms: Some(3),
            error_message: Some(Some("pop".to_string())),
            error_history: Some(ErrorHistory::default()),
            receipt: None,
            confirmations: Some(vec![]),
        };
        txu.merge(&txu2);
        assert_eq!(txu, txu2);

        // merging an empty update changes nothing
        txu.merge(&TxUpdates::default());
        assert_eq!(txu, txu2);
    }

    #[test]
    fn test_tx_updates_apply_full_record() {
        let mut source = record();
        source.record_submission("0xabc".to_string(), 5_000);
        source.add_error(ErrorReason::NonceTooLow, "low".to_string(), 3, 5_001);
        source.touch_updated(5_002);

        let mut target = source.clone();
        target.transaction_hash = None;
        target.error_history = ErrorHistory::default();
        target.error_message = None;

        TxUpdates::from_record(&source).apply_to(&mut target);
        assert_eq!(target, source);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let tx = record();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["status"], "Pending");
        assert_eq!(json["createdMs"], 1_000);
        assert!(json.get("transactionHash").is_none());
    }
}
