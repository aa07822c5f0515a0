// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mock ports used across the crate's tests.

use crate::confirmations::{ChainReader, ConfirmationTracker, Notification, TrackedTransaction};
use crate::error::{TxManagerError, TxManagerResult};
use crate::notifications::{NotificationSink, TransactionUpdateReply};
use crate::persistence::{
    MemoryStore, SortDirection, TransactionPersistence, TransactionStore, WriteBatch,
};
use crate::policy::{ChainConnector, ConnectorError, PolicyEngine, PolicyError};
use crate::types::{
    BlockInfo, ErrorReason, Sequence, TransactionHeaders, TransactionReceipt, TransactionRecord,
    TxStatus, TxUpdates,
};
use crate::utils::now_ms;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Consume one injected failure, if any are left
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn new_record(from: &str) -> TransactionRecord {
    TransactionRecord::new(
        "ns1",
        TransactionHeaders {
            from: from.to_string(),
            ..Default::default()
        },
        "0xdata".to_string(),
        now_ms(),
    )
}

pub fn receipt(block_number: u64, success: bool) -> TransactionReceipt {
    TransactionReceipt {
        block_number,
        transaction_index: 0,
        block_hash: format!("0xb{}", block_number),
        success,
        extra_info: None,
    }
}

// Persistence over a memory store with failure injection and recorded calls
#[derive(Default)]
pub struct MockPersistence {
    store: MemoryStore,
    list_failures: AtomicUsize,
    write_failures: AtomicUsize,
    list_calls: Mutex<Vec<(Option<Sequence>, usize)>>,
    updates: Mutex<Vec<TransactionRecord>>,
}

impl MockPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `count` pending transactions, returned as stored
    pub async fn seed(&self, count: usize) -> Vec<TransactionRecord> {
        let mut stored = Vec::with_capacity(count);
        for i in 0..count {
            let record = new_record(&format!("0x{:04}", i));
            TransactionPersistence::write_transaction(&self.store, &record, true)
                .await
                .unwrap();
            stored.push(self.get(&record.id).await.unwrap());
        }
        stored
    }

    pub async fn get(&self, id: &str) -> Option<TransactionRecord> {
        TransactionStore::get_transaction_by_id(&self.store, id)
            .await
            .unwrap()
    }

    pub async fn set_status(&self, id: &str, status: TxStatus) {
        let txu = TxUpdates {
            status: Some(status),
            ..Default::default()
        };
        self.store
            .apply_batch(WriteBatch {
                inserts: vec![],
                updates: vec![(id.to_string(), txu)],
            })
            .await
            .unwrap();
    }

    pub fn fail_lists(&self, count: usize) {
        self.list_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, count: usize) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> Vec<(Option<Sequence>, usize)> {
        self.list_calls.lock().unwrap().clone()
    }

    /// Successful non-insert writes, in order
    pub fn updates(&self) -> Vec<TransactionRecord> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionPersistence for MockPersistence {
    async fn list_transactions_pending(
        &self,
        after: Option<Sequence>,
        limit: usize,
        direction: SortDirection,
    ) -> TxManagerResult<Vec<TransactionRecord>> {
        self.list_calls.lock().unwrap().push((after, limit));
        if take_failure(&self.list_failures) {
            return Err(TxManagerError::Persistence("injected list failure".to_string()));
        }
        TransactionStore::list_transactions_pending(&self.store, after, limit, direction).await
    }

    async fn write_transaction(
        &self,
        record: &TransactionRecord,
        is_new: bool,
    ) -> TxManagerResult<()> {
        if take_failure(&self.write_failures) {
            return Err(TxManagerError::Persistence("injected write failure".to_string()));
        }
        TransactionPersistence::write_transaction(&self.store, record, is_new).await?;
        if !is_new {
            self.updates.lock().unwrap().push(record.clone());
        }
        Ok(())
    }

    async fn get_transaction_by_id(&self, id: &str) -> TxManagerResult<Option<TransactionRecord>> {
        TransactionStore::get_transaction_by_id(&self.store, id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    New(String),
    Removed(String),
}

// Confirmation tracker that records notifications; callbacks are fired by hand
#[derive(Default)]
pub struct MockTracker {
    events: Mutex<Vec<TrackerEvent>>,
    tracked: Mutex<HashMap<String, TrackedTransaction>>,
    unavailable: AtomicBool,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<TrackerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn is_tracked(&self, hash: &str) -> bool {
        self.tracked.lock().unwrap().contains_key(hash)
    }

    /// Registration currently held for `hash`, callbacks included
    pub fn tracked_transaction(&self, hash: &str) -> TrackedTransaction {
        self.tracked
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or_else(|| panic!("hash {} is not tracked", hash))
    }

    pub fn fire_receipt(&self, hash: &str, receipt: &TransactionReceipt) {
        let tracked = self.tracked_transaction(hash);
        (tracked.on_receipt)(hash, receipt);
    }

    pub fn fire_confirmed(&self, hash: &str, blocks: &[BlockInfo]) {
        let tracked = self.tracked_transaction(hash);
        (tracked.on_confirmed)(hash, blocks);
    }

    /// Receipt followed by confirmation, as the real tracker delivers them
    pub fn complete(&self, hash: &str, receipt: &TransactionReceipt) {
        self.fire_receipt(hash, receipt);
        let block = BlockInfo {
            block_number: receipt.block_number + 1,
            block_hash: format!("0xb{}", receipt.block_number + 1),
            parent_hash: receipt.block_hash.clone(),
        };
        self.fire_confirmed(hash, &[block]);
    }
}

#[async_trait]
impl ConfirmationTracker for MockTracker {
    async fn notify(&self, notification: Notification) -> TxManagerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TxManagerError::ConfirmationsUnavailable(
                "tracker stopped".to_string(),
            ));
        }
        match notification {
            Notification::NewTransaction(tx) => {
                self.events
                    .lock()
                    .unwrap()
                    .push(TrackerEvent::New(tx.hash.clone()));
                self.tracked.lock().unwrap().insert(tx.hash.clone(), tx);
            }
            Notification::RemovedTransaction { hash } => {
                self.tracked.lock().unwrap().remove(&hash);
                self.events.lock().unwrap().push(TrackerEvent::Removed(hash));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyStep {
    NoChange,
    Changed,
    Submit(String),
    Fail(ErrorReason, String),
}

// Policy engine replaying scripted steps; unscripted executions change nothing
#[derive(Default)]
pub struct ScriptedPolicyEngine {
    steps: Mutex<VecDeque<PolicyStep>>,
    executions: Mutex<Vec<String>>,
}

impl ScriptedPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: PolicyStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// Ids of the transactions the engine ran against, in call order
    pub fn executions(&self) -> Vec<String> {
        self.executions.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyEngine for ScriptedPolicyEngine {
    async fn execute(&self, tx: &mut TransactionRecord) -> Result<bool, PolicyError> {
        self.executions.lock().unwrap().push(tx.id.clone());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PolicyStep::NoChange);
        match step {
            PolicyStep::NoChange => Ok(false),
            PolicyStep::Changed => Ok(true),
            PolicyStep::Submit(hash) => {
                tx.record_submission(hash, now_ms());
                Ok(true)
            }
            PolicyStep::Fail(reason, message) => Err(PolicyError::new(reason, message)),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    replies: Mutex<Vec<TransactionUpdateReply>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replies(&self) -> Vec<TransactionUpdateReply> {
        self.replies.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn send_reply(&self, reply: TransactionUpdateReply) {
        self.replies.lock().unwrap().push(reply);
    }
}

#[derive(Default)]
struct ChainState {
    head: u64,
    generation: u64,
    blocks: BTreeMap<u64, BlockInfo>,
    receipts: HashMap<String, TransactionReceipt>,
}

impl ChainState {
    fn block_hash(&self, number: u64) -> String {
        if self.generation == 0 {
            format!("0xb{}", number)
        } else {
            format!("0xb{}g{}", number, self.generation)
        }
    }

    fn grow_to(&mut self, head: u64) {
        let start = self.blocks.keys().next_back().map_or(0, |last| last + 1);
        for number in start..=head {
            let parent_hash = match number.checked_sub(1) {
                Some(parent) => self.blocks[&parent].block_hash.clone(),
                None => String::new(),
            };
            let block = BlockInfo {
                block_number: number,
                block_hash: self.block_hash(number),
                parent_hash,
            };
            self.blocks.insert(number, block);
        }
        self.head = head;
    }
}

// Chain with linked blocks, scripted receipts and reorgs
#[derive(Default)]
pub struct MockChainReader {
    state: Mutex<ChainState>,
    failures: AtomicUsize,
}

impl MockChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_chain(&self, head: u64) {
        let mut state = self.state.lock().unwrap();
        *state = ChainState::default();
        state.grow_to(head);
    }

    pub fn extend_chain(&self, head: u64) {
        self.state.lock().unwrap().grow_to(head);
    }

    /// Replace every block from `from` onwards and drop receipts in them
    pub fn reorg_from(&self, from: u64, head: u64) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.blocks.retain(|number, _| *number < from);
        state.receipts.retain(|_, r| r.block_number < from);
        state.grow_to(head);
    }

    pub fn add_receipt(&self, hash: &str, block_number: u64, success: bool) {
        let mut state = self.state.lock().unwrap();
        let block_hash = state.blocks[&block_number].block_hash.clone();
        state.receipts.insert(
            hash.to_string(),
            TransactionReceipt {
                block_number,
                transaction_index: 0,
                block_hash,
                success,
                extra_info: None,
            },
        );
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn check_failure(&self) -> TxManagerResult<()> {
        if take_failure(&self.failures) {
            return Err(TxManagerError::ChainReader("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn get_latest_block_number(&self) -> TxManagerResult<u64> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> TxManagerResult<Option<TransactionReceipt>> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().receipts.get(hash).cloned())
    }

    async fn get_block_info(&self, block_number: u64) -> TxManagerResult<Option<BlockInfo>> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().blocks.get(&block_number).cloned())
    }
}

// Connector replaying scripted results, then returning numbered hashes
#[derive(Default)]
pub struct MockChainConnector {
    results: Mutex<VecDeque<Result<String, ConnectorError>>>,
    sent: Mutex<Vec<(String, Option<serde_json::Value>)>>,
}

impl MockChainConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: Result<String, ConnectorError>) {
        self.results.lock().unwrap().push_back(result);
    }

    /// `(transaction id, gas price)` per submission
    pub fn sent(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainConnector for MockChainConnector {
    async fn send_transaction(
        &self,
        tx: &TransactionRecord,
        gas_price: Option<&serde_json::Value>,
    ) -> Result<String, ConnectorError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((tx.id.clone(), gas_price.cloned()));
        let count = sent.len();
        drop(sent);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("0xhash{}", count)))
    }
}
