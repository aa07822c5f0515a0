// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::TxManagerConfig;
use crate::confirmations::{BlockConfirmationTracker, ChainReader};
use crate::manager::{TxManager, TxManagerHandle};
use crate::metrics::TxManagerMetrics;
use crate::notifications::BroadcastNotifier;
use crate::persistence::{BatchedPersistence, MemoryStore, TransactionWriter};
use crate::policy::{ChainConnector, PolicyEngineRegistry};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

const NOTIFICATION_CHANNEL_SIZE: usize = 1000;

/// A running manager with everything it was wired to
pub struct TxManagerNode {
    pub handle: TxManagerHandle,
    pub notifier: BroadcastNotifier,
    pub handles: Vec<JoinHandle<()>>,
}

/// Start a manager with the built-in policy engines
pub fn run_tx_manager(
    config: TxManagerConfig,
    connector: Arc<dyn ChainConnector>,
    chain_reader: Arc<dyn ChainReader>,
    prometheus_registry: &prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<TxManagerNode> {
    run_tx_manager_with_policy_engines(
        config,
        connector,
        chain_reader,
        prometheus_registry,
        &PolicyEngineRegistry::default(),
        cancel,
    )
}

pub fn run_tx_manager_with_policy_engines(
    config: TxManagerConfig,
    connector: Arc<dyn ChainConnector>,
    chain_reader: Arc<dyn ChainReader>,
    prometheus_registry: &prometheus::Registry,
    policy_engines: &PolicyEngineRegistry,
    cancel: CancellationToken,
) -> anyhow::Result<TxManagerNode> {
    config.validate()?;
    let metrics = Arc::new(TxManagerMetrics::new(prometheus_registry));
    let policy_engine = policy_engines.new_policy_engine(&config.policy_engine, connector)?;

    let mut handles = vec![];

    let store = Arc::new(MemoryStore::new());
    let (writer, writer_handles) = TransactionWriter::start(
        store.clone(),
        &config.persistence,
        cancel.clone(),
        Some(metrics.clone()),
    );
    handles.extend(writer_handles);
    let persistence = Arc::new(BatchedPersistence::new(store, writer));

    let (tracker, tracker_handle) = BlockConfirmationTracker::start(
        chain_reader,
        &config.confirmations,
        cancel.clone(),
        Some(metrics.clone()),
    );
    handles.push(tracker_handle);

    let notifier = BroadcastNotifier::new(NOTIFICATION_CHANNEL_SIZE);

    let (handle, manager_handle) = TxManager::new(
        &config.namespace,
        config.manager.clone(),
        persistence,
        Arc::new(tracker),
        policy_engine,
        Arc::new(notifier.clone()),
    )
    .with_metrics(metrics)
    .start(cancel);
    handles.push(manager_handle);

    info!(
        "[TxManager] Node started: namespace={}, policy_engine={}",
        config.namespace, config.policy_engine.name
    );
    Ok(TxManagerNode {
        handle,
        notifier,
        handles,
    })
}
