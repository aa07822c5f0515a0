// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0];

#[derive(Clone, Debug)]
pub struct TxManagerMetrics {
    // Policy loop
    pub(crate) policy_loop_cycles: IntCounterVec,
    pub(crate) inflight_transactions: IntGauge,
    pub(crate) inflight_refill_latency: HistogramVec,
    pub(crate) policy_engine_errors: IntCounterVec,
    pub(crate) persistence_write_errors: IntCounterVec,
    pub(crate) transactions_completed: IntCounterVec,

    // Transaction writer
    pub(crate) writer_batch_size: HistogramVec,
    pub(crate) writer_batch_errors: IntCounter,

    // Confirmation tracker
    pub(crate) tracked_transactions: IntGauge,
    pub(crate) chain_reader_errors: IntCounterVec,
}

impl TxManagerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            policy_loop_cycles: register_int_counter_vec_with_registry!(
                "txm_policy_loop_cycles",
                "Total number of policy loop cycles, by trigger",
                &["trigger"],
                registry,
            )
            .unwrap(),
            inflight_transactions: register_int_gauge_with_registry!(
                "txm_inflight_transactions",
                "Current size of the inflight working set",
                registry,
            )
            .unwrap(),
            inflight_refill_latency: register_histogram_vec_with_registry!(
                "txm_inflight_refill_latency",
                "Latency of refilling the inflight set from persistence",
                &["outcome"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            policy_engine_errors: register_int_counter_vec_with_registry!(
                "txm_policy_engine_errors",
                "Total number of policy engine errors, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            persistence_write_errors: register_int_counter_vec_with_registry!(
                "txm_persistence_write_errors",
                "Total number of failed transaction writes from the policy loop, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            transactions_completed: register_int_counter_vec_with_registry!(
                "txm_transactions_completed",
                "Total number of transactions that reached a terminal status",
                &["status"],
                registry,
            )
            .unwrap(),
            writer_batch_size: register_histogram_vec_with_registry!(
                "txm_writer_batch_size",
                "Number of operations flushed per writer batch",
                &["writer"],
                BATCH_SIZE_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            writer_batch_errors: register_int_counter_with_registry!(
                "txm_writer_batch_errors",
                "Total number of writer batches that failed to apply",
                registry,
            )
            .unwrap(),
            tracked_transactions: register_int_gauge_with_registry!(
                "txm_tracked_transactions",
                "Transaction hashes currently watched by the confirmation tracker",
                registry,
            )
            .unwrap(),
            chain_reader_errors: register_int_counter_vec_with_registry!(
                "txm_chain_reader_errors",
                "Total number of chain reader failures, by method",
                &["method"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
