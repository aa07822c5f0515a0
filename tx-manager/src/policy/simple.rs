// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{ChainConnector, PolicyEngine, PolicyError};
use crate::error::{TxManagerError, TxManagerResult};
use crate::types::{ErrorReason, TransactionRecord};
use crate::utils::{now_ms, short_hash};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SIMPLE_POLICY_ENGINE: &str = "simple";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimplePolicyConfig {
    // Gas price passed as-is to the connector on every submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_gas_price: Option<serde_json::Value>,
    // Time since the last submission after which the transaction is resubmitted
    #[serde(default = "default_resubmit_interval_ms")]
    pub resubmit_interval_ms: u64,
}

impl Default for SimplePolicyConfig {
    fn default() -> Self {
        Self {
            fixed_gas_price: None,
            resubmit_interval_ms: default_resubmit_interval_ms(),
        }
    }
}

fn default_resubmit_interval_ms() -> u64 {
    300_000
}

/// Submits once at a fixed gas price, then resubmits the same payload every
/// resubmit interval until the transaction completes.
pub struct SimplePolicyEngine {
    connector: Arc<dyn ChainConnector>,
    fixed_gas_price: Option<serde_json::Value>,
    resubmit_interval: Duration,
}

impl SimplePolicyEngine {
    pub fn new(config: SimplePolicyConfig, connector: Arc<dyn ChainConnector>) -> Self {
        Self {
            connector,
            fixed_gas_price: config.fixed_gas_price,
            resubmit_interval: Duration::from_millis(config.resubmit_interval_ms),
        }
    }

    pub fn from_config(
        config: &serde_json::Value,
        connector: Arc<dyn ChainConnector>,
    ) -> TxManagerResult<Self> {
        let config = if config.is_null() {
            SimplePolicyConfig::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| {
                TxManagerError::InvalidConfig(format!("simple policy engine: {}", e))
            })?
        };
        Ok(Self::new(config, connector))
    }

    fn resubmit_due(&self, tx: &TransactionRecord, now: u64) -> bool {
        let last = tx.last_submit_ms.or(tx.first_submit_ms).unwrap_or_default();
        now.saturating_sub(last) >= self.resubmit_interval.as_millis() as u64
    }
}

#[async_trait]
impl PolicyEngine for SimplePolicyEngine {
    async fn execute(&self, tx: &mut TransactionRecord) -> Result<bool, PolicyError> {
        let now = now_ms();

        if tx.first_submit_ms.is_none() {
            tx.gas_price = self.fixed_gas_price.clone();
            let hash = self
                .connector
                .send_transaction(tx, self.fixed_gas_price.as_ref())
                .await?;
            info!(
                "[SimplePolicy] Submitted transaction {} hash={}",
                tx.id,
                short_hash(&hash)
            );
            tx.record_submission(hash, now);
            return Ok(true);
        }

        if !self.resubmit_due(tx, now) {
            return Ok(false);
        }

        match self
            .connector
            .send_transaction(tx, self.fixed_gas_price.as_ref())
            .await
        {
            Ok(hash) => {
                info!(
                    "[SimplePolicy] Resubmitted transaction {} hash={}",
                    tx.id,
                    short_hash(&hash)
                );
                tx.record_submission(hash, now);
                Ok(true)
            }
            Err(e) if e.reason == ErrorReason::KnownTransaction => {
                // the node already has it, which is what a resubmit wants
                debug!(
                    "[SimplePolicy] Transaction {} already known to the node",
                    tx.id
                );
                if let Some(hash) = tx.transaction_hash.clone() {
                    tx.record_submission(hash, now);
                }
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ConnectorError;
    use crate::test_utils::MockChainConnector;
    use crate::types::TransactionHeaders;

    fn new_tx() -> TransactionRecord {
        TransactionRecord::new(
            "ns1",
            TransactionHeaders {
                from: "0xaaaa".to_string(),
                ..Default::default()
            },
            "0xdata".to_string(),
            1,
        )
    }

    fn engine(connector: Arc<MockChainConnector>, resubmit_interval_ms: u64) -> SimplePolicyEngine {
        SimplePolicyEngine::new(
            SimplePolicyConfig {
                fixed_gas_price: Some(serde_json::json!("12345")),
                resubmit_interval_ms,
            },
            connector,
        )
    }

    #[tokio::test]
    async fn test_first_submission() {
        let connector = Arc::new(MockChainConnector::new());
        connector.push_result(Ok("0xhash1".to_string()));
        let engine = engine(connector.clone(), 60_000);

        let mut tx = new_tx();
        assert!(engine.execute(&mut tx).await.unwrap());
        assert_eq!(tx.transaction_hash.as_deref(), Some("0xhash1"));
        assert!(tx.first_submit_ms.is_some());
        assert_eq!(tx.gas_price, Some(serde_json::json!("12345")));
        assert_eq!(connector.sent(), vec![(tx.id.clone(), Some(serde_json::json!("12345")))]);

        // inside the resubmit interval nothing happens
        assert!(!engine.execute(&mut tx).await.unwrap());
        assert_eq!(connector.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_resubmission_updates_hash_not_first_submit() {
        let connector = Arc::new(MockChainConnector::new());
        connector.push_result(Ok("0xhash1".to_string()));
        connector.push_result(Ok("0xhash2".to_string()));
        let engine = engine(connector.clone(), 0);

        let mut tx = new_tx();
        engine.execute(&mut tx).await.unwrap();
        let first_submit = tx.first_submit_ms;

        assert!(engine.execute(&mut tx).await.unwrap());
        assert_eq!(tx.transaction_hash.as_deref(), Some("0xhash2"));
        assert_eq!(tx.first_submit_ms, first_submit);
        assert!(tx.last_submit_ms >= first_submit);
    }

    #[tokio::test]
    async fn test_known_transaction_on_resubmit_is_ok() {
        let connector = Arc::new(MockChainConnector::new());
        connector.push_result(Ok("0xhash1".to_string()));
        connector.push_result(Err(ConnectorError {
            reason: ErrorReason::KnownTransaction,
            message: "known transaction".to_string(),
        }));
        let engine = engine(connector, 0);

        let mut tx = new_tx();
        engine.execute(&mut tx).await.unwrap();
        assert!(engine.execute(&mut tx).await.unwrap());
        assert_eq!(tx.transaction_hash.as_deref(), Some("0xhash1"));
    }

    #[tokio::test]
    async fn test_submission_error_is_classified() {
        let connector = Arc::new(MockChainConnector::new());
        connector.push_result(Err(ConnectorError {
            reason: ErrorReason::InsufficientFunds,
            message: "insufficient funds for gas".to_string(),
        }));
        let engine = engine(connector, 0);

        let mut tx = new_tx();
        let err = engine.execute(&mut tx).await.unwrap_err();
        assert_eq!(err.reason, ErrorReason::InsufficientFunds);
        assert!(tx.first_submit_ms.is_none());
        assert!(tx.transaction_hash.is_none());
    }

    #[test]
    fn test_config_defaults() {
        let connector = Arc::new(MockChainConnector::new());
        let engine = SimplePolicyEngine::from_config(&serde_json::Value::Null, connector).unwrap();
        assert!(engine.fixed_gas_price.is_none());
        assert_eq!(engine.resubmit_interval, Duration::from_secs(300));
    }
}
