// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable policy engines
//!
//! A policy engine decides the next action for a pending transaction: first
//! submission, resubmission, gas changes. Engines are built by name from a
//! [`PolicyEngineRegistry`] and submit through a [`ChainConnector`].

mod simple;

pub use simple::{SimplePolicyConfig, SimplePolicyEngine, SIMPLE_POLICY_ENGINE};

use crate::config::PolicyEngineConfig;
use crate::error::{TxManagerError, TxManagerResult};
use crate::types::{ErrorReason, TransactionRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Classified policy failure, recorded into the transaction's error history
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct PolicyError {
    pub reason: ErrorReason,
    pub message: String,
}

impl PolicyError {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Decide and perform the next action for `tx`, mutating it in place.
    ///
    /// Returns `Ok(true)` when the record changed and must be persisted.
    async fn execute(&self, tx: &mut TransactionRecord) -> Result<bool, PolicyError>;
}

/// Failure reported by a chain connector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct ConnectorError {
    pub reason: ErrorReason,
    pub message: String,
}

impl From<ConnectorError> for PolicyError {
    fn from(e: ConnectorError) -> Self {
        PolicyError {
            reason: e.reason,
            message: e.message,
        }
    }
}

/// Write access to the chain used by policy engines
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Submit `tx` at `gas_price`, returning the transaction hash
    async fn send_transaction(
        &self,
        tx: &TransactionRecord,
        gas_price: Option<&serde_json::Value>,
    ) -> Result<String, ConnectorError>;
}

pub type PolicyEngineFactory = Box<
    dyn Fn(&serde_json::Value, Arc<dyn ChainConnector>) -> TxManagerResult<Arc<dyn PolicyEngine>>
        + Send
        + Sync,
>;

/// Policy engine factories by name
pub struct PolicyEngineRegistry {
    factories: HashMap<String, PolicyEngineFactory>,
}

impl Default for PolicyEngineRegistry {
    /// Registry holding the built-in engines
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            SIMPLE_POLICY_ENGINE,
            Box::new(|config: &serde_json::Value, connector: Arc<dyn ChainConnector>| {
                let engine = SimplePolicyEngine::from_config(config, connector)?;
                Ok(Arc::new(engine) as Arc<dyn PolicyEngine>)
            }),
        );
        registry
    }
}

impl PolicyEngineRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` under `name`, replacing any previous registration
    pub fn register(&mut self, name: &str, factory: PolicyEngineFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn new_policy_engine(
        &self,
        config: &PolicyEngineConfig,
        connector: Arc<dyn ChainConnector>,
    ) -> TxManagerResult<Arc<dyn PolicyEngine>> {
        let factory = self
            .factories
            .get(&config.name)
            .ok_or_else(|| TxManagerError::UnknownPolicyEngine(config.name.clone()))?;
        let engine = factory(&config.config, connector)?;
        info!("[PolicyEngine] Created policy engine '{}'", config.name);
        Ok(engine)
    }
}
