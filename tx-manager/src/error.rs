// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxManagerError {
    // Backing store failed to read or write
    #[error("Persistence error: {0}")]
    Persistence(String),
    // Insert of an id that already exists
    #[error("Transaction already exists: {0}")]
    Conflict(String),
    // Update or lookup of an id that does not exist
    #[error("Transaction not found: {0}")]
    NotFound(String),
    // The batching writer has shut down
    #[error("Transaction writer stopped")]
    WriterStopped,
    // The confirmation tracker is no longer accepting notifications
    #[error("Confirmation tracker unavailable: {0}")]
    ConfirmationsUnavailable(String),
    // Chain read failure inside the confirmation tracker
    #[error("Chain reader error: {0}")]
    ChainReader(String),
    // No policy engine factory registered under this name
    #[error("Unknown policy engine: {0}")]
    UnknownPolicyEngine(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl TxManagerError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            TxManagerError::Persistence(_) => "persistence",
            TxManagerError::Conflict(_) => "conflict",
            TxManagerError::NotFound(_) => "not_found",
            TxManagerError::WriterStopped => "writer_stopped",
            TxManagerError::ConfirmationsUnavailable(_) => "confirmations_unavailable",
            TxManagerError::ChainReader(_) => "chain_reader",
            TxManagerError::UnknownPolicyEngine(_) => "unknown_policy_engine",
            TxManagerError::InvalidConfig(_) => "invalid_config",
        }
    }
}

pub type TxManagerResult<T> = Result<T, TxManagerError>;
