// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger error taxonomy.
//!
//! Business rejections (`InsufficientBalance`, `NotFound`, ...) are returned to
//! the caller synchronously. Idempotency signals (`AlreadyProcessed`,
//! `AlreadyResolved`) mean a prior call already did the work. Transient chain
//! and storage failures are retried by the reconciliation pipeline.

use crate::chain::ChainError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("insufficient frozen funds: frozen {frozen}, required {required}")]
    InsufficientFrozen { frozen: u64, required: u64 },

    #[error("insufficient withdrawal funds: withdrawal {withdrawal}, required {required}")]
    InsufficientWithdrawal { withdrawal: u64, required: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not owned by caller: {0}")]
    NotOwner(String),

    #[error("already active: {0}")]
    AlreadyActive(String),

    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    #[error("already resolved: {0}")]
    AlreadyResolved(String),

    #[error("transaction hash {0} already reported for another operation")]
    DuplicateTxHash(String),

    #[error("withdrawal lock {0} expired")]
    LockExpired(String),

    /// The paired Freeze row has not been confirmed on chain yet.
    #[error("paired lock {0} not confirmed yet")]
    PairNotReady(u64),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Whether the reconciliation pipeline should try the same item again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Chain(e) => e.is_transient(),
            Self::Storage(_) | Self::PairNotReady(_) => true,
            _ => false,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(LedgerError::Chain(ChainError::Timeout(15)).is_retryable());
        assert!(LedgerError::Chain(ChainError::Rpc("reset".into())).is_retryable());
        assert!(LedgerError::PairNotReady(7).is_retryable());
        assert!(LedgerError::Storage(StorageError::NotFound("x".into())).is_retryable());
    }

    #[test]
    fn business_errors_are_final() {
        assert!(!LedgerError::validation("bad").is_retryable());
        assert!(!LedgerError::AlreadyProcessed("flow 1".into()).is_retryable());
        assert!(!LedgerError::InsufficientWithdrawal {
            withdrawal: 0,
            required: 1
        }
        .is_retryable());
        assert!(!LedgerError::Chain(ChainError::InvalidTxHash("0x12".into())).is_retryable());
    }
}
