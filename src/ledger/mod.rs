// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger operations.
//!
//! Every balance-changing operation follows the same shape: open a
//! [`LedgerTxn`](crate::storage::LedgerTxn), read the balance row under its
//! exclusive lock, check and mutate it, write the ledger row(s), then commit.
//! Returning early with `?` drops the transaction and rolls everything back.
//!
//! - [`balance`]: balance arithmetic and `query_balance`
//! - [`spend`]: session-independent freeze / unfreeze / spend
//! - [`session`]: game sessions and their freeze/spend pairs
//! - [`withdraw`]: signed withdrawal lock issuance
//! - [`settlement`]: tx-hash reporting and chain outcome application

pub mod balance;
pub mod session;
pub mod settlement;
pub mod spend;
pub mod withdraw;

use std::sync::Arc;

use alloy::primitives::Address;

use crate::error::{LedgerError, LedgerResult};
use crate::queue::ReconciliationQueue;
use crate::storage::LedgerDatabase;

pub use session::SessionFreeze;
pub use settlement::{ReportReceipt, SettlementOperation, TxReport};
pub use spend::SpendReceipt;
pub use withdraw::{LockIssuer, WithdrawLock};

/// Maximum length of caller-supplied external ids and remarks.
pub const MAX_EXTERNAL_LEN: usize = 128;

/// Entry point for all ledger mutations and queries.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<LedgerDatabase>,
    queue: ReconciliationQueue,
    locks: Option<LockIssuer>,
    custody_contract: Option<Address>,
}

impl Ledger {
    pub fn new(db: Arc<LedgerDatabase>, queue: ReconciliationQueue) -> Self {
        Self {
            db,
            queue,
            locks: None,
            custody_contract: None,
        }
    }

    /// Enable withdrawal lock issuance.
    pub fn with_lock_issuer(mut self, issuer: LockIssuer) -> Self {
        self.custody_contract = Some(issuer.contract());
        self.locks = Some(issuer);
        self
    }

    /// Only credit deposits whose event was emitted by `contract`.
    pub fn with_custody_contract(mut self, contract: Address) -> Self {
        self.custody_contract = Some(contract);
        self
    }

    pub fn db(&self) -> &Arc<LedgerDatabase> {
        &self.db
    }

    pub fn queue(&self) -> &ReconciliationQueue {
        &self.queue
    }
}

fn check_external_field(name: &str, value: &str) -> LedgerResult<()> {
    if value.chars().count() > MAX_EXTERNAL_LEN {
        return Err(LedgerError::Validation(format!(
            "{name} exceeds {MAX_EXTERNAL_LEN} characters"
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_fields_are_bounded_in_characters() {
        assert!(check_external_field("external_id", &"é".repeat(128)).is_ok());
        let err = check_external_field("remark", &"x".repeat(129)).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(msg) if msg.contains("remark")));
    }
}
