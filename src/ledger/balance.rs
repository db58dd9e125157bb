// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Balance arithmetic.
//!
//! Each move is checked before any field is touched, so a failed move leaves
//! the row exactly as it was.

use crate::error::{LedgerError, LedgerResult};
use crate::models::AccountBalance;

use super::Ledger;

fn overflow(field: &str) -> LedgerError {
    LedgerError::Validation(format!("{field} would overflow"))
}

impl AccountBalance {
    /// available → frozen
    pub fn freeze(&mut self, amount: u64) -> LedgerResult<()> {
        if self.available < amount {
            return Err(LedgerError::InsufficientBalance {
                available: self.available,
                required: amount,
            });
        }
        self.frozen = self.frozen.checked_add(amount).ok_or_else(|| overflow("frozen"))?;
        self.available -= amount;
        Ok(())
    }

    /// frozen → available
    pub fn unfreeze(&mut self, amount: u64) -> LedgerResult<()> {
        if self.frozen < amount {
            return Err(LedgerError::InsufficientFrozen {
                frozen: self.frozen,
                required: amount,
            });
        }
        self.available = self
            .available
            .checked_add(amount)
            .ok_or_else(|| overflow("available"))?;
        self.frozen -= amount;
        Ok(())
    }

    /// Consume frozen funds.
    pub fn spend_frozen(&mut self, amount: u64) -> LedgerResult<()> {
        if self.frozen < amount {
            return Err(LedgerError::InsufficientFrozen {
                frozen: self.frozen,
                required: amount,
            });
        }
        self.frozen -= amount;
        Ok(())
    }

    /// available → withdrawal
    pub fn reserve_withdrawal(&mut self, amount: u64) -> LedgerResult<()> {
        if self.available < amount {
            return Err(LedgerError::InsufficientBalance {
                available: self.available,
                required: amount,
            });
        }
        self.withdrawal = self
            .withdrawal
            .checked_add(amount)
            .ok_or_else(|| overflow("withdrawal"))?;
        self.available -= amount;
        Ok(())
    }

    /// withdrawal → available
    pub fn release_withdrawal(&mut self, amount: u64) -> LedgerResult<()> {
        if self.withdrawal < amount {
            return Err(LedgerError::InsufficientWithdrawal {
                withdrawal: self.withdrawal,
                required: amount,
            });
        }
        self.available = self
            .available
            .checked_add(amount)
            .ok_or_else(|| overflow("available"))?;
        self.withdrawal -= amount;
        Ok(())
    }

    /// Funds left custody on chain.
    pub fn settle_withdrawal(&mut self, amount: u64) -> LedgerResult<()> {
        if self.withdrawal < amount {
            return Err(LedgerError::InsufficientWithdrawal {
                withdrawal: self.withdrawal,
                required: amount,
            });
        }
        self.withdrawal -= amount;
        Ok(())
    }

    /// Funds entered custody on chain.
    pub fn credit(&mut self, amount: u64) -> LedgerResult<()> {
        self.available = self
            .available
            .checked_add(amount)
            .ok_or_else(|| overflow("available"))?;
        Ok(())
    }
}

impl Ledger {
    /// Current balance, creating a zero row on first access.
    pub fn query_balance(&self, main_id: u64, asset_id: u64) -> LedgerResult<AccountBalance> {
        if let Some(balance) = self.db.get_balance(main_id, asset_id)? {
            return Ok(balance);
        }
        let txn = self.db.begin()?;
        if let Some(balance) = txn.lock_balance(main_id, asset_id)? {
            return Ok(balance);
        }
        let mut balance = AccountBalance::zero(main_id, asset_id);
        txn.save_balance(&mut balance)?;
        txn.commit()?;
        tracing::debug!(main_id, asset_id, "Created balance row");
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support;
    use crate::models::DEFAULT_ASSET_ID;

    fn balance(available: u64, frozen: u64, withdrawal: u64) -> AccountBalance {
        AccountBalance {
            available,
            frozen,
            withdrawal,
            ..AccountBalance::zero(1, DEFAULT_ASSET_ID)
        }
    }

    #[test]
    fn freeze_and_unfreeze_preserve_total() {
        let mut b = balance(1_000, 0, 0);
        b.freeze(300).unwrap();
        assert_eq!((b.available, b.frozen), (700, 300));
        b.unfreeze(300).unwrap();
        assert_eq!((b.available, b.frozen), (1_000, 0));
    }

    #[test]
    fn failed_moves_leave_row_untouched() {
        let mut b = balance(10, 5, 2);
        let before = b.clone();
        assert!(matches!(
            b.freeze(11),
            Err(LedgerError::InsufficientBalance { available: 10, required: 11 })
        ));
        assert!(matches!(b.spend_frozen(6), Err(LedgerError::InsufficientFrozen { .. })));
        assert!(matches!(
            b.settle_withdrawal(3),
            Err(LedgerError::InsufficientWithdrawal { withdrawal: 2, required: 3 })
        ));
        assert!(matches!(b.release_withdrawal(3), Err(LedgerError::InsufficientWithdrawal { .. })));
        assert_eq!(b, before);
    }

    #[test]
    fn withdrawal_reserve_then_release_or_settle() {
        let mut b = balance(500, 0, 0);
        b.reserve_withdrawal(200).unwrap();
        assert_eq!((b.available, b.withdrawal), (300, 200));
        b.release_withdrawal(50).unwrap();
        assert_eq!((b.available, b.withdrawal), (350, 150));
        b.settle_withdrawal(150).unwrap();
        assert_eq!((b.available, b.withdrawal), (350, 0));
    }

    #[test]
    fn credit_detects_overflow() {
        let mut b = balance(u64::MAX, 0, 0);
        assert!(matches!(b.credit(1), Err(LedgerError::Validation(_))));
        assert_eq!(b.available, u64::MAX);
    }

    #[test]
    fn query_balance_creates_zero_row() {
        let (ledger, _dir) = test_support::ledger();
        assert!(ledger.db().get_balance(42, DEFAULT_ASSET_ID).unwrap().is_none());
        let b = ledger.query_balance(42, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen, b.withdrawal), (0, 0, 0));
        assert!(ledger.db().get_balance(42, DEFAULT_ASSET_ID).unwrap().is_some());
    }
}
