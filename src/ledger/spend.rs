// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Spend ledger: session-independent freeze / unfreeze / spend.
//!
//! A Freeze row moves funds `available → frozen` and stays Pending until
//! exactly one Spend (funds consumed) or Unfreeze (funds returned) row
//! resolves it. The `spend_settled_by` index records that resolution, which
//! makes a repeated spend/unfreeze of the same freeze return the first
//! result.

use chrono::Utc;
use serde::Serialize;

use super::{check_external_field, Ledger};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Direction, Page, SpendBizType, SpendFlow, SpendStatus, DEFAULT_ASSET_ID};
use crate::storage::ledger_db::{PENDING_FREEZE, SPEND_EXTERNAL, SPEND_SETTLED_BY};
use crate::storage::LedgerTxn;

/// Result of a freeze, spend or unfreeze.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendReceipt {
    pub flow_id: u64,
    pub amount: u64,
    /// The call matched an earlier one and changed nothing.
    pub replayed: bool,
}

impl SpendReceipt {
    fn created(flow: &SpendFlow) -> Self {
        Self {
            flow_id: flow.id,
            amount: flow.amount,
            replayed: false,
        }
    }

    fn replayed(flow: &SpendFlow) -> Self {
        Self {
            flow_id: flow.id,
            amount: flow.amount,
            replayed: true,
        }
    }
}

/// How a Pending Freeze row is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Resolution {
    Spend,
    Unfreeze,
}

impl Resolution {
    fn biz_type(self) -> SpendBizType {
        match self {
            Self::Spend => SpendBizType::Spend,
            Self::Unfreeze => SpendBizType::Unfreeze,
        }
    }
}

fn external_key(main_id: u64, client_id: &str, external_id: &str) -> String {
    format!("{main_id}|{client_id}|{external_id}")
}

pub(super) fn load_spend_flow(txn: &LedgerTxn, id: u64) -> LedgerResult<SpendFlow> {
    txn.get_spend_flow(id)?
        .ok_or_else(|| LedgerError::not_found(format!("flow {id}")))
}

/// The row that already resolved `freeze_id`, if any.
pub(super) fn prior_resolution(txn: &LedgerTxn, freeze_id: u64) -> LedgerResult<Option<SpendFlow>> {
    match txn.index_get(SPEND_SETTLED_BY, &freeze_id)? {
        Some(id) => Ok(Some(load_spend_flow(txn, id)?)),
        None => Ok(None),
    }
}

/// Close a Pending Freeze row inside `txn`.
///
/// The caller has verified ownership and that `freeze` is still Pending.
/// Writes the new row, the updated freeze row, the balance and the indexes;
/// the caller commits.
pub(super) fn resolve_freeze(
    txn: &LedgerTxn,
    freeze: &mut SpendFlow,
    resolution: Resolution,
) -> LedgerResult<SpendFlow> {
    let mut balance = txn
        .lock_balance(freeze.main_id, freeze.asset_id)?
        .ok_or_else(|| LedgerError::not_found(format!("balance of user {}", freeze.main_id)))?;
    match resolution {
        Resolution::Spend => balance.spend_frozen(freeze.amount)?,
        Resolution::Unfreeze => balance.unfreeze(freeze.amount)?,
    }

    let now = Utc::now();
    let mut flow = SpendFlow {
        id: 0,
        main_id: freeze.main_id,
        asset_id: freeze.asset_id,
        biz_type: resolution.biz_type(),
        amount: freeze.amount,
        direction: match resolution {
            Resolution::Spend => Direction::Out,
            Resolution::Unfreeze => Direction::In,
        },
        client_id: freeze.client_id.clone(),
        game_id: freeze.game_id,
        session_id: freeze.session_id.clone(),
        external_id: None,
        external_remark: None,
        ref_flow_id: Some(freeze.id),
        status: SpendStatus::Done,
        created_at: now,
        updated_at: now,
    };
    txn.insert_spend_flow(&mut flow)?;

    freeze.status = match resolution {
        Resolution::Spend => SpendStatus::Done,
        Resolution::Unfreeze => SpendStatus::Reversed,
    };
    freeze.updated_at = now;
    txn.update_spend_flow(freeze)?;

    if let Some(existing) = txn.index_claim(SPEND_SETTLED_BY, &freeze.id, flow.id)? {
        return Err(LedgerError::AlreadyResolved(format!(
            "flow {} already resolved by flow {existing}",
            freeze.id
        )));
    }
    if let Some(session_id) = freeze.session_id.as_deref() {
        txn.index_release(PENDING_FREEZE, &(freeze.main_id, session_id))?;
    }
    txn.save_balance(&mut balance)?;
    Ok(flow)
}

impl Ledger {
    /// Hold `amount` for a caller-managed operation keyed by `external_id`.
    pub fn freeze_advanced(
        &self,
        main_id: u64,
        client_id: &str,
        amount: u64,
        external_id: &str,
        remark: Option<&str>,
    ) -> LedgerResult<SpendReceipt> {
        if amount == 0 {
            return Err(LedgerError::validation("amount must be positive"));
        }
        if external_id.trim().is_empty() {
            return Err(LedgerError::validation("external_id is required"));
        }
        check_external_field("external_id", external_id)?;
        if let Some(remark) = remark {
            check_external_field("remark", remark)?;
        }

        let key = external_key(main_id, client_id, external_id);
        let txn = self.db.begin()?;
        if let Some(id) = txn.index_get(SPEND_EXTERNAL, &key.as_str())? {
            let existing = load_spend_flow(&txn, id)?;
            if existing.amount != amount {
                return Err(LedgerError::Validation(format!(
                    "external_id {external_id} already used with amount {}",
                    existing.amount
                )));
            }
            return Ok(SpendReceipt::replayed(&existing));
        }

        let mut balance = txn.lock_balance_or_zero(main_id, DEFAULT_ASSET_ID)?;
        balance.freeze(amount)?;

        let now = Utc::now();
        let mut flow = SpendFlow {
            id: 0,
            main_id,
            asset_id: DEFAULT_ASSET_ID,
            biz_type: SpendBizType::Freeze,
            amount,
            direction: Direction::Out,
            client_id: client_id.to_string(),
            game_id: None,
            session_id: None,
            external_id: Some(external_id.to_string()),
            external_remark: remark.map(str::to_string),
            ref_flow_id: None,
            status: SpendStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        txn.insert_spend_flow(&mut flow)?;
        txn.index_claim(SPEND_EXTERNAL, &key.as_str(), flow.id)?;
        txn.save_balance(&mut balance)?;
        txn.commit()?;

        tracing::info!(main_id, flow_id = flow.id, amount, client_id, "Froze funds");
        Ok(SpendReceipt::created(&flow))
    }

    /// Return the funds held by `freeze_id` to `available`.
    pub fn unfreeze_advanced(&self, main_id: u64, freeze_id: u64) -> LedgerResult<SpendReceipt> {
        self.close_freeze(main_id, freeze_id, Resolution::Unfreeze)
    }

    /// Consume the funds held by `freeze_id`.
    pub fn spend_advanced(&self, main_id: u64, freeze_id: u64) -> LedgerResult<SpendReceipt> {
        self.close_freeze(main_id, freeze_id, Resolution::Spend)
    }

    fn close_freeze(&self, main_id: u64, freeze_id: u64, resolution: Resolution) -> LedgerResult<SpendReceipt> {
        let txn = self.db.begin()?;
        let mut freeze = load_spend_flow(&txn, freeze_id)?;
        if freeze.main_id != main_id {
            return Err(LedgerError::NotOwner(format!("flow {freeze_id}")));
        }
        if freeze.biz_type != SpendBizType::Freeze {
            return Err(LedgerError::Validation(format!("flow {freeze_id} is not a freeze")));
        }

        if let Some(prior) = prior_resolution(&txn, freeze_id)? {
            if prior.biz_type == resolution.biz_type() {
                return Ok(SpendReceipt::replayed(&prior));
            }
            return Err(LedgerError::AlreadyResolved(format!(
                "flow {freeze_id} already resolved by {:?} flow {}",
                prior.biz_type, prior.id
            )));
        }
        if freeze.status != SpendStatus::Pending {
            return Err(LedgerError::AlreadyResolved(format!(
                "flow {freeze_id} is {:?}",
                freeze.status
            )));
        }

        let flow = resolve_freeze(&txn, &mut freeze, resolution)?;
        txn.commit()?;

        tracing::info!(
            main_id,
            freeze_id,
            flow_id = flow.id,
            amount = flow.amount,
            kind = ?resolution,
            "Resolved freeze"
        );
        Ok(SpendReceipt::created(&flow))
    }

    /// Spend ledger rows of a user, newest first.
    pub fn list_spend_flows(
        &self,
        main_id: u64,
        biz_type: Option<SpendBizType>,
        page: usize,
        limit: usize,
    ) -> LedgerResult<Page<SpendFlow>> {
        let mut flows = self.db.list_spend_flows(main_id)?;
        if let Some(biz_type) = biz_type {
            flows.retain(|f| f.biz_type == biz_type);
        }
        Ok(Page::from_sorted(flows, page, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{fund, ledger};

    const USER: u64 = 1;

    #[test]
    fn freeze_then_spend() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 1_000);

        let frozen = ledger.freeze_advanced(USER, "app", 400, "order-1", Some("boost")).unwrap();
        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen), (600, 400));

        let spent = ledger.spend_advanced(USER, frozen.flow_id).unwrap();
        assert!(!spent.replayed);
        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen), (600, 0));

        let freeze = ledger.db().get_spend_flow(frozen.flow_id).unwrap().unwrap();
        assert_eq!(freeze.status, SpendStatus::Done);
        let spend = ledger.db().get_spend_flow(spent.flow_id).unwrap().unwrap();
        assert_eq!(spend.ref_flow_id, Some(frozen.flow_id));
        assert_eq!(spend.status, SpendStatus::Done);
    }

    #[test]
    fn unfreeze_returns_funds_and_reverses_freeze() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 1_000);
        let frozen = ledger.freeze_advanced(USER, "app", 250, "order-2", None).unwrap();
        ledger.unfreeze_advanced(USER, frozen.flow_id).unwrap();

        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen), (1_000, 0));
        let freeze = ledger.db().get_spend_flow(frozen.flow_id).unwrap().unwrap();
        assert_eq!(freeze.status, SpendStatus::Reversed);
    }

    #[test]
    fn same_external_id_never_double_debits() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 1_000);
        let first = ledger.freeze_advanced(USER, "app", 100, "order-3", None).unwrap();
        let again = ledger.freeze_advanced(USER, "app", 100, "order-3", None).unwrap();
        assert!(again.replayed);
        assert_eq!(first.flow_id, again.flow_id);
        assert_eq!(ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap().frozen, 100);

        // Another client may reuse the id
        let other = ledger.freeze_advanced(USER, "other-app", 100, "order-3", None).unwrap();
        assert_ne!(other.flow_id, first.flow_id);

        let err = ledger.freeze_advanced(USER, "app", 999, "order-3", None).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn repeated_resolution_is_idempotent_but_not_convertible() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 500);
        let frozen = ledger.freeze_advanced(USER, "app", 200, "order-4", None).unwrap();
        let spent = ledger.spend_advanced(USER, frozen.flow_id).unwrap();
        let again = ledger.spend_advanced(USER, frozen.flow_id).unwrap();
        assert!(again.replayed);
        assert_eq!(again.flow_id, spent.flow_id);

        let err = ledger.unfreeze_advanced(USER, frozen.flow_id).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyResolved(_)));
        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen), (300, 0));
    }

    #[test]
    fn advanced_input_validation() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 500);
        assert!(matches!(
            ledger.freeze_advanced(USER, "app", 0, "x", None),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.freeze_advanced(USER, "app", 1, " ", None),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.freeze_advanced(USER, "app", 1, &"e".repeat(129), None),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.freeze_advanced(USER, "app", 501, "too-much", None),
            Err(LedgerError::InsufficientBalance { available: 500, required: 501 })
        ));
    }

    #[test]
    fn foreign_freeze_is_rejected() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 500);
        let frozen = ledger.freeze_advanced(USER, "app", 10, "order-5", None).unwrap();
        assert!(matches!(
            ledger.spend_advanced(2, frozen.flow_id),
            Err(LedgerError::NotOwner(_))
        ));
        assert!(matches!(ledger.spend_advanced(USER, 999), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn listing_filters_by_type() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 500);
        let a = ledger.freeze_advanced(USER, "app", 10, "a", None).unwrap();
        ledger.freeze_advanced(USER, "app", 10, "b", None).unwrap();
        ledger.spend_advanced(USER, a.flow_id).unwrap();

        let all = ledger.list_spend_flows(USER, None, 1, 50).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.items[0].biz_type, SpendBizType::Spend);
        let freezes = ledger.list_spend_flows(USER, Some(SpendBizType::Freeze), 1, 50).unwrap();
        assert_eq!(freezes.total, 2);
        assert!(!freezes.has_more);
    }
}
