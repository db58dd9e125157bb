// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Settlement ledger: reporting custody transactions and applying their
//! on-chain outcomes.
//!
//! ## Reporting
//!
//! | op         | ref_flow_id | effect                                             |
//! |------------|-------------|----------------------------------------------------|
//! | `Recharge` | -           | new Pending row                                    |
//! | `Freeze`   | lock row    | hash attached to the lock row                      |
//! | `Withdraw` | lock row    | new Pending row for the lock's amount, ref = lock  |
//! | `Unfreeze` | lock row    | new Pending row for the lock's amount, ref = lock  |
//!
//! A tx hash belongs to at most one row of one user through the
//! `settlement_tx` index. Every report enqueues a [`ReconciliationItem`]
//! pointing at the row it touched.
//!
//! ## Application
//!
//! | op         | chain success                                          | balance                    |
//! |------------|--------------------------------------------------------|----------------------------|
//! | `Recharge` | row → Success                                          | available += amount        |
//! | `Freeze`   | row → PendingWithdraw                                  | -                          |
//! | `Withdraw` | row → Success, lock PendingWithdraw → Success          | withdrawal -= amount       |
//! | `Unfreeze` | row → Success, lock PendingWithdraw → Canceled         | withdrawal → available     |
//!
//! A failed transaction marks the row Failed and leaves the balance alone. So
//! does a successful one without the operation's custody event, or whose event
//! names a different lock.

use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use serde::Serialize;

use super::Ledger;
use crate::chain::parse_tx_hash;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Page, ParsedTxOutcome, ReconciliationItem, SettlementFlow, SettlementOp, SettlementStatus,
    TxOutcomeStatus, DEFAULT_ASSET_ID,
};
use crate::storage::ledger_db::{ACTIVE_LOCK, SETTLEMENT_TX};
use crate::storage::LedgerTxn;

/// A user's claim that `tx_hash` performs `op`.
#[derive(Debug, Clone, Copy)]
pub struct TxReport<'a> {
    pub main_id: u64,
    pub op: SettlementOp,
    pub chain_id: u64,
    pub tx_hash: &'a str,
    /// Lock row for Freeze / Withdraw / Unfreeze.
    pub ref_flow_id: Option<u64>,
    /// Amount the user says was deposited. Informational; the chain decides.
    pub amount: Option<u64>,
}

/// Pending acknowledgement of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportReceipt {
    pub operation_id: u64,
    pub status: SettlementStatus,
    pub replayed: bool,
}

/// Withdraw-check view of one settlement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementOperation {
    pub operation_id: u64,
    pub operation_type: &'static str,
    pub status: SettlementStatus,
    pub chain_id: u64,
    pub tx_hash: String,
    pub amount: u64,
    pub real_amount: u64,
    pub ref_flow_id: Option<u64>,
    pub lock_id: Option<String>,
    pub signature: Option<String>,
    pub nonce: Option<String>,
    pub expiry: Option<chrono::DateTime<Utc>>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<&SettlementFlow> for SettlementOperation {
    fn from(flow: &SettlementFlow) -> Self {
        let lock = flow.lock.as_ref();
        Self {
            operation_id: flow.id,
            operation_type: flow.op.label(),
            status: flow.status,
            chain_id: flow.chain_id,
            tx_hash: flow.tx_hash.clone(),
            amount: flow.amount,
            real_amount: flow.real_amount,
            ref_flow_id: flow.ref_flow_id,
            lock_id: lock.map(|t| alloy::hex::encode_prefixed(t.lock_id)),
            signature: lock.map(|t| t.signature.clone()),
            nonce: lock.map(|t| t.nonce.to_string()),
            expiry: lock.map(|t| t.expiry),
            updated_at: flow.updated_at,
        }
    }
}

/// Canonical (lowercase, `0x`-prefixed) form of a reported hash.
pub fn normalize_tx_hash(raw: &str) -> LedgerResult<String> {
    let hash = parse_tx_hash(raw).map_err(|e| LedgerError::Validation(e.to_string()))?;
    Ok(alloy::hex::encode_prefixed(hash))
}

fn item_for(flow: &SettlementFlow) -> ReconciliationItem {
    ReconciliationItem {
        chain_id: flow.chain_id,
        tx_hash: flow.tx_hash.clone(),
        main_id: flow.main_id,
        ref_flow_id: flow.id,
        op: flow.op,
    }
}

/// Amount a lock row holds in `withdrawal`.
fn reserved(lock: &SettlementFlow) -> u64 {
    if lock.real_amount > 0 {
        lock.real_amount
    } else {
        lock.amount
    }
}

fn to_units(amount: U256) -> LedgerResult<u64> {
    u64::try_from(amount)
        .map_err(|_| LedgerError::Validation(format!("amount {amount} exceeds ledger precision")))
}

fn load_lock(txn: &LedgerTxn, main_id: u64, lock_flow_id: u64) -> LedgerResult<SettlementFlow> {
    let lock = txn
        .get_settlement_flow(lock_flow_id)?
        .ok_or_else(|| LedgerError::not_found(format!("lock {lock_flow_id}")))?;
    if lock.main_id != main_id {
        return Err(LedgerError::NotOwner(format!("lock {lock_flow_id}")));
    }
    if lock.op != SettlementOp::Freeze {
        return Err(LedgerError::Validation(format!("flow {lock_flow_id} is not a lock")));
    }
    Ok(lock)
}

fn record_chain_fields(flow: &mut SettlementFlow, outcome: &ParsedTxOutcome) {
    flow.block_height = outcome.block_height;
    flow.block_timestamp = outcome.block_time;
    if let Some(from) = outcome.from_addr {
        flow.from_addr = from.to_string();
    }
    if let Some(to) = outcome.to_addr {
        flow.to_addr = to.to_string();
    }
}

/// Mark a successful transaction that does not prove `flow`'s operation.
fn reject(flow: &mut SettlementFlow, reason: &str) {
    flow.status = SettlementStatus::Failed;
    tracing::warn!(
        main_id = flow.main_id,
        operation_id = flow.id,
        op = %flow.op,
        tx_hash = %flow.tx_hash,
        reason,
        "Transaction not applied"
    );
}

impl Ledger {
    /// Record a user-submitted transaction hash and queue it for reconciliation.
    pub fn report_tx_hash(&self, report: TxReport<'_>) -> LedgerResult<ReportReceipt> {
        let tx_hash = normalize_tx_hash(report.tx_hash)?;
        let main_id = report.main_id;
        let ref_flow_id = match (report.op, report.ref_flow_id) {
            (SettlementOp::Recharge, _) => None,
            (_, Some(id)) => Some(id),
            (op, None) => {
                return Err(LedgerError::Validation(format!("{op} report requires ref_flow_id")));
            }
        };

        let txn = self.db.begin()?;
        let existing = match txn.index_get(SETTLEMENT_TX, &tx_hash.as_str())? {
            Some(id) => Some(txn.require_settlement_flow(id)?),
            None => None,
        };

        let (flow, replayed) = match ref_flow_id {
            None => self.report_recharge(&txn, &report, &tx_hash, existing)?,
            Some(lock_flow_id) => {
                let mut lock = load_lock(&txn, main_id, lock_flow_id)?;
                if lock.chain_id != report.chain_id {
                    return Err(LedgerError::Validation(format!(
                        "lock {lock_flow_id} was issued for chain {}",
                        lock.chain_id
                    )));
                }
                if report.op == SettlementOp::Freeze {
                    attach_lock_hash(&txn, &mut lock, &tx_hash, existing)?
                } else {
                    report_lock_resolution(&txn, report.op, &lock, &tx_hash, existing)?
                }
            }
        };
        txn.commit()?;

        if flow.status == SettlementStatus::Pending {
            // The row is durable; a failed enqueue is recovered by the stale sweep
            if let Err(e) = self.queue.enqueue_unique(&item_for(&flow)) {
                tracing::warn!(operation_id = flow.id, tx_hash = %tx_hash, error = %e, "Enqueue failed");
            }
        }
        if !replayed {
            tracing::info!(
                main_id,
                operation_id = flow.id,
                op = %flow.op,
                chain_id = flow.chain_id,
                tx_hash = %tx_hash,
                "Transaction reported"
            );
        }
        Ok(ReportReceipt {
            operation_id: flow.id,
            status: flow.status,
            replayed,
        })
    }

    fn report_recharge(
        &self,
        txn: &LedgerTxn,
        report: &TxReport<'_>,
        tx_hash: &str,
        existing: Option<SettlementFlow>,
    ) -> LedgerResult<(SettlementFlow, bool)> {
        if let Some(flow) = existing {
            if flow.op == SettlementOp::Recharge && flow.main_id == report.main_id {
                return Ok((flow, true));
            }
            return Err(LedgerError::DuplicateTxHash(tx_hash.to_string()));
        }
        let now = Utc::now();
        let mut flow = SettlementFlow {
            id: 0,
            main_id: report.main_id,
            asset_id: DEFAULT_ASSET_ID,
            op: SettlementOp::Recharge,
            status: SettlementStatus::Pending,
            amount: report.amount.unwrap_or(0),
            real_amount: 0,
            chain_id: report.chain_id,
            tx_hash: tx_hash.to_string(),
            block_height: 0,
            block_timestamp: None,
            ref_flow_id: None,
            from_addr: String::new(),
            to_addr: self.custody_contract.map(|c| c.to_string()).unwrap_or_default(),
            lock: None,
            created_at: now,
            updated_at: now,
        };
        txn.insert_settlement_flow(&mut flow)?;
        txn.index_claim(SETTLEMENT_TX, &tx_hash, flow.id)?;
        Ok((flow, false))
    }

    /// Apply a final chain outcome to the row `item` points at.
    ///
    /// Runs as one transaction; any error leaves the row Pending. A successful
    /// transaction only moves balances when it carries the operation's custody
    /// event for the right lock; otherwise the row is marked Failed.
    pub fn apply_outcome(
        &self,
        item: &ReconciliationItem,
        outcome: &ParsedTxOutcome,
    ) -> LedgerResult<SettlementStatus> {
        if !outcome.is_final() {
            return Err(LedgerError::validation("outcome is not final"));
        }
        let tx_hash = normalize_tx_hash(&item.tx_hash)?;

        let txn = self.db.begin()?;
        let id = txn
            .index_get(SETTLEMENT_TX, &tx_hash.as_str())?
            .ok_or_else(|| LedgerError::not_found(format!("settlement for {tx_hash}")))?;
        if id != item.ref_flow_id {
            return Err(LedgerError::Validation(format!(
                "{tx_hash} belongs to flow {id}, not {}",
                item.ref_flow_id
            )));
        }
        let mut flow = txn.require_settlement_flow(id)?;
        if flow.main_id != item.main_id {
            return Err(LedgerError::NotOwner(format!("settlement flow {id}")));
        }
        if flow.status != SettlementStatus::Pending {
            return Err(LedgerError::AlreadyProcessed(format!(
                "settlement flow {id} is {:?}",
                flow.status
            )));
        }
        if flow.op != item.op {
            return Err(LedgerError::Validation(format!(
                "settlement flow {id} is a {} but was queued as {}",
                flow.op, item.op
            )));
        }

        record_chain_fields(&mut flow, outcome);
        if outcome.status == TxOutcomeStatus::Failed {
            flow.status = SettlementStatus::Failed;
        } else {
            self.apply_success(&txn, &mut flow, outcome)?;
        }
        if flow.op == SettlementOp::Freeze && flow.status == SettlementStatus::Failed {
            txn.index_release(ACTIVE_LOCK, &flow.main_id)?;
            tracing::warn!(
                main_id = flow.main_id,
                operation_id = id,
                amount = flow.amount,
                "Lock transaction failed; reserved withdrawal needs manual handling"
            );
        }
        flow.updated_at = Utc::now();
        txn.update_settlement_flow(&flow)?;
        txn.commit()?;

        tracing::info!(
            main_id = flow.main_id,
            operation_id = id,
            op = %flow.op,
            status = ?flow.status,
            real_amount = flow.real_amount,
            block_height = flow.block_height,
            "Settlement applied"
        );
        Ok(flow.status)
    }

    /// Check that `outcome` carries a custody event, from the custody contract
    /// when one is configured, acting on `expected_lock` when given.
    fn check_event(&self, outcome: &ParsedTxOutcome, expected_lock: Option<B256>) -> Result<(), String> {
        let Some(emitter) = outcome.contract else {
            return Err("no matching custody event in transaction".to_string());
        };
        if let Some(custody) = self.custody_contract {
            if emitter != custody {
                return Err(format!("event emitted by {emitter}, not the custody contract"));
            }
        }
        if let Some(expected) = expected_lock {
            if outcome.lock_id != Some(expected) {
                return Err(format!("event is for lock {:?}, expected {expected}", outcome.lock_id));
            }
        }
        Ok(())
    }

    fn apply_success(
        &self,
        txn: &LedgerTxn,
        flow: &mut SettlementFlow,
        outcome: &ParsedTxOutcome,
    ) -> LedgerResult<()> {
        match flow.op {
            SettlementOp::Recharge => {
                if let Err(reason) = self.check_event(outcome, None) {
                    reject(flow, &reason);
                    return Ok(());
                }
                let amount = outcome
                    .amount
                    .ok_or_else(|| LedgerError::validation("deposit amount missing from transaction"))?;
                let amount = to_units(amount)?;
                let mut balance = txn.lock_balance_or_zero(flow.main_id, flow.asset_id)?;
                balance.credit(amount)?;
                txn.save_balance(&mut balance)?;
                flow.real_amount = amount;
                flow.status = SettlementStatus::Success;
            }
            SettlementOp::Freeze => {
                let Some(expected) = flow.lock.as_ref().map(|t| t.lock_id) else {
                    reject(flow, "lock row carries no permit");
                    return Ok(());
                };
                if let Err(reason) = self.check_event(outcome, Some(expected)) {
                    reject(flow, &reason);
                    return Ok(());
                }
                flow.real_amount = match outcome.amount {
                    Some(amount) => to_units(amount)?,
                    None => flow.amount,
                };
                flow.status = SettlementStatus::PendingWithdraw;
            }
            SettlementOp::Withdraw | SettlementOp::Unfreeze => {
                let lock_flow_id = flow
                    .ref_flow_id
                    .ok_or_else(|| LedgerError::Validation(format!("flow {} has no lock", flow.id)))?;
                let mut lock = txn.require_settlement_flow(lock_flow_id)?;
                match lock.status {
                    SettlementStatus::PendingWithdraw => {}
                    SettlementStatus::Pending => return Err(LedgerError::PairNotReady(lock.id)),
                    other => {
                        return Err(LedgerError::AlreadyResolved(format!(
                            "lock {lock_flow_id} is {other:?}"
                        )))
                    }
                }
                let expected = lock.lock.as_ref().map(|t| t.lock_id);
                let proof = match expected {
                    Some(expected) => self.check_event(outcome, Some(expected)),
                    None => Err(format!("lock {lock_flow_id} carries no permit")),
                };
                if let Err(reason) = proof {
                    reject(flow, &reason);
                    return Ok(());
                }

                let amount = reserved(&lock);
                let mut balance = txn
                    .lock_balance(flow.main_id, flow.asset_id)?
                    .ok_or_else(|| LedgerError::not_found(format!("balance of user {}", flow.main_id)))?;
                if flow.op == SettlementOp::Withdraw {
                    balance.settle_withdrawal(amount)?;
                    lock.status = SettlementStatus::Success;
                } else {
                    balance.release_withdrawal(amount)?;
                    lock.status = SettlementStatus::Canceled;
                }
                txn.save_balance(&mut balance)?;
                lock.updated_at = Utc::now();
                txn.update_settlement_flow(&lock)?;
                txn.index_release(ACTIVE_LOCK, &lock.main_id)?;

                flow.real_amount = match outcome.amount {
                    Some(amount) => to_units(amount)?,
                    None => amount,
                };
                flow.status = SettlementStatus::Success;
            }
        }
        Ok(())
    }

    /// Withdraw-check view of one of the user's settlement rows.
    pub fn get_settlement_operation(
        &self,
        main_id: u64,
        operation_id: u64,
    ) -> LedgerResult<SettlementOperation> {
        let flow = self
            .db
            .get_settlement_flow(operation_id)?
            .ok_or_else(|| LedgerError::not_found(format!("operation {operation_id}")))?;
        if flow.main_id != main_id {
            return Err(LedgerError::NotOwner(format!("operation {operation_id}")));
        }
        Ok(SettlementOperation::from(&flow))
    }

    /// Settlement rows of a user, newest first.
    pub fn list_settlement_flows(
        &self,
        main_id: u64,
        page: usize,
        limit: usize,
    ) -> LedgerResult<Page<SettlementFlow>> {
        let flows = self.db.list_settlement_flows(main_id)?;
        Ok(Page::from_sorted(flows, page, limit))
    }

    /// Re-enqueue Pending rows with a hash that have not moved for `stale_after`.
    ///
    /// Returns how many items were actually queued.
    pub fn sweep_stale_pending(&self, stale_after: Duration) -> LedgerResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let mut queued = 0;
        for flow in self.db.pending_settlements()? {
            if flow.updated_at > cutoff {
                continue;
            }
            if self.queue.enqueue_unique(&item_for(&flow))? {
                tracing::debug!(operation_id = flow.id, tx_hash = %flow.tx_hash, "Re-enqueued stale settlement");
                queued += 1;
            }
        }
        Ok(queued)
    }
}

fn attach_lock_hash(
    txn: &LedgerTxn,
    lock: &mut SettlementFlow,
    tx_hash: &str,
    existing: Option<SettlementFlow>,
) -> LedgerResult<(SettlementFlow, bool)> {
    if let Some(flow) = existing {
        if flow.id == lock.id {
            return Ok((flow, true));
        }
        return Err(LedgerError::DuplicateTxHash(tx_hash.to_string()));
    }
    if lock.status != SettlementStatus::Pending {
        return Err(LedgerError::AlreadyProcessed(format!(
            "lock {} is {:?}",
            lock.id, lock.status
        )));
    }
    if !lock.tx_hash.is_empty() {
        // Replacement transaction (speed-up or resubmission)
        tracing::warn!(
            operation_id = lock.id,
            previous = %lock.tx_hash,
            tx_hash,
            "Lock transaction hash replaced"
        );
        txn.index_release(SETTLEMENT_TX, &lock.tx_hash.as_str())?;
    }
    lock.tx_hash = tx_hash.to_string();
    lock.updated_at = Utc::now();
    txn.update_settlement_flow(lock)?;
    txn.index_claim(SETTLEMENT_TX, &tx_hash, lock.id)?;
    Ok((lock.clone(), false))
}

fn report_lock_resolution(
    txn: &LedgerTxn,
    op: SettlementOp,
    lock: &SettlementFlow,
    tx_hash: &str,
    existing: Option<SettlementFlow>,
) -> LedgerResult<(SettlementFlow, bool)> {
    if let Some(flow) = existing {
        if flow.op == op && flow.ref_flow_id == Some(lock.id) {
            return Ok((flow, true));
        }
        return Err(LedgerError::DuplicateTxHash(tx_hash.to_string()));
    }
    if !lock.status.is_active_lock() {
        return Err(LedgerError::AlreadyResolved(format!(
            "lock {} is {:?}",
            lock.id, lock.status
        )));
    }
    let now = Utc::now();
    let mut flow = SettlementFlow {
        id: 0,
        main_id: lock.main_id,
        asset_id: lock.asset_id,
        op,
        status: SettlementStatus::Pending,
        amount: reserved(lock),
        real_amount: 0,
        chain_id: lock.chain_id,
        tx_hash: tx_hash.to_string(),
        block_height: 0,
        block_timestamp: None,
        ref_flow_id: Some(lock.id),
        from_addr: String::new(),
        to_addr: lock
            .lock
            .as_ref()
            .map(|t| t.lock_addr.to_string())
            .unwrap_or_else(|| Address::ZERO.to_string()),
        lock: None,
        created_at: now,
        updated_at: now,
    };
    txn.insert_settlement_flow(&mut flow)?;
    txn.index_claim(SETTLEMENT_TX, &tx_hash, flow.id)?;
    Ok((flow, false))
}
