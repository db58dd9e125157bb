// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ledger records shared by storage, the ledgers and the reconciliation queue.
//!
//! Two ledgers live side by side:
//!
//! - the **spend ledger** ([`SpendFlow`]) for in-app game charges, moving funds
//!   between `available` and `frozen`;
//! - the **settlement ledger** ([`SettlementFlow`]) for on-chain custody events,
//!   moving funds between `available` and `withdrawal`.
//!
//! Both link rows through `ref_flow_id`, but they are separate types so that each
//! state machine's legal transitions stay enumerable.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Asset id used for the platform's single settlement token.
pub const DEFAULT_ASSET_ID: u64 = 0;

// =============================================================================
// Balance
// =============================================================================

/// Per-(user, asset) balance. All amounts are in the token's smallest unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub main_id: u64,
    pub asset_id: u64,
    /// Spendable funds.
    pub available: u64,
    /// Held by a pending game freeze.
    pub frozen: u64,
    /// Reserved by a withdrawal lock until it is claimed or canceled on chain.
    pub withdrawal: u64,
    pub update_time: DateTime<Utc>,
}

impl AccountBalance {
    /// A zero balance, used when the row is created lazily.
    pub fn zero(main_id: u64, asset_id: u64) -> Self {
        Self {
            main_id,
            asset_id,
            available: 0,
            frozen: 0,
            withdrawal: 0,
            update_time: Utc::now(),
        }
    }
}

// =============================================================================
// Spend ledger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendBizType {
    Recharge,
    Freeze,
    Unfreeze,
    Spend,
    Withdraw,
    Refund,
}

impl FromStr for SpendBizType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recharge" => Ok(Self::Recharge),
            "freeze" => Ok(Self::Freeze),
            "unfreeze" => Ok(Self::Unfreeze),
            "spend" => Ok(Self::Spend),
            "withdraw" => Ok(Self::Withdraw),
            "refund" => Ok(Self::Refund),
            other => Err(format!("unknown flow type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    None,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendStatus {
    Pending,
    Done,
    Failed,
    Reversed,
}

/// Spend ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendFlow {
    pub id: u64,
    pub main_id: u64,
    pub asset_id: u64,
    pub biz_type: SpendBizType,
    pub amount: u64,
    pub direction: Direction,
    pub client_id: String,
    pub game_id: Option<u64>,
    pub session_id: Option<String>,
    /// Caller-supplied idempotency key.
    pub external_id: Option<String>,
    pub external_remark: Option<String>,
    /// The freeze row this row settles or reverses.
    pub ref_flow_id: Option<u64>,
    pub status: SpendStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Settlement ledger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementOp {
    /// Deposit into the custody contract.
    Recharge,
    /// Withdrawal lock (server-signed permit, opened on chain).
    Freeze,
    /// Lock claimed on chain.
    Withdraw,
    /// Lock canceled on chain.
    Unfreeze,
}

impl SettlementOp {
    /// Operation label used by the withdraw-check view.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Recharge => "topup",
            Self::Freeze => "lock",
            Self::Withdraw => "withdraw",
            Self::Unfreeze => "unlock",
        }
    }
}

impl fmt::Display for SettlementOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Recharge => "recharge",
            Self::Freeze => "freeze",
            Self::Withdraw => "withdraw",
            Self::Unfreeze => "unfreeze",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    /// Lock opened on chain, waiting for its claim or cancel.
    PendingWithdraw,
    Success,
    Failed,
    Canceled,
}

impl SettlementStatus {
    /// Statuses in which a Freeze row still reserves `withdrawal` funds.
    pub fn is_active_lock(&self) -> bool {
        matches!(self, Self::Pending | Self::PendingWithdraw)
    }
}

/// Settlement ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementFlow {
    pub id: u64,
    pub main_id: u64,
    pub asset_id: u64,
    pub op: SettlementOp,
    pub status: SettlementStatus,
    /// Requested amount.
    pub amount: u64,
    /// Chain-confirmed amount.
    pub real_amount: u64,
    pub chain_id: u64,
    /// Empty until the user reports the transaction.
    pub tx_hash: String,
    pub block_height: u64,
    pub block_timestamp: Option<DateTime<Utc>>,
    /// Withdraw/Unfreeze rows point at their Freeze row.
    pub ref_flow_id: Option<u64>,
    pub from_addr: String,
    pub to_addr: String,
    pub lock: Option<LockTicket>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Signed withdrawal permit carried by a Freeze row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTicket {
    pub lock_id: B256,
    pub nonce: U256,
    pub digest: B256,
    /// 65-byte `r || s || v` signature, `v` in {27, 28}, hex encoded.
    pub signature: String,
    pub expiry: DateTime<Utc>,
    /// User address the permit was issued to.
    pub lock_addr: Address,
}

// =============================================================================
// Game sessions & catalog
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Start,
    End,
    Reversed,
    Settled,
    Auditing,
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            "reversed" => Ok(Self::Reversed),
            "settled" => Ok(Self::Settled),
            "auditing" => Ok(Self::Auditing),
            other => Err(format!("unknown session status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSession {
    pub session_id: String,
    pub main_id: u64,
    pub game_id: u64,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub score: Option<Decimal>,
    pub user_report_score: Option<Decimal>,
    pub spend_amount: u64,
    pub testing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Draft,
    Testing,
    Active,
    Inactive,
}

/// Catalog entry consulted when opening sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub game_id: u64,
    pub name: String,
    pub status: GameStatus,
}

/// Per-game price table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSetting {
    pub game_id: u64,
    pub code: String,
    pub amount_per_play: u64,
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Queue payload: one on-chain transaction to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub chain_id: u64,
    pub tx_hash: String,
    pub main_id: u64,
    /// Settlement row the transaction was reported against.
    pub ref_flow_id: u64,
    pub op: SettlementOp,
}

impl ReconciliationItem {
    /// Dedupe key for the queue.
    pub fn queue_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.main_id,
            self.chain_id,
            self.tx_hash.to_lowercase(),
            self.op
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxOutcomeStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// Normalized view of a decoded custody transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedTxOutcome {
    pub status: TxOutcomeStatus,
    pub amount: Option<U256>,
    /// Transaction sender.
    pub from_addr: Option<Address>,
    /// Call target, or the claim recipient for claims.
    pub to_addr: Option<Address>,
    /// `user` field of the emitted event.
    pub user_addr: Option<Address>,
    /// Contract that emitted the matched event.
    pub contract: Option<Address>,
    pub block_height: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub lock_id: Option<B256>,
}

impl ParsedTxOutcome {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn is_final(&self) -> bool {
        self.status != TxOutcomeStatus::Pending
    }
}

/// A page of results, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Slice `all` (already sorted) into page `page` (1-based).
    pub fn from_sorted(all: Vec<T>, page: usize, limit: usize) -> Self {
        let page = page.max(1);
        let limit = limit.clamp(1, 200);
        let total = all.len();
        let offset = (page - 1).saturating_mul(limit);
        let items: Vec<T> = all.into_iter().skip(offset).take(limit).collect();
        Self {
            items,
            page,
            limit,
            total,
            has_more: offset.saturating_add(limit) < total,
        }
    }
}
