// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Withdrawal lock issuance.
//!
//! ## State machine (per user)
//!
//! ```text
//! NoActiveLock ──issue──► Pending ──openLock mined──► PendingWithdraw ──claim──► Success
//!                                                                    └─cancel──► Canceled
//! ```
//!
//! Issuing moves the amount from `available` to `withdrawal` and signs an
//! EIP-712 permit the custody contract verifies in `openLock`. The `active_lock`
//! index holds the user's single active lock row; a repeated request returns
//! that row's permit unchanged.

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::Ledger;
use crate::chain::signing::{generate_lock_id, generate_nonce};
use crate::chain::{ChainError, DomainSeparatorSource, LockAuthParams, LockAuthSigner};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{LockTicket, SettlementFlow, SettlementOp, SettlementStatus, DEFAULT_ASSET_ID};
use crate::storage::ledger_db::ACTIVE_LOCK;
use crate::storage::LedgerTxn;

/// Validity window of a freshly issued permit.
pub const LOCK_TTL_HOURS: i64 = 10;

/// Signing key, contract and domain source used to issue permits.
#[derive(Clone)]
pub struct LockIssuer {
    signer: Arc<LockAuthSigner>,
    contract: Address,
    domains: Arc<dyn DomainSeparatorSource>,
}

impl LockIssuer {
    pub fn new(
        signer: Arc<LockAuthSigner>,
        contract: Address,
        domains: Arc<dyn DomainSeparatorSource>,
    ) -> Self {
        Self {
            signer,
            contract,
            domains,
        }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }
}

/// Permit handed to the user for `openLock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawLock {
    pub operation_id: u64,
    /// `lock` while the permit is unused, `withdraw` once the lock is open.
    pub operation_type: &'static str,
    pub status: SettlementStatus,
    pub chain_id: u64,
    pub contract: Address,
    pub user: Address,
    pub amount: u64,
    pub lock_id: B256,
    pub nonce: U256,
    pub digest: B256,
    pub signature: String,
    pub expiry: DateTime<Utc>,
}

impl WithdrawLock {
    fn from_flow(flow: &SettlementFlow, contract: Address) -> LedgerResult<Self> {
        let ticket = flow.lock.as_ref().ok_or_else(|| {
            LedgerError::Validation(format!("settlement flow {} carries no permit", flow.id))
        })?;
        Ok(Self {
            operation_id: flow.id,
            operation_type: if flow.status == SettlementStatus::PendingWithdraw {
                SettlementOp::Withdraw.label()
            } else {
                SettlementOp::Freeze.label()
            },
            status: flow.status,
            chain_id: flow.chain_id,
            contract,
            user: ticket.lock_addr,
            amount: flow.amount,
            lock_id: ticket.lock_id,
            nonce: ticket.nonce,
            digest: ticket.digest,
            signature: ticket.signature.clone(),
            expiry: ticket.expiry,
        })
    }
}

/// Re-validate an existing active lock against a new request.
fn reuse_lock(
    flow: &SettlementFlow,
    user: Address,
    amount: u64,
    contract: Address,
) -> LedgerResult<WithdrawLock> {
    if flow.amount != amount {
        return Err(LedgerError::Validation(format!(
            "an active withdrawal of {} is already pending",
            flow.amount
        )));
    }
    let lock = WithdrawLock::from_flow(flow, contract)?;
    if lock.user != user {
        return Err(LedgerError::Validation(format!(
            "the active withdrawal is bound to {}",
            lock.user
        )));
    }
    // Once opened on chain the permit has been consumed; expiry no longer matters
    if flow.status == SettlementStatus::Pending && lock.expiry <= Utc::now() {
        return Err(LedgerError::LockExpired(alloy::hex::encode_prefixed(lock.lock_id)));
    }
    Ok(lock)
}

fn active_lock_row(txn: &LedgerTxn, main_id: u64) -> LedgerResult<Option<SettlementFlow>> {
    match txn.index_get(ACTIVE_LOCK, &main_id)? {
        Some(id) => Ok(Some(txn.require_settlement_flow(id)?)),
        None => Ok(None),
    }
}

impl Ledger {
    /// Reserve `amount` for withdrawal and sign a permit for `user`.
    ///
    /// Repeating the request while the lock is active returns the same permit.
    pub async fn issue_withdraw_lock(
        &self,
        main_id: u64,
        user: Address,
        amount: u64,
        chain_id: u64,
    ) -> LedgerResult<WithdrawLock> {
        if amount == 0 {
            return Err(LedgerError::validation("amount must be positive"));
        }
        if user.is_zero() {
            return Err(LedgerError::validation("user address is required"));
        }
        let issuer = self
            .locks
            .as_ref()
            .ok_or(LedgerError::Chain(ChainError::MissingParams("withdraw lock signer")))?;

        if let Some(id) = self.db.active_lock(main_id)? {
            if let Some(flow) = self.db.get_settlement_flow(id)? {
                return reuse_lock(&flow, user, amount, issuer.contract);
            }
        }

        let domain_separator = issuer.domains.domain_separator(chain_id, issuer.contract).await?;

        let txn = self.db.begin()?;
        // Another request may have issued a lock while the separator was fetched
        if let Some(flow) = active_lock_row(&txn, main_id)? {
            return reuse_lock(&flow, user, amount, issuer.contract);
        }

        let mut balance = txn.lock_balance_or_zero(main_id, DEFAULT_ASSET_ID)?;
        balance.reserve_withdrawal(amount)?;

        let lock_id = generate_lock_id()?;
        let nonce = generate_nonce()?;
        let now = Utc::now();
        let expiry = now + Duration::hours(LOCK_TTL_HOURS);
        let params = LockAuthParams {
            user,
            lock_id,
            amount: U256::from(amount),
            expiry: u64::try_from(expiry.timestamp()).unwrap_or_default(),
            nonce,
        };
        let signed = issuer.signer.sign_lock_auth(domain_separator, &params)?;

        let mut flow = SettlementFlow {
            id: 0,
            main_id,
            asset_id: DEFAULT_ASSET_ID,
            op: SettlementOp::Freeze,
            status: SettlementStatus::Pending,
            amount,
            real_amount: 0,
            chain_id,
            tx_hash: String::new(),
            block_height: 0,
            block_timestamp: None,
            ref_flow_id: None,
            from_addr: String::new(),
            to_addr: issuer.contract.to_string(),
            lock: Some(LockTicket {
                lock_id,
                nonce,
                digest: signed.digest,
                signature: signed.signature_hex(),
                expiry,
                lock_addr: user,
            }),
            created_at: now,
            updated_at: now,
        };
        txn.insert_settlement_flow(&mut flow)?;
        txn.index_claim(ACTIVE_LOCK, &main_id, flow.id)?;
        txn.save_balance(&mut balance)?;
        txn.commit()?;

        tracing::info!(
            main_id,
            operation_id = flow.id,
            amount,
            chain_id,
            lock_id = %lock_id,
            user = %user,
            "Issued withdrawal lock"
        );
        WithdrawLock::from_flow(&flow, issuer.contract)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::recover_signer;
    use crate::ledger::test_support::{fund, ledger};
    use async_trait::async_trait;

    const USER: u64 = 1;
    pub(crate) const CONTRACT: Address = Address::repeat_byte(0xcc);
    pub(crate) const WALLET: Address = Address::repeat_byte(0x0a);
    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    pub(crate) struct FixedDomain(pub B256);

    #[async_trait]
    impl DomainSeparatorSource for FixedDomain {
        async fn domain_separator(&self, _chain_id: u64, _contract: Address) -> Result<B256, ChainError> {
            Ok(self.0)
        }
    }

    struct Unreachable;

    #[async_trait]
    impl DomainSeparatorSource for Unreachable {
        async fn domain_separator(&self, _chain_id: u64, _contract: Address) -> Result<B256, ChainError> {
            Err(ChainError::Timeout(15))
        }
    }

    /// Holds every caller until `n` of them are fetching the separator.
    struct Gate(tokio::sync::Barrier);

    #[async_trait]
    impl DomainSeparatorSource for Gate {
        async fn domain_separator(&self, _chain_id: u64, _contract: Address) -> Result<B256, ChainError> {
            self.0.wait().await;
            Ok(B256::repeat_byte(0xd0))
        }
    }

    pub(crate) fn issuer() -> LockIssuer {
        LockIssuer::new(
            Arc::new(LockAuthSigner::from_hex(KEY).unwrap()),
            CONTRACT,
            Arc::new(FixedDomain(B256::repeat_byte(0xd0))),
        )
    }

    #[tokio::test]
    async fn repeated_request_returns_identical_permit() {
        let (ledger, _dir) = ledger();
        let ledger = ledger.with_lock_issuer(issuer());
        fund(&ledger, USER, 2_000_000);

        let first = ledger.issue_withdraw_lock(USER, WALLET, 500_000, 56).await.unwrap();
        let second = ledger.issue_withdraw_lock(USER, WALLET, 500_000, 56).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.operation_type, "lock");

        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.withdrawal), (1_500_000, 500_000));
    }

    #[tokio::test]
    async fn permit_is_signed_by_the_issuer() {
        let (ledger, _dir) = ledger();
        let issuer = issuer();
        let signer = issuer.signer_address();
        let ledger = ledger.with_lock_issuer(issuer);
        fund(&ledger, USER, 100);

        let lock = ledger.issue_withdraw_lock(USER, WALLET, 100, 56).await.unwrap();
        let signature = alloy::hex::decode(&lock.signature).unwrap();
        assert_eq!(signature.len(), 65);
        assert_eq!(recover_signer(&lock.digest, &signature).unwrap(), signer);
        let minutes = (lock.expiry - Utc::now()).num_minutes();
        assert!((9 * 60..=10 * 60).contains(&minutes));
    }

    #[tokio::test]
    async fn different_amount_while_active_is_rejected() {
        let (ledger, _dir) = ledger();
        let ledger = ledger.with_lock_issuer(issuer());
        fund(&ledger, USER, 1_000);
        ledger.issue_withdraw_lock(USER, WALLET, 400, 56).await.unwrap();
        assert!(matches!(
            ledger.issue_withdraw_lock(USER, WALLET, 300, 56).await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn different_wallet_while_active_is_rejected() {
        let (ledger, _dir) = ledger();
        let ledger = ledger.with_lock_issuer(issuer());
        fund(&ledger, USER, 1_000);
        ledger.issue_withdraw_lock(USER, WALLET, 400, 56).await.unwrap();
        assert!(matches!(
            ledger.issue_withdraw_lock(USER, Address::repeat_byte(0x0b), 400, 56).await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_requests_reserve_once() {
        let (ledger, _dir) = ledger();
        let ledger = ledger.with_lock_issuer(LockIssuer::new(
            Arc::new(LockAuthSigner::from_hex(KEY).unwrap()),
            CONTRACT,
            Arc::new(Gate(tokio::sync::Barrier::new(2))),
        ));
        fund(&ledger, USER, 1_000);

        // Both requests pass the first active-lock check before either writes
        let (a, b) = tokio::join!(
            ledger.issue_withdraw_lock(USER, WALLET, 600, 56),
            ledger.issue_withdraw_lock(USER, WALLET, 600, 56),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.operation_id, b.operation_id);
        assert_eq!(a.lock_id, b.lock_id);

        let balance = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((balance.available, balance.withdrawal), (400, 600));
        assert_eq!(ledger.list_settlement_flows(USER, 1, 50).unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn insufficient_balance_reserves_nothing() {
        let (ledger, _dir) = ledger();
        let ledger = ledger.with_lock_issuer(issuer());
        fund(&ledger, USER, 10);
        assert!(matches!(
            ledger.issue_withdraw_lock(USER, WALLET, 11, 56).await,
            Err(LedgerError::InsufficientBalance { available: 10, required: 11 })
        ));
        assert!(ledger.db().active_lock(USER).unwrap().is_none());
        assert!(ledger.list_settlement_flows(USER, 1, 50).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn expired_unopened_lock_is_reported() {
        let (ledger, _dir) = ledger();
        let ledger = ledger.with_lock_issuer(issuer());
        fund(&ledger, USER, 1_000);
        let lock = ledger.issue_withdraw_lock(USER, WALLET, 100, 56).await.unwrap();

        let txn = ledger.db().begin().unwrap();
        let mut flow = txn.require_settlement_flow(lock.operation_id).unwrap();
        if let Some(ticket) = flow.lock.as_mut() {
            ticket.expiry = Utc::now() - Duration::minutes(1);
        }
        txn.update_settlement_flow(&flow).unwrap();
        txn.commit().unwrap();

        assert!(matches!(
            ledger.issue_withdraw_lock(USER, WALLET, 100, 56).await,
            Err(LedgerError::LockExpired(_))
        ));
    }

    #[tokio::test]
    async fn missing_signer_or_domain_fails_cleanly() {
        let (ledger, _dir) = ledger();
        fund(&ledger, USER, 1_000);
        assert!(matches!(
            ledger.issue_withdraw_lock(USER, WALLET, 100, 56).await,
            Err(LedgerError::Chain(ChainError::MissingParams(_)))
        ));

        let ledger = ledger.with_lock_issuer(LockIssuer::new(
            Arc::new(LockAuthSigner::from_hex(KEY).unwrap()),
            CONTRACT,
            Arc::new(Unreachable),
        ));
        let err = ledger.issue_withdraw_lock(USER, WALLET, 100, 56).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap().withdrawal, 0);
    }
}
