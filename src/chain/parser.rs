// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Custody Transaction Parser
//!
//! Turns a `(chain_id, tx_hash, op)` triple into a [`ParsedTxOutcome`].
//!
//! ## Strategy
//!
//! 1. Fetch the transaction. Unknown or unmined hashes are `pending`, never an
//!    error, so callers can tell "not final yet" from "failed".
//! 2. Fetch the receipt; its status flag decides `success` / `failed`.
//! 3. Read amount and counterparties from the operation's event log. Each
//!    operation has exactly one event in the decode table below.
//! 4. When no matching log is present, fall back to the call's input
//!    arguments.

use std::str::FromStr;
use std::sync::Arc;

use alloy::{
    primitives::{Address, Log, B256, U256},
    sol_types::{SolCall, SolEvent},
};

use super::client::{ChainClient, ChainError, TxSnapshot};
use super::topup::ITopupLogic;
use crate::models::{ParsedTxOutcome, SettlementOp, TxOutcomeStatus};

/// Fields recoverable from a custody event or call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Decoded {
    user: Option<Address>,
    lock_id: Option<B256>,
    to: Option<Address>,
    amount: Option<U256>,
}

/// Decode the event that `op` emits, if `log` is that event.
fn decode_event(op: SettlementOp, log: &Log) -> Option<Decoded> {
    match op {
        SettlementOp::Recharge => {
            let ev = ITopupLogic::Deposited::decode_log(log).ok()?;
            Some(Decoded {
                user: Some(ev.data.user),
                amount: Some(ev.data.amount),
                ..Default::default()
            })
        }
        SettlementOp::Freeze => {
            let ev = ITopupLogic::LockOpened::decode_log(log).ok()?;
            Some(Decoded {
                user: Some(ev.data.user),
                lock_id: Some(ev.data.lockId),
                amount: Some(ev.data.amount),
                ..Default::default()
            })
        }
        SettlementOp::Withdraw => {
            let ev = ITopupLogic::LockClaimed::decode_log(log).ok()?;
            Some(Decoded {
                user: Some(ev.data.user),
                lock_id: Some(ev.data.lockId),
                to: Some(ev.data.to),
                amount: Some(ev.data.amount),
            })
        }
        SettlementOp::Unfreeze => {
            let ev = ITopupLogic::LockCanceled::decode_log(log).ok()?;
            Some(Decoded {
                user: Some(ev.data.user),
                lock_id: Some(ev.data.lockId),
                amount: Some(ev.data.amount),
                ..Default::default()
            })
        }
    }
}

/// Best-effort decode of the call `op` is expected to make.
fn decode_call(op: SettlementOp, input: &[u8]) -> Option<Decoded> {
    match op {
        SettlementOp::Recharge => {
            let call = ITopupLogic::depositCall::abi_decode(input).ok()?;
            Some(Decoded {
                amount: Some(call.amount),
                ..Default::default()
            })
        }
        SettlementOp::Freeze => {
            let call = ITopupLogic::openLockCall::abi_decode(input).ok()?;
            Some(Decoded {
                lock_id: Some(call.lockId),
                amount: Some(call.amount),
                ..Default::default()
            })
        }
        SettlementOp::Withdraw => {
            let call = ITopupLogic::claimLockedCall::abi_decode(input).ok()?;
            Some(Decoded {
                lock_id: Some(call.lockId),
                to: Some(call.to),
                ..Default::default()
            })
        }
        SettlementOp::Unfreeze => {
            let call = ITopupLogic::cancelLockCall::abi_decode(input).ok()?;
            Some(Decoded {
                lock_id: Some(call.lockId),
                ..Default::default()
            })
        }
    }
}

/// Normalize a fetched transaction for `op`.
pub fn decode_outcome(op: SettlementOp, snapshot: Option<&TxSnapshot>) -> ParsedTxOutcome {
    let Some(tx) = snapshot else {
        return ParsedTxOutcome::pending();
    };

    let mut outcome = ParsedTxOutcome {
        from_addr: Some(tx.from),
        to_addr: tx.to,
        ..ParsedTxOutcome::pending()
    };

    let call = decode_call(op, &tx.input);
    if let Some(call) = &call {
        outcome.amount = call.amount;
        outcome.lock_id = call.lock_id;
        if call.to.is_some() {
            outcome.to_addr = call.to;
        }
    }

    let Some(receipt) = &tx.receipt else {
        return outcome;
    };
    outcome.status = if receipt.success {
        TxOutcomeStatus::Success
    } else {
        TxOutcomeStatus::Failed
    };
    outcome.block_height = receipt.block_number;
    outcome.block_time = receipt.block_time;

    let event = receipt
        .logs
        .iter()
        .find_map(|log| decode_event(op, log).map(|d| (log.address, d)));
    if let Some((contract, event)) = event {
        outcome.contract = Some(contract);
        outcome.user_addr = event.user;
        if event.amount.is_some() {
            outcome.amount = event.amount;
        }
        if event.lock_id.is_some() {
            outcome.lock_id = event.lock_id;
        }
        if event.to.is_some() {
            outcome.to_addr = event.to;
        }
    }
    outcome
}

/// Validate and parse a `0x`-prefixed 32-byte transaction hash.
pub fn parse_tx_hash(raw: &str) -> Result<B256, ChainError> {
    let raw = raw.trim();
    let well_formed = raw.len() == 66
        && raw.starts_with("0x")
        && raw[2..].bytes().all(|b| b.is_ascii_hexdigit());
    if !well_formed {
        return Err(ChainError::InvalidTxHash(raw.to_string()));
    }
    B256::from_str(raw).map_err(|e| ChainError::InvalidTxHash(e.to_string()))
}

/// Chain-backed parser used by the reconciliation worker.
pub struct TxParser {
    client: Arc<ChainClient>,
}

impl TxParser {
    pub fn new(client: Arc<ChainClient>) -> Self {
        Self { client }
    }

    /// Resolve the current on-chain state of `tx_hash` for `op`.
    pub async fn parse(
        &self,
        chain_id: u64,
        tx_hash: &str,
        op: SettlementOp,
    ) -> Result<ParsedTxOutcome, ChainError> {
        let hash = parse_tx_hash(tx_hash)?;
        let snapshot = self.client.fetch_tx(chain_id, hash).await?;
        let outcome = decode_outcome(op, snapshot.as_ref());
        tracing::debug!(
            chain_id,
            tx_hash = %hash,
            op = %op,
            status = ?outcome.status,
            "Parsed custody transaction"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::ReceiptSnapshot;
    use alloy::primitives::Bytes;

    const CONTRACT: Address = Address::repeat_byte(0xcc);
    const USER: Address = Address::repeat_byte(0x0a);
    const OTHER: Address = Address::repeat_byte(0x0b);

    fn log_of<E: SolEvent>(event: &E) -> Log {
        Log {
            address: CONTRACT,
            data: event.encode_log_data(),
        }
    }

    fn mined(input: Vec<u8>, success: bool, logs: Vec<Log>) -> TxSnapshot {
        TxSnapshot {
            from: USER,
            to: Some(CONTRACT),
            input: Bytes::from(input),
            receipt: Some(ReceiptSnapshot {
                success,
                block_number: 1234,
                block_time: None,
                logs,
            }),
        }
    }

    #[test]
    fn unknown_transaction_is_pending() {
        let outcome = decode_outcome(SettlementOp::Recharge, None);
        assert_eq!(outcome.status, TxOutcomeStatus::Pending);
        assert!(outcome.amount.is_none());
    }

    #[test]
    fn unmined_transaction_is_pending_with_call_amount() {
        let input = ITopupLogic::depositCall { amount: U256::from(7u64) }.abi_encode();
        let tx = TxSnapshot {
            from: USER,
            to: Some(CONTRACT),
            input: input.into(),
            receipt: None,
        };
        let outcome = decode_outcome(SettlementOp::Recharge, Some(&tx));
        assert_eq!(outcome.status, TxOutcomeStatus::Pending);
        assert_eq!(outcome.amount, Some(U256::from(7u64)));
    }

    #[test]
    fn deposit_prefers_event_amount() {
        let input = ITopupLogic::depositCall { amount: U256::from(1u64) }.abi_encode();
        let event = ITopupLogic::Deposited {
            user: USER,
            amount: U256::from(1_000_000u64),
        };
        let outcome = decode_outcome(SettlementOp::Recharge, Some(&mined(input, true, vec![log_of(&event)])));
        assert_eq!(outcome.status, TxOutcomeStatus::Success);
        assert_eq!(outcome.amount, Some(U256::from(1_000_000u64)));
        assert_eq!(outcome.user_addr, Some(USER));
        assert_eq!(outcome.contract, Some(CONTRACT));
        assert_eq!(outcome.block_height, 1234);
    }

    #[test]
    fn claim_reads_recipient_and_lock_from_event() {
        let lock_id = B256::repeat_byte(0x77);
        let input = ITopupLogic::claimLockedCall { lockId: lock_id, to: OTHER }.abi_encode();
        let event = ITopupLogic::LockClaimed {
            user: USER,
            lockId: lock_id,
            to: OTHER,
            amount: U256::from(500_000u64),
        };
        let outcome = decode_outcome(SettlementOp::Withdraw, Some(&mined(input, true, vec![log_of(&event)])));
        assert_eq!(outcome.lock_id, Some(lock_id));
        assert_eq!(outcome.to_addr, Some(OTHER));
        assert_eq!(outcome.from_addr, Some(USER));
        assert_eq!(outcome.amount, Some(U256::from(500_000u64)));
    }

    #[test]
    fn falls_back_to_call_input_without_matching_log() {
        let lock_id = B256::repeat_byte(0x42);
        let input = ITopupLogic::openLockCall {
            lockId: lock_id,
            amount: U256::from(300u64),
            expiry: 1,
            nonce: U256::from(9u64),
            signature: Bytes::from(vec![0u8; 65]),
        }
        .abi_encode();
        // A log of a different event is ignored
        let unrelated = ITopupLogic::Deposited {
            user: USER,
            amount: U256::from(1u64),
        };
        let outcome = decode_outcome(SettlementOp::Freeze, Some(&mined(input, true, vec![log_of(&unrelated)])));
        assert_eq!(outcome.status, TxOutcomeStatus::Success);
        assert_eq!(outcome.lock_id, Some(lock_id));
        assert_eq!(outcome.amount, Some(U256::from(300u64)));
        assert!(outcome.contract.is_none());
    }

    #[test]
    fn reverted_receipt_is_failed() {
        let input = ITopupLogic::cancelLockCall { lockId: B256::repeat_byte(1) }.abi_encode();
        let outcome = decode_outcome(SettlementOp::Unfreeze, Some(&mined(input, false, vec![])));
        assert_eq!(outcome.status, TxOutcomeStatus::Failed);
        assert_eq!(outcome.lock_id, Some(B256::repeat_byte(1)));
    }

    #[test]
    fn cancel_event_decodes_indexed_topics() {
        let event = ITopupLogic::LockCanceled {
            user: USER,
            lockId: B256::repeat_byte(9),
            amount: U256::from(55u64),
        };
        let log = log_of(&event);
        assert_eq!(log.data.topics().len(), 3);
        let decoded = decode_event(SettlementOp::Unfreeze, &log).unwrap();
        assert_eq!(decoded.user, Some(USER));
        assert_eq!(decoded.lock_id, Some(B256::repeat_byte(9)));
        assert_eq!(decoded.amount, Some(U256::from(55u64)));
        // The same log is not a claim
        assert!(decode_event(SettlementOp::Withdraw, &log).is_none());
    }

    #[test]
    fn tx_hash_format_is_enforced() {
        let good = format!("0x{}", "ab".repeat(32));
        assert!(parse_tx_hash(&good).is_ok());
        assert!(parse_tx_hash(&good[2..]).is_err());
        assert!(parse_tx_hash("0x1234").is_err());
        assert!(parse_tx_hash(&format!("0x{}", "zz".repeat(32))).is_err());
    }
}
