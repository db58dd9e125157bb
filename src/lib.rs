// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Game Ledger - Balance Ledger & On-Chain Settlement Reconciliation
//!
//! This crate keeps per-user balances for paid game plays and bridges them to
//! an EVM custody contract (deposit, lock-for-withdraw, claim, cancel).
//!
//! ## Modules
//!
//! - `ledger` - Balance store, spend ledger, game sessions, withdrawal locks, settlement
//! - `chain` - EVM RPC client, transaction parser, EIP-712 permit signing
//! - `queue` - Durable reconciliation queue, worker, applier and stale sweep
//! - `storage` - Embedded redb database

pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod queue;
pub mod state;
pub mod storage;
