// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Storage
//!
//! Durable state lives in a single embedded redb database (pure Rust, ACID).
//!
//! ## Locking Model
//!
//! redb allows one write transaction at a time. A [`LedgerTxn`] is therefore the
//! exclusive lock for every balance row it touches: a balance is read with
//! [`LedgerTxn::lock_balance`], ledger rows are written next to it, and
//! [`LedgerTxn::commit`] publishes everything at once. Dropping a `LedgerTxn`
//! without committing rolls the whole unit back.
//!
//! Write transactions are never held across an `.await`.
//!
//! ## Storage Layout
//!
//! ```text
//! ledger.redb
//!   balances            (main_id, asset_id) -> AccountBalance
//!   spend_flows         id -> SpendFlow
//!   settlement_flows    id -> SettlementFlow
//!   sessions            session_id -> GameSession
//!   games / settings    catalog consulted by the session engine
//!   counters            name -> last issued id
//!   unique indexes      pending_freeze, spend_settled_by, spend_external,
//!                       settlement_tx, active_lock, active_session
//!   user indexes        (main_id, id) for newest-first listings
//!   queue / queue_keys  durable reconciliation queue
//! ```

pub mod ledger_db;
pub mod queue_store;

pub use ledger_db::{LedgerDatabase, LedgerTxn};
pub use queue_store::QueueEntry;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
