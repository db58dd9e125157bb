// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded ledger database backed by redb.
//!
//! Records are stored as JSON bytes. Unique constraints are kept in index tables
//! that map a natural key to the owning row id; because only one write
//! transaction runs at a time, "check then insert" on an index inside a
//! [`LedgerTxn`] is atomic.

use std::path::Path;

use redb::{
    AccessGuard, Database, Key, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition,
    WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{StorageError, StorageResult};
use crate::models::{
    AccountBalance, GameInfo, GameSession, GameSetting, SettlementFlow, SettlementStatus, SpendFlow,
};

// =============================================================================
// Table Definitions
// =============================================================================

/// (main_id, asset_id) → AccountBalance.
const BALANCES: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("balances");

const SPEND_FLOWS: TableDefinition<u64, &[u8]> = TableDefinition::new("spend_flows");

const SETTLEMENT_FLOWS: TableDefinition<u64, &[u8]> = TableDefinition::new("settlement_flows");

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

const GAMES: TableDefinition<u64, &[u8]> = TableDefinition::new("games");

/// (game_id, setting code) → GameSetting.
const GAME_SETTINGS: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("game_settings");

/// Counter name → last issued id.
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// (main_id, session_id) → id of the session's Pending Freeze row.
pub(crate) const PENDING_FREEZE: TableDefinition<(u64, &str), u64> =
    TableDefinition::new("pending_freeze");

/// Freeze flow id → id of the Spend/Unfreeze row that resolved it.
pub(crate) const SPEND_SETTLED_BY: TableDefinition<u64, u64> =
    TableDefinition::new("spend_settled_by");

/// `main_id|client_id|external_id` → Freeze flow id.
pub(crate) const SPEND_EXTERNAL: TableDefinition<&str, u64> = TableDefinition::new("spend_external");

/// Lowercase tx hash → settlement flow id, across all users and chains.
pub(crate) const SETTLEMENT_TX: TableDefinition<&str, u64> = TableDefinition::new("settlement_tx");

/// main_id → Freeze settlement row while Pending or PendingWithdraw.
pub(crate) const ACTIVE_LOCK: TableDefinition<u64, u64> = TableDefinition::new("active_lock");

/// (main_id, game_id) → session id while the session is in Start.
const ACTIVE_SESSION: TableDefinition<(u64, u64), &str> = TableDefinition::new("active_session");

/// (main_id, flow id) for per-user listings, newest first by reverse scan.
const USER_SPEND: TableDefinition<(u64, u64), ()> = TableDefinition::new("user_spend");
const USER_SETTLEMENT: TableDefinition<(u64, u64), ()> = TableDefinition::new("user_settlement");
/// (main_id, sequence) → session id.
const USER_SESSIONS: TableDefinition<(u64, u64), &str> = TableDefinition::new("user_sessions");

const SPEND_FLOW_SEQ: &str = "spend_flow";
const SETTLEMENT_FLOW_SEQ: &str = "settlement_flow";
const SESSION_SEQ: &str = "session";

fn decode<T: DeserializeOwned>(raw: Option<AccessGuard<'_, &'static [u8]>>) -> StorageResult<Option<T>> {
    match raw {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

// =============================================================================
// LedgerDatabase
// =============================================================================

/// Embedded ACID ledger database.
pub struct LedgerDatabase {
    db: Database,
}

impl LedgerDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BALANCES)?;
            let _ = write_txn.open_table(SPEND_FLOWS)?;
            let _ = write_txn.open_table(SETTLEMENT_FLOWS)?;
            let _ = write_txn.open_table(SESSIONS)?;
            let _ = write_txn.open_table(GAMES)?;
            let _ = write_txn.open_table(GAME_SETTINGS)?;
            let _ = write_txn.open_table(COUNTERS)?;
            let _ = write_txn.open_table(PENDING_FREEZE)?;
            let _ = write_txn.open_table(SPEND_SETTLED_BY)?;
            let _ = write_txn.open_table(SPEND_EXTERNAL)?;
            let _ = write_txn.open_table(SETTLEMENT_TX)?;
            let _ = write_txn.open_table(ACTIVE_LOCK)?;
            let _ = write_txn.open_table(ACTIVE_SESSION)?;
            let _ = write_txn.open_table(USER_SPEND)?;
            let _ = write_txn.open_table(USER_SETTLEMENT)?;
            let _ = write_txn.open_table(USER_SESSIONS)?;
            super::queue_store::create_tables(&write_txn)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Start an exclusive write unit. Drop it to roll back.
    pub fn begin(&self) -> StorageResult<LedgerTxn> {
        Ok(LedgerTxn {
            txn: self.db.begin_write()?,
        })
    }

    pub(crate) fn raw(&self) -> &Database {
        &self.db
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> StorageResult<T>) -> StorageResult<T> {
        let read_txn = self.db.begin_read()?;
        f(&read_txn)
    }

    // =========================================================================
    // Point reads
    // =========================================================================

    pub fn get_balance(&self, main_id: u64, asset_id: u64) -> StorageResult<Option<AccountBalance>> {
        self.read(|txn| {
            let table = txn.open_table(BALANCES)?;
            let balance = decode(table.get((main_id, asset_id))?)?;
            Ok(balance)
        })
    }

    pub fn get_spend_flow(&self, id: u64) -> StorageResult<Option<SpendFlow>> {
        self.read(|txn| {
            let table = txn.open_table(SPEND_FLOWS)?;
            let flow = decode(table.get(id)?)?;
            Ok(flow)
        })
    }

    pub fn get_settlement_flow(&self, id: u64) -> StorageResult<Option<SettlementFlow>> {
        self.read(|txn| {
            let table = txn.open_table(SETTLEMENT_FLOWS)?;
            let flow = decode(table.get(id)?)?;
            Ok(flow)
        })
    }

    pub fn get_session(&self, session_id: &str) -> StorageResult<Option<GameSession>> {
        self.read(|txn| {
            let table = txn.open_table(SESSIONS)?;
            let session = decode(table.get(session_id)?)?;
            Ok(session)
        })
    }

    pub fn get_game(&self, game_id: u64) -> StorageResult<Option<GameInfo>> {
        self.read(|txn| {
            let table = txn.open_table(GAMES)?;
            let game = decode(table.get(game_id)?)?;
            Ok(game)
        })
    }

    pub fn get_setting(&self, game_id: u64, code: &str) -> StorageResult<Option<GameSetting>> {
        self.read(|txn| {
            let table = txn.open_table(GAME_SETTINGS)?;
            let setting = decode(table.get((game_id, code))?)?;
            Ok(setting)
        })
    }

    /// Session currently in Start for (user, game), if any.
    pub fn active_session(&self, main_id: u64, game_id: u64) -> StorageResult<Option<String>> {
        self.read(|txn| {
            let table = txn.open_table(ACTIVE_SESSION)?;
            let id = table.get((main_id, game_id))?.map(|v| v.value().to_string());
            Ok(id)
        })
    }

    /// Pending Freeze row of a session, if any.
    pub fn pending_freeze(&self, main_id: u64, session_id: &str) -> StorageResult<Option<u64>> {
        self.read(|txn| {
            let table = txn.open_table(PENDING_FREEZE)?;
            let id = table.get((main_id, session_id))?.map(|v| v.value());
            Ok(id)
        })
    }

    /// Freeze settlement row currently reserving funds for a user, if any.
    pub fn active_lock(&self, main_id: u64) -> StorageResult<Option<u64>> {
        self.read(|txn| {
            let table = txn.open_table(ACTIVE_LOCK)?;
            let id = table.get(main_id)?.map(|v| v.value());
            Ok(id)
        })
    }

    // =========================================================================
    // Listings (newest first)
    // =========================================================================

    pub fn list_spend_flows(&self, main_id: u64) -> StorageResult<Vec<SpendFlow>> {
        self.read(|txn| {
            let index = txn.open_table(USER_SPEND)?;
            let flows = txn.open_table(SPEND_FLOWS)?;
            let mut out = Vec::new();
            for entry in index.range((main_id, 0u64)..=(main_id, u64::MAX))?.rev() {
                let (key, _) = entry?;
                let (_, id) = key.value();
                if let Some(flow) = decode(flows.get(id)?)? {
                    out.push(flow);
                }
            }
            Ok(out)
        })
    }

    pub fn list_settlement_flows(&self, main_id: u64) -> StorageResult<Vec<SettlementFlow>> {
        self.read(|txn| {
            let index = txn.open_table(USER_SETTLEMENT)?;
            let flows = txn.open_table(SETTLEMENT_FLOWS)?;
            let mut out = Vec::new();
            for entry in index.range((main_id, 0u64)..=(main_id, u64::MAX))?.rev() {
                let (key, _) = entry?;
                let (_, id) = key.value();
                if let Some(flow) = decode(flows.get(id)?)? {
                    out.push(flow);
                }
            }
            Ok(out)
        })
    }

    pub fn list_sessions(&self, main_id: u64) -> StorageResult<Vec<GameSession>> {
        self.read(|txn| {
            let index = txn.open_table(USER_SESSIONS)?;
            let sessions = txn.open_table(SESSIONS)?;
            let mut out = Vec::new();
            for entry in index.range((main_id, 0u64)..=(main_id, u64::MAX))?.rev() {
                let (_, session_id) = entry?;
                if let Some(session) = decode(sessions.get(session_id.value())?)? {
                    out.push(session);
                }
            }
            Ok(out)
        })
    }

    /// Pending settlement rows that already carry a transaction hash.
    pub fn pending_settlements(&self) -> StorageResult<Vec<SettlementFlow>> {
        self.read(|txn| {
            let table = txn.open_table(SETTLEMENT_FLOWS)?;
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let flow: SettlementFlow = serde_json::from_slice(value.value())?;
                if flow.status == SettlementStatus::Pending && !flow.tx_hash.is_empty() {
                    out.push(flow);
                }
            }
            Ok(out)
        })
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Insert or replace a catalog entry.
    pub fn upsert_game(&self, game: &GameInfo) -> StorageResult<()> {
        let json = encode(game)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(GAMES)?;
            table.insert(game.game_id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Insert or replace a per-game price setting.
    pub fn upsert_setting(&self, setting: &GameSetting) -> StorageResult<()> {
        let json = encode(setting)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(GAME_SETTINGS)?;
            table.insert((setting.game_id, setting.code.as_str()), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// LedgerTxn
// =============================================================================

/// One exclusive, atomic unit of ledger work.
pub struct LedgerTxn {
    txn: WriteTransaction,
}

impl LedgerTxn {
    pub fn commit(self) -> StorageResult<()> {
        self.txn.commit()?;
        Ok(())
    }

    fn next_id(&self, counter: &str) -> StorageResult<u64> {
        let mut table = self.txn.open_table(COUNTERS)?;
        let current = table.get(counter)?.map(|v| v.value()).unwrap_or(0);
        let next = current + 1;
        table.insert(counter, next)?;
        Ok(next)
    }

    // =========================================================================
    // Balance
    // =========================================================================

    /// Read a balance row under the transaction's exclusive lock.
    pub fn lock_balance(&self, main_id: u64, asset_id: u64) -> StorageResult<Option<AccountBalance>> {
        let table = self.txn.open_table(BALANCES)?;
        let balance = decode(table.get((main_id, asset_id))?)?;
        Ok(balance)
    }

    /// Like [`Self::lock_balance`], yielding an unsaved zero row when absent.
    pub fn lock_balance_or_zero(&self, main_id: u64, asset_id: u64) -> StorageResult<AccountBalance> {
        Ok(self
            .lock_balance(main_id, asset_id)?
            .unwrap_or_else(|| AccountBalance::zero(main_id, asset_id)))
    }

    pub fn save_balance(&self, balance: &mut AccountBalance) -> StorageResult<()> {
        balance.update_time = chrono::Utc::now();
        let json = encode(balance)?;
        let mut table = self.txn.open_table(BALANCES)?;
        table.insert((balance.main_id, balance.asset_id), json.as_slice())?;
        Ok(())
    }

    // =========================================================================
    // Spend ledger
    // =========================================================================

    pub fn get_spend_flow(&self, id: u64) -> StorageResult<Option<SpendFlow>> {
        let table = self.txn.open_table(SPEND_FLOWS)?;
        let flow = decode(table.get(id)?)?;
        Ok(flow)
    }

    /// Assign an id to a new row and store it.
    pub fn insert_spend_flow(&self, flow: &mut SpendFlow) -> StorageResult<u64> {
        flow.id = self.next_id(SPEND_FLOW_SEQ)?;
        self.update_spend_flow(flow)?;
        let mut index = self.txn.open_table(USER_SPEND)?;
        index.insert((flow.main_id, flow.id), ())?;
        Ok(flow.id)
    }

    pub fn update_spend_flow(&self, flow: &SpendFlow) -> StorageResult<()> {
        let json = encode(flow)?;
        let mut table = self.txn.open_table(SPEND_FLOWS)?;
        table.insert(flow.id, json.as_slice())?;
        Ok(())
    }

    // =========================================================================
    // Settlement ledger
    // =========================================================================

    pub fn get_settlement_flow(&self, id: u64) -> StorageResult<Option<SettlementFlow>> {
        let table = self.txn.open_table(SETTLEMENT_FLOWS)?;
        let flow = decode(table.get(id)?)?;
        Ok(flow)
    }

    pub fn require_settlement_flow(&self, id: u64) -> StorageResult<SettlementFlow> {
        self.get_settlement_flow(id)?
            .ok_or_else(|| StorageError::NotFound(format!("settlement flow {id}")))
    }

    pub fn insert_settlement_flow(&self, flow: &mut SettlementFlow) -> StorageResult<u64> {
        flow.id = self.next_id(SETTLEMENT_FLOW_SEQ)?;
        self.update_settlement_flow(flow)?;
        let mut index = self.txn.open_table(USER_SETTLEMENT)?;
        index.insert((flow.main_id, flow.id), ())?;
        Ok(flow.id)
    }

    pub fn update_settlement_flow(&self, flow: &SettlementFlow) -> StorageResult<()> {
        let json = encode(flow)?;
        let mut table = self.txn.open_table(SETTLEMENT_FLOWS)?;
        table.insert(flow.id, json.as_slice())?;
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn get_session(&self, session_id: &str) -> StorageResult<Option<GameSession>> {
        let table = self.txn.open_table(SESSIONS)?;
        let session = decode(table.get(session_id)?)?;
        Ok(session)
    }

    pub fn insert_session(&self, session: &GameSession) -> StorageResult<()> {
        self.update_session(session)?;
        let seq = self.next_id(SESSION_SEQ)?;
        let mut index = self.txn.open_table(USER_SESSIONS)?;
        index.insert((session.main_id, seq), session.session_id.as_str())?;
        Ok(())
    }

    pub fn update_session(&self, session: &GameSession) -> StorageResult<()> {
        let json = encode(session)?;
        let mut table = self.txn.open_table(SESSIONS)?;
        table.insert(session.session_id.as_str(), json.as_slice())?;
        Ok(())
    }

    pub fn active_session(&self, main_id: u64, game_id: u64) -> StorageResult<Option<String>> {
        let table = self.txn.open_table(ACTIVE_SESSION)?;
        let id = table.get((main_id, game_id))?.map(|v| v.value().to_string());
        Ok(id)
    }

    /// Claim the (user, game) Start slot; yields the current holder if taken.
    pub fn claim_active_session(
        &self,
        main_id: u64,
        game_id: u64,
        session_id: &str,
    ) -> StorageResult<Option<String>> {
        let mut table = self.txn.open_table(ACTIVE_SESSION)?;
        let existing = table.get((main_id, game_id))?.map(|v| v.value().to_string());
        if existing.is_some() {
            return Ok(existing);
        }
        table.insert((main_id, game_id), session_id)?;
        Ok(None)
    }

    pub fn release_active_session(&self, main_id: u64, game_id: u64) -> StorageResult<()> {
        let mut table = self.txn.open_table(ACTIVE_SESSION)?;
        table.remove((main_id, game_id))?;
        Ok(())
    }

    // =========================================================================
    // Unique indexes
    // =========================================================================

    /// Look up a row id in a unique index.
    pub(crate) fn index_get<'k, K: Key + 'static>(
        &self,
        def: TableDefinition<K, u64>,
        key: &K::SelfType<'k>,
    ) -> StorageResult<Option<u64>> {
        let table = self.txn.open_table(def)?;
        let id = table.get(key)?.map(|v| v.value());
        Ok(id)
    }

    /// Insert into a unique index unless occupied; yields the current holder.
    pub(crate) fn index_claim<'k, K: Key + 'static>(
        &self,
        def: TableDefinition<K, u64>,
        key: &K::SelfType<'k>,
        id: u64,
    ) -> StorageResult<Option<u64>> {
        let mut table = self.txn.open_table(def)?;
        let existing = table.get(key)?.map(|v| v.value());
        if existing.is_some() {
            return Ok(existing);
        }
        table.insert(key, id)?;
        Ok(None)
    }

    pub(crate) fn index_release<'k, K: Key + 'static>(
        &self,
        def: TableDefinition<K, u64>,
        key: &K::SelfType<'k>,
    ) -> StorageResult<()> {
        let mut table = self.txn.open_table(def)?;
        table.remove(key)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
