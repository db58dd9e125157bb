// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable tables behind the reconciliation queue.
//!
//! ## Table Layout
//!
//! - `queue`: `(ready_at_ms, seq)` → serialized ReconciliationItem. A forward
//!   range scan up to `(now, MAX)` yields due items oldest first.
//! - `queue_keys`: item dedupe key → its current `(ready_at_ms, seq)` position.
//! - `queue_meta`: sequence counter.
//!
//! A claimed item is not deleted: it is moved to `now + lease` so that a crash
//! between claim and acknowledgement makes it visible again.

use redb::{
    ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction,
};

use super::{LedgerDatabase, StorageResult};
use crate::models::ReconciliationItem;

const QUEUE: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("queue");

const QUEUE_KEYS: TableDefinition<&str, (u64, u64)> = TableDefinition::new("queue_keys");

const QUEUE_META: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");

const SEQ_KEY: &str = "seq";

pub(super) fn create_tables(write_txn: &WriteTransaction) -> StorageResult<()> {
    let _ = write_txn.open_table(QUEUE)?;
    let _ = write_txn.open_table(QUEUE_KEYS)?;
    let _ = write_txn.open_table(QUEUE_META)?;
    Ok(())
}

/// A queued item together with its current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub ready_at_ms: u64,
    pub seq: u64,
    pub item: ReconciliationItem,
}

fn next_seq(write_txn: &WriteTransaction) -> StorageResult<u64> {
    let mut meta = write_txn.open_table(QUEUE_META)?;
    let seq = meta.get(SEQ_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
    meta.insert(SEQ_KEY, seq)?;
    Ok(seq)
}

/// Insert `item` at `ready_at_ms` and point its dedupe key at the new slot.
fn place(
    write_txn: &WriteTransaction,
    item: &ReconciliationItem,
    ready_at_ms: u64,
) -> StorageResult<(u64, u64)> {
    let json = serde_json::to_vec(item)?;
    let seq = next_seq(write_txn)?;
    let slot = (ready_at_ms, seq);
    {
        let mut queue = write_txn.open_table(QUEUE)?;
        queue.insert(slot, json.as_slice())?;
    }
    let mut keys = write_txn.open_table(QUEUE_KEYS)?;
    keys.insert(item.queue_key().as_str(), slot)?;
    Ok(slot)
}

/// Remove the slot; drop the dedupe key only if it still points at this slot.
fn remove_slot(write_txn: &WriteTransaction, item: &ReconciliationItem, slot: (u64, u64)) -> StorageResult<()> {
    {
        let mut queue = write_txn.open_table(QUEUE)?;
        queue.remove(slot)?;
    }
    let key = item.queue_key();
    let mut keys = write_txn.open_table(QUEUE_KEYS)?;
    let current = keys.get(key.as_str())?.map(|v| v.value());
    if current == Some(slot) {
        keys.remove(key.as_str())?;
    }
    Ok(())
}

impl LedgerDatabase {
    /// Append an item that becomes visible at `ready_at_ms`.
    ///
    /// With `unique`, nothing is written when an item with the same key is
    /// already queued (or leased) and `false` is returned.
    pub fn queue_push(
        &self,
        item: &ReconciliationItem,
        ready_at_ms: u64,
        unique: bool,
    ) -> StorageResult<bool> {
        let write_txn = self.raw().begin_write()?;
        if unique {
            let keys = write_txn.open_table(QUEUE_KEYS)?;
            let present = keys.get(item.queue_key().as_str())?.is_some();
            if present {
                return Ok(false);
            }
        }
        place(&write_txn, item, ready_at_ms)?;
        write_txn.commit()?;
        Ok(true)
    }

    /// Take the oldest item due at `now_ms`, leasing it until `now_ms + lease_ms`.
    pub fn queue_claim_due(&self, now_ms: u64, lease_ms: u64) -> StorageResult<Option<QueueEntry>> {
        let write_txn = self.raw().begin_write()?;
        let due = {
            let queue = write_txn.open_table(QUEUE)?;
            let mut range = queue.range(..=(now_ms, u64::MAX))?;
            let next = range.next();
            let due = match next {
                Some(entry) => {
                    let (key, value) = entry?;
                    let item: ReconciliationItem = serde_json::from_slice(value.value())?;
                    Some((key.value(), item))
                }
                None => None,
            };
            due
        };
        let Some((slot, item)) = due else {
            return Ok(None);
        };

        remove_slot(&write_txn, &item, slot)?;
        let (ready_at_ms, seq) = place(&write_txn, &item, now_ms.saturating_add(lease_ms))?;
        write_txn.commit()?;
        Ok(Some(QueueEntry {
            ready_at_ms,
            seq,
            item,
        }))
    }

    /// Finish a claimed item.
    pub fn queue_ack(&self, entry: &QueueEntry) -> StorageResult<()> {
        let write_txn = self.raw().begin_write()?;
        remove_slot(&write_txn, &entry.item, (entry.ready_at_ms, entry.seq))?;
        write_txn.commit()?;
        Ok(())
    }

    /// Move a claimed item to a later slot.
    pub fn queue_reschedule(&self, entry: &QueueEntry, ready_at_ms: u64) -> StorageResult<()> {
        let write_txn = self.raw().begin_write()?;
        remove_slot(&write_txn, &entry.item, (entry.ready_at_ms, entry.seq))?;
        place(&write_txn, &entry.item, ready_at_ms)?;
        write_txn.commit()?;
        Ok(())
    }

    pub fn queue_len(&self) -> StorageResult<u64> {
        let read_txn = self.raw().begin_read()?;
        let queue = read_txn.open_table(QUEUE)?;
        Ok(queue.len()?)
    }
}
