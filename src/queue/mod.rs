// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Reconciliation pipeline.
//!
//! ```text
//! report_tx_hash ──► ReconciliationQueue ──► ReconciliationWorker ──► mpsc ──► SettlementApplier
//!                          ▲                   (parse, retry)                   (apply_outcome)
//!                          └──────────── PendingSweeper (stale Pending rows) ◄──────────┘
//! ```
//!
//! The queue is durable (redb); the outcome channel between worker and
//! applier is bounded and lossy. Settlement rows stay Pending until applied,
//! so the sweeper can always find and re-enqueue work the channel dropped.

pub mod applier;
pub mod sweeper;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use crate::models::ReconciliationItem;
use crate::storage::{LedgerDatabase, QueueEntry, StorageResult};

pub use applier::SettlementApplier;
pub use sweeper::PendingSweeper;
pub use worker::{OutcomeSource, ReconciliationWorker, SettlementUpdate};

/// Delay before retrying an item whose parse failed.
pub const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Delay before re-checking a transaction that is not final yet.
pub const PENDING_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How long a claimed item stays invisible to other claims.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn after(delay: Duration) -> u64 {
    now_ms().saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
}

/// Durable FIFO of transactions awaiting reconciliation.
#[derive(Clone)]
pub struct ReconciliationQueue {
    db: Arc<LedgerDatabase>,
}

impl ReconciliationQueue {
    pub fn new(db: Arc<LedgerDatabase>) -> Self {
        Self { db }
    }

    /// Enqueue for immediate processing.
    pub fn enqueue(&self, item: &ReconciliationItem) -> StorageResult<()> {
        self.db.queue_push(item, now_ms(), false)?;
        Ok(())
    }

    /// Enqueue unless the same transaction is already queued or in flight.
    pub fn enqueue_unique(&self, item: &ReconciliationItem) -> StorageResult<bool> {
        self.db.queue_push(item, now_ms(), true)
    }

    pub fn enqueue_with_delay(&self, item: &ReconciliationItem, delay: Duration) -> StorageResult<()> {
        self.db.queue_push(item, after(delay), false)?;
        Ok(())
    }

    /// Claim the oldest due item, if any.
    pub fn claim(&self) -> StorageResult<Option<QueueEntry>> {
        let lease_ms = u64::try_from(DEFAULT_LEASE.as_millis()).unwrap_or(u64::MAX);
        self.db.queue_claim_due(now_ms(), lease_ms)
    }

    /// Drop a claimed item for good.
    pub fn ack(&self, entry: &QueueEntry) -> StorageResult<()> {
        self.db.queue_ack(entry)
    }

    /// Put a claimed item back, visible again after `delay`.
    pub fn retry_later(&self, entry: &QueueEntry, delay: Duration) -> StorageResult<()> {
        self.db.queue_reschedule(entry, after(delay))
    }

    pub fn len(&self) -> StorageResult<u64> {
        self.db.queue_len()
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SettlementOp;

    fn queue() -> (ReconciliationQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDatabase::open(&dir.path().join("q.redb")).unwrap();
        (ReconciliationQueue::new(Arc::new(db)), dir)
    }

    fn item() -> ReconciliationItem {
        ReconciliationItem {
            chain_id: 56,
            tx_hash: format!("0x{}", "11".repeat(32)),
            main_id: 1,
            ref_flow_id: 1,
            op: SettlementOp::Recharge,
        }
    }

    #[test]
    fn delayed_items_are_not_claimable_yet() {
        let (queue, _dir) = queue();
        queue.enqueue_with_delay(&item(), Duration::from_secs(3600)).unwrap();
        assert!(queue.claim().unwrap().is_none());
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn retry_later_keeps_item_queued() {
        let (queue, _dir) = queue();
        queue.enqueue(&item()).unwrap();
        let entry = queue.claim().unwrap().unwrap();
        queue.retry_later(&entry, PENDING_RETRY_DELAY).unwrap();
        assert!(queue.claim().unwrap().is_none());
        assert!(!queue.is_empty().unwrap());
    }

    #[test]
    fn enqueue_unique_skips_duplicates() {
        let (queue, _dir) = queue();
        assert!(queue.enqueue_unique(&item()).unwrap());
        assert!(!queue.enqueue_unique(&item()).unwrap());
        let entry = queue.claim().unwrap().unwrap();
        queue.ack(&entry).unwrap();
        assert!(queue.is_empty().unwrap());
    }
}
