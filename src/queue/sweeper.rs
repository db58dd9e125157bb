// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Stale Pending Sweeper
//!
//! Background task that makes the settlement ledger, not the outcome channel,
//! the source of truth for outstanding work. Every `interval` it re-enqueues
//! Pending settlement rows that carry a tx hash and have not changed for
//! `stale_after`. Items already queued or in flight are skipped.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ledger::Ledger;

pub struct PendingSweeper {
    ledger: Ledger,
    interval: Duration,
    stale_after: Duration,
}

impl PendingSweeper {
    pub fn new(ledger: Ledger, interval: Duration, stale_after: Duration) -> Self {
        Self {
            ledger,
            interval,
            stale_after,
        }
    }

    /// Run sweeps until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Pending sweeper starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Pending sweeper shutting down");
                    return;
                }
            }

            match self.ledger.sweep_stale_pending(self.stale_after) {
                Ok(0) => {}
                Ok(count) => info!(count, "Re-enqueued stale pending settlements"),
                Err(e) => warn!(error = %e, "Pending sweep failed, will retry"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ledger::TxReport;
    use crate::models::SettlementOp;
    use crate::queue::ReconciliationQueue;
    use crate::storage::LedgerDatabase;

    #[tokio::test]
    async fn sweeper_requeues_dropped_work() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LedgerDatabase::open(&dir.path().join("s.redb")).unwrap());
        let ledger = Ledger::new(db.clone(), ReconciliationQueue::new(db));
        let tx_hash = alloy::hex::encode_prefixed([0x5a; 32]);
        ledger
            .report_tx_hash(TxReport {
                main_id: 1,
                op: SettlementOp::Recharge,
                chain_id: 56,
                tx_hash: &tx_hash,
                ref_flow_id: None,
                amount: None,
            })
            .unwrap();
        // Simulate an update lost between worker and applier
        let entry = ledger.queue().claim().unwrap().unwrap();
        ledger.queue().ack(&entry).unwrap();

        let shutdown = CancellationToken::new();
        let sweeper = PendingSweeper::new(ledger.clone(), Duration::from_millis(10), Duration::ZERO);
        let handle = tokio::spawn(sweeper.run(shutdown.clone()));

        let mut requeued = false;
        for _ in 0..200 {
            if !ledger.queue().is_empty().unwrap() {
                requeued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
        assert!(requeued);
        assert_eq!(ledger.queue().len().unwrap(), 1);
    }
}
