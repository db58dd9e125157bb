// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Reconciliation Worker
//!
//! The single consumer of the reconciliation queue.
//!
//! ## Strategy
//!
//! For each due item the worker asks an [`OutcomeSource`] for the
//! transaction's current outcome:
//! 1. Error: the item is retried after [`ERROR_RETRY_DELAY`].
//! 2. Not final yet: the item is retried after [`PENDING_RETRY_DELAY`].
//! 3. Success or failure: the outcome is handed to the settlement applier over
//!    a bounded channel and the item is acknowledged. If the channel is full
//!    the update is dropped with a warning; the settlement row stays Pending
//!    and the stale sweep picks it up again.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`. Cancellation is checked between
//! items, so an item being processed is always acknowledged or rescheduled.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ReconciliationQueue, ERROR_RETRY_DELAY, PENDING_RETRY_DELAY};
use crate::chain::{ChainError, TxParser};
use crate::models::{ParsedTxOutcome, ReconciliationItem};
use crate::storage::StorageResult;

/// How long to wait when the queue has nothing due.
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves the current on-chain outcome of a queued transaction.
#[async_trait]
pub trait OutcomeSource: Send + Sync {
    async fn resolve(&self, item: &ReconciliationItem) -> Result<ParsedTxOutcome, ChainError>;
}

#[async_trait]
impl OutcomeSource for TxParser {
    async fn resolve(&self, item: &ReconciliationItem) -> Result<ParsedTxOutcome, ChainError> {
        self.parse(item.chain_id, &item.tx_hash, item.op).await
    }
}

/// A final outcome on its way to the settlement applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementUpdate {
    pub item: ReconciliationItem,
    pub outcome: ParsedTxOutcome,
}

pub struct ReconciliationWorker<S> {
    queue: ReconciliationQueue,
    source: S,
    updates: mpsc::Sender<SettlementUpdate>,
    idle_interval: Duration,
}

impl<S: OutcomeSource> ReconciliationWorker<S> {
    pub fn new(queue: ReconciliationQueue, source: S, updates: mpsc::Sender<SettlementUpdate>) -> Self {
        Self {
            queue,
            source,
            updates,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    /// Drain the queue until the cancellation token is triggered.
    ///
    /// Takes `self` by value, so a worker can only be started once:
    /// ```rust,ignore
    /// tokio::spawn(worker.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            idle_ms = self.idle_interval.as_millis() as u64,
            "Reconciliation worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Reconciliation worker shutting down");
                return;
            }

            let pause = match self.step().await {
                Ok(true) => None,
                Ok(false) => Some(self.idle_interval),
                Err(e) => {
                    warn!(error = %e, "Reconciliation step failed, will retry");
                    Some(ERROR_RETRY_DELAY)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {},
                    _ = shutdown.cancelled() => {
                        info!("Reconciliation worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Process at most one due item. `Ok(false)` means nothing was due.
    pub(crate) async fn step(&self) -> StorageResult<bool> {
        let Some(entry) = self.queue.claim()? else {
            return Ok(false);
        };
        let item = &entry.item;

        let outcome = match self.source.resolve(item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    tx_hash = %item.tx_hash,
                    op = %item.op,
                    chain_id = item.chain_id,
                    error = %e,
                    "Transaction parse failed, retrying"
                );
                self.queue.retry_later(&entry, ERROR_RETRY_DELAY)?;
                return Ok(true);
            }
        };

        if !outcome.is_final() {
            debug!(tx_hash = %item.tx_hash, op = %item.op, "Transaction not final yet");
            self.queue.retry_later(&entry, PENDING_RETRY_DELAY)?;
            return Ok(true);
        }

        let update = SettlementUpdate {
            item: item.clone(),
            outcome,
        };
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                warn!(
                    tx_hash = %update.item.tx_hash,
                    main_id = update.item.main_id,
                    ref_flow_id = update.item.ref_flow_id,
                    op = %update.item.op,
                    status = ?update.outcome.status,
                    "Settlement channel full, update dropped; needs manual handling"
                );
            }
            Err(TrySendError::Closed(_)) => {
                warn!(tx_hash = %item.tx_hash, "Settlement channel closed, retrying later");
                self.queue.retry_later(&entry, ERROR_RETRY_DELAY)?;
                return Ok(true);
            }
        }
        self.queue.ack(&entry)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::models::{SettlementOp, TxOutcomeStatus};
    use crate::storage::LedgerDatabase;

    /// Plays back a fixed list of outcomes, then reports pending forever.
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<ParsedTxOutcome, ChainError>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<ParsedTxOutcome, ChainError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl OutcomeSource for ScriptedSource {
        async fn resolve(&self, _item: &ReconciliationItem) -> Result<ParsedTxOutcome, ChainError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ParsedTxOutcome::pending()))
        }
    }

    fn setup(
        script: Vec<Result<ParsedTxOutcome, ChainError>>,
        capacity: usize,
    ) -> (
        ReconciliationWorker<ScriptedSource>,
        mpsc::Receiver<SettlementUpdate>,
        ReconciliationQueue,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LedgerDatabase::open(&dir.path().join("w.redb")).unwrap());
        let queue = ReconciliationQueue::new(db);
        let (tx, rx) = mpsc::channel(capacity);
        let worker = ReconciliationWorker::new(queue.clone(), ScriptedSource::new(script), tx);
        (worker, rx, queue, dir)
    }

    fn item(byte: u8) -> ReconciliationItem {
        ReconciliationItem {
            chain_id: 56,
            tx_hash: alloy::hex::encode_prefixed([byte; 32]),
            main_id: 1,
            ref_flow_id: u64::from(byte),
            op: SettlementOp::Recharge,
        }
    }

    fn final_outcome() -> ParsedTxOutcome {
        ParsedTxOutcome {
            status: TxOutcomeStatus::Success,
            block_height: 7,
            ..ParsedTxOutcome::pending()
        }
    }

    #[tokio::test]
    async fn pending_outcome_is_rescheduled_without_update() {
        let (worker, mut rx, queue, _dir) = setup(vec![Ok(ParsedTxOutcome::pending())], 4);
        queue.enqueue(&item(1)).unwrap();

        assert!(worker.step().await.unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.len().unwrap(), 1);
        // Not due again until the retry delay has passed
        assert!(!worker.step().await.unwrap());
    }

    #[tokio::test]
    async fn parse_error_is_rescheduled() {
        let (worker, mut rx, queue, _dir) = setup(vec![Err(ChainError::Timeout(15))], 4);
        queue.enqueue(&item(2)).unwrap();

        assert!(worker.step().await.unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn final_outcome_is_forwarded_and_acked() {
        let (worker, mut rx, queue, _dir) = setup(vec![Ok(final_outcome())], 4);
        queue.enqueue(&item(3)).unwrap();

        assert!(worker.step().await.unwrap());
        let update = rx.try_recv().unwrap();
        assert_eq!(update.item, item(3));
        assert_eq!(update.outcome.block_height, 7);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn full_channel_drops_update() {
        let (worker, mut rx, queue, _dir) = setup(vec![Ok(final_outcome()), Ok(final_outcome())], 1);
        queue.enqueue(&item(4)).unwrap();
        queue.enqueue(&item(5)).unwrap();

        assert!(worker.step().await.unwrap());
        assert!(worker.step().await.unwrap());
        assert!(queue.is_empty().unwrap());
        assert_eq!(rx.try_recv().unwrap().item, item(4));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let (worker, mut rx, queue, _dir) = setup(vec![Ok(final_outcome())], 4);
        queue.enqueue(&item(6)).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            worker
                .with_idle_interval(Duration::from_millis(10))
                .run(shutdown.clone()),
        );

        let update = rx.recv().await.unwrap();
        assert_eq!(update.item, item(6));
        shutdown.cancel();
        handle.await.unwrap();
        assert!(queue.is_empty().unwrap());
    }
}
