// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Consumer side of the outcome channel.
//!
//! Each [`SettlementUpdate`] is applied with [`Ledger::apply_outcome`].
//! Retryable failures (storage, unconfirmed paired lock) go back to the queue
//! with a delay; anything else is logged for manual handling.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SettlementUpdate, ERROR_RETRY_DELAY};
use crate::error::LedgerError;
use crate::ledger::Ledger;

pub struct SettlementApplier {
    ledger: Ledger,
    updates: mpsc::Receiver<SettlementUpdate>,
}

impl SettlementApplier {
    pub fn new(ledger: Ledger, updates: mpsc::Receiver<SettlementUpdate>) -> Self {
        Self { ledger, updates }
    }

    /// Apply updates until cancelled or every sender is gone.
    ///
    /// Updates already in the channel at cancellation are still applied.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Settlement applier starting");
        loop {
            tokio::select! {
                update = self.updates.recv() => match update {
                    Some(update) => self.apply(update),
                    None => {
                        info!("Settlement channel closed, applier stopping");
                        return;
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }

        self.updates.close();
        while let Ok(update) = self.updates.try_recv() {
            self.apply(update);
        }
        info!("Settlement applier shutting down");
    }

    fn apply(&self, update: SettlementUpdate) {
        let item = &update.item;
        match self.ledger.apply_outcome(item, &update.outcome) {
            Ok(status) => {
                debug!(
                    tx_hash = %item.tx_hash,
                    ref_flow_id = item.ref_flow_id,
                    status = ?status,
                    "Settlement update applied"
                );
            }
            Err(LedgerError::AlreadyProcessed(reason)) => {
                debug!(tx_hash = %item.tx_hash, reason = %reason, "Settlement already applied");
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    tx_hash = %item.tx_hash,
                    ref_flow_id = item.ref_flow_id,
                    error = %e,
                    "Settlement deferred, re-enqueueing"
                );
                if let Err(e) = self.ledger.queue().enqueue_with_delay(item, ERROR_RETRY_DELAY) {
                    error!(
                        tx_hash = %item.tx_hash,
                        error = %e,
                        "Re-enqueue failed; stale sweep will pick the row up"
                    );
                }
            }
            Err(e) => {
                error!(
                    tx_hash = %item.tx_hash,
                    main_id = item.main_id,
                    ref_flow_id = item.ref_flow_id,
                    op = %item.op,
                    error = %e,
                    "Settlement failed; needs manual handling"
                );
            }
        }
    }
}
