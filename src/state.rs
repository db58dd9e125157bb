// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::{ChainClient, ChainRegistry, LockAuthSigner, TxParser};
use crate::config::LedgerConfig;
use crate::error::LedgerResult;
use crate::ledger::{Ledger, LockIssuer};
use crate::queue::{PendingSweeper, ReconciliationQueue, ReconciliationWorker, SettlementApplier};
use crate::storage::LedgerDatabase;

/// Everything the service shares between callers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LedgerConfig>,
    pub db: Arc<LedgerDatabase>,
    pub chain: Arc<ChainClient>,
    pub queue: ReconciliationQueue,
    pub ledger: Ledger,
}

impl AppState {
    /// Open the database and wire the ledger to the chain client.
    ///
    /// Withdrawal locks are only enabled when both a signing key and the
    /// custody contract are configured.
    pub fn from_config(config: LedgerConfig) -> LedgerResult<Self> {
        let db = Arc::new(LedgerDatabase::open(&config.db_path())?);
        let registry = ChainRegistry::new(config.default_chain_id, &config.rpc_overrides)?;
        let chain = Arc::new(ChainClient::new(registry, config.rpc_timeout));
        let queue = ReconciliationQueue::new(db.clone());

        let mut ledger = Ledger::new(db.clone(), queue.clone());
        match (&config.signing_key, config.topup_contract) {
            (Some(source), Some(contract)) => {
                let signer = Arc::new(LockAuthSigner::from_source(source)?);
                info!(signer = %signer.address(), %contract, "Withdrawal lock signer loaded");
                ledger = ledger.with_lock_issuer(LockIssuer::new(signer, contract, chain.clone()));
            }
            (None, Some(contract)) => {
                warn!(%contract, "No withdrawal signing key configured, locks disabled");
                ledger = ledger.with_custody_contract(contract);
            }
            (Some(_), None) => warn!("Signing key set without custody contract, locks disabled"),
            (None, None) => warn!("No custody contract configured, locks disabled"),
        }

        Ok(Self {
            config: Arc::new(config),
            db,
            chain,
            queue,
            ledger,
        })
    }

    /// Spawn the reconciliation worker, the settlement applier and the stale
    /// pending sweeper. All of them stop when `shutdown` is cancelled.
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel(self.config.settlement_channel_capacity);

        let worker = ReconciliationWorker::new(self.queue.clone(), TxParser::new(self.chain.clone()), tx);
        let applier = SettlementApplier::new(self.ledger.clone(), rx);
        let sweeper = PendingSweeper::new(
            self.ledger.clone(),
            self.config.pending_sweep_interval,
            self.config.pending_stale_after,
        );

        vec![
            tokio::spawn(worker.run(shutdown.clone())),
            tokio::spawn(applier.run(shutdown.clone())),
            tokio::spawn(sweeper.run(shutdown.clone())),
        ]
    }
}
