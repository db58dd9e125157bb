// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use game_ledger::config::{init_tracing, LedgerConfig};
use game_ledger::state::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing();

    let config = LedgerConfig::from_env().expect("Invalid configuration");
    info!(
        data_dir = %config.data_dir.display(),
        default_chain_id = config.default_chain_id,
        "Starting game ledger"
    );

    let state = AppState::from_config(config).expect("Failed to initialize ledger");

    let shutdown = CancellationToken::new();
    let handles = state.spawn_background(&shutdown);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested, stopping background tasks");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }
    info!("Game ledger stopped");
}
