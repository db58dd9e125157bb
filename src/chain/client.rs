// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Multi-chain JSON-RPC client.
//!
//! One erased alloy provider is kept per RPC endpoint and every call is
//! individually time-boxed.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::{
    consensus::Transaction as _,
    eips::BlockNumberOrTag,
    network::{ReceiptResponse as _, TransactionResponse as _},
    primitives::{Address, Bytes, Log, B256},
    providers::{DynProvider, Provider, ProviderBuilder},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::domain_cache::DomainSeparatorCache;
use super::topup::TopupContract;
use super::types::ChainRegistry;

/// Errors that can occur during chain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("No RPC configured for chain {0}")]
    UnknownChain(u64),

    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),

    #[error("Missing parameter: {0}")]
    MissingParams(&'static str),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC call timed out after {0}s")]
    Timeout(u64),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Signing error: {0}")]
    Sign(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

impl ChainError {
    /// Node unreachable or slow; the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Timeout(_))
    }
}

/// Mined part of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptSnapshot {
    pub success: bool,
    pub block_number: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub logs: Vec<Log>,
}

/// What the parser needs to know about one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSnapshot {
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    /// `None` while the transaction is not mined.
    pub receipt: Option<ReceiptSnapshot>,
}

/// Source of a custody contract's EIP-712 domain separator.
#[async_trait]
pub trait DomainSeparatorSource: Send + Sync {
    async fn domain_separator(&self, chain_id: u64, contract: Address) -> Result<B256, ChainError>;
}

/// Chain client shared by the parser and the lock issuer.
pub struct ChainClient {
    registry: ChainRegistry,
    providers: Mutex<HashMap<String, DynProvider>>,
    domain_cache: DomainSeparatorCache,
    timeout: Duration,
}

impl ChainClient {
    pub fn new(registry: ChainRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            providers: Mutex::new(HashMap::new()),
            domain_cache: DomainSeparatorCache::default(),
            timeout,
        }
    }

    /// Provider for `chain_id`, built on first use.
    fn provider(&self, chain_id: u64) -> Result<DynProvider, ChainError> {
        let resolved = self.registry.resolve(chain_id)?;
        if resolved.fallback {
            tracing::debug!(
                chain_id,
                fallback_chain_id = resolved.chain_id,
                "No RPC mapped for chain, using default"
            );
        }

        let mut providers = self
            .providers
            .lock()
            .map_err(|_| ChainError::Rpc("provider pool poisoned".to_string()))?;
        if let Some(provider) = providers.get(&resolved.rpc_url) {
            return Ok(provider.clone());
        }

        let url: url::Url = resolved
            .rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainError::InvalidRpcUrl(e.to_string()))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        providers.insert(resolved.rpc_url, provider.clone());
        Ok(provider)
    }

    async fn timed<F, T, E>(&self, call: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: Display,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|e| ChainError::Rpc(e.to_string())),
            Err(_) => Err(ChainError::Timeout(self.timeout.as_secs())),
        }
    }

    /// Fetch a transaction and, once mined, its receipt and block time.
    ///
    /// `Ok(None)` means the node does not know the hash (yet).
    pub async fn fetch_tx(&self, chain_id: u64, hash: B256) -> Result<Option<TxSnapshot>, ChainError> {
        let provider = self.provider(chain_id)?;

        let Some(tx) = self.timed(provider.get_transaction_by_hash(hash)).await? else {
            return Ok(None);
        };
        let mut snapshot = TxSnapshot {
            from: tx.from(),
            to: tx.to(),
            input: tx.input().clone(),
            receipt: None,
        };
        if tx.block_number.is_none() {
            return Ok(Some(snapshot));
        }

        let Some(receipt) = self.timed(provider.get_transaction_receipt(hash)).await? else {
            return Ok(Some(snapshot));
        };
        let block_number = receipt.block_number.unwrap_or_default();

        // Block time is informational; a failed lookup leaves it empty
        let block_time = match self
            .timed(provider.get_block_by_number(BlockNumberOrTag::Number(block_number)))
            .await
        {
            Ok(Some(block)) => DateTime::from_timestamp(block.header.timestamp as i64, 0),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(block_number, error = %e, "Block lookup failed");
                None
            }
        };

        snapshot.receipt = Some(ReceiptSnapshot {
            success: receipt.status(),
            block_number,
            block_time,
            logs: receipt.inner.logs().iter().map(|l| l.inner.clone()).collect(),
        });
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl DomainSeparatorSource for ChainClient {
    async fn domain_separator(&self, chain_id: u64, contract: Address) -> Result<B256, ChainError> {
        if let Some(hit) = self.domain_cache.get(chain_id, contract) {
            return Ok(hit);
        }
        let provider = self.provider(chain_id)?;
        let contract_handle = TopupContract::new(&provider, contract);
        let separator = match tokio::time::timeout(self.timeout, contract_handle.domain_separator()).await {
            Ok(result) => result?,
            Err(_) => return Err(ChainError::Timeout(self.timeout.as_secs())),
        };
        self.domain_cache.put(chain_id, contract, separator);
        tracing::debug!(chain_id, contract = %contract, "Fetched domain separator");
        Ok(separator)
    }
}

#[async_trait]
impl<T: DomainSeparatorSource + ?Sized> DomainSeparatorSource for Arc<T> {
    async fn domain_separator(&self, chain_id: u64, contract: Address) -> Result<B256, ChainError> {
        (**self).domain_separator(chain_id, contract).await
    }
}
