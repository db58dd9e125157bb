// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain types and constants.

use std::collections::HashMap;

use super::client::ChainError;

/// EVM network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Network name as used by deployment configuration
    pub name: &'static str,
    /// Chain ID
    pub chain_id: u64,
    /// Public RPC endpoint URL
    pub rpc_url: &'static str,
}

pub const ETH_MAINNET: NetworkConfig = NetworkConfig {
    name: "ETH",
    chain_id: 1,
    rpc_url: "https://ethereum-rpc.publicnode.com",
};

pub const OPTIMISM: NetworkConfig = NetworkConfig {
    name: "OPTIMISM",
    chain_id: 10,
    rpc_url: "https://mainnet.optimism.io",
};

pub const BSC: NetworkConfig = NetworkConfig {
    name: "BSC",
    chain_id: 56,
    rpc_url: "https://bsc-dataseed.bnbchain.org",
};

pub const BSC_TESTNET: NetworkConfig = NetworkConfig {
    name: "BSC_TESTNET",
    chain_id: 97,
    rpc_url: "https://data-seed-prebsc-1-s1.bnbchain.org:8545",
};

pub const POLYGON: NetworkConfig = NetworkConfig {
    name: "POLYGON",
    chain_id: 137,
    rpc_url: "https://polygon-rpc.com",
};

pub const ARBITRUM: NetworkConfig = NetworkConfig {
    name: "ARBITRUM",
    chain_id: 42161,
    rpc_url: "https://arb1.arbitrum.io/rpc",
};

/// Networks known out of the box.
pub const BUILTIN_NETWORKS: [NetworkConfig; 6] =
    [ETH_MAINNET, OPTIMISM, BSC, BSC_TESTNET, POLYGON, ARBITRUM];

/// RPC endpoint selected for a requested chain id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChain {
    /// Chain the endpoint actually serves.
    pub chain_id: u64,
    pub rpc_url: String,
    /// True when the requested chain was unmapped and the default was used.
    pub fallback: bool,
}

/// Chain id → RPC endpoint table.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    default_chain_id: u64,
    urls: HashMap<u64, String>,
}

impl ChainRegistry {
    /// Built-in table plus `overrides`. The default chain must resolve.
    pub fn new(default_chain_id: u64, overrides: &HashMap<u64, String>) -> Result<Self, ChainError> {
        let mut urls: HashMap<u64, String> = BUILTIN_NETWORKS
            .iter()
            .map(|n| (n.chain_id, n.rpc_url.to_string()))
            .collect();
        for (chain_id, url) in overrides {
            url::Url::parse(url).map_err(|e| ChainError::InvalidRpcUrl(e.to_string()))?;
            urls.insert(*chain_id, url.clone());
        }
        if !urls.contains_key(&default_chain_id) {
            return Err(ChainError::UnknownChain(default_chain_id));
        }
        Ok(Self {
            default_chain_id,
            urls,
        })
    }

    pub fn default_chain_id(&self) -> u64 {
        self.default_chain_id
    }

    /// Endpoint for `chain_id`, falling back to the default chain.
    pub fn resolve(&self, chain_id: u64) -> Result<ResolvedChain, ChainError> {
        if let Some(url) = self.urls.get(&chain_id) {
            return Ok(ResolvedChain {
                chain_id,
                rpc_url: url.clone(),
                fallback: false,
            });
        }
        let url = self
            .urls
            .get(&self.default_chain_id)
            .ok_or(ChainError::UnknownChain(chain_id))?;
        Ok(ResolvedChain {
            chain_id: self.default_chain_id,
            rpc_url: url.clone(),
            fallback: true,
        })
    }

    /// Display name of a built-in network.
    pub fn name_of(chain_id: u64) -> Option<&'static str> {
        BUILTIN_NETWORKS
            .iter()
            .find(|n| n.chain_id == chain_id)
            .map(|n| n.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_chain_falls_back_to_default() {
        let registry = ChainRegistry::new(56, &HashMap::new()).unwrap();
        let resolved = registry.resolve(8453).unwrap();
        assert!(resolved.fallback);
        assert_eq!(resolved.chain_id, 56);
        assert_eq!(resolved.rpc_url, BSC.rpc_url);

        let polygon = registry.resolve(137).unwrap();
        assert!(!polygon.fallback);
        assert_eq!(ChainRegistry::name_of(137), Some("POLYGON"));
    }

    #[test]
    fn overrides_replace_and_extend_builtins() {
        let mut overrides = HashMap::new();
        overrides.insert(56, "https://bsc.example".to_string());
        overrides.insert(8453, "https://base.example".to_string());
        let registry = ChainRegistry::new(8453, &overrides).unwrap();
        assert_eq!(registry.resolve(56).unwrap().rpc_url, "https://bsc.example");
        assert_eq!(registry.resolve(999).unwrap().chain_id, 8453);
    }

    #[test]
    fn default_chain_must_be_known() {
        assert!(matches!(
            ChainRegistry::new(31337, &HashMap::new()),
            Err(ChainError::UnknownChain(31337))
        ));
    }
}
