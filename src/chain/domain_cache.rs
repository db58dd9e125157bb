// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LRU cache for contract domain separators.
//!
//! Lock issuance needs the custody contract's EIP-712 domain separator for
//! every permit. The value only changes when the contract is redeployed, so it
//! is cached per `(chain_id, contract)` with a short TTL.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, B256};
use lru::LruCache;

/// Default number of (chain, contract) pairs kept.
pub const DEFAULT_CAPACITY: usize = 32;

/// Default time-to-live of a cached separator.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    separator: B256,
    inserted_at: Instant,
}

/// In-process LRU cache of domain separators.
pub struct DomainSeparatorCache {
    cache: Mutex<LruCache<(u64, Address), CacheEntry>>,
    ttl: Duration,
}

impl Default for DomainSeparatorCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl DomainSeparatorCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    /// Cached separator, or `None` if absent or expired.
    pub fn get(&self, chain_id: u64, contract: Address) -> Option<B256> {
        let key = (chain_id, contract);
        let mut cache = self.cache.lock().ok()?;
        if let Some(entry) = cache.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.separator);
            }
            cache.pop(&key);
        }
        None
    }

    pub fn put(&self, chain_id: u64, contract: Address, separator: B256) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                (chain_id, contract),
                CacheEntry {
                    separator,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub fn invalidate(&self, chain_id: u64, contract: Address) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(&(chain_id, contract));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: Address = Address::repeat_byte(0x11);

    #[test]
    fn cache_put_and_get() {
        let cache = DomainSeparatorCache::default();
        assert!(cache.get(56, CONTRACT).is_none());
        cache.put(56, CONTRACT, B256::repeat_byte(7));
        assert_eq!(cache.get(56, CONTRACT), Some(B256::repeat_byte(7)));
        // Same contract on another chain is a different domain
        assert!(cache.get(97, CONTRACT).is_none());
    }

    #[test]
    fn cache_invalidate() {
        let cache = DomainSeparatorCache::default();
        cache.put(56, CONTRACT, B256::repeat_byte(1));
        cache.invalidate(56, CONTRACT);
        assert!(cache.get(56, CONTRACT).is_none());
    }

    #[test]
    fn cache_ttl_expiry() {
        let cache = DomainSeparatorCache::new(4, Duration::from_millis(1));
        cache.put(56, CONTRACT, B256::repeat_byte(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(56, CONTRACT).is_none());
    }
}
