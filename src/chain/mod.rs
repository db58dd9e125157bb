// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! EVM chain integration for the custody contract.
//!
//! This module provides functionality for:
//! - Resolving an RPC endpoint per chain id
//! - Decoding deposit / lock / claim / cancel transactions
//! - Signing withdrawal permits against the contract's EIP-712 domain

pub mod client;
pub mod domain_cache;
pub mod parser;
pub mod signing;
pub mod topup;
pub mod types;

pub use client::{ChainClient, ChainError, DomainSeparatorSource, ReceiptSnapshot, TxSnapshot};
pub use parser::{decode_outcome, parse_tx_hash, TxParser};
pub use signing::{recover_signer, LockAuthParams, LockAuthSigner, SignedLockAuth};
pub use types::{ChainRegistry, NetworkConfig};
