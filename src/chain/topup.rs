// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Custody ("topup") contract interface.

use alloy::{
    primitives::{Address, B256},
    providers::Provider,
    sol,
};

use super::client::ChainError;

sol! {
    #[sol(rpc)]
    interface ITopupLogic {
        event Deposited(address indexed user, uint256 amount);
        event LockOpened(address indexed user, bytes32 indexed lockId, uint256 amount, uint64 expiry);
        event LockClaimed(address indexed user, bytes32 indexed lockId, address to, uint256 amount);
        event LockCanceled(address indexed user, bytes32 indexed lockId, uint256 amount);

        function deposit(uint256 amount) external;
        function openLock(bytes32 lockId, uint256 amount, uint64 expiry, uint256 nonce, bytes signature) external;
        function claimLocked(bytes32 lockId, address to) external;
        function cancelLock(bytes32 lockId) external;
        function domainSeparator() external view returns (bytes32);
    }
}

sol! {
    /// Typed payload the contract verifies before opening a lock.
    #[derive(Debug)]
    struct LockAuth {
        address user;
        bytes32 lockId;
        uint256 amount;
        uint64 expiry;
        uint256 nonce;
    }
}

/// Custody contract wrapper.
pub struct TopupContract<P> {
    contract: ITopupLogic::ITopupLogicInstance<P>,
}

impl<P: Provider + Clone> TopupContract<P> {
    pub fn new(provider: &P, address: Address) -> Self {
        Self {
            contract: ITopupLogic::new(address, provider.clone()),
        }
    }

    /// EIP-712 domain separator of this deployment.
    pub async fn domain_separator(&self) -> Result<B256, ChainError> {
        self.contract
            .domainSeparator()
            .call()
            .await
            .map_err(|e| match e {
                alloy::contract::Error::TransportError(t) => ChainError::Rpc(t.to_string()),
                other => ChainError::Contract(other.to_string()),
            })
    }
}
