// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Withdrawal permit ("lock auth") signing.
//!
//! The custody contract only opens a lock when it is presented with a server
//! signature over an EIP-712 digest:
//!
//! ```text
//! structHash = keccak256(TYPEHASH ‖ user ‖ lockId ‖ amount ‖ expiry ‖ nonce)
//! digest     = keccak256(0x19 0x01 ‖ domainSeparator ‖ structHash)
//! ```
//!
//! every field left-padded to 32 bytes. The domain separator is read from the
//! deployed contract so permits cannot be replayed on another deployment.
//! Signatures are `r ‖ s ‖ v` with `v` in {27, 28}.

use std::fmt;

use alloy::{
    primitives::{keccak256, Address, Signature, B256, U256},
    signers::{local::PrivateKeySigner, SignerSync},
};
use k256::SecretKey;
use ring::rand::{SecureRandom, SystemRandom};

use super::client::ChainError;
use crate::config::SigningKeySource;

/// EIP-712 type string of the permit.
pub const LOCK_AUTH_TYPE: &str =
    "LockAuth(address user,bytes32 lockId,uint256 amount,uint64 expiry,uint256 nonce)";

/// Fields bound by one permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAuthParams {
    pub user: Address,
    pub lock_id: B256,
    pub amount: U256,
    /// Unix seconds.
    pub expiry: u64,
    pub nonce: U256,
}

/// Digest and its 65-byte signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLockAuth {
    pub digest: B256,
    pub signature: [u8; 65],
}

impl SignedLockAuth {
    /// `0x`-prefixed hex of the signature.
    pub fn signature_hex(&self) -> String {
        alloy::hex::encode_prefixed(self.signature)
    }
}

pub fn lock_auth_typehash() -> B256 {
    keccak256(LOCK_AUTH_TYPE.as_bytes())
}

pub fn lock_auth_struct_hash(params: &LockAuthParams) -> B256 {
    let mut buf = Vec::with_capacity(6 * 32);
    buf.extend_from_slice(lock_auth_typehash().as_slice());
    buf.extend_from_slice(params.user.into_word().as_slice());
    buf.extend_from_slice(params.lock_id.as_slice());
    buf.extend_from_slice(&params.amount.to_be_bytes::<32>());
    buf.extend_from_slice(&U256::from(params.expiry).to_be_bytes::<32>());
    buf.extend_from_slice(&params.nonce.to_be_bytes::<32>());
    keccak256(&buf)
}

pub fn lock_auth_digest(domain_separator: B256, struct_hash: B256) -> B256 {
    let mut buf = [0u8; 66];
    buf[0] = 0x19;
    buf[1] = 0x01;
    buf[2..34].copy_from_slice(domain_separator.as_slice());
    buf[34..].copy_from_slice(struct_hash.as_slice());
    keccak256(buf)
}

/// Server key that signs withdrawal permits.
pub struct LockAuthSigner {
    signer: PrivateKeySigner,
}

impl fmt::Debug for LockAuthSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockAuthSigner")
            .field("address", &self.signer.address())
            .finish()
    }
}

impl LockAuthSigner {
    /// Create a signer from a hex key (with or without `0x`).
    pub fn from_hex(private_key_hex: &str) -> Result<Self, ChainError> {
        let key_bytes = alloy::hex::decode(private_key_hex.trim())
            .map_err(|e| ChainError::InvalidPrivateKey(e.to_string()))?;
        let signer = PrivateKeySigner::from_slice(&key_bytes)
            .map_err(|e| ChainError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { signer })
    }

    /// Create a signer from a SEC1 or PKCS#8 PEM key.
    pub fn from_pem(pem_bytes: &[u8]) -> Result<Self, ChainError> {
        let secret = secret_from_pem(pem_bytes)?;
        let signer = PrivateKeySigner::from_slice(secret.to_bytes().as_slice())
            .map_err(|e| ChainError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { signer })
    }

    pub fn from_source(source: &SigningKeySource) -> Result<Self, ChainError> {
        match source {
            SigningKeySource::Hex(hex) => Self::from_hex(hex),
            SigningKeySource::PemFile(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    ChainError::InvalidPrivateKey(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_pem(&bytes)
            }
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign a prehashed digest, returning `r ‖ s ‖ v` with `v` in {27, 28}.
    pub fn sign_digest(&self, digest: &B256) -> Result<[u8; 65], ChainError> {
        let sig = self
            .signer
            .sign_hash_sync(digest)
            .map_err(|e| ChainError::Sign(e.to_string()))?;
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&sig.r().to_be_bytes::<32>());
        out[32..64].copy_from_slice(&sig.s().to_be_bytes::<32>());
        out[64] = 27 + u8::from(sig.v());
        Ok(out)
    }

    /// Build the permit digest for `contract`'s domain and sign it.
    pub fn sign_lock_auth(
        &self,
        domain_separator: B256,
        params: &LockAuthParams,
    ) -> Result<SignedLockAuth, ChainError> {
        if params.user.is_zero() {
            return Err(ChainError::MissingParams("user"));
        }
        if params.lock_id.is_zero() {
            return Err(ChainError::MissingParams("lock_id"));
        }
        if params.nonce.is_zero() {
            return Err(ChainError::MissingParams("nonce"));
        }
        if domain_separator.is_zero() {
            return Err(ChainError::MissingParams("domain_separator"));
        }
        let digest = lock_auth_digest(domain_separator, lock_auth_struct_hash(params));
        let signature = self.sign_digest(&digest)?;
        Ok(SignedLockAuth { digest, signature })
    }
}

/// Recover the signer address from a 65-byte `r ‖ s ‖ v` signature.
///
/// `v` may be 0/1 or 27/28.
pub fn recover_signer(digest: &B256, signature: &[u8]) -> Result<Address, ChainError> {
    if signature.len() != 65 {
        return Err(ChainError::InvalidSignature(format!(
            "expected 65 bytes, got {}",
            signature.len()
        )));
    }
    let v = match signature[64] {
        v @ (27 | 28) => v - 27,
        v @ (0 | 1) => v,
        other => {
            return Err(ChainError::InvalidSignature(format!("bad recovery byte {other}")));
        }
    };
    let r = U256::from_be_slice(&signature[..32]);
    let s = U256::from_be_slice(&signature[32..64]);
    Signature::new(r, s, v == 1)
        .recover_address_from_prehash(digest)
        .map_err(|e| ChainError::InvalidSignature(e.to_string()))
}

/// 32 random bytes identifying a new lock.
pub fn generate_lock_id() -> Result<B256, ChainError> {
    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| ChainError::Sign("system randomness unavailable".to_string()))?;
    Ok(B256::from(bytes))
}

/// Unpredictable permit nonce: keccak256 of a millisecond timestamp and a random value.
pub fn generate_nonce() -> Result<U256, ChainError> {
    let mut rand = [0u8; 8];
    SystemRandom::new()
        .fill(&mut rand)
        .map_err(|_| ChainError::Sign("system randomness unavailable".to_string()))?;
    let seed = format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        u64::from_be_bytes(rand)
    );
    Ok(U256::from_be_bytes(keccak256(seed.as_bytes()).0))
}

fn secret_from_pem(pem_bytes: &[u8]) -> Result<SecretKey, ChainError> {
    let pem_str = std::str::from_utf8(pem_bytes)
        .map_err(|e| ChainError::InvalidPrivateKey(format!("Invalid UTF-8: {e}")))?;
    let pem = pem::parse(pem_str)
        .map_err(|e| ChainError::InvalidPrivateKey(format!("Invalid PEM: {e}")))?;

    // SEC1 ("EC PRIVATE KEY") first, then PKCS#8 ("PRIVATE KEY")
    SecretKey::from_sec1_der(pem.contents())
        .or_else(|_| {
            use k256::pkcs8::DecodePrivateKey;
            SecretKey::from_pkcs8_der(pem.contents()).map_err(|e| e.to_string())
        })
        .map_err(|e| ChainError::InvalidPrivateKey(format!("Invalid key format: {e}")))
}
