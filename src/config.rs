// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the service. Configuration is loaded from the environment
//! at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `ledger.redb` | `./data` |
//! | `DEFAULT_CHAIN_ID` | Chain used when a chain id has no RPC mapping | `56` |
//! | `CHAIN_RPC_URLS` | `id=url,id=url` overrides for the built-in RPC table | built-ins |
//! | `TOPUP_CONTRACT` | Custody contract the withdrawal permits are bound to | Required for locks |
//! | `WITHDRAW_LOCK_PK` | Hex signing key for withdrawal permits | - |
//! | `WITHDRAW_LOCK_PK_PEM` | Path to a PEM signing key, used when the hex key is unset | - |
//! | `RPC_TIMEOUT_SECS` | Per-call RPC timeout | `15` |
//! | `SETTLEMENT_CHANNEL_CAPACITY` | Bound of the outcome channel | `500` |
//! | `PENDING_SWEEP_SECS` | Interval of the stale-pending sweep | `60` |
//! | `PENDING_STALE_SECS` | Age after which a Pending row is re-enqueued | `600` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,game_ledger=debug` |

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable name for the data directory.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = "./data";
/// File name of the redb database inside the data directory.
pub const LEDGER_DB_FILE: &str = "ledger.redb";

pub const DEFAULT_CHAIN_ID_ENV: &str = "DEFAULT_CHAIN_ID";
/// BSC mainnet.
pub const DEFAULT_CHAIN_ID: u64 = 56;

/// Comma separated `chain_id=url` pairs.
pub const CHAIN_RPC_URLS_ENV: &str = "CHAIN_RPC_URLS";

pub const TOPUP_CONTRACT_ENV: &str = "TOPUP_CONTRACT";

/// Hex encoded secp256k1 key used to sign withdrawal permits.
///
/// Never logged. The key is only handed to the lock signer.
pub const WITHDRAW_LOCK_PK_ENV: &str = "WITHDRAW_LOCK_PK";
pub const WITHDRAW_LOCK_PK_PEM_ENV: &str = "WITHDRAW_LOCK_PK_PEM";

pub const RPC_TIMEOUT_SECS_ENV: &str = "RPC_TIMEOUT_SECS";
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);

pub const SETTLEMENT_CHANNEL_CAPACITY_ENV: &str = "SETTLEMENT_CHANNEL_CAPACITY";
pub const DEFAULT_SETTLEMENT_CHANNEL_CAPACITY: usize = 500;

pub const PENDING_SWEEP_SECS_ENV: &str = "PENDING_SWEEP_SECS";
pub const DEFAULT_PENDING_SWEEP: Duration = Duration::from_secs(60);

pub const PENDING_STALE_SECS_ENV: &str = "PENDING_STALE_SECS";
pub const DEFAULT_PENDING_STALE: Duration = Duration::from_secs(600);

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const DEFAULT_LOG_FILTER: &str = "info,game_ledger=debug";

/// Where the withdrawal signing key comes from.
#[derive(Clone)]
pub enum SigningKeySource {
    Hex(String),
    PemFile(PathBuf),
}

impl std::fmt::Debug for SigningKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hex(_) => f.write_str("Hex(<redacted>)"),
            Self::PemFile(path) => f.debug_tuple("PemFile").field(path).finish(),
        }
    }
}

/// Service configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    pub default_chain_id: u64,
    pub rpc_overrides: HashMap<u64, String>,
    pub topup_contract: Option<Address>,
    pub signing_key: Option<SigningKeySource>,
    pub rpc_timeout: Duration,
    pub settlement_channel_capacity: usize,
    pub pending_sweep_interval: Duration,
    pub pending_stale_after: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            default_chain_id: DEFAULT_CHAIN_ID,
            rpc_overrides: HashMap::new(),
            topup_contract: None,
            signing_key: None,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            settlement_channel_capacity: DEFAULT_SETTLEMENT_CHANNEL_CAPACITY,
            pending_sweep_interval: DEFAULT_PENDING_SWEEP,
            pending_stale_after: DEFAULT_PENDING_STALE,
        }
    }
}

impl LedgerConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let topup_contract = match get(TOPUP_CONTRACT_ENV) {
            Some(raw) => Some(
                Address::from_str(&raw)
                    .map_err(|e| ConfigError::invalid(TOPUP_CONTRACT_ENV, e.to_string()))?,
            ),
            None => None,
        };

        let signing_key = get(WITHDRAW_LOCK_PK_ENV)
            .map(SigningKeySource::Hex)
            .or_else(|| get(WITHDRAW_LOCK_PK_PEM_ENV).map(|p| SigningKeySource::PemFile(p.into())));

        let rpc_overrides = match get(CHAIN_RPC_URLS_ENV) {
            Some(raw) => parse_rpc_overrides(&raw)?,
            None => HashMap::new(),
        };

        Ok(Self {
            data_dir: get(DATA_DIR_ENV).map(PathBuf::from).unwrap_or(defaults.data_dir),
            default_chain_id: parse_or(get(DEFAULT_CHAIN_ID_ENV), DEFAULT_CHAIN_ID_ENV, DEFAULT_CHAIN_ID)?,
            rpc_overrides,
            topup_contract,
            signing_key,
            rpc_timeout: secs_or(get(RPC_TIMEOUT_SECS_ENV), RPC_TIMEOUT_SECS_ENV, DEFAULT_RPC_TIMEOUT)?,
            settlement_channel_capacity: parse_or(
                get(SETTLEMENT_CHANNEL_CAPACITY_ENV),
                SETTLEMENT_CHANNEL_CAPACITY_ENV,
                DEFAULT_SETTLEMENT_CHANNEL_CAPACITY,
            )?
            .max(1),
            pending_sweep_interval: secs_or(
                get(PENDING_SWEEP_SECS_ENV),
                PENDING_SWEEP_SECS_ENV,
                DEFAULT_PENDING_SWEEP,
            )?,
            pending_stale_after: secs_or(
                get(PENDING_STALE_SECS_ENV),
                PENDING_STALE_SECS_ENV,
                DEFAULT_PENDING_STALE,
            )?,
        })
    }

    /// Path of the redb database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_DB_FILE)
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
        None => Ok(default),
    }
}

fn secs_or(raw: Option<String>, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_or(raw, name, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::invalid(name, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

/// Parse `56=https://a,137=https://b` into a chain id → url map.
fn parse_rpc_overrides(raw: &str) -> Result<HashMap<u64, String>, ConfigError> {
    let mut out = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, url) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::invalid(CHAIN_RPC_URLS_ENV, format!("`{pair}` is not id=url")))?;
        let id: u64 = id
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(CHAIN_RPC_URLS_ENV, format!("bad chain id in `{pair}`")))?;
        url::Url::parse(url.trim())
            .map_err(|e| ConfigError::invalid(CHAIN_RPC_URLS_ENV, e.to_string()))?;
        out.insert(id, url.trim().to_string());
    }
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            reason: reason.into(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `LOG_FORMAT=json` emits JSON lines; anything else uses the human readable
/// formatter. `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`].
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
