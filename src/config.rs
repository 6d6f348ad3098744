//! Configuration for the anchoring pipeline.
//!
//! [`AnchorConfig`] is deserialized from JSON; every field has a default so
//! a config file only needs to list what differs. Durations use
//! human-readable strings (`"30s"`, `"2m"`).
//!
//! ```json
//! {
//!   "storage": { "cache_dir": "/var/lib/evidence-anchor/cache", "tier_timeout": "10s" },
//!   "ledger": { "rpc_url": "http://localhost:8545", "chain_id": 31337 },
//!   "lifecycle": { "rejected_is_final": true }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::error::{AnchorError, Result};
use crate::record::lifecycle::LifecyclePolicy;

const DEFAULT_IPFS_API_URL: &str = "https://ipfs.infura.io:5001";
const DEFAULT_GATEWAY_URL: &str = "https://ipfs.io";
const DEFAULT_RPC_URL: &str = "https://rpc-amoy.polygon.technology/";
const DEFAULT_EXPLORER_URL: &str = "https://amoy.polygonscan.com";
const DEFAULT_CONTRACT_ADDRESS: &str = "0x8fd7C60e037BB9Ec865EC8c31ac3c61DB582a6dF";

/// Polygon Amoy testnet.
const DEFAULT_CHAIN_ID: u64 = 80002;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnchorConfig {
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub lifecycle: LifecycleConfig,
}

impl AnchorConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AnchorError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.gas_margin_percent > 500 {
            return Err(AnchorError::Config(format!(
                "gas_margin_percent {} is unreasonably large",
                self.ledger.gas_margin_percent
            )));
        }
        if self.ledger.poll_interval.is_zero() {
            return Err(AnchorError::Config("poll_interval must be non-zero".into()));
        }
        if !self.ledger.simulate {
            self.ledger.contract_address()?;
        }
        Ok(())
    }
}

/// Storage tier chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// IPFS HTTP API (primary write tier). `null` disables the tier.
    pub ipfs_api_url: Option<String>,
    pub ipfs_username: Option<String>,
    pub ipfs_password: Option<String>,
    /// Public read gateway. `null` disables the tier.
    pub gateway_url: Option<String>,
    /// Durable local cache directory (terminal fallback tier).
    pub cache_dir: Option<PathBuf>,
    /// Per-tier call timeout.
    #[serde(with = "humantime_serde")]
    pub tier_timeout: Duration,
    /// Append an in-memory simulation tier. Opt-in only.
    pub simulate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ipfs_api_url: Some(DEFAULT_IPFS_API_URL.to_string()),
            ipfs_username: None,
            ipfs_password: None,
            gateway_url: Some(DEFAULT_GATEWAY_URL.to_string()),
            cache_dir: None,
            tier_timeout: Duration::from_secs(30),
            simulate: false,
        }
    }
}

/// Commitment ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub rpc_url: String,
    /// Chain the client must be connected to; anything else is `WrongNetwork`.
    pub chain_id: u64,
    pub contract_address: String,
    pub explorer_url: String,
    /// Blocks on top of the inclusion block before a write counts as confirmed.
    pub confirmations: u64,
    #[serde(with = "humantime_serde")]
    pub confirmation_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Safety margin added to gas estimates, in percent.
    pub gas_margin_percent: u64,
    /// First block scanned for audit events.
    pub from_block: u64,
    /// Use the in-process ledger instead of the chain. Opt-in only.
    pub simulate: bool,
}

impl LedgerConfig {
    pub fn contract_address(&self) -> Result<Address> {
        self.contract_address.parse().map_err(|e| {
            AnchorError::Config(format!(
                "invalid contract address {:?}: {e}",
                self.contract_address
            ))
        })
    }

    /// Block explorer link for a transaction.
    pub fn explorer_tx_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/{tx_hash}", self.explorer_url.trim_end_matches('/'))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            chain_id: DEFAULT_CHAIN_ID,
            contract_address: DEFAULT_CONTRACT_ADDRESS.to_string(),
            explorer_url: DEFAULT_EXPLORER_URL.to_string(),
            confirmations: 1,
            confirmation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            gas_margin_percent: 20,
            from_block: 0,
            simulate: false,
        }
    }
}

/// Lifecycle and status-cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    pub rejected_is_final: bool,
    /// How long a cached ledger status is served before re-querying.
    #[serde(with = "humantime_serde")]
    pub status_ttl: Duration,
}

impl LifecycleConfig {
    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy::new(self.rejected_is_final)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            rejected_is_final: false,
            status_ttl: Duration::from_secs(15),
        }
    }
}
