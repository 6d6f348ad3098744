/// Ordered fallback chain across storage tiers.
///
/// ```text
/// put: ipfs ──✗──▶ local-cache ──✓   (read-only tiers skipped)
/// get: ipfs ──✗──▶ gateway ──✗──▶ local-cache ──✓
/// ```
///
/// Tiers are attempted one at a time, never raced, each under its own
/// timeout. A timeout, an HTTP error or a malformed response all fall
/// through to the next tier. Only when every tier has failed does the
/// caller see `StorageUnavailable`.
///
/// The first tier that accepts a write wins; its locator is trusted
/// without a read-back through another tier.
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::gateway::GatewayBackend;
use super::ipfs::{IpfsBackend, IpfsConfig};
use super::local::LocalCacheBackend;
use super::memory::MemoryBackend;
use super::{StorageBackend, TierFailure, TierKind};
use crate::config::StorageConfig;
use crate::error::{AnchorError, Result};
use crate::record::ContentLocator;

/// Where a payload was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub locator: ContentLocator,
    pub tier: String,
    pub kind: TierKind,
}

/// Bytes read back, and which tier served them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub data: Vec<u8>,
    pub tier: String,
    pub kind: TierKind,
}

struct Tier {
    backend: Arc<dyn StorageBackend>,
    timeout: Duration,
}

/// Storage adapter over an ordered list of tiers.
#[derive(Default)]
pub struct TieredStorage {
    tiers: Vec<Tier>,
}

impl TieredStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tier to the end of the chain.
    pub fn with_tier(mut self, backend: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        self.tiers.push(Tier { backend, timeout });
        self
    }

    /// Build the chain described by `config`:
    /// ipfs → gateway → local cache → simulation (each optional).
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let mut storage = Self::new();

        if let Some(api_url) = &config.ipfs_api_url {
            let mut ipfs = IpfsConfig::new(api_url.clone());
            if let Some(user) = &config.ipfs_username {
                ipfs.credentials = Some((
                    user.clone(),
                    config.ipfs_password.clone().unwrap_or_default(),
                ));
            }
            storage = storage.with_tier(Arc::new(IpfsBackend::new(ipfs)), config.tier_timeout);
        }
        if let Some(gateway_url) = &config.gateway_url {
            storage = storage.with_tier(
                Arc::new(GatewayBackend::new(gateway_url.clone())),
                config.tier_timeout,
            );
        }
        if let Some(cache_dir) = &config.cache_dir {
            let cache = LocalCacheBackend::open(cache_dir.clone()).await?;
            storage = storage.with_tier(Arc::new(cache), config.tier_timeout);
        }
        if config.simulate {
            warn!("Simulation storage tier enabled; payloads are not retrievable by third parties");
            storage = storage.with_tier(
                Arc::new(MemoryBackend::new("simulation")),
                config.tier_timeout,
            );
        }

        if storage.tiers.is_empty() {
            return Err(AnchorError::Config("no storage tiers configured".into()));
        }
        Ok(storage)
    }

    /// Tier names in attempt order.
    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.backend.name()).collect()
    }

    /// Write `data` to the first writable tier that accepts it.
    pub async fn put(&self, data: &[u8]) -> Result<Placement> {
        let mut attempts = Vec::new();

        for tier in self.tiers.iter().filter(|t| t.backend.writable()) {
            let name = tier.backend.name();
            match tokio::time::timeout(tier.timeout, tier.backend.put(data)).await {
                Ok(Ok(locator)) => {
                    info!(tier = %name, locator = %locator, size = data.len(), "Payload stored");
                    return Ok(Placement {
                        locator,
                        tier: name.to_string(),
                        kind: tier.backend.kind(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(tier = %name, error = %e, "Storage write failed, trying next tier");
                    attempts.push(failure(name, e.to_string()));
                }
                Err(_) => {
                    warn!(tier = %name, timeout = ?tier.timeout, "Storage write timed out, trying next tier");
                    attempts.push(failure(name, format!("timed out after {:?}", tier.timeout)));
                }
            }
        }

        Err(AnchorError::StorageUnavailable { attempts })
    }

    /// Fetch `locator` from the first tier that can serve it.
    pub async fn get(&self, locator: &ContentLocator) -> Result<Retrieved> {
        let mut attempts = Vec::new();

        for tier in &self.tiers {
            let name = tier.backend.name();
            match tokio::time::timeout(tier.timeout, tier.backend.get(locator)).await {
                Ok(Ok(data)) => {
                    info!(tier = %name, locator = %locator, "Payload retrieved");
                    return Ok(Retrieved {
                        data,
                        tier: name.to_string(),
                        kind: tier.backend.kind(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(tier = %name, locator = %locator, error = %e, "Storage read failed, trying next tier");
                    attempts.push(failure(name, e.to_string()));
                }
                Err(_) => {
                    warn!(tier = %name, locator = %locator, "Storage read timed out, trying next tier");
                    attempts.push(failure(name, format!("timed out after {:?}", tier.timeout)));
                }
            }
        }

        Err(AnchorError::StorageUnavailable { attempts })
    }

    /// Pin `locator` on the first tier that accepts the pin.
    /// Returns that tier's name.
    pub async fn pin(&self, locator: &ContentLocator) -> Result<String> {
        let mut attempts = Vec::new();

        for tier in self.tiers.iter().filter(|t| t.backend.writable()) {
            let name = tier.backend.name();
            match tokio::time::timeout(tier.timeout, tier.backend.pin(locator)).await {
                Ok(Ok(())) => return Ok(name.to_string()),
                Ok(Err(e)) => attempts.push(failure(name, e.to_string())),
                Err(_) => {
                    attempts.push(failure(name, format!("timed out after {:?}", tier.timeout)))
                }
            }
        }

        Err(AnchorError::StorageUnavailable { attempts })
    }
}

fn failure(tier: &str, reason: String) -> TierFailure {
    TierFailure {
        tier: tier.to_string(),
        reason,
    }
}
