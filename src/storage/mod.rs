/// Pluggable storage backend abstraction.
///
/// Record payloads are written to an ordered chain of tiers:
/// - Network: an IPFS node's HTTP API (primary write path)
/// - Gateway: a public IPFS HTTP gateway (read-only fallback)
/// - LocalCache: a durable on-disk store keyed by locator
/// - Simulated: an in-memory store, only when explicitly configured
///
/// `TieredStorage` walks the chain and reports which tier served each
/// operation so callers can tell an independently retrievable payload from
/// one only this process can see.
pub mod gateway;
pub mod ipfs;
pub mod local;
pub mod memory;
pub mod tiered;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::ContentLocator;

pub use tiered::{Placement, Retrieved, TieredStorage};

/// What kind of store a tier is, and so how far its content can be trusted
/// to be retrievable by third parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Network,
    Gateway,
    LocalCache,
    Simulated,
}

impl TierKind {
    /// Whether content served by this tier is reachable by other parties.
    pub fn is_public(self) -> bool {
        matches!(self, TierKind::Network | TierKind::Gateway)
    }
}

/// One failed tier attempt, kept for `StorageUnavailable` reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFailure {
    pub tier: String,
    pub reason: String,
}

/// Trait for pluggable storage tiers.
///
/// For content-addressed tiers the returned locator is a pure function of
/// the stored bytes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable name of this tier (e.g., "ipfs", "local-cache").
    fn name(&self) -> &str;

    fn kind(&self) -> TierKind;

    /// Read-only tiers are skipped by `TieredStorage::put`.
    fn writable(&self) -> bool {
        true
    }

    /// Store bytes and return their locator.
    async fn put(&self, data: &[u8]) -> Result<ContentLocator>;

    /// Fetch the bytes behind a locator.
    async fn get(&self, locator: &ContentLocator) -> Result<Vec<u8>>;

    /// Ask the tier to retain the content indefinitely.
    async fn pin(&self, locator: &ContentLocator) -> Result<()>;
}
