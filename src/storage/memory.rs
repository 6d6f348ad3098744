/// In-memory simulation tier.
///
/// Only used when a deployment opts into simulation, or by tests. It
/// derives locators exactly like the local cache and supports failure
/// injection (unavailability, latency) and out-of-band tampering.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{StorageBackend, TierKind};
use crate::crypto::hash;
use crate::error::{AnchorError, Result};
use crate::record::ContentLocator;

/// Thread-safe in-memory locator → payload store.
pub struct MemoryBackend {
    name: String,
    blobs: RwLock<HashMap<ContentLocator, Vec<u8>>>,
    pinned: RwLock<HashSet<ContentLocator>>,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blobs: RwLock::new(HashMap::new()),
            pinned: RwLock::new(HashSet::new()),
            available: AtomicBool::new(true),
            latency: Mutex::new(None),
        }
    }

    /// Simulate the tier going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation, e.g. to trip a tier timeout.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Overwrite stored bytes without changing the locator.
    pub fn tamper(&self, locator: &ContentLocator, data: Vec<u8>) {
        self.blobs.write().insert(locator.clone(), data);
    }

    pub fn remove(&self, locator: &ContentLocator) -> Option<Vec<u8>> {
        self.blobs.write().remove(locator)
    }

    pub fn contains(&self, locator: &ContentLocator) -> bool {
        self.blobs.read().contains_key(locator)
    }

    pub fn is_pinned(&self, locator: &ContentLocator) -> bool {
        self.pinned.read().contains(locator)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AnchorError::Storage(format!("{} is unavailable", self.name)))
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TierKind {
        TierKind::Simulated
    }

    async fn put(&self, data: &[u8]) -> Result<ContentLocator> {
        self.enter().await?;
        let locator = hash::content_locator(data);
        self.blobs
            .write()
            .entry(locator.clone())
            .or_insert_with(|| data.to_vec());
        Ok(locator)
    }

    async fn get(&self, locator: &ContentLocator) -> Result<Vec<u8>> {
        self.enter().await?;
        self.blobs
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| AnchorError::Storage(format!("{locator} not found in {}", self.name)))
    }

    async fn pin(&self, locator: &ContentLocator) -> Result<()> {
        self.enter().await?;
        if !self.contains(locator) {
            return Err(AnchorError::Storage(format!(
                "cannot pin {locator}: not found in {}",
                self.name
            )));
        }
        self.pinned.write().insert(locator.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_pin() {
        let backend = MemoryBackend::default();
        let locator = backend.put(b"hello").await.unwrap();

        assert_eq!(backend.get(&locator).await.unwrap(), b"hello".to_vec());
        assert!(!backend.is_pinned(&locator));
        backend.pin(&locator).await.unwrap();
        assert!(backend.is_pinned(&locator));
    }

    #[tokio::test]
    async fn test_put_does_not_overwrite() {
        let backend = MemoryBackend::default();
        let locator = backend.put(b"original").await.unwrap();
        backend.tamper(&locator, b"tampered".to_vec());

        // Re-uploading the original bytes does not repair the tampered entry.
        backend.put(b"original").await.unwrap();
        assert_eq!(backend.get(&locator).await.unwrap(), b"tampered".to_vec());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let backend = MemoryBackend::new("primary");
        backend.set_available(false);

        let err = backend.put(b"x").await.unwrap_err();
        assert!(err.to_string().contains("primary is unavailable"));

        backend.set_available(true);
        assert!(backend.put(b"x").await.is_ok());
    }
}
