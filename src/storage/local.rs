/// Durable local cache tier.
///
/// Stores one file per locator under a directory. Writes go to a temporary
/// file that is synced and then renamed into place, so a crash never leaves
/// a partially written payload under a valid locator. Entries never expire.
///
/// This is the terminal fallback tier: it keeps `put` available with no
/// network at all, at the cost that nobody outside this host can fetch the
/// content.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::{StorageBackend, TierKind};
use crate::crypto::hash;
use crate::error::{AnchorError, Result};
use crate::record::ContentLocator;

/// On-disk locator → payload store.
pub struct LocalCacheBackend {
    dir: PathBuf,
}

impl LocalCacheBackend {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `locator`'s payload.
    ///
    /// Locators are CIDs; anything else is rejected so a crafted locator
    /// cannot escape the cache directory.
    pub fn path_for(&self, locator: &ContentLocator) -> Result<PathBuf> {
        let name = locator.as_str();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AnchorError::Storage(format!(
                "invalid locator for local cache: {name:?}"
            )));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl StorageBackend for LocalCacheBackend {
    fn name(&self) -> &str {
        "local-cache"
    }

    fn kind(&self) -> TierKind {
        TierKind::LocalCache
    }

    async fn put(&self, data: &[u8]) -> Result<ContentLocator> {
        let locator = hash::content_locator(data);
        let path = self.path_for(&locator)?;

        if fs::try_exists(&path).await? {
            debug!(locator = %locator, "Payload already cached");
            return Ok(locator);
        }

        let tmp = self.dir.join(format!(".{locator}.{}.tmp", Uuid::now_v7()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        Ok(locator)
    }

    async fn get(&self, locator: &ContentLocator) -> Result<Vec<u8>> {
        let path = self.path_for(locator)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AnchorError::Storage(format!(
                "{locator} is not in the local cache"
            ))),
            Err(e) => Err(AnchorError::Io(e)),
        }
    }

    /// Cached entries never expire; pinning only checks presence.
    async fn pin(&self, locator: &ContentLocator) -> Result<()> {
        let path = self.path_for(locator)?;
        if fs::try_exists(&path).await? {
            Ok(())
        } else {
            Err(AnchorError::Storage(format!(
                "cannot pin {locator}: not in the local cache"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCacheBackend::open(dir.path()).await.unwrap();

        let locator = cache.put(b"payload bytes").await.unwrap();
        assert_eq!(locator, hash::content_locator(b"payload bytes"));
        assert_eq!(cache.get(&locator).await.unwrap(), b"payload bytes".to_vec());
        cache.pin(&locator).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCacheBackend::open(dir.path()).await.unwrap();

        let a = cache.put(b"same").await.unwrap();
        let b = cache.put(b"same").await.unwrap();
        assert_eq!(a, b);

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_some());
        assert!(entries.next().is_none(), "no temp files left behind");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let locator = {
            let cache = LocalCacheBackend::open(dir.path()).await.unwrap();
            cache.put(b"durable").await.unwrap()
        };

        let reopened = LocalCacheBackend::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(&locator).await.unwrap(), b"durable".to_vec());
    }

    #[tokio::test]
    async fn test_missing_and_invalid_locators() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCacheBackend::open(dir.path()).await.unwrap();

        let missing = hash::content_locator(b"absent");
        assert!(matches!(
            cache.get(&missing).await,
            Err(AnchorError::Storage(_))
        ));
        assert!(cache.pin(&missing).await.is_err());

        let escape = ContentLocator::new("../etc/passwd");
        assert!(matches!(
            cache.get(&escape).await,
            Err(AnchorError::Storage(_))
        ));
    }
}
