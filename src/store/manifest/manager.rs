//! Caching and locking wrapper over a raw manifest backend.
//!
//! The manager remembers the most recently observed contents per store
//! identity, so a commit doomed by a stale lock can be failed preemptively
//! without touching the backend, and serializes local manifest updates
//! through a process-wide per-identity lock so concurrent committers in one
//! process do not race each other into orphan tables.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use super::{ManifestBackend, ManifestContents};
use crate::cache::CacheContext;
use crate::error::Result;
use crate::hash::Addr;

#[derive(Clone)]
pub struct ManifestManager {
    backend: Arc<dyn ManifestBackend>,
    caches: Arc<CacheContext>,
}

impl ManifestManager {
    pub fn new(backend: Arc<dyn ManifestBackend>, caches: Arc<CacheContext>) -> Self {
        Self { backend, caches }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Takes the process-wide update lock for this store identity. Held for
    /// the duration of a commit; re-entrant acquisition deadlocks.
    pub async fn lock_for_update(&self) -> OwnedMutexGuard<()> {
        self.caches.update_lock(self.backend.name()).lock_owned().await
    }

    pub async fn fetch(&self) -> Result<Option<ManifestContents>> {
        let contents = self.backend.fetch().await?;
        if let Some(contents) = &contents {
            self.caches.put_manifest(self.backend.name(), contents.clone());
        }
        Ok(contents)
    }

    pub async fn update(
        &self,
        last_lock: Addr,
        new_contents: ManifestContents,
    ) -> Result<ManifestContents> {
        let stored = self.backend.update(last_lock, new_contents).await?;
        self.caches.put_manifest(self.backend.name(), stored.clone());
        Ok(stored)
    }

    /// If the cache already knows the durable lock differs from
    /// `last_lock`, returns the cached contents so the caller can skip the
    /// doomed CAS and rebase immediately.
    pub fn update_will_fail(&self, last_lock: Addr) -> Option<ManifestContents> {
        let cached = self.caches.manifest(self.backend.name())?;
        if cached.lock != last_lock {
            Some(cached)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::manifest::MemoryManifest;

    fn manager_pair() -> (ManifestManager, ManifestManager) {
        let backend = MemoryManifest::new("shared-store");
        let caches = CacheContext::new(1024 * 1024, 1024 * 1024, 16);
        (
            ManifestManager::new(Arc::new(backend.clone()), caches.clone()),
            ManifestManager::new(Arc::new(backend), caches),
        )
    }

    #[tokio::test]
    async fn test_fetch_populates_cache() {
        let (a, b) = manager_pair();

        let contents = ManifestContents::new(Addr::of(b"root"), Vec::new());
        a.update(Addr::ZERO, contents.clone()).await.unwrap();

        // b shares the cache by identity, so a's update already primed it.
        assert_eq!(b.update_will_fail(Addr::ZERO), Some(contents.clone()));
        assert_eq!(b.update_will_fail(contents.lock), None);
    }

    #[tokio::test]
    async fn test_update_will_fail_without_observation() {
        let backend = MemoryManifest::new("unseen-store");
        let caches = CacheContext::new(1024, 1024, 4);
        let mm = ManifestManager::new(Arc::new(backend), caches);
        // Nothing observed yet: the CAS must be attempted for real.
        assert_eq!(mm.update_will_fail(Addr::ZERO), None);
    }

    #[tokio::test]
    async fn test_losing_update_refreshes_cache() {
        let (a, b) = manager_pair();

        let first = ManifestContents::new(Addr::of(b"one"), Vec::new());
        a.update(Addr::ZERO, first.clone()).await.unwrap();

        let doomed = ManifestContents::new(Addr::of(b"two"), Vec::new());
        let stored = b.update(Addr::ZERO, doomed).await.unwrap();
        assert_eq!(stored, first);
        assert_eq!(b.update_will_fail(Addr::ZERO), Some(first));
    }

    #[tokio::test]
    async fn test_update_lock_serializes_by_identity() {
        let (a, _) = manager_pair();
        let guard = a.lock_for_update().await;
        // A second acquisition for the same identity must wait.
        assert!(
            a.caches.update_lock(a.name()).try_lock().is_err(),
            "lock should be held"
        );
        drop(guard);
        assert!(a.caches.update_lock(a.name()).try_lock().is_ok());
    }
}
