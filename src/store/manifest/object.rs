//! Object-store manifest.
//!
//! The record is a single object whose body is the textual manifest
//! encoding. Updates are conditional puts: `Create` for the first write and
//! `Update` against the ETag observed at the most recent fetch, which is how
//! providers expose compare-and-swap. The backend remembers the contents and
//! update token from its last fetch, so an update doomed by a stale lock is
//! answered from memory without another round trip.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, UpdateVersion};

use super::{ManifestBackend, ManifestContents};
use crate::error::Result;
use crate::hash::Addr;

const MANIFEST_OBJECT: &str = "manifest";

struct Observed {
    contents: ManifestContents,
    version: UpdateVersion,
}

pub struct ObjectManifest {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    name: String,
    observed: Mutex<Option<Observed>>,
}

impl ObjectManifest {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &ObjectPath) -> Self {
        let path = prefix.child(MANIFEST_OBJECT);
        let name = path.to_string();
        Self { store, path, name, observed: Mutex::new(None) }
    }

    async fn fetch_observed(&self) -> Result<Option<ManifestContents>> {
        let result = match self.store.get(&self.path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                *self.observed.lock().unwrap() = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let body = result.bytes().await?;
        let text = std::str::from_utf8(&body)
            .map_err(|_| crate::error::Error::Corruption("manifest is not utf-8".to_string()))?;
        let contents = ManifestContents::parse(text)?;

        *self.observed.lock().unwrap() =
            Some(Observed { contents: contents.clone(), version });
        Ok(Some(contents))
    }
}

#[async_trait]
impl ManifestBackend for ObjectManifest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Option<ManifestContents>> {
        self.fetch_observed().await
    }

    async fn update(
        &self,
        last_lock: Addr,
        new_contents: ManifestContents,
    ) -> Result<ManifestContents> {
        let (stored_lock, put_version) = {
            let observed = self.observed.lock().unwrap();
            match observed.as_ref() {
                Some(o) => (o.contents.lock, Some(o.version.clone())),
                None => (Addr::ZERO, None),
            }
        };

        if stored_lock != last_lock {
            // Doomed without a round trip: the caller's token is already
            // known to be stale.
            return Ok(self
                .fetch_observed()
                .await?
                .unwrap_or_else(ManifestContents::empty));
        }

        let mode = match put_version {
            Some(version) => PutMode::Update(version),
            None => PutMode::Create,
        };
        let body = bytes::Bytes::from(new_contents.encode().into_bytes());

        match self
            .store
            .put_opts(&self.path, body, PutOptions::from(mode))
            .await
        {
            Ok(result) => {
                let version =
                    UpdateVersion { e_tag: result.e_tag.clone(), version: result.version.clone() };
                *self.observed.lock().unwrap() =
                    Some(Observed { contents: new_contents.clone(), version });
                Ok(new_contents)
            }
            Err(object_store::Error::Precondition { .. })
            | Err(object_store::Error::AlreadyExists { .. }) => Ok(self
                .fetch_observed()
                .await?
                .unwrap_or_else(ManifestContents::empty)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn manifest_pair() -> (ObjectManifest, ObjectManifest) {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let prefix = ObjectPath::from("db");
        (
            ObjectManifest::new(store.clone(), &prefix),
            ObjectManifest::new(store, &prefix),
        )
    }

    #[tokio::test]
    async fn test_fetch_uninitialized() {
        let (manifest, _) = manifest_pair();
        assert_eq!(manifest.fetch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_then_conditional_update() {
        let (manifest, _) = manifest_pair();

        let first = ManifestContents::new(Addr::of(b"one"), Vec::new());
        assert_eq!(
            manifest.update(Addr::ZERO, first.clone()).await.unwrap(),
            first
        );

        let second = ManifestContents::new(Addr::of(b"two"), Vec::new());
        assert_eq!(
            manifest.update(first.lock, second.clone()).await.unwrap(),
            second
        );
        assert_eq!(manifest.fetch().await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_competing_writers() {
        let (a, b) = manifest_pair();

        let from_a = ManifestContents::new(Addr::of(b"a"), Vec::new());
        a.update(Addr::ZERO, from_a.clone()).await.unwrap();

        // b has never fetched; its create is rejected by the provider and
        // it observes a's contents.
        let from_b = ManifestContents::new(Addr::of(b"b"), Vec::new());
        let stored = b.update(Addr::ZERO, from_b.clone()).await.unwrap();
        assert_eq!(stored, from_a);

        // With the fresh token the retry succeeds.
        let stored = b.update(from_a.lock, from_b.clone()).await.unwrap();
        assert_eq!(stored, from_b);
        assert_eq!(a.fetch().await.unwrap().unwrap(), from_b);
    }

    #[tokio::test]
    async fn test_stale_token_skips_round_trip() {
        let (a, _) = manifest_pair();

        let first = ManifestContents::new(Addr::of(b"one"), Vec::new());
        a.update(Addr::ZERO, first.clone()).await.unwrap();

        // a's cached state says the stored lock is first.lock, so an update
        // presenting the zero token is answered without attempting the put.
        let doomed = ManifestContents::new(Addr::of(b"doomed"), Vec::new());
        let stored = a.update(Addr::ZERO, doomed).await.unwrap();
        assert_eq!(stored, first);
    }
}
