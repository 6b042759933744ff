//! In-memory manifest, for tests. Share one instance (or one cloned handle)
//! between stores to model a common backend.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ManifestBackend, ManifestContents};
use crate::error::Result;
use crate::hash::Addr;

#[derive(Clone)]
pub struct MemoryManifest {
    name: String,
    state: Arc<Mutex<Option<ManifestContents>>>,
}

impl MemoryManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: Arc::new(Mutex::new(None)) }
    }
}

#[async_trait]
impl ManifestBackend for MemoryManifest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Option<ManifestContents>> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn update(
        &self,
        last_lock: Addr,
        new_contents: ManifestContents,
    ) -> Result<ManifestContents> {
        let mut state = self.state.lock().unwrap();
        let stored_lock = state.as_ref().map(|c| c.lock).unwrap_or(Addr::ZERO);
        if stored_lock != last_lock {
            return Ok(state.clone().unwrap_or_else(ManifestContents::empty));
        }
        *state = Some(new_contents.clone());
        Ok(new_contents)
    }
}
