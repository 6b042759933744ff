//! Filesystem manifest.
//!
//! The record is a single `manifest` file in the store directory, replaced
//! by writing a temp file and renaming it into place. The read-check-rename
//! sequence runs under an exclusive advisory lock on a sibling `LOCK` file,
//! so concurrent processes racing a stat/open still observe plain
//! compare-and-swap semantics.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use async_trait::async_trait;

use super::{ManifestBackend, ManifestContents};
use crate::error::Result;
use crate::flock::FileLock;
use crate::hash::Addr;

const MANIFEST_FILE: &str = "manifest";
const LOCK_FILE: &str = "LOCK";

pub struct FileManifest {
    dir: PathBuf,
    name: String,
}

impl FileManifest {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = dir.to_string_lossy().into_owned();
        Self { dir, name }
    }

    fn read_if_exists(&self) -> Result<Option<ManifestContents>> {
        match fs::read_to_string(self.dir.join(MANIFEST_FILE)) {
            Ok(text) => Ok(Some(ManifestContents::parse(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_and_rename(&self, contents: &ManifestContents) -> Result<()> {
        let tmp = self.dir.join(format!(
            ".manifest-{}-{}.tmp",
            std::process::id(),
            nanos_now()
        ));
        let mut file = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
        file.write_all(contents.encode().as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, self.dir.join(MANIFEST_FILE))?;

        // Make the rename durable on platforms where directory metadata
        // needs its own sync.
        #[cfg(unix)]
        {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }
}

#[async_trait]
impl ManifestBackend for FileManifest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Option<ManifestContents>> {
        self.read_if_exists()
    }

    async fn update(
        &self,
        last_lock: Addr,
        new_contents: ManifestContents,
    ) -> Result<ManifestContents> {
        let _lock = FileLock::lock(self.dir.join(LOCK_FILE))?;

        let current = self.read_if_exists()?;
        let stored_lock = current.as_ref().map(|c| c.lock).unwrap_or(Addr::ZERO);
        if stored_lock != last_lock {
            return Ok(current.unwrap_or_else(ManifestContents::empty));
        }

        self.write_and_rename(&new_contents)?;
        Ok(new_contents)
    }
}

fn nanos_now() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
