//! Scratch directories for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// A scratch directory under the system temp root, removed on drop. Names
/// combine the process id with a process-local serial, so parallel tests
/// and parallel test processes never collide.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir()
            .join(format!("cinder-test-{}-{serial}", std::process::id()));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path for a named file inside the directory. Nothing is created; the
    /// caller writes it.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_distinct_and_cleaned_up() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());

        let kept = a.path().to_path_buf();
        fs::write(a.file("scratch"), b"contents").unwrap();
        drop(a);
        assert!(!kept.exists());
    }
}
