use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An exclusive advisory lock on a file, held until dropped. Used to make
/// the filesystem manifest's read-check-rename sequence atomic across
/// processes; acquisition blocks until the current holder releases.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and blocks until the exclusive lock
    /// is acquired. The file contains the holder's process ID for debugging.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::acquire(&file)?;

        // Write process ID to the lock file for debugging
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    /// Platform-specific blocking lock acquisition
    #[cfg(unix)]
    fn acquire(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn acquire(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::winnt::LOCKFILE_EXCLUSIVE_LOCK;

        let handle = file.as_raw_handle();
        let mut overlapped = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn acquire(_file: &File) -> io::Result<()> {
        // Fallback for other platforms - just succeed
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself is left in place to avoid unlink races with other
        // processes opening it concurrently.
    }
}
