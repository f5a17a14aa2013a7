//! Advisory lock on the authentication cache file, so a second `nbd-server`
//! instance started against the same cache fails fast instead of racing
//! writes into it.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::Context;
use nix::fcntl::{flock, FlockArg};

/// Guard that holds an exclusive lock on the auth cache file. Releases the
/// lock when dropped.
pub struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

/// Acquires an exclusive, non-blocking `flock` on `path`, creating the file
/// if it doesn't exist yet. Fails if another process already holds it.
pub fn acquire(path: &Path) -> anyhow::Result<CacheLock> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .context("failed to open auth cache file for locking")?;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        .context("auth cache is already locked by another nbd-server instance")?;
    Ok(CacheLock { file })
}
