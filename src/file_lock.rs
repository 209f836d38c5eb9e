//! Advisory file locks for inter-process coordination.
//!
//! Locks are taken with non-blocking `flock(2)` and bound to the open
//! file description, so two lock instances conflict even inside a
//! single process. A lock is released when its guard is dropped, or by
//! the kernel when the holding process exits.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Error};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

/// Exclusive advisory lock bound to a pathname.
///
/// Dropping the guard releases the lock; the lock file itself stays
/// behind and is reused by the next holder.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to acquire the lock without blocking.
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>, Error> {
        let path = path.as_ref();
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(err) => bail!("unable to open lock {:?} - {}", path, err),
        };
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_owned(),
            })),
            Err(Errno::EWOULDBLOCK) => Ok(None),
            Err(err) => bail!("unable to lock {:?} - {}", path, err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

/// Acquire an exclusive lock, waiting up to `timeout`.
///
/// Polls every 100 ms. Only meant for short critical sections like the
/// meta store commit.
pub fn lock_file_timeout<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<FileLock, Error> {
    let path = path.as_ref();
    let started = Instant::now();
    loop {
        if let Some(guard) = FileLock::try_acquire(path)? {
            return Ok(guard);
        }
        if started.elapsed() >= timeout {
            bail!("unable to acquire lock {:?} - got timeout", path);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exclusive_lock() -> Result<(), Error> {
        let path = std::path::Path::new(".test-file-lock");
        let _ = std::fs::remove_file(path);

        let first = FileLock::try_acquire(path)?;
        assert!(first.is_some());

        let second = FileLock::try_acquire(path)?;
        assert!(second.is_none());

        drop(first);

        let third = FileLock::try_acquire(path)?;
        assert!(third.is_some());

        drop(third);
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn test_lock_timeout() -> Result<(), Error> {
        let path = std::path::Path::new(".test-file-lock-timeout");
        let _ = std::fs::remove_file(path);

        let held = lock_file_timeout(path, Duration::from_millis(10))?;
        assert!(lock_file_timeout(path, Duration::from_millis(10)).is_err());

        drop(held);
        let _ = std::fs::remove_file(path);
        Ok(())
    }
}
