use super::SyncError;
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};
use tracing::{debug, error, trace};

/* Coordination between generations happens purely over the file system:
 * 1. every shared document has exactly one lock file next to it
 * 2. a process opens the lock file and takes an exclusive flock(2) on it
 * 3. the lock is bound to the open file description, so dropping the guard (or the process dying)
 *    releases it
 *
 * flock is advisory, every participant has to go through `LockGuard`.
 */

/// Exclusive advisory lock on a lock file, released when dropped
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Block until the exclusive lock on `path` is held, creating the lock file if needed
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        trace!(path = ?path, "Waiting for lock");

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                // a signal interrupted the wait, keep waiting
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(SyncError::Lock { path, source }),
            }
        }

        debug!(path = ?path, "Acquired lock");

        Ok(Self { file, path })
    }

    /// Take the lock only if nobody holds it right now, `None` otherwise
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>, SyncError> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::EWOULDBLOCK) => {
                    trace!(path = ?path, "Lock is held elsewhere");

                    return Ok(None);
                }
                Err(source) => return Err(SyncError::Lock { path, source }),
            }
        }

        debug!(path = ?path, "Acquired lock without waiting");

        Ok(Some(Self { file, path }))
    }

    fn open(path: &Path) -> Result<File, SyncError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|source| SyncError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            Ok(()) => trace!(path = ?self.path, "Released lock"),
            // closing the descriptor right after this still drops the lock
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to unlock: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LockGuard;
    use nix::{
        errno::Errno,
        fcntl::{flock, FlockArg},
    };
    use std::{fs::OpenOptions, os::unix::io::AsRawFd, path::Path};

    fn try_lock(path: &Path) -> Result<(), Errno> {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
    }

    #[test]
    fn creates_missing_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".slf.lck");

        let _guard = LockGuard::acquire(&path).unwrap();

        assert!(path.is_file());
    }

    #[test]
    fn excludes_other_descriptors_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".slf.lck");

        let guard = LockGuard::acquire(&path).unwrap();
        assert_eq!(try_lock(&path), Err(Errno::EWOULDBLOCK));

        drop(guard);
        assert_eq!(try_lock(&path), Ok(()));
    }

    #[test]
    fn try_acquire_does_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".slot-0.lck");

        let held = LockGuard::try_acquire(&path).unwrap();
        assert!(held.is_some());
        assert!(LockGuard::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(LockGuard::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn released_during_unwind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".slf.lck");
        let inner = path.clone();

        let result = std::thread::spawn(move || {
            let _guard = LockGuard::acquire(&inner).unwrap();
            panic!("generation died while holding the lock");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(try_lock(&path), Ok(()));
    }
}
