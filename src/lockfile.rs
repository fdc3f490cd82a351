//! Advisory file locks.
//!
//! Two callers need exactly this primitive: the experiment-root lockfile
//! (one experiment process at a time, per the data model's ownership
//! section) and the per-repo-key clone lock used by the workspace manager
//! to guarantee at-most-one concurrent clone. Both use OS-advisory locks
//! that release automatically when the file descriptor closes, so a crash
//! can never leave a stale lock behind (per the "scoped resources" design
//! note).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::fcntl::{flock, FlockArg};
use nix::libc::EWOULDBLOCK;
use std::os::unix::io::AsRawFd;

/// A held advisory lock on a file. Dropping this releases the lock.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to acquire an exclusive lock on `path` without blocking.
    /// Returns `Ok(None)` if another process currently holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lockfile(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self {
                _file: file,
                path: path.to_path_buf(),
            })),
            Err(nix::errno::Errno::EWOULDBLOCK) => Ok(None),
            Err(e) if e as i32 == EWOULDBLOCK => Ok(None),
            Err(e) => Err(e).context(format!("flock {}", path.display())),
        }
    }

    /// Acquire an exclusive lock, blocking until it becomes available.
    pub fn acquire_blocking(path: &Path) -> Result<Self> {
        let file = open_lockfile(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .with_context(|| format!("flock (blocking) {}", path.display()))?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lockfile(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating lockfile parent dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening lockfile {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_nonblocking_acquire_fails_while_first_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        let first = FileLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        let second = FileLock::try_acquire(&path).unwrap();
        assert!(second.is_none(), "second acquire should fail while held");
        drop(first);
        let third = FileLock::try_acquire(&path).unwrap();
        assert!(third.is_some(), "lock should release when dropped");
    }
}
