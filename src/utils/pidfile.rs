//! Single-instance guard for the broker daemon.
//!
//! The broker takes an exclusive, non-blocking `flock` on a well-known PID
//! file. A second instance fails with [`Error::AlreadyRunning`] instead of
//! binding a second listener. The lock is released when the guard is dropped
//! or the process exits.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::utils::error::{Error, Result};

pub struct PidFileLock {
    file: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for PidFileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidFileLock").field("path", &self.path).finish()
    }
}

impl PidFileLock {
    /// Open (creating if needed) and lock the PID file.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => Ok(Self { file, path }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(Error::AlreadyRunning(path)),
            Err((_, errno)) => Err(Error::Io(std::io::Error::from(errno))),
        }
    }

    /// Write the current process id into the locked file.
    ///
    /// Called after daemonizing, since forking changes the pid.
    pub fn record_pid(&self) -> Result<()> {
        let mut file: &File = &self.file;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_lock_reports_already_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("popbusd.pid");

        let first = PidFileLock::acquire(&path).expect("first lock");
        match PidFileLock::acquire(&path) {
            Err(Error::AlreadyRunning(p)) => assert_eq!(p, path),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        drop(first);
        assert!(PidFileLock::acquire(&path).is_ok());
    }

    #[test]
    fn record_pid_writes_process_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("popbusd.pid");

        let lock = PidFileLock::acquire(&path).unwrap();
        lock.record_pid().unwrap();

        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
