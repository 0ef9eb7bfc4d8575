// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Exclusive run lock so overlapping invocations cannot interleave
//!
//! The lock is released when the guard is dropped or the process exits. The
//! file itself is left in place and only records the holder's PID.

use crate::error::{AgentError, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct RunLock {
    path: PathBuf,
    #[cfg(unix)]
    file: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    file: File,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

impl RunLock {
    /// Take the lock without waiting. Fails with `AgentError::Lock` if it is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut lock = Self::open_exclusive(path)?;
        lock.record_pid()?;
        tracing::debug!(path = %path.display(), "Run lock acquired");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn open_exclusive(path: &Path) -> Result<Self> {
        use nix::fcntl::{Flock, FlockArg};

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            AgentError::Lock(format!("{} ({errno})", path.display()))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    #[cfg(not(unix))]
    fn open_exclusive(path: &Path) -> Result<Self> {
        use std::os::windows::fs::OpenOptionsExt;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .share_mode(0)
            .open(path)
            .map_err(|e| AgentError::Lock(format!("{} ({e})", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn record_pid(&mut self) -> Result<()> {
        let file: &mut File = &mut self.file;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(())
    }
}
