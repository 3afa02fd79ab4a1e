//! Cross-process file lock.
//!
//! Mutual exclusion between processes sharing one store file, built on
//! exclusive file creation. The lock file holds the owner's process id so a
//! stale lock can be diagnosed by hand.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::StoreError;

/// Default interval between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held lock on a path. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    /// Path of the lock file
    path: PathBuf,
    /// Open handle, closed before the file is removed
    file: Option<File>,
}

impl FileLock {
    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// On timeout the lock is assumed stale (its holder crashed): it is
    /// force-removed and one more attempt is made before giving up with
    /// [`StoreError::LockTimeout`].
    pub fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, StoreError> {
        Self::acquire_with_poll(path, timeout, DEFAULT_POLL_INTERVAL)
    }

    /// Acquire the lock with a custom poll interval.
    pub fn acquire_with_poll(
        path: impl Into<PathBuf>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let start = Instant::now();
        let mut contended = false;

        loop {
            match try_create(&path) {
                Ok(file) => {
                    if contended {
                        tracing::debug!(
                            path = %path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "Acquired contended lock"
                        );
                    }
                    return Ok(Self { path, file: Some(file) });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    contended = true;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }

            if start.elapsed() >= timeout {
                break;
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            std::thread::sleep(poll_interval.min(remaining));
        }

        let holder = read_holder(&path);
        tracing::warn!(
            path = %path.display(),
            holder = holder.as_deref().unwrap_or("unknown"),
            "Lock acquisition timed out, removing stale lock"
        );

        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale lock");
            }
        }

        match try_create(&path) {
            Ok(file) => Ok(Self { path, file: Some(file) }),
            Err(_) => Err(StoreError::LockTimeout { path, waited: start.elapsed() }),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        // Close before unlinking.
        if self.file.take().is_none() {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Exclusively create the lock file and stamp it with our pid.
fn try_create(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    // Diagnostic only; a failed write still leaves a valid lock.
    let _ = writeln!(file, "{}", std::process::id());
    let _ = file.flush();
    Ok(file)
}

/// Read the pid recorded by the current holder, if any.
fn read_holder(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
