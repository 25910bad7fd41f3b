//! File-based run lock.
//!
//! At most one pipeline run may operate on an output directory at a time, across processes. The
//! lock is a file containing the holder's PID, created exclusively. A lock left behind by a
//! process that no longer exists is reclaimed.

use std::io::Write;

use super::*;

/// Holds the run lock until dropped.
#[derive(Debug)]
pub struct RunLock {
  /// Lock file owned by this process
  path: PathBuf,
}

impl RunLock {
  /// Takes the lock at `path`, or fails with [`DigestError::RunInProgress`] if a live process
  /// holds it.
  pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    for _ in 0..2 {
      match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
          write!(file, "{}", std::process::id())?;
          debug!("Acquired run lock {}", path.display());
          return Ok(Self { path: path.to_path_buf() });
        },
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
          if !Self::is_stale(path) {
            return Err(DigestError::RunInProgress(path.to_path_buf()));
          }
          warn!("Removing stale run lock {}", path.display());
          match std::fs::remove_file(path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
          }
        },
        Err(e) => return Err(e.into()),
      }
    }
    Err(DigestError::RunInProgress(path.to_path_buf()))
  }

  /// [`RunLock::acquire`] on the blocking pool.
  pub async fn acquire_async(path: PathBuf) -> Result<Self> {
    tokio::task::spawn_blocking(move || Self::acquire(path)).await.map_err(std::io::Error::other)?
  }

  /// PID recorded in the lock file at `path`.
  pub fn holder(path: impl AsRef<Path>) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
  }

  /// Whether the lock at `path` was left by a process that is gone.
  pub fn is_stale(path: &Path) -> bool {
    match Self::holder(path) {
      Some(pid) => !process_alive(pid),
      None => true,
    }
  }

  /// Lock file location.
  pub fn path(&self) -> &Path { &self.path }
}

impl Drop for RunLock {
  fn drop(&mut self) {
    if let Err(e) = std::fs::remove_file(&self.path) {
      warn!("Could not release run lock {}: {e}", self.path.display());
    } else {
      debug!("Released run lock {}", self.path.display());
    }
  }
}

/// Signal 0 probes for existence without delivering anything.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
  use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

  let Ok(raw) = i32::try_from(pid) else { return false };
  match kill(Pid::from_raw(raw), None) {
    Ok(()) | Err(Errno::EPERM) => true,
    Err(_) => false,
  }
}

/// Without a portable probe every recorded holder counts as alive.
#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool { true }
