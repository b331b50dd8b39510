// SPDX-License-Identifier: MPL-2.0

//! Advisory file-lock discipline with shared/exclusive modes (spec.md C3).
//!
//! A [`ResourceLock`] wraps a single file under a known locks directory and
//! arbitrates access both across processes (via `flock(2)`, through `nix`)
//! and within one process (via an in-process [`tokio::sync::Notify`] that lets
//! a writer ask shared holders in the same process to drop their hold before
//! blocking on the OS-level upgrade). Cross-process coordination is the OS
//! lock's job; the `Notify` only shortens the common case where the
//! contending holders are tasks of the same orchestrator.

use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use fs_err as fs;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;
use tokio::sync::Notify;

/// Shared (read-only) or exclusive (read-write) lock discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    None,
    Shared,
    Exclusive,
}

/// Coordinates acquisition of one named resource lock.
///
/// One `ResourceLock` is shared (via `Clone`) by every task in the process
/// that wants to contend for the same underlying path; each clone sees the
/// same in-process held-state and the same release signal.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    path: PathBuf,
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    held: std::sync::Mutex<Held>,
    exclusive: AtomicBool,
    release_requested: Notify,
}

/// An acquired lock. Dropping it releases the OS-level lock and updates the
/// in-process held-state so waiting peers can proceed.
pub struct Guard {
    file: fs::File,
    mode: Mode,
    inner: Arc<Inner>,
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("mode", &self.mode).finish()
    }
}

impl ResourceLock {
    /// Open (creating if needed) the lock file at `path`. Does not acquire.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Self {
            path,
            inner: Arc::new(Inner {
                held: std::sync::Mutex::new(Held::None),
                exclusive: AtomicBool::new(false),
                release_requested: Notify::new(),
            }),
        })
    }

    /// Is some holder (in this process) currently holding the lock exclusively?
    pub fn is_locked_exclusive(&self) -> bool {
        self.inner.exclusive.load(AtomicOrdering::SeqCst)
    }

    /// Ask in-process shared holders to drop their lock before a blocking
    /// exclusive acquisition proceeds.
    pub fn signal_peers(&self) {
        self.inner.release_requested.notify_waiters();
    }

    /// Acquire `mode`. If `blocking` is false, an incompatible peer holding
    /// the lock returns [`Error::Busy`] immediately; a same-process holder
    /// already owning an incompatible mode returns [`Error::Refused`]
    /// without touching the OS lock. If `blocking` is true, peers are first
    /// signalled via [`Self::signal_peers`] and the call waits on the OS lock.
    pub fn acquire(&self, mode: Mode, blocking: bool) -> Result<Guard, Error> {
        {
            let held = self.inner.held.lock().expect("lock poisoned");
            let incompatible = match (*held, mode) {
                (Held::None, _) => false,
                (Held::Shared, Mode::Shared) => false,
                (Held::Shared, Mode::Exclusive) => true,
                (Held::Exclusive, _) => true,
            };
            if incompatible && !blocking {
                return Err(Error::Refused);
            }
        }

        let file = fs::OpenOptions::new().create(true).write(true).truncate(false).open(&self.path)?;

        let (nonblocking_arg, blocking_arg) = match mode {
            Mode::Shared => (FlockArg::LockSharedNonblock, FlockArg::LockShared),
            Mode::Exclusive => (FlockArg::LockExclusiveNonblock, FlockArg::LockExclusive),
        };

        match flock(file.as_raw_fd(), nonblocking_arg) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                if !blocking {
                    return Err(Error::Busy);
                }
                self.signal_peers();
                flock(file.as_raw_fd(), blocking_arg)?;
            }
            Err(e) => return Err(Error::Flock(e)),
        }

        *self.inner.held.lock().expect("lock poisoned") = match mode {
            Mode::Shared => Held::Shared,
            Mode::Exclusive => Held::Exclusive,
        };
        if mode == Mode::Exclusive {
            self.inner.exclusive.store(true, AtomicOrdering::SeqCst);
        }

        Ok(Guard {
            file,
            mode,
            inner: self.inner.clone(),
        })
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::UnlockNonblock);
        *self.inner.held.lock().expect("lock poisoned") = Held::None;
        if self.mode == Mode::Exclusive {
            self.inner.exclusive.store(false, AtomicOrdering::SeqCst);
        }
        self.inner.release_requested.notify_waiters();
    }
}

impl Guard {
    pub fn mode(&self) -> Mode {
        self.mode
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("obtaining file lock")]
    Flock(#[source] nix::Error),
    #[error("lock is held by an incompatible peer")]
    Busy,
    #[error("this holder already owns a conflicting lock")]
    Refused,
}

impl From<nix::Error> for Error {
    fn from(error: nix::Error) -> Self {
        Error::Flock(error)
    }
}

/// Convenience for naming the per-root lock file under the advisory locks
/// directory described in spec.md §6.
pub fn resource_path(locks_dir: impl AsRef<Path>, name: &str) -> PathBuf {
    locks_dir.as_ref().join(format!("{name}.lock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_are_compatible() {
        let dir = tempfile_dir();
        let lock = ResourceLock::open(dir.join("shared.lock")).unwrap();

        let g1 = lock.acquire(Mode::Shared, false).unwrap();
        let g2 = lock.acquire(Mode::Shared, false).unwrap();
        assert!(!lock.is_locked_exclusive());
        drop(g1);
        drop(g2);
    }

    #[test]
    fn exclusive_refuses_same_holder_conflict() {
        let dir = tempfile_dir();
        let lock = ResourceLock::open(dir.join("exclusive.lock")).unwrap();

        let _g1 = lock.acquire(Mode::Exclusive, false).unwrap();
        assert!(lock.is_locked_exclusive());

        let err = lock.acquire(Mode::Shared, false).unwrap_err();
        assert!(matches!(err, Error::Refused));
    }

    #[test]
    fn release_drops_exclusive_flag() {
        let dir = tempfile_dir();
        let lock = ResourceLock::open(dir.join("release.lock")).unwrap();

        let guard = lock.acquire(Mode::Exclusive, false).unwrap();
        assert!(lock.is_locked_exclusive());
        drop(guard);
        assert!(!lock.is_locked_exclusive());
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("entropy-lock-test-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        dir
    }
}
