//! Whole-segment mutual exclusion.
//!
//! `flock` excludes other open file descriptions, which covers other
//! processes and other handles in this process. Threads sharing one handle
//! share one open file description, so a process-local mutex is taken first.

use crate::error::Result;
use rustix::fd::BorrowedFd;
use rustix::fs::FlockOperation;
use rustix::io::Errno;
use std::sync::{Mutex, MutexGuard};

/// Advisory exclusive lock over a segment's backing file.
#[derive(Debug, Default)]
pub struct SegmentLock {
    local: Mutex<()>,
}

impl SegmentLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until both the local mutex and the file lock are held.
    ///
    /// # Errors
    ///
    /// Returns the `flock` error if `fd` is unusable.
    pub fn acquire<'a>(&'a self, fd: BorrowedFd<'a>) -> Result<SegmentLockGuard<'a>> {
        // A panic while holding the lock leaves nothing half-written that the
        // validator would not repair, so poisoning is ignored.
        let local = self.local.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match rustix::fs::flock(fd, FlockOperation::LockExclusive) {
                Ok(()) => break,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(SegmentLockGuard { fd, _local: local })
    }
}

/// Held lock; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SegmentLockGuard<'a> {
    fd: BorrowedFd<'a>,
    _local: MutexGuard<'a, ()>,
}

impl Drop for SegmentLockGuard<'_> {
    fn drop(&mut self) {
        // File lock first; the local mutex is released when `_local` drops.
        let _ = rustix::fs::flock(self.fd, FlockOperation::Unlock);
    }
}
