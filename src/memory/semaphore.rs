//! Counting semaphore that lives in shared memory.
//!
//! The count is a single futex word. Waiters use the shared (non-private)
//! futex operations, so processes that map the word at different addresses
//! still meet on the same kernel wait queue.

use crate::error::Result;
use rustix::io::Errno;
use rustix::thread::futex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// A process-shared counting semaphore.
///
/// Zeroed memory is a valid semaphore with a count of 0.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmSemaphore {
    count: AtomicU32,
}

impl ShmSemaphore {
    /// Create a semaphore with an initial count (for tests and local use).
    pub fn new(value: u32) -> Self {
        Self {
            count: AtomicU32::new(value),
        }
    }

    /// Overwrite the count. Only for (re)initialization.
    pub fn reset(&self, value: u32) {
        self.count.store(value, Ordering::Release);
    }

    /// Current count (a snapshot).
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::AcqRel);
        futex::wake(&self.count, futex::Flags::empty(), 1)?;
        Ok(())
    }

    /// Decrement the count if it is positive, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Block until the count can be decremented.
    pub fn wait(&self) -> Result<()> {
        loop {
            if self.try_wait() {
                return Ok(());
            }
            match futex::wait(&self.count, futex::Flags::empty(), 0, None) {
                Ok(()) | Err(Errno::AGAIN) | Err(Errno::INTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block for at most `timeout`; returns whether the count was decremented.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let ts = futex::Timespec {
                tv_sec: remaining.as_secs() as _,
                tv_nsec: remaining.subsec_nanos() as _,
            };
            match futex::wait(&self.count, futex::Flags::empty(), 0, Some(&ts)) {
                Ok(()) | Err(Errno::AGAIN) | Err(Errno::INTR) | Err(Errno::TIMEDOUT) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
