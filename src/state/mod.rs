//! The shared resource table and its lock discipline.
//!
//! [`SharedState`] owns the mapping. Every access to the lock-protected part
//! goes through a [`StateGuard`], which runs the validator when taken and, if
//! anything was written, refreshes the checksum and content version before
//! the lock is released. The semaphores in [`SignalTable`] are reached through
//! [`SharedState::signals`] without the lock.

mod checksum;
mod layout;
mod queue;
mod validate;

pub use checksum::{crc32, resource_checksum};
pub use layout::{
    FORMAT_VERSION, MAX_QUEUE_NODES, MAX_RESOURCES, NO_INDEX, NotifyEvent, NotifyPhase,
    NotifySems, NotifyState, QueueNode, ResourceRecord, SEGMENT_MAGIC, SEGMENT_SIZE,
    SIGNAL_OFFSET, SegmentHeader, SharedRequest, SignalTable, StateTable,
};
pub use queue::PendingIter;
pub use validate::{ValidationReport, initialize, process_alive, validate};

use crate::config::Config;
use crate::error::Result;
use crate::memory::{SegmentLockGuard, SharedSegment};
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// A mapped segment together with the config used to (re)initialize it.
pub struct SharedState {
    segment: SharedSegment,
    config: Config,
}

impl SharedState {
    /// Map the segment at `path` and validate it once.
    ///
    /// A fresh (zero-filled) file fails the magic check and is initialized
    /// from `config` under the lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::SegmentUnavailable`] if the file cannot be
    /// opened or mapped, or a system error if it cannot be locked.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        let segment = SharedSegment::open(path, SEGMENT_SIZE)?;
        let state = Self { segment, config };
        drop(state.lock()?);
        Ok(state)
    }

    /// Take the segment lock and validate the table.
    pub fn lock(&self) -> Result<StateGuard<'_>> {
        let lock = self.segment.lock()?;
        let table = self.segment.as_ptr().cast::<StateTable>();

        // SAFETY: the mapping is SEGMENT_SIZE bytes, page aligned, and the
        // lock just taken excludes every other writer.
        let report = validate(
            unsafe { &mut *table },
            self.signals(),
            &self.config,
            process_alive,
        );

        Ok(StateGuard {
            table,
            dirty: report.changed(),
            report,
            _lock: lock,
        })
    }

    /// Semaphores of the segment.
    pub fn signals(&self) -> &SignalTable {
        // SAFETY: SIGNAL_OFFSET is 64-byte aligned and the table fits in the
        // mapping (checked at compile time). All fields are atomics.
        unsafe { &*self.segment.as_ptr().add(SIGNAL_OFFSET).cast::<SignalTable>() }
    }

    /// Config used on reset.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.segment.path()
    }
}

/// Exclusive access to the [`StateTable`].
///
/// Mutable access marks the table dirty; a dirty table gets a new checksum
/// and content version when the guard drops.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct StateGuard<'a> {
    table: *mut StateTable,
    dirty: bool,
    report: ValidationReport,
    _lock: SegmentLockGuard<'a>,
}

impl StateGuard<'_> {
    /// What validation did when this guard was taken.
    pub fn report(&self) -> &ValidationReport {
        &self.report
    }
}

impl Deref for StateGuard<'_> {
    type Target = StateTable;

    fn deref(&self) -> &StateTable {
        // SAFETY: valid for the guard's lifetime; the lock is held.
        unsafe { &*self.table }
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut StateTable {
        self.dirty = true;
        // SAFETY: as above, and `&mut self` makes this the only reference.
        unsafe { &mut *self.table }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if self.dirty {
            // SAFETY: the lock is still held; `_lock` drops after this body.
            let table = unsafe { &mut *self.table };
            table.header.content_version = table.header.content_version.wrapping_add(1);
            table.header.checksum = resource_checksum(&table.resources);
        }
    }
}
