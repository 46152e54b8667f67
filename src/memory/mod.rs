//! Shared memory primitives.
//!
//! - [`SharedSegment`]: the file-backed mapping every process opens
//! - [`SegmentLock`]: whole-segment lock (local mutex + `flock`)
//! - [`ShmSemaphore`]: futex counting semaphore placed inside the mapping

mod lock;
mod segment;
mod semaphore;

pub use lock::{SegmentLock, SegmentLockGuard};
pub use segment::{SEGMENT_FILE_NAME, SharedSegment};
pub use semaphore::ShmSemaphore;
