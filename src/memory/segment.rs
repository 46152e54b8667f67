//! File-backed shared segment.
//!
//! Every participating process maps the same file, so the file path is the
//! rendezvous point. The mapping may land at a different address in each
//! process; nothing stored inside it may be a pointer.

use super::lock::{SegmentLock, SegmentLockGuard};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// File name of the segment inside the runtime directory.
pub const SEGMENT_FILE_NAME: &str = "essrmgr";

/// A shared, memory-mapped file guarded by a whole-file lock.
///
/// # Example
///
/// ```rust,ignore
/// use resmgr::memory::SharedSegment;
///
/// let segment = SharedSegment::open(SharedSegment::default_path()?, 16 * 1024)?;
/// let guard = segment.lock()?;
/// // read or write through segment.as_ptr() while the guard lives
/// ```
pub struct SharedSegment {
    /// File descriptor of the backing file.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the mapping.
    len: usize,
    /// Path of the backing file.
    path: PathBuf,
    /// Cross-process lock on `fd`.
    lock: SegmentLock,
}

impl SharedSegment {
    /// `${XDG_RUNTIME_DIR}/essrmgr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentUnavailable`] if `XDG_RUNTIME_DIR` is unset or empty.
    pub fn default_path() -> Result<PathBuf> {
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir).join(SEGMENT_FILE_NAME)),
            _ => Err(Error::SegmentUnavailable(
                "XDG_RUNTIME_DIR is not set".into(),
            )),
        }
    }

    /// Open (creating if absent) and map a segment of `size` bytes.
    ///
    /// A newly created or short file is grown with `ftruncate`, so fresh
    /// content is all zeroes. The file is made readable and writable by
    /// everyone, since unrelated processes must be able to join.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentUnavailable`] if the file cannot be opened,
    /// sized or mapped.
    pub fn open<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |what: &str, e: rustix::io::Errno| {
            Error::SegmentUnavailable(format!("{what} {}: {e}", path.display()))
        };

        if size == 0 {
            return Err(Error::SegmentUnavailable(
                "size must be greater than 0".into(),
            ));
        }

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o666),
        )
        .map_err(|e| unavailable("open", e))?;

        // umask strips group/other write on creation. Files owned by another
        // user already have the right mode and refuse the chmod.
        if let Err(e) = rustix::fs::fchmod(&fd, Mode::from_raw_mode(0o666)) {
            tracing::trace!("fchmod {}: {}", path.display(), e);
        }

        let current = rustix::fs::fstat(&fd)
            .map_err(|e| unavailable("stat", e))?
            .st_size;
        if (current as u64) < size as u64 {
            rustix::fs::ftruncate(&fd, size as u64).map_err(|e| unavailable("resize", e))?;
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| unavailable("map", e))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::SegmentUnavailable("mmap returned null".into()))?;

        tracing::debug!("mapped {} bytes of {}", size, path.display());

        Ok(Self {
            fd,
            ptr,
            len: size,
            path: path.to_path_buf(),
            lock: SegmentLock::new(),
        })
    }

    /// Acquire the cross-process lock, blocking until it is granted.
    ///
    /// # Errors
    ///
    /// Fails only if the descriptor is unusable.
    pub fn lock(&self) -> Result<SegmentLockGuard<'_>> {
        self.lock.acquire(self.fd.as_fd())
    }

    /// Start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-sized segments are rejected at open.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is automatically closed when OwnedFd is dropped
    }
}

// SAFETY: the mapping is process-shared memory with no thread affinity; all
// access to it goes through the segment lock or through atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl AsFd for SharedSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
