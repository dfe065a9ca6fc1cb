//! Doubly-mapped virtual memory region backing the packet ring.
//!
//! The region exposes `capacity` usable bytes, but the `capacity` bytes of
//! virtual address space immediately following it are a second mapping of
//! the same physical pages. A copy of up to `capacity` contiguous bytes may
//! therefore start at any offset inside the ring without wrap-around
//! handling: whatever runs past the end lands in the mirror, which is the
//! start of the ring.
//!
//! The mapping is built in three steps:
//!
//! 1. Create an anonymous shared file descriptor and size it to `capacity`.
//! 2. Reserve `2 * capacity` bytes of address space with a `PROT_NONE`
//!    anonymous mapping.
//! 3. Map the descriptor twice with `MAP_FIXED`, over each half of the
//!    reservation.
//!
//! Any failure unwinds the descriptor and mappings created so far.

use std::io;
use std::ptr;

use tracing::error;

use crate::error::JitterError;

/// A byte region whose second half mirrors its first.
///
/// All offsets handed to this type must be below [`capacity`], and copies
/// must not exceed [`capacity`] bytes; both are debug-asserted.
///
/// [`capacity`]: VirtualRing::capacity
pub(crate) struct VirtualRing {
    base: *mut u8,
    cap: usize,
    fd: libc::c_int,
}

// The region is plain shared memory; synchronization is the caller's
// problem, exactly as with a `Box<[u8]>` handed across threads.
unsafe impl Send for VirtualRing {}
unsafe impl Sync for VirtualRing {}

impl VirtualRing {
    /// Map a mirrored region of at least `min_capacity` bytes, rounded up
    /// to the page size.
    pub fn new(min_capacity: usize) -> Result<Self, JitterError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let cap = match min_capacity % page {
            0 => min_capacity.max(page),
            rem => min_capacity + page - rem,
        };

        let fd = create_backing_fd()?;
        if unsafe { libc::ftruncate(fd, cap as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(JitterError::ResourceExhaustion(err));
        }

        // Reserve both windows up front so the two fixed maps cannot land on
        // top of unrelated mappings.
        let reserved = unsafe {
            libc::mmap(
                ptr::null_mut(),
                cap * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserved == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(JitterError::ResourceExhaustion(err));
        }
        let base = reserved as *mut u8;

        for window in 0..2 {
            let at = unsafe { base.add(window * cap) };
            let mapped = unsafe {
                libc::mmap(
                    at as *mut libc::c_void,
                    cap,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::munmap(reserved, cap * 2);
                    libc::close(fd);
                }
                return Err(JitterError::ResourceExhaustion(err));
            }
        }

        Ok(Self { base, cap, fd })
    }

    /// Usable capacity in bytes (page-rounded).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Pointer to `offset` within the first window. Reads and writes of up
    /// to [`capacity`](Self::capacity) bytes starting here stay contiguous
    /// thanks to the mirror.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.cap);
        unsafe { self.base.add(offset) }
    }

    /// Copy `src` into the ring at `offset`, running into the mirror if the
    /// copy crosses the boundary.
    ///
    /// Callers must hold the single-writer role for the destination region.
    pub unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        debug_assert!(src.len() <= self.cap);
        ptr::copy_nonoverlapping(src.as_ptr(), self.ptr_at(offset), src.len());
    }

    /// Copy ring bytes starting at `offset` into `dst`.
    ///
    /// Callers must hold the single-reader role for the source region.
    pub unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.cap);
        ptr::copy_nonoverlapping(self.ptr_at(offset), dst.as_mut_ptr(), dst.len());
    }
}

impl Drop for VirtualRing {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.cap * 2) };
        if rc != 0 {
            error!("failed to unmap ring memory: {}", io::Error::last_os_error());
        }
        unsafe { libc::close(self.fd) };
    }
}

/// Anonymous shared descriptor the two windows both map.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_backing_fd() -> Result<libc::c_int, JitterError> {
    let fd = unsafe {
        libc::memfd_create(b"jitter-ring\0".as_ptr() as *const libc::c_char, 0)
    };
    if fd < 0 {
        return Err(JitterError::ResourceExhaustion(io::Error::last_os_error()));
    }
    Ok(fd)
}

/// POSIX shared memory fallback for platforms without `memfd_create`. The
/// object is unlinked immediately so only the descriptor keeps it alive.
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn create_backing_fd() -> Result<libc::c_int, JitterError> {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "/jitter-ring-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let c_name = CString::new(name).expect("shm name contains no interior NUL");

    let fd = unsafe {
        libc::shm_open(
            c_name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(JitterError::ResourceExhaustion(io::Error::last_os_error()));
    }
    unsafe { libc::shm_unlink(c_name.as_ptr()) };
    Ok(fd)
}
