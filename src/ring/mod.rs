//! Record format and index bookkeeping for the packet ring.
//!
//! The ring stores variable-length `[header | payload]` records back to
//! back. Each header carries the packet sequence number, the element count
//! still held by the record, the enqueue timestamp, the concealment flag,
//! a one-byte `in_use` flag coordinating the writer's update walk with the
//! reader, and the element count of the preceding record so the writer can
//! walk the ring backwards.
//!
//! [`RingIndices`] tracks the read and write cursors plus the published
//! byte and element counts shared between the two sides.

pub(crate) mod vm;

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Fixed prefix written before every payload in the ring.
///
/// Headers land at element-aligned (not pointer-aligned) offsets, so they
/// are always copied in and out with unaligned reads and writes. The
/// `in_use` byte in a copied header is a snapshot only; coordination goes
/// through [`in_use_flag`] on the in-ring byte.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct Header {
    /// Sequence number of the packet this record holds.
    pub sequence_number: u32,
    /// Payload elements remaining in this record; shrinks on partial reads.
    pub elements: usize,
    /// Enqueue time in milliseconds.
    pub timestamp: u64,
    /// True while the record holds synthesized data not yet replaced.
    pub concealment: bool,
    /// Held by whichever of writer-update or reader is mutating the record.
    pub in_use: u8,
    /// Element count of the record immediately before this one in ring
    /// order; 0 for the first record ever written.
    pub previous_elements: usize,
}

/// Bytes every record spends on its header.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header>();

impl Header {
    /// Copy the header stored at `ptr`.
    pub unsafe fn load(ptr: *const u8) -> Header {
        ptr::read_unaligned(ptr as *const Header)
    }

    /// Store this header at `ptr`.
    pub unsafe fn store(self, ptr: *mut u8) {
        ptr::write_unaligned(ptr as *mut Header, self);
    }
}

/// Atomic view of the `in_use` byte of the header stored at `header_ptr`.
///
/// Acquired with `swap(1, Acquire)`, released with `store(0, Release)`;
/// whichever side finds the flag already set backs off.
pub(crate) unsafe fn in_use_flag<'a>(header_ptr: *mut u8) -> &'a AtomicU8 {
    AtomicU8::from_ptr(header_ptr.add(mem::offset_of!(Header, in_use)))
}

/// Rewrite only the `previous_elements` field of the header at `header_ptr`.
///
/// Used by the reader to repair the walk chain after a partial read; the
/// caller must hold that header's `in_use` flag.
pub(crate) unsafe fn store_previous_elements(header_ptr: *mut u8, elements: usize) {
    let at = header_ptr.add(mem::offset_of!(Header, previous_elements));
    ptr::write_unaligned(at as *mut usize, elements);
}

/// Rewrite only the `concealment` field of the header at `header_ptr`.
///
/// Used by the writer when an update lands real data in a concealed slot;
/// the caller must hold that header's `in_use` flag.
pub(crate) unsafe fn store_concealment(header_ptr: *mut u8, concealment: bool) {
    let at = header_ptr.add(mem::offset_of!(Header, concealment));
    ptr::write_unaligned(at as *mut bool, concealment);
}

/// Read and write cursors plus the published-byte accounting shared between
/// the producer and the consumer.
///
/// Each cursor is advanced by exactly one side and read with relaxed
/// ordering; `written` is the publication point, released by whichever side
/// produced the change and acquired by the observer. `written_elements` is
/// advisory and feeds the depth computation.
pub(crate) struct RingIndices {
    cap: usize,
    read_offset: CachePadded<AtomicUsize>,
    write_offset: CachePadded<AtomicUsize>,
    written: CachePadded<AtomicUsize>,
    written_elements: CachePadded<AtomicUsize>,
}

impl RingIndices {
    /// Fresh indices for a ring of `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            read_offset: CachePadded::new(AtomicUsize::new(0)),
            write_offset: CachePadded::new(AtomicUsize::new(0)),
            written: CachePadded::new(AtomicUsize::new(0)),
            written_elements: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Current read cursor, always in `[0, cap)`.
    #[inline]
    pub fn read_offset(&self) -> usize {
        self.read_offset.load(Ordering::Relaxed)
    }

    /// Current write cursor, always in `[0, cap)`.
    #[inline]
    pub fn write_offset(&self) -> usize {
        self.write_offset.load(Ordering::Relaxed)
    }

    /// Bytes currently published and unconsumed.
    #[inline]
    pub fn written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    /// Payload elements currently published and unconsumed.
    #[inline]
    pub fn written_elements(&self) -> usize {
        self.written_elements.load(Ordering::Acquire)
    }

    /// Bytes of free space left in the ring.
    #[inline]
    pub fn free(&self) -> usize {
        self.cap - self.written()
    }

    /// Publish `n` freshly written bytes and advance the write cursor.
    /// The release pairs with the reader's acquire of [`written`].
    ///
    /// [`written`]: RingIndices::written
    pub fn forward_write(&self, n: usize) {
        let offset = self.write_offset.load(Ordering::Relaxed);
        self.write_offset
            .store((offset + n) % self.cap, Ordering::Relaxed);
        let before = self.written.fetch_add(n, Ordering::Release);
        debug_assert!(before + n <= self.cap);
    }

    /// Consume `n` bytes and advance the read cursor, freeing the space for
    /// the writer.
    pub fn forward_read(&self, n: usize) {
        debug_assert!(n <= self.cap);
        let offset = self.read_offset.load(Ordering::Relaxed);
        self.read_offset
            .store((offset + n) % self.cap, Ordering::Relaxed);
        let before = self.written.fetch_sub(n, Ordering::Release);
        debug_assert!(before >= n);
    }

    /// Credit `n` published payload elements.
    pub fn add_elements(&self, n: usize) {
        self.written_elements.fetch_add(n, Ordering::Release);
    }

    /// Debit `n` consumed or discarded payload elements.
    pub fn sub_elements(&self, n: usize) {
        let before = self.written_elements.fetch_sub(n, Ordering::Release);
        debug_assert!(before >= n);
    }
}
