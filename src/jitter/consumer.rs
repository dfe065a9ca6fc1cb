//! Reader endpoint: time-gated, in-order dequeue.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::JitterError;
use crate::ring::{self, Header, HEADER_SIZE};

use super::{Metrics, Shared};

/// The single-reader half of a jitter buffer.
///
/// Owns the read cursor; at most one exists per buffer, which is what
/// makes multi-consumer access unrepresentable.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Dequeue up to `elements` elements into `dst`, in ring order.
    ///
    /// Returns 0 until the play gate has latched. Records older than the
    /// maximum length are discarded in passing and counted as skipped;
    /// a concealment record the writer is mid-update on is skipped the
    /// same way. A record drained only partially keeps its tail in the
    /// ring for the next call.
    ///
    /// Returns the element count actually copied, which is short when the
    /// ring runs out of live records. Fails with
    /// [`JitterError::InvalidArgument`] when `dst` is smaller than
    /// `elements * element_size` bytes.
    pub fn dequeue(&mut self, dst: &mut [u8], elements: usize) -> Result<usize, JitterError> {
        let shared = Arc::clone(&self.shared);
        if !shared.play.load(Ordering::Acquire) {
            return Ok(0);
        }

        let element_size = shared.element_size;
        let required = elements * element_size;
        if dst.len() < required {
            return Err(JitterError::invalid_argument(format!(
                "destination too small: was {}, need {}",
                dst.len(),
                required
            )));
        }

        let capacity = shared.ring.capacity();
        let mut produced = 0usize;
        while produced < required {
            if shared.indices.written() < HEADER_SIZE {
                break;
            }

            let header_at = shared.indices.read_offset();
            let header = unsafe { Header::load(shared.ring.ptr_at(header_at)) };
            debug_assert!(header.elements > 0);
            let payload_bytes = header.elements * element_size;

            // A concealment record mid-update belongs to the writer; leave
            // it behind rather than read torn data.
            let mut held = None;
            if header.concealment {
                let flag = unsafe { ring::in_use_flag(shared.ring.ptr_at(header_at)) };
                if flag.swap(1, Ordering::Acquire) == 1 {
                    warn!(
                        "skipping concealment record mid-update: seq={}",
                        header.sequence_number
                    );
                    shared.indices.forward_read(HEADER_SIZE + payload_bytes);
                    shared.indices.sub_elements(header.elements);
                    shared
                        .metrics
                        .skipped_frames
                        .fetch_add(header.elements as u64, Ordering::Relaxed);
                    continue;
                }
                held = Some(flag);
            }

            // Expired records are discarded, never delivered.
            let age = shared.now().saturating_sub(header.timestamp);
            if age >= shared.max_length_ms {
                debug_assert!(header.elements <= shared.packet_elements);
                if let Some(flag) = held {
                    flag.store(0, Ordering::Release);
                }
                shared.indices.forward_read(HEADER_SIZE + payload_bytes);
                shared.indices.sub_elements(header.elements);
                shared
                    .metrics
                    .skipped_frames
                    .fetch_add(header.elements as u64, Ordering::Relaxed);
                continue;
            }

            let to_copy = payload_bytes.min(required - produced);
            let payload_at = (header_at + HEADER_SIZE) % capacity;
            unsafe {
                shared
                    .ring
                    .copy_out(payload_at, &mut dst[produced..produced + to_copy]);
            }
            produced += to_copy;

            if to_copy == payload_bytes {
                // Record fully drained; release before its bytes are freed.
                if let Some(flag) = held {
                    flag.store(0, Ordering::Release);
                }
                shared.indices.forward_read(HEADER_SIZE + payload_bytes);
                continue;
            }

            // Partial drain: the record shrinks from the front, so the
            // header moves forward to sit ahead of the remaining tail.
            let remaining_elements = (payload_bytes - to_copy) / element_size;
            debug_assert!(remaining_elements > 0);
            let moved_header = Header {
                elements: remaining_elements,
                in_use: 0,
                ..header
            };
            let moved_at = (header_at + to_copy) % capacity;
            unsafe { moved_header.store(shared.ring.ptr_at(moved_at)) };
            shared.indices.forward_read(to_copy);

            // Keep the walk chain honest: the record after this one must
            // link back to the shrunken element count.
            let remaining_bytes = remaining_elements * element_size;
            if shared.indices.written() >= 2 * HEADER_SIZE + remaining_bytes {
                let next_at = (moved_at + HEADER_SIZE + remaining_bytes) % capacity;
                let next_flag = unsafe { ring::in_use_flag(shared.ring.ptr_at(next_at)) };
                if next_flag.swap(1, Ordering::Acquire) == 1 {
                    let next = unsafe { Header::load(shared.ring.ptr_at(next_at)) };
                    error!(
                        "cannot repair next record, walks will stop at seq={}",
                        next.sequence_number
                    );
                    shared
                        .dont_walk_beyond
                        .store(u64::from(next.sequence_number), Ordering::Release);
                } else {
                    unsafe {
                        ring::store_previous_elements(
                            shared.ring.ptr_at(next_at),
                            remaining_elements,
                        );
                    }
                    next_flag.store(0, Ordering::Release);
                }
            }

            // A partial drain means the destination is satisfied.
            break;
        }

        debug_assert_eq!(produced % element_size, 0);
        let produced_elements = produced / element_size;
        shared.indices.sub_elements(produced_elements);
        Ok(produced_elements)
    }

    /// Current buffered depth in milliseconds of media.
    pub fn depth_ms(&self) -> u64 {
        self.shared.depth_ms()
    }

    /// Snapshot of the cumulative operation counters.
    pub fn metrics(&self) -> Metrics {
        self.shared.metrics.snapshot()
    }
}
