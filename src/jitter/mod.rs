//! Jitter buffer core: configuration, value types, shared state, and the
//! producer/consumer split.
//!
//! [`JitterBuffer::new`] sizes and maps the ring for the configured maximum
//! length; [`JitterBuffer::split`] hands out the two endpoints. The
//! [`Producer`] owns the write side (enqueue, concealment, late-packet
//! update) and the [`Consumer`] owns the read side (time-gated dequeue).
//! Holding each side in exactly one place is what enforces the
//! single-producer / single-consumer contract.

mod consumer;
mod producer;

pub use consumer::Consumer;
pub use producer::Producer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::JitterError;
use crate::ring::vm::VirtualRing;
use crate::ring::{RingIndices, HEADER_SIZE};

/// A sequence-numbered packet of fixed-rate media handed to
/// [`Producer::enqueue`].
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    /// Monotonically increasing packet sequence number.
    pub sequence_number: u32,
    /// Payload bytes, exactly `elements * element_size` long.
    pub data: &'a [u8],
    /// Number of elements in the payload.
    pub elements: usize,
}

/// A placeholder for a lost packet, handed to the concealment callback.
///
/// `data` borrows the payload region of the synthesized record directly
/// from the ring; the callback fills it in place. The borrow ends when the
/// callback returns, so the pointers cannot be retained or freed.
#[derive(Debug)]
pub struct ConcealmentPacket<'a> {
    /// Sequence number of the gap slot being filled.
    pub sequence_number: u32,
    /// Payload region inside the ring, `packet_elements * element_size`
    /// bytes long.
    pub data: &'a mut [u8],
}

/// Milliseconds on the system wall clock; the default record clock.
fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Construction parameters for a [`JitterBuffer`].
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Size of one element in bytes, e.g. 4 for 16-bit stereo samples.
    pub element_size: usize,
    /// Elements per packet; every enqueued packet must carry exactly this
    /// many.
    pub packet_elements: usize,
    /// Clock rate of the contained elements in Hz, e.g. 48000 for 48kHz
    /// audio.
    pub clock_rate_hz: u32,
    /// Maximum buffer length. Sizes the ring; records older than this are
    /// discarded on dequeue.
    pub max_length: Duration,
    /// Minimum buffer depth. Playback starts once the depth reaches 1.5x
    /// this, and enqueue tops a playing buffer back up to it with
    /// concealment.
    pub min_length: Duration,
    /// Millisecond clock used to stamp and age records. Injectable so tests
    /// can drive aging without sleeping.
    pub now_ms: fn() -> u64,
}

impl Default for JitterBufferConfig {
    /// 48kHz media in 10ms packets of 4-byte elements, 100ms maximum, no
    /// minimum hold.
    fn default() -> Self {
        Self {
            element_size: 4,
            packet_elements: 480,
            clock_rate_hz: 48_000,
            max_length: Duration::from_millis(100),
            min_length: Duration::ZERO,
            now_ms: wall_clock_ms,
        }
    }
}

/// Cumulative operation counters, snapshotted by [`Producer::metrics`] and
/// [`Consumer::metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Elements synthesized to cover gaps between arriving sequence
    /// numbers.
    pub concealed_frames: u64,
    /// Elements passed over on dequeue because the record expired or was
    /// mid-update.
    pub skipped_frames: u64,
    /// Elements synthesized to top a playing buffer back up to the minimum
    /// depth.
    pub filled_packets: u64,
    /// Concealed elements later overwritten with real data by a late
    /// packet.
    pub updated_frames: u64,
    /// Elements of late packets whose slot was already consumed or lost a
    /// race.
    pub update_missed_frames: u64,
}

/// Atomic cells behind [`Metrics`], so snapshots are safe from any thread.
pub(crate) struct MetricCells {
    pub concealed_frames: AtomicU64,
    pub skipped_frames: AtomicU64,
    pub filled_packets: AtomicU64,
    pub updated_frames: AtomicU64,
    pub update_missed_frames: AtomicU64,
}

impl MetricCells {
    fn new() -> Self {
        Self {
            concealed_frames: AtomicU64::new(0),
            skipped_frames: AtomicU64::new(0),
            filled_packets: AtomicU64::new(0),
            updated_frames: AtomicU64::new(0),
            update_missed_frames: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Metrics {
        Metrics {
            concealed_frames: self.concealed_frames.load(Ordering::Relaxed),
            skipped_frames: self.skipped_frames.load(Ordering::Relaxed),
            filled_packets: self.filled_packets.load(Ordering::Relaxed),
            updated_frames: self.updated_frames.load(Ordering::Relaxed),
            update_missed_frames: self.update_missed_frames.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the two endpoints.
pub(crate) struct Shared {
    pub ring: VirtualRing,
    pub indices: RingIndices,
    pub element_size: usize,
    pub packet_elements: usize,
    pub clock_rate_hz: u32,
    pub max_length_ms: u64,
    pub min_length_ms: u64,
    pub now_ms: fn() -> u64,
    /// One-shot play gate; latches true when the depth first reaches
    /// 1.5x the minimum length.
    pub play: AtomicBool,
    /// Sticky marker set by the reader when it cannot repair a next
    /// header; the writer's walk stops at or before this sequence.
    pub dont_walk_beyond: AtomicU64,
    pub metrics: MetricCells,
}

impl Shared {
    /// Payload bytes in one full packet.
    #[inline]
    pub fn packet_bytes(&self) -> usize {
        self.packet_elements * self.element_size
    }

    /// Ring bytes one full record occupies.
    #[inline]
    pub fn record_bytes(&self) -> usize {
        HEADER_SIZE + self.packet_bytes()
    }

    /// Current depth in milliseconds of media.
    pub fn depth_ms(&self) -> u64 {
        self.indices.written_elements() as u64 * 1000 / u64::from(self.clock_rate_hz)
    }

    /// Current time on the injected clock.
    #[inline]
    pub fn now(&self) -> u64 {
        (self.now_ms)()
    }
}

/// A jitter buffer for fixed-rate packetized media.
///
/// Split it into its two endpoints before use:
///
/// ```
/// use jitter_buffer::{JitterBuffer, JitterBufferConfig};
///
/// let buffer = JitterBuffer::new(JitterBufferConfig::default()).unwrap();
/// let (mut producer, mut consumer) = buffer.split();
/// # let _ = (&mut producer, &mut consumer);
/// ```
pub struct JitterBuffer {
    shared: Arc<Shared>,
}

impl JitterBuffer {
    /// Allocate a buffer sized to hold `max_length` of media.
    ///
    /// Fails with [`JitterError::InvalidArgument`] when `max_length` is
    /// zero, when the element size is zero, when the clock rate is below
    /// 1kHz, or when one packet spans less than a millisecond; with
    /// [`JitterError::ResourceExhaustion`] when the ring mapping cannot be
    /// created.
    pub fn new(config: JitterBufferConfig) -> Result<Self, JitterError> {
        if config.element_size == 0 {
            return Err(JitterError::invalid_argument(
                "element size must be greater than zero",
            ));
        }
        // Capacity sizing counts elements per millisecond of clock, so a
        // sub-kilohertz rate would truncate the ring to nothing.
        if config.clock_rate_hz < 1000 {
            return Err(JitterError::invalid_argument(
                "clock rate must be at least 1000 Hz",
            ));
        }
        if config.max_length.is_zero() {
            return Err(JitterError::invalid_argument(
                "max length must be greater than zero",
            ));
        }
        let packet_ms =
            config.packet_elements as u64 * 1000 / u64::from(config.clock_rate_hz);
        if packet_ms < 1 {
            return Err(JitterError::invalid_argument(
                "packets must span at least one millisecond",
            ));
        }

        let max_length_ms = config.max_length.as_millis() as u64;
        let min_length_ms = config.min_length.as_millis() as u64;
        let capacity = max_length_ms as usize
            * (config.clock_rate_hz / 1000) as usize
            * (config.element_size + HEADER_SIZE);

        let ring = VirtualRing::new(capacity)?;
        let capacity = ring.capacity();
        debug!("allocated jitter buffer: {} bytes", capacity);

        Ok(Self {
            shared: Arc::new(Shared {
                ring,
                indices: RingIndices::new(capacity),
                element_size: config.element_size,
                packet_elements: config.packet_elements,
                clock_rate_hz: config.clock_rate_hz,
                max_length_ms,
                min_length_ms,
                now_ms: config.now_ms,
                play: AtomicBool::new(false),
                dont_walk_beyond: AtomicU64::new(0),
                metrics: MetricCells::new(),
            }),
        })
    }

    /// Split into the single-writer and single-reader endpoints. Each side
    /// may be moved to its own thread.
    pub fn split(self) -> (Producer, Consumer) {
        let consumer = Consumer::new(Arc::clone(&self.shared));
        let producer = Producer::new(self.shared);
        (producer, consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_max_length() {
        let config = JitterBufferConfig {
            max_length: Duration::ZERO,
            ..JitterBufferConfig::default()
        };
        assert!(matches!(
            JitterBuffer::new(config),
            Err(JitterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_sub_millisecond_packets() {
        let config = JitterBufferConfig {
            packet_elements: 10,
            clock_rate_hz: 48_000,
            ..JitterBufferConfig::default()
        };
        assert!(matches!(
            JitterBuffer::new(config),
            Err(JitterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_sub_kilohertz_clock() {
        // 500 Hz would lose its whole elements-per-millisecond factor to
        // integer truncation and size a ring far smaller than max_length.
        let config = JitterBufferConfig {
            element_size: 1,
            packet_elements: 4,
            clock_rate_hz: 500,
            ..JitterBufferConfig::default()
        };
        assert!(matches!(
            JitterBuffer::new(config),
            Err(JitterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_zero_element_size() {
        let config = JitterBufferConfig {
            element_size: 0,
            ..JitterBufferConfig::default()
        };
        assert!(matches!(
            JitterBuffer::new(config),
            Err(JitterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_split_hands_out_both_sides() {
        let buffer = JitterBuffer::new(JitterBufferConfig::default()).unwrap();
        let (producer, consumer) = buffer.split();
        assert_eq!(producer.depth_ms(), 0);
        assert_eq!(consumer.depth_ms(), 0);
        assert_eq!(producer.metrics(), Metrics::default());
    }

    #[test]
    fn test_endpoints_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Producer>();
        assert_send::<Consumer>();
    }
}
