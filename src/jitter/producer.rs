//! Writer endpoint: enqueue, gap concealment, and late-packet update.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::JitterError;
use crate::ring::{self, Header, HEADER_SIZE};

use super::{ConcealmentPacket, Metrics, Packet, Shared};

/// The single-writer half of a jitter buffer.
///
/// Owns the write cursor and the sequence bookkeeping; at most one exists
/// per buffer, which is what makes multi-producer access unrepresentable.
pub struct Producer {
    shared: Arc<Shared>,
    /// Highest sequence number ever written, widened so `last + 1` cannot
    /// overflow. `None` until the first packet lands.
    last_written: Option<u64>,
    /// Element count of the most recently written record, the first link of
    /// the backwards walk chain.
    latest_written_elements: usize,
}

impl Producer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            last_written: None,
            latest_written_elements: 0,
        }
    }

    /// Enqueue `packets` in order.
    ///
    /// A gap in sequence numbers synthesizes concealment records whose
    /// payloads `conceal` fills in place; a packet at or below the last
    /// written sequence number becomes an in-place update of the slot it
    /// was concealed into. After the batch, a playing buffer below its
    /// minimum depth is topped back up with concealment, and the play gate
    /// is latched once the depth first reaches 1.5x the minimum.
    ///
    /// Returns the total element count enqueued, counting concealment as
    /// enqueued and updates as the elements they replaced. Packets that do
    /// not fit are dropped with a warning and end the batch early.
    ///
    /// Fails with [`JitterError::InvalidArgument`] (before touching the
    /// ring) when any packet's element count or byte length does not match
    /// the configured packet shape.
    pub fn enqueue<F>(
        &mut self,
        packets: &[Packet<'_>],
        mut conceal: F,
    ) -> Result<usize, JitterError>
    where
        F: FnMut(&mut [ConcealmentPacket<'_>]),
    {
        let shared = Arc::clone(&self.shared);

        for packet in packets {
            if packet.elements != shared.packet_elements {
                return Err(JitterError::invalid_argument(format!(
                    "packet elements must match the configured count: got {}, expected {}",
                    packet.elements, shared.packet_elements
                )));
            }
            if packet.data.len() != packet.elements * shared.element_size {
                return Err(JitterError::invalid_argument(format!(
                    "packet length must be elements * element size: got {}, expected {}",
                    packet.data.len(),
                    packet.elements * shared.element_size
                )));
            }
        }

        let mut enqueued = 0usize;
        for packet in packets {
            let sequence = u64::from(packet.sequence_number);
            match self.last_written {
                // At or below the last written sequence: a candidate update
                // for a slot we concealed earlier.
                Some(last) if sequence <= last => {
                    enqueued += self.update(packet);
                    continue;
                }
                // A discontinuity: conceal the missing range first.
                Some(last) if sequence > last + 1 => {
                    let concealed =
                        self.generate_concealment((sequence - last - 1) as usize, &mut conceal);
                    shared
                        .metrics
                        .concealed_frames
                        .fetch_add(concealed as u64, Ordering::Relaxed);
                    enqueued += concealed;
                }
                _ => {}
            }

            let copied = self.copy_packet(packet);
            if copied == 0 && packet.elements > 0 {
                warn!(
                    "no space left in ring, dropping packet: seq={}",
                    packet.sequence_number
                );
                break;
            }
            enqueued += copied;
            self.last_written = Some(sequence);
        }

        // Once playing, never let the depth sag below the minimum: top it
        // back up with concealment attributed to the fill counter.
        let depth = shared.depth_ms();
        if shared.play.load(Ordering::Acquire) && depth < shared.min_length_ms {
            let gap = shared.min_length_ms - depth;
            let packet_ms =
                shared.packet_elements as u64 * 1000 / u64::from(shared.clock_rate_hz);
            let to_fill = gap.div_ceil(packet_ms) as usize;
            let filled = self.generate_concealment(to_fill, &mut conceal);
            shared
                .metrics
                .filled_packets
                .fetch_add(filled as u64, Ordering::Relaxed);
            enqueued += filled;
        }

        // Latch the play gate at 1.5x the minimum depth.
        if !shared.play.load(Ordering::Acquire) && shared.depth_ms() * 2 >= shared.min_length_ms * 3
        {
            shared.play.store(true, Ordering::Release);
        }

        Ok(enqueued)
    }

    /// Pre-conceal the gap up to (but not including) `sequence_number`,
    /// for callers that know a future sequence number before its packet
    /// arrives.
    ///
    /// Returns the element count concealed; 0 when nothing has been
    /// written yet, when the sequence is not ahead of the last written
    /// packet, or when it is merely the next one expected.
    pub fn prepare<F>(&mut self, sequence_number: u32, mut conceal: F) -> usize
    where
        F: FnMut(&mut [ConcealmentPacket<'_>]),
    {
        let Some(last) = self.last_written else {
            return 0;
        };
        let sequence = u64::from(sequence_number);
        if sequence <= last + 1 {
            // Either a potential update or the next expected packet.
            return 0;
        }

        let concealed = self.generate_concealment((sequence - last - 1) as usize, &mut conceal);
        self.shared
            .metrics
            .concealed_frames
            .fetch_add(concealed as u64, Ordering::Relaxed);
        concealed
    }

    /// Current buffered depth in milliseconds of media.
    pub fn depth_ms(&self) -> u64 {
        self.shared.depth_ms()
    }

    /// Snapshot of the cumulative operation counters.
    pub fn metrics(&self) -> Metrics {
        self.shared.metrics.snapshot()
    }

    /// Write one record of real data. Returns the elements written, or 0
    /// when the record does not fit.
    fn copy_packet(&mut self, packet: &Packet<'_>) -> usize {
        let shared = Arc::clone(&self.shared);
        let total = HEADER_SIZE + packet.data.len();
        if shared.indices.free() < total {
            return 0;
        }

        let header = Header {
            sequence_number: packet.sequence_number,
            elements: packet.elements,
            timestamp: shared.now(),
            concealment: false,
            in_use: 0,
            previous_elements: self.latest_written_elements,
        };

        let write_offset = shared.indices.write_offset();
        let capacity = shared.ring.capacity();
        unsafe {
            header.store(shared.ring.ptr_at(write_offset));
            shared
                .ring
                .copy_in((write_offset + HEADER_SIZE) % capacity, packet.data);
        }

        self.latest_written_elements = packet.elements;
        // Publish header and payload together.
        shared.indices.forward_write(total);
        shared.indices.add_elements(packet.elements);
        packet.elements
    }

    /// Synthesize up to `missing` concealment records, let `conceal` fill
    /// their payloads in place, then publish them as a batch. Returns the
    /// element count produced.
    fn generate_concealment<F>(&mut self, missing: usize, conceal: &mut F) -> usize
    where
        F: FnMut(&mut [ConcealmentPacket<'_>]),
    {
        let Some(last) = self.last_written else {
            return 0;
        };
        if missing == 0 {
            return 0;
        }

        let shared = Arc::clone(&self.shared);
        let record_bytes = shared.record_bytes();
        let fits = shared.indices.free() / record_bytes;
        let to_conceal = missing.min(fits);
        if to_conceal != missing {
            warn!(
                "not all missing packets fit, concealing {}/{}",
                to_conceal, missing
            );
        }
        if to_conceal == 0 {
            return 0;
        }

        let capacity = shared.ring.capacity();
        let packet_bytes = shared.packet_bytes();
        let mut offset = shared.indices.write_offset();
        let mut previous = self.latest_written_elements;
        let mut slots: Vec<ConcealmentPacket<'_>> = Vec::with_capacity(to_conceal);
        for index in 0..to_conceal {
            let header = Header {
                sequence_number: (last + 1 + index as u64) as u32,
                elements: shared.packet_elements,
                timestamp: shared.now(),
                concealment: true,
                in_use: 0,
                previous_elements: previous,
            };
            previous = header.elements;
            unsafe { header.store(shared.ring.ptr_at(offset)) };

            let payload_at = (offset + HEADER_SIZE) % capacity;
            // The slot borrows the unpublished payload region; the borrow
            // ends before the records become visible to the reader.
            let data = unsafe {
                std::slice::from_raw_parts_mut(shared.ring.ptr_at(payload_at), packet_bytes)
            };
            slots.push(ConcealmentPacket {
                sequence_number: header.sequence_number,
                data,
            });
            offset = (offset + record_bytes) % capacity;
        }

        conceal(&mut slots);
        drop(slots);

        // The callback has returned; publish the batch.
        shared.indices.forward_write(to_conceal * record_bytes);
        shared
            .indices
            .add_elements(to_conceal * shared.packet_elements);
        self.last_written = Some(last + to_conceal as u64);
        self.latest_written_elements = shared.packet_elements;
        to_conceal * shared.packet_elements
    }

    /// Walk the written region backwards to the slot holding
    /// `packet.sequence_number` and, if it is still concealment and not
    /// being read, overwrite its payload with the real data. Returns the
    /// elements written into the slot.
    fn update(&self, packet: &Packet<'_>) -> usize {
        let shared = &self.shared;
        let capacity = shared.ring.capacity();
        let element_size = shared.element_size;
        let target = packet.sequence_number;

        let mut remaining = shared.indices.written();
        let mut offset = shared.indices.write_offset();

        // Step back onto the head record.
        let head = self.latest_written_elements * element_size + HEADER_SIZE;
        if head > remaining {
            warn!(
                "update target already consumed: seq={}, have {} bytes, head is {}",
                target, remaining, head
            );
            shared
                .metrics
                .update_missed_frames
                .fetch_add(packet.elements as u64, Ordering::Relaxed);
            return 0;
        }
        remaining -= head;
        offset = (offset + capacity - head) % capacity;

        loop {
            let header = unsafe { Header::load(shared.ring.ptr_at(offset)) };
            if header.sequence_number == target {
                break;
            }

            let flag = unsafe { ring::in_use_flag(shared.ring.ptr_at(offset)) };
            if flag.swap(1, Ordering::Acquire) == 1 {
                warn!(
                    "walk blocked by in-use record: seq={}, at={}",
                    target, header.sequence_number
                );
                return 0;
            }
            if u64::from(header.sequence_number) <= shared.dont_walk_beyond.load(Ordering::Acquire)
            {
                warn!(
                    "walk stopped at repair marker: seq={}, at={}",
                    target, header.sequence_number
                );
                flag.store(0, Ordering::Release);
                return 0;
            }

            let step = header.previous_elements * element_size + HEADER_SIZE;
            if step > remaining {
                // Walked past the oldest live record; the slot is gone.
                warn!("update target not found: seq={}", target);
                flag.store(0, Ordering::Release);
                shared
                    .metrics
                    .update_missed_frames
                    .fetch_add(packet.elements as u64, Ordering::Relaxed);
                return 0;
            }
            offset = (offset + capacity - step) % capacity;
            remaining -= step;
            flag.store(0, Ordering::Release);
        }

        // Found the slot; take it before touching the payload.
        let flag = unsafe { ring::in_use_flag(shared.ring.ptr_at(offset)) };
        if flag.swap(1, Ordering::Acquire) == 1 {
            warn!("update raced with the reader: seq={}", target);
            return 0;
        }
        let header = unsafe { Header::load(shared.ring.ptr_at(offset)) };
        if !header.concealment {
            debug!("slot already holds real data: seq={}", target);
            flag.store(0, Ordering::Release);
            return 0;
        }
        if packet.elements < header.elements {
            warn!(
                "update smaller than the remaining slot: seq={}, got {}, slot holds {}",
                target, packet.elements, header.elements
            );
            flag.store(0, Ordering::Release);
            return 0;
        }

        // The reader may have drained the head of this slot already; the
        // header says how many elements remain, so supply the packet tail.
        let skip = (packet.elements - header.elements) * element_size;
        let payload_at = (offset + HEADER_SIZE) % capacity;
        unsafe {
            shared.ring.copy_in(payload_at, &packet.data[skip..]);
            ring::store_concealment(shared.ring.ptr_at(offset), false);
        }
        flag.store(0, Ordering::Release);

        shared
            .metrics
            .updated_frames
            .fetch_add(header.elements as u64, Ordering::Relaxed);
        header.elements
    }
}

#[cfg(test)]
mod tests {
    use super::super::{JitterBuffer, JitterBufferConfig};
    use super::*;
    use crate::jitter::Consumer;

    fn endpoints() -> (Producer, Consumer) {
        JitterBuffer::new(JitterBufferConfig::default())
            .unwrap()
            .split()
    }

    fn payload(seq: u32, bytes: usize) -> Vec<u8> {
        vec![seq as u8; bytes]
    }

    fn packet<'a>(seq: u32, data: &'a [u8]) -> Packet<'a> {
        Packet {
            sequence_number: seq,
            data,
            elements: data.len() / 4,
        }
    }

    #[test]
    fn test_enqueue_updates_indices() {
        let (mut producer, _consumer) = endpoints();
        let data = payload(1, 1920);
        let enqueued = producer
            .enqueue(&[packet(1, &data)], |_| panic!("unexpected concealment"))
            .unwrap();
        assert_eq!(enqueued, 480);

        let shared = &producer.shared;
        let expected_bytes = HEADER_SIZE + 1920;
        assert_eq!(shared.indices.written(), expected_bytes);
        assert_eq!(shared.indices.read_offset(), 0);
        assert_eq!(shared.indices.write_offset(), expected_bytes);
        assert_eq!(shared.indices.written_elements(), 480);

        // The payload sits right after the header.
        let mut stored = vec![0u8; 1920];
        unsafe { shared.ring.copy_out(HEADER_SIZE, &mut stored) };
        assert_eq!(stored, data);
    }

    #[test]
    fn test_concealment_writes_records_in_place() {
        let (mut producer, _consumer) = endpoints();
        let first = payload(1, 1920);
        producer
            .enqueue(&[packet(1, &first)], |_| panic!("unexpected concealment"))
            .unwrap();

        // Sequence 4 conceals 2 and 3 before landing.
        let fourth = payload(4, 1920);
        let enqueued = producer
            .enqueue(&[packet(4, &fourth)], |packets| {
                assert_eq!(packets.len(), 2);
                for (index, concealment) in packets.iter_mut().enumerate() {
                    assert_eq!(concealment.sequence_number, 2 + index as u32);
                    assert_eq!(concealment.data.len(), 1920);
                    let seq = concealment.sequence_number as u8;
                    concealment.data.fill(seq);
                }
            })
            .unwrap();
        assert_eq!(enqueued, 3 * 480);

        // All four records sit back to back, payloads intact.
        let shared = &producer.shared;
        let record = shared.record_bytes();
        for slot in 0..4u32 {
            let offset = slot as usize * record;
            let header = unsafe { Header::load(shared.ring.ptr_at(offset)) };
            assert_eq!(header.sequence_number, slot + 1);
            assert_eq!(header.elements, 480);
            assert_eq!(header.concealment, slot == 1 || slot == 2);

            let mut stored = vec![0u8; 1920];
            unsafe { shared.ring.copy_out(offset + HEADER_SIZE, &mut stored) };
            assert!(stored.iter().all(|&b| b == (slot + 1) as u8));
        }
    }

    #[test]
    fn test_walk_chain_links_previous_elements() {
        let (mut producer, _consumer) = endpoints();
        let first = payload(1, 1920);
        producer
            .enqueue(&[packet(1, &first)], |_| {})
            .unwrap();
        let third = payload(3, 1920);
        producer
            .enqueue(&[packet(3, &third)], |packets| {
                for concealment in packets.iter_mut() {
                    concealment.data.fill(0);
                }
            })
            .unwrap();

        let shared = &producer.shared;
        let record = shared.record_bytes();
        let first_header = unsafe { Header::load(shared.ring.ptr_at(0)) };
        let second_header = unsafe { Header::load(shared.ring.ptr_at(record)) };
        let third_header = unsafe { Header::load(shared.ring.ptr_at(2 * record)) };
        assert_eq!(first_header.previous_elements, 0);
        assert_eq!(second_header.previous_elements, 480);
        assert_eq!(third_header.previous_elements, 480);
    }

    #[test]
    fn test_update_overwrites_the_right_slot() {
        let (mut producer, _consumer) = endpoints();
        let first = payload(1, 1920);
        producer
            .enqueue(&[packet(1, &first)], |_| panic!("unexpected concealment"))
            .unwrap();
        let third = payload(3, 1920);
        producer
            .enqueue(&[packet(3, &third)], |packets| {
                assert_eq!(packets.len(), 1);
                assert_eq!(packets[0].sequence_number, 2);
                packets[0].data.fill(0);
            })
            .unwrap();

        let real = payload(2, 1920);
        let enqueued = producer
            .enqueue(&[packet(2, &real)], |_| panic!("unexpected concealment"))
            .unwrap();
        assert_eq!(enqueued, 480);

        let shared = &producer.shared;
        let record = shared.record_bytes();
        let header = unsafe { Header::load(shared.ring.ptr_at(record)) };
        assert_eq!(header.sequence_number, 2);
        assert_eq!(header.elements, 480);
        assert!(!header.concealment);

        let mut stored = vec![0u8; 1920];
        unsafe { shared.ring.copy_out(record + HEADER_SIZE, &mut stored) };
        assert_eq!(stored, real);
        assert_eq!(producer.metrics().updated_frames, 480);
    }

    #[test]
    fn test_concealment_caps_at_free_space() {
        let (mut producer, _consumer) = endpoints();
        let first = payload(1, 1920);
        producer
            .enqueue(&[packet(1, &first)], |_| {})
            .unwrap();

        // Demand far more concealment than the ring can hold; the produced
        // slots must be a contiguous prefix of the missing range.
        let capacity = producer.shared.ring.capacity();
        let record = producer.shared.record_bytes();
        let fits = (capacity - producer.shared.indices.written()) / record;
        let mut seen = Vec::new();
        let concealed = producer.prepare(1 + fits as u32 + 50, |packets| {
            for concealment in packets.iter_mut() {
                seen.push(concealment.sequence_number);
                concealment.data.fill(0);
            }
        });
        assert_eq!(concealed, fits * 480);
        let expected: Vec<u32> = (2..2 + fits as u32).collect();
        assert_eq!(seen, expected);
        assert!(producer.shared.indices.written() <= capacity);
    }
}
