//! Property tests for the jitter buffer invariants.

use std::time::Duration;

use jitter_buffer::{JitterBuffer, JitterBufferConfig, Packet};
use proptest::collection::vec;
use proptest::prelude::*;

const ELEMENT_SIZE: usize = 4;
const PACKET_ELEMENTS: usize = 480;
const PACKET_BYTES: usize = ELEMENT_SIZE * PACKET_ELEMENTS;

fn config() -> JitterBufferConfig {
    JitterBufferConfig {
        element_size: ELEMENT_SIZE,
        packet_elements: PACKET_ELEMENTS,
        clock_rate_hz: 48_000,
        max_length: Duration::from_millis(100),
        min_length: Duration::ZERO,
        ..JitterBufferConfig::default()
    }
}

/// One step the harness can take against the buffer.
#[derive(Debug, Clone)]
enum Op {
    /// Enqueue this many consecutive packets.
    Enqueue(usize),
    /// Dequeue this many elements.
    Dequeue(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..3).prop_map(Op::Enqueue),
        (1usize..600).prop_map(Op::Dequeue),
    ]
}

proptest! {
    /// Consecutive packets with distinct payloads come back out as their
    /// exact concatenation once the play gate has latched.
    #[test]
    fn round_trip_preserves_bytes(count in 1usize..9) {
        let (mut producer, mut consumer) = JitterBuffer::new(config()).unwrap().split();

        let mut expected = Vec::new();
        for seq in 1..=count as u32 {
            let data = vec![seq as u8; PACKET_BYTES];
            expected.extend_from_slice(&data);
            let enqueued = producer
                .enqueue(
                    &[Packet { sequence_number: seq, data: &data, elements: PACKET_ELEMENTS }],
                    |_| panic!("unexpected concealment"),
                )
                .unwrap();
            prop_assert_eq!(enqueued, PACKET_ELEMENTS);
        }

        let mut out = vec![0u8; count * PACKET_BYTES];
        let dequeued = consumer.dequeue(&mut out, count * PACKET_ELEMENTS).unwrap();
        prop_assert_eq!(dequeued, count * PACKET_ELEMENTS);
        prop_assert_eq!(out, expected);
    }

    /// However large the gap, the concealed range is a contiguous prefix of
    /// the missing sequences, capped at what fits.
    #[test]
    fn concealment_is_a_prefix_of_the_gap(gap in 1u32..100) {
        let (mut producer, _consumer) = JitterBuffer::new(config()).unwrap().split();

        let first = vec![1u8; PACKET_BYTES];
        producer
            .enqueue(
                &[Packet { sequence_number: 1, data: &first, elements: PACKET_ELEMENTS }],
                |_| panic!("unexpected concealment"),
            )
            .unwrap();

        let late_seq = 2 + gap;
        let late = vec![late_seq as u8; PACKET_BYTES];
        let mut seen = Vec::new();
        producer
            .enqueue(
                &[Packet { sequence_number: late_seq, data: &late, elements: PACKET_ELEMENTS }],
                |packets| {
                    for concealment in packets.iter_mut() {
                        seen.push(concealment.sequence_number);
                        concealment.data.fill(concealment.sequence_number as u8);
                    }
                },
            )
            .unwrap();

        prop_assert!(seen.len() <= gap as usize);
        let expected: Vec<u32> = (2..2 + seen.len() as u32).collect();
        prop_assert_eq!(&seen, &expected);
        prop_assert_eq!(
            producer.metrics().concealed_frames,
            seen.len() as u64 * PACKET_ELEMENTS as u64
        );
    }

    /// Under arbitrary interleavings of enqueue and dequeue, output bytes
    /// never regress: every payload byte is its packet's sequence number,
    /// so ring order means a non-decreasing byte stream whatever gets
    /// dropped or concealed along the way.
    #[test]
    fn interleaved_ops_keep_ring_order(ops in vec(op_strategy(), 1..40)) {
        let (mut producer, mut consumer) = JitterBuffer::new(config()).unwrap().split();

        let mut next_seq = 1u32;
        let mut last_byte: Option<u8> = None;
        for op in ops {
            match op {
                Op::Enqueue(count) => {
                    for _ in 0..count {
                        let data = vec![next_seq as u8; PACKET_BYTES];
                        producer
                            .enqueue(
                                &[Packet {
                                    sequence_number: next_seq,
                                    data: &data,
                                    elements: PACKET_ELEMENTS,
                                }],
                                |packets| {
                                    for concealment in packets.iter_mut() {
                                        let seq = concealment.sequence_number as u8;
                                        concealment.data.fill(seq);
                                    }
                                },
                            )
                            .unwrap();
                        next_seq += 1;
                    }
                }
                Op::Dequeue(elements) => {
                    let mut out = vec![0u8; elements * ELEMENT_SIZE];
                    let dequeued = consumer.dequeue(&mut out, elements).unwrap();
                    prop_assert!(dequeued <= elements);
                    for &byte in &out[..dequeued * ELEMENT_SIZE] {
                        if let Some(last) = last_byte {
                            prop_assert!(byte >= last);
                        }
                        last_byte = Some(byte);
                    }
                }
            }
        }
    }
}
