//! Jitter buffer for fixed-rate, packetized media.
//!
//! # Overview
//!
//! This crate absorbs short-term arrival-time variance and reordering in a
//! stream of sequence-numbered packets and delivers a smooth, time-gated
//! byte stream to a single consumer at the playback clock. It is built
//! around two pieces:
//!
//! 1. A lock-free, SPSC (Single-Producer, Single-Consumer) ring buffer
//!    holding `[header | payload]` records in doubly-mapped virtual memory,
//!    so copies never split at the wrap-around point
//! 2. A policy layer on top: loss concealment filled in place by the
//!    caller, in-window replacement of concealed data when the real packet
//!    arrives late, age-based discard, partial reads, and a one-shot play
//!    gate that holds playback until enough media has buffered
//!
//! # Key Features
//!
//! - Lock-free coordination between one writer and one reader thread
//! - Zero-copy concealment: gap payloads are synthesized directly in the
//!   ring and handed to a synchronous callback to fill
//! - Late packets overwrite the concealment slot they displaced, found by
//!   walking the ring backwards over per-record links
//! - Per-record `in_use` flags arbitrate writer-update against reader
//!   races; whichever side loses backs off and counts a metric
//! - Expired records are skipped at dequeue time, never delivered
//!
//! # Usage
//!
//! Construct a [`JitterBuffer`], split it, and move each endpoint to its
//! thread:
//!
//! ```
//! use jitter_buffer::{JitterBuffer, JitterBufferConfig, Packet};
//!
//! let buffer = JitterBuffer::new(JitterBufferConfig::default()).unwrap();
//! let (mut producer, mut consumer) = buffer.split();
//!
//! let payload = vec![0u8; 1920];
//! let packet = Packet { sequence_number: 1, data: &payload, elements: 480 };
//! producer.enqueue(&[packet], |gaps| {
//!     for gap in gaps.iter_mut() {
//!         gap.data.fill(0); // silence for lost packets
//!     }
//! }).unwrap();
//!
//! let mut out = vec![0u8; 1920];
//! let dequeued = consumer.dequeue(&mut out, 480).unwrap();
//! assert_eq!(dequeued, 480);
//! ```

#![deny(missing_docs)]

mod error;
mod jitter;
mod ring;

pub use error::JitterError;
pub use jitter::{
    ConcealmentPacket, Consumer, JitterBuffer, JitterBufferConfig, Metrics, Packet, Producer,
};
