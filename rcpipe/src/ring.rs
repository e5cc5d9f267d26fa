//! Single-producer single-consumer byte ring with detached head and tail.
//!
//! Positions are virtual (unwrapped) u64 counters that only ever grow; the
//! buffer offset of a position is `position & (capacity - 1)`, so the
//! capacity must be a power of two. `head - tail` is the occupancy.
//!
//! The counters are plain `Cell`s: every mutation happens on the loop
//! thread, including the completion-driven ones (the inbox head advances
//! when the peer's RDMA write completes locally, the outbox tail when the
//! peer's acknowledgement arrives), so no atomics are needed.
//!
//! A peek is a transaction that never moves the tail by itself: the caller
//! walks the returned spans and then either commits the consumed length or
//! simply walks away, leaving the ring untouched. The write path of the
//! connection leans on the cancel side of this: it peeks at bytes it has
//! just produced to hand them to the HCA, but only commits the tail once
//! the peer acknowledges them.

use std::cell::Cell;
use std::io;

use crate::buffer::MappedBuffer;

/// One contiguous stretch of ring memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

/// Up to two contiguous spans; two when the range wraps the ring boundary.
#[derive(Debug, Clone, Copy)]
pub struct Spans {
    pub first: Span,
    pub second: Option<Span>,
}

impl Spans {
    pub fn total_len(&self) -> usize {
        self.first.len + self.second.map_or(0, |s| s.len)
    }

    pub fn iter(&self) -> impl Iterator<Item = Span> {
        std::iter::once(self.first).chain(self.second)
    }
}

pub struct RingBuffer {
    buf: MappedBuffer,
    capacity: u64,
    /// Total bytes ever produced.
    head: Cell<u64>,
    /// Total bytes ever consumed.
    tail: Cell<u64>,
}

impl RingBuffer {
    /// Allocate a ring of `capacity` bytes (must be a power of two) backed
    /// by a fresh anonymous mapping.
    pub fn new(capacity: usize) -> io::Result<Self> {
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");
        Ok(Self {
            buf: MappedBuffer::new(capacity)?,
            capacity: capacity as u64,
            head: Cell::new(0),
            tail: Cell::new(0),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn head(&self) -> u64 {
        self.head.get()
    }

    pub fn tail(&self) -> u64 {
        self.tail.get()
    }

    pub fn occupancy(&self) -> u64 {
        self.head.get() - self.tail.get()
    }

    pub fn free_space(&self) -> u64 {
        self.capacity - self.occupancy()
    }

    /// Base pointer of the backing buffer, for memory region registration.
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Base address of the backing buffer as an integer, for SGE math.
    pub fn base_addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn spans_at(&self, pos: u64, n: u64) -> Spans {
        let offset = (pos & (self.capacity - 1)) as usize;
        let first_len = (n as usize).min(self.capacity as usize - offset);
        let second_len = n as usize - first_len;
        Spans {
            first: Span {
                offset,
                len: first_len,
            },
            second: (second_len > 0).then_some(Span {
                offset: 0,
                len: second_len,
            }),
        }
    }

    /// Claim `n` writable bytes starting at the head, or `None` when the
    /// free space is short. Nothing moves until `produce_commit`.
    pub fn produce_reserve(&self, n: u64) -> Option<Spans> {
        if self.free_space() < n {
            return None;
        }
        Some(self.spans_at(self.head.get(), n))
    }

    /// Advance the head past `n` produced bytes.
    pub fn produce_commit(&self, n: u64) {
        self.head.set(self.head.get() + n);
        debug_assert!(self.occupancy() <= self.capacity);
    }

    /// Look at `n` readable bytes starting `skip` bytes past the tail, or
    /// `None` when `skip + n` exceeds the occupancy. Nothing moves until
    /// `consume_commit`; a caller that walks away cancels the peek.
    pub fn consume_peek(&self, skip: u64, n: u64) -> Option<Spans> {
        if self.occupancy() < skip + n {
            return None;
        }
        Some(self.spans_at(self.tail.get() + skip, n))
    }

    /// Advance the tail past `n` consumed bytes.
    pub fn consume_commit(&self, n: u64) {
        debug_assert!(n <= self.occupancy());
        self.tail.set(self.tail.get() + n);
    }

    /// View one span of ring memory.
    pub fn slice(&self, span: Span) -> &[u8] {
        debug_assert!(span.offset + span.len <= self.capacity as usize);
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr().add(span.offset), span.len) }
    }

    /// Copy `data` into reserved spans. `data.len()` must match the spans.
    pub fn copy_in(&self, spans: &Spans, data: &[u8]) {
        debug_assert_eq!(spans.total_len(), data.len());
        let mut copied = 0;
        for span in spans.iter() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[copied..].as_ptr(),
                    self.buf.as_ptr().add(span.offset),
                    span.len,
                );
            }
            copied += span.len;
        }
    }

    /// Copy peeked spans out into `out`. `out.len()` must match the spans.
    pub fn copy_out(&self, spans: &Spans, out: &mut [u8]) {
        debug_assert_eq!(spans.total_len(), out.len());
        let mut copied = 0;
        for span in spans.iter() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.buf.as_ptr().add(span.offset),
                    out[copied..].as_mut_ptr(),
                    span.len,
                );
            }
            copied += span.len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_ring() {
        let ring = RingBuffer::new(256).unwrap();
        assert_eq!(ring.capacity(), 256);
        assert_eq!(ring.occupancy(), 0);
        assert_eq!(ring.free_space(), 256);
        assert!(ring.consume_peek(0, 1).is_none());
    }

    #[test]
    fn test_produce_consume_roundtrip() {
        let ring = RingBuffer::new(256).unwrap();
        let data = b"hello ring";

        let spans = ring.produce_reserve(data.len() as u64).unwrap();
        ring.copy_in(&spans, data);
        ring.produce_commit(data.len() as u64);
        assert_eq!(ring.occupancy(), data.len() as u64);

        let spans = ring.consume_peek(0, data.len() as u64).unwrap();
        let mut out = vec![0u8; data.len()];
        ring.copy_out(&spans, &mut out);
        ring.consume_commit(data.len() as u64);

        assert_eq!(&out, data);
        assert_eq!(ring.occupancy(), 0);
    }

    #[test]
    fn test_reserve_fails_when_full() {
        let ring = RingBuffer::new(64).unwrap();
        assert!(ring.produce_reserve(65).is_none());
        let spans = ring.produce_reserve(64).unwrap();
        assert_eq!(spans.total_len(), 64);
        ring.produce_commit(64);
        assert!(ring.produce_reserve(1).is_none());
    }

    #[test]
    fn test_wraparound_splits_spans() {
        let ring = RingBuffer::new(64).unwrap();
        // Leave the head 16 bytes before the boundary.
        ring.produce_commit(48);
        ring.consume_commit(48);

        let spans = ring.produce_reserve(32).unwrap();
        assert_eq!(spans.first, Span { offset: 48, len: 16 });
        assert_eq!(spans.second, Some(Span { offset: 0, len: 16 }));

        let data: Vec<u8> = (0..32).collect();
        ring.copy_in(&spans, &data);
        ring.produce_commit(32);

        let spans = ring.consume_peek(0, 32).unwrap();
        let mut out = vec![0u8; 32];
        ring.copy_out(&spans, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn test_peek_with_skip() {
        let ring = RingBuffer::new(64).unwrap();
        let data: Vec<u8> = (0..40).collect();
        let spans = ring.produce_reserve(40).unwrap();
        ring.copy_in(&spans, &data);
        ring.produce_commit(40);

        // Skip over the first 24 bytes as if they were in flight.
        let spans = ring.consume_peek(24, 16).unwrap();
        let mut out = vec![0u8; 16];
        ring.copy_out(&spans, &mut out);
        assert_eq!(out, &data[24..40]);

        // Skip + len beyond occupancy fails.
        assert!(ring.consume_peek(24, 17).is_none());
    }

    #[test]
    fn test_cancelled_peek_leaves_tail() {
        let ring = RingBuffer::new(64).unwrap();
        ring.produce_commit(32);
        let before = ring.tail();
        let _ = ring.consume_peek(0, 32).unwrap();
        // No commit: the peek is cancelled by dropping the spans.
        assert_eq!(ring.tail(), before);
        assert_eq!(ring.occupancy(), 32);
    }

    #[test]
    fn test_direct_commits_track_remote_counters() {
        // The inbox head and outbox tail are advanced directly from
        // completion handlers, without reserve or peek.
        let ring = RingBuffer::new(128).unwrap();
        ring.produce_commit(100);
        assert_eq!(ring.occupancy(), 100);
        ring.consume_commit(60);
        assert_eq!(ring.occupancy(), 40);
        ring.produce_commit(80);
        assert_eq!(ring.occupancy(), 120);
        assert_eq!(ring.free_space(), 8);
    }

    proptest! {
        /// Bytes come out in the order they went in, across arbitrary
        /// interleavings of partial writes and reads, and the counters
        /// never violate `tail <= head <= tail + capacity`.
        #[test]
        fn prop_byte_stream_preserved(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..100), 1..40,
        )) {
            let ring = RingBuffer::new(128).unwrap();
            let mut sent: Vec<u8> = Vec::new();
            let mut received: Vec<u8> = Vec::new();
            let mut pending = chunks.as_slice();
            let mut offset = 0;

            while !pending.is_empty() || ring.occupancy() > 0 {
                // Produce as much of the current chunk as fits.
                if let Some(chunk) = pending.first() {
                    let n = ((chunk.len() - offset) as u64).min(ring.free_space());
                    if n > 0 {
                        let spans = ring.produce_reserve(n).unwrap();
                        ring.copy_in(&spans, &chunk[offset..offset + n as usize]);
                        ring.produce_commit(n);
                        sent.extend_from_slice(&chunk[offset..offset + n as usize]);
                        offset += n as usize;
                    }
                    if offset == chunk.len() {
                        pending = &pending[1..];
                        offset = 0;
                    }
                }

                // Consume whatever is there.
                let n = ring.occupancy();
                if n > 0 {
                    let spans = ring.consume_peek(0, n).unwrap();
                    let mut out = vec![0u8; n as usize];
                    ring.copy_out(&spans, &mut out);
                    ring.consume_commit(n);
                    received.extend_from_slice(&out);
                }

                prop_assert!(ring.tail() <= ring.head());
                prop_assert!(ring.head() - ring.tail() <= ring.capacity());
            }

            prop_assert_eq!(sent, received);
        }
    }
}
