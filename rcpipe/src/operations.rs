//! Per-request read and write state machines.
//!
//! Each queued operation carries a cursor and drains bytes from the inbox
//! (or into the outbox) across possibly many calls, because the data it
//! needs may arrive across several remote writes and ring wraparounds.
//! Operations never touch the network themselves; the connection turns
//! their progress reports into acknowledgements and RDMA writes.

use crate::error::{Error, Result};
use crate::ring::RingBuffer;

/// Size of the little-endian length prefix of framed operations.
pub(crate) const FRAME_PREFIX_SIZE: usize = 4;

pub(crate) type ChunkCallback = Box<dyn FnOnce(Result<&[u8]>)>;
pub(crate) type BufferCallback = Box<dyn FnOnce(Result<Vec<u8>>)>;
pub(crate) type WriteCallback = Box<dyn FnOnce(Result<()>)>;

enum ReadMode {
    /// Deliver the next available contiguous chunk, whatever its size.
    Unsized { data: Vec<u8>, done: bool, cb: ChunkCallback },
    /// Fill the caller's buffer completely, then hand it back.
    Sized {
        buf: Vec<u8>,
        filled: usize,
        cb: BufferCallback,
    },
    /// Decode a length prefix, then deliver exactly that many bytes.
    Framed { state: FrameState, cb: ChunkCallback },
}

enum FrameState {
    Prefix { bytes: [u8; FRAME_PREFIX_SIZE], filled: usize },
    Payload { data: Vec<u8>, filled: usize },
}

pub(crate) struct ReadOperation {
    seq: u64,
    mode: ReadMode,
}

impl ReadOperation {
    pub(crate) fn unsized_chunk(seq: u64, cb: ChunkCallback) -> Self {
        Self {
            seq,
            mode: ReadMode::Unsized {
                data: Vec::new(),
                done: false,
                cb,
            },
        }
    }

    pub(crate) fn sized(seq: u64, buf: Vec<u8>, cb: BufferCallback) -> Self {
        Self {
            seq,
            mode: ReadMode::Sized {
                buf,
                filled: 0,
                cb,
            },
        }
    }

    pub(crate) fn framed(seq: u64, cb: ChunkCallback) -> Self {
        Self {
            seq,
            mode: ReadMode::Framed {
                state: FrameState::Prefix {
                    bytes: [0; FRAME_PREFIX_SIZE],
                    filled: 0,
                },
                cb,
            },
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Drain whatever the inbox can contribute right now. Returns the
    /// bytes consumed (to be acknowledged) and, for framed reads, an
    /// operation-level error when the length prefix is implausible. The
    /// consumed count is valid either way: an erroring frame still ate its
    /// prefix.
    pub(crate) fn handle_read(&mut self, inbox: &RingBuffer) -> (u64, Option<Error>) {
        match &mut self.mode {
            ReadMode::Unsized { data, done, .. } => {
                if *done {
                    return (0, None);
                }
                let available = inbox.occupancy();
                if available == 0 {
                    return (0, None);
                }
                let Some(spans) = inbox.consume_peek(0, available) else {
                    return (0, None);
                };
                // One contiguous chunk per unsized read; a wrapped inbox
                // yields the remainder to the next read.
                let first = spans.first;
                data.resize(first.len, 0);
                data.copy_from_slice(inbox.slice(first));
                inbox.consume_commit(first.len as u64);
                *done = true;
                (first.len as u64, None)
            }
            ReadMode::Sized { buf, filled, .. } => {
                let want = (buf.len() - *filled) as u64;
                let take = want.min(inbox.occupancy());
                if take == 0 {
                    return (0, None);
                }
                let Some(spans) = inbox.consume_peek(0, take) else {
                    return (0, None);
                };
                inbox.copy_out(&spans, &mut buf[*filled..*filled + take as usize]);
                inbox.consume_commit(take);
                *filled += take as usize;
                (take, None)
            }
            ReadMode::Framed { state, .. } => {
                let mut consumed = 0u64;
                if let FrameState::Prefix { bytes, filled } = state {
                    let want = (FRAME_PREFIX_SIZE - *filled) as u64;
                    let take = want.min(inbox.occupancy());
                    if take > 0 {
                        if let Some(spans) = inbox.consume_peek(0, take) {
                            inbox.copy_out(&spans, &mut bytes[*filled..*filled + take as usize]);
                            inbox.consume_commit(take);
                            *filled += take as usize;
                            consumed += take;
                        }
                    }
                    if *filled < FRAME_PREFIX_SIZE {
                        return (consumed, None);
                    }
                    let length = u32::from_le_bytes(*bytes) as u64;
                    let max = inbox.capacity() - FRAME_PREFIX_SIZE as u64;
                    if length > max {
                        return (consumed, Some(Error::FrameTooLarge { length, max }));
                    }
                    *state = FrameState::Payload {
                        data: vec![0; length as usize],
                        filled: 0,
                    };
                }
                if let FrameState::Payload { data, filled } = state {
                    let want = (data.len() - *filled) as u64;
                    let take = want.min(inbox.occupancy());
                    if take > 0 {
                        if let Some(spans) = inbox.consume_peek(0, take) {
                            inbox.copy_out(&spans, &mut data[*filled..*filled + take as usize]);
                            inbox.consume_commit(take);
                            *filled += take as usize;
                            consumed += take;
                        }
                    }
                }
                (consumed, None)
            }
        }
    }

    pub(crate) fn completed(&self) -> bool {
        match &self.mode {
            ReadMode::Unsized { done, .. } => *done,
            ReadMode::Sized { buf, filled, .. } => *filled == buf.len(),
            ReadMode::Framed { state, .. } => match state {
                FrameState::Prefix { .. } => false,
                FrameState::Payload { data, filled } => *filled == data.len(),
            },
        }
    }

    /// Invoke the callback with the delivered bytes.
    pub(crate) fn succeed(self) {
        match self.mode {
            ReadMode::Unsized { data, cb, .. } => cb(Ok(&data)),
            ReadMode::Sized { buf, cb, .. } => cb(Ok(buf)),
            ReadMode::Framed { state, cb } => match state {
                FrameState::Payload { data, .. } => cb(Ok(&data)),
                FrameState::Prefix { .. } => cb(Ok(&[])),
            },
        }
    }

    /// Invoke the callback with an error.
    pub(crate) fn fail(self, err: Error) {
        match self.mode {
            ReadMode::Unsized { cb, .. } => cb(Err(err)),
            ReadMode::Sized { cb, .. } => cb(Err(err)),
            ReadMode::Framed { cb, .. } => cb(Err(err)),
        }
    }
}

pub(crate) struct WriteOperation {
    seq: u64,
    data: Vec<u8>,
    written: usize,
    cb: WriteCallback,
}

impl WriteOperation {
    pub(crate) fn raw(seq: u64, data: Vec<u8>, cb: WriteCallback) -> Self {
        Self {
            seq,
            data,
            written: 0,
            cb,
        }
    }

    /// A framed write is a raw write of the length prefix followed by the
    /// payload.
    pub(crate) fn framed(seq: u64, payload: Vec<u8>, cb: WriteCallback) -> Self {
        let mut data = Vec::with_capacity(FRAME_PREFIX_SIZE + payload.len());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);
        Self {
            seq,
            data,
            written: 0,
            cb,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Copy as many remaining bytes as fit into the outbox. Returns the
    /// number of bytes produced this call.
    pub(crate) fn handle_write(&mut self, outbox: &RingBuffer) -> u64 {
        let remaining = (self.data.len() - self.written) as u64;
        let take = remaining.min(outbox.free_space());
        if take == 0 {
            return 0;
        }
        let Some(spans) = outbox.produce_reserve(take) else {
            return 0;
        };
        outbox.copy_in(&spans, &self.data[self.written..self.written + take as usize]);
        outbox.produce_commit(take);
        self.written += take as usize;
        take
    }

    pub(crate) fn completed(&self) -> bool {
        self.written == self.data.len()
    }

    pub(crate) fn succeed(self) {
        (self.cb)(Ok(()))
    }

    pub(crate) fn fail(self, err: Error) {
        (self.cb)(Err(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fill(ring: &RingBuffer, data: &[u8]) {
        let spans = ring.produce_reserve(data.len() as u64).unwrap();
        ring.copy_in(&spans, data);
        ring.produce_commit(data.len() as u64);
    }

    #[test]
    fn test_unsized_read_takes_first_chunk() {
        let ring = RingBuffer::new(64).unwrap();
        fill(&ring, b"hello");

        let delivered = Rc::new(RefCell::new(Vec::new()));
        let delivered2 = delivered.clone();
        let mut op = ReadOperation::unsized_chunk(
            0,
            Box::new(move |r| delivered2.borrow_mut().extend_from_slice(r.unwrap())),
        );

        assert!(!op.completed());
        let (consumed, err) = op.handle_read(&ring);
        assert_eq!(consumed, 5);
        assert!(err.is_none());
        assert!(op.completed());
        op.succeed();
        assert_eq!(&*delivered.borrow(), b"hello");
        assert_eq!(ring.occupancy(), 0);
    }

    #[test]
    fn test_sized_read_across_many_arrivals() {
        let ring = RingBuffer::new(32).unwrap();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let mut op = ReadOperation::sized(
            0,
            vec![0; 48],
            Box::new(move |r| *got2.borrow_mut() = Some(r.unwrap())),
        );

        let mut pushed = 0u8;
        while !op.completed() {
            // Feed in dribs so the ring wraps more than once.
            let n = ring.free_space().min(10);
            let chunk: Vec<u8> = (0..n).map(|i| pushed.wrapping_add(i as u8)).collect();
            pushed = pushed.wrapping_add(n as u8);
            fill(&ring, &chunk);
            let (_, err) = op.handle_read(&ring);
            assert!(err.is_none());
        }
        op.succeed();

        let expected: Vec<u8> = (0u8..48).collect();
        assert_eq!(got.borrow().as_deref(), Some(expected.as_slice()));
    }

    #[test]
    fn test_framed_read_with_split_prefix() {
        let ring = RingBuffer::new(64).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        let mut op = ReadOperation::framed(
            0,
            Box::new(move |r| got2.borrow_mut().extend_from_slice(r.unwrap())),
        );

        let payload = b"framed payload";
        let prefix = (payload.len() as u32).to_le_bytes();

        // Prefix arrives split across two remote writes.
        fill(&ring, &prefix[..2]);
        let (consumed, err) = op.handle_read(&ring);
        assert_eq!((consumed, err.is_none()), (2, true));
        assert!(!op.completed());

        fill(&ring, &prefix[2..]);
        fill(&ring, &payload[..5]);
        let (consumed, err) = op.handle_read(&ring);
        assert_eq!((consumed, err.is_none()), (2 + 5, true));
        assert!(!op.completed());

        fill(&ring, &payload[5..]);
        let (consumed, err) = op.handle_read(&ring);
        assert_eq!((consumed, err.is_none()), (payload.len() as u64 - 5, true));
        assert!(op.completed());
        op.succeed();
        assert_eq!(&*got.borrow(), payload);
    }

    #[test]
    fn test_framed_read_rejects_implausible_length() {
        let ring = RingBuffer::new(64).unwrap();
        let mut op = ReadOperation::framed(0, Box::new(|r| assert!(r.is_err())));

        fill(&ring, &u32::MAX.to_le_bytes());
        let (consumed, err) = op.handle_read(&ring);
        assert_eq!(consumed, 4);
        match &err {
            Some(Error::FrameTooLarge { length, max }) => {
                assert_eq!(*length, u32::MAX as u64);
                assert_eq!(*max, 60);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
        op.fail(err.unwrap());
    }

    #[test]
    fn test_zero_length_sized_read_completes_immediately() {
        let ring = RingBuffer::new(32).unwrap();
        let mut op = ReadOperation::sized(0, Vec::new(), Box::new(|r| assert!(r.is_ok())));
        assert!(op.completed());
        let (consumed, err) = op.handle_read(&ring);
        assert_eq!(consumed, 0);
        assert!(err.is_none());
        op.succeed();
    }

    #[test]
    fn test_write_fills_ring_and_resumes() {
        let ring = RingBuffer::new(32).unwrap();
        let data: Vec<u8> = (0u8..50).collect();
        let mut op = WriteOperation::raw(0, data.clone(), Box::new(|r| assert!(r.is_ok())));

        let produced = op.handle_write(&ring);
        assert_eq!(produced, 32);
        assert!(!op.completed());
        assert_eq!(op.handle_write(&ring), 0);

        // The peer acknowledges some bytes; writing resumes.
        let mut drained = Vec::new();
        let spans = ring.consume_peek(0, 32).unwrap();
        let mut out = vec![0u8; 32];
        ring.copy_out(&spans, &mut out);
        drained.extend_from_slice(&out);
        ring.consume_commit(32);

        let produced = op.handle_write(&ring);
        assert_eq!(produced, 18);
        assert!(op.completed());

        let spans = ring.consume_peek(0, 18).unwrap();
        let mut out = vec![0u8; 18];
        ring.copy_out(&spans, &mut out);
        drained.extend_from_slice(&out);
        assert_eq!(drained, data);
        op.succeed();
    }

    #[test]
    fn test_framed_write_prepends_length() {
        let ring = RingBuffer::new(64).unwrap();
        let mut op = WriteOperation::framed(0, b"abc".to_vec(), Box::new(|r| assert!(r.is_ok())));
        let produced = op.handle_write(&ring);
        assert_eq!(produced, 7);
        assert!(op.completed());

        let spans = ring.consume_peek(0, 7).unwrap();
        let mut out = vec![0u8; 7];
        ring.copy_out(&spans, &mut out);
        assert_eq!(&out[..4], &3u32.to_le_bytes());
        assert_eq!(&out[4..], b"abc");
    }

    #[test]
    fn test_zero_length_write_completes_immediately() {
        let ring = RingBuffer::new(32).unwrap();
        let mut op = WriteOperation::raw(0, Vec::new(), Box::new(|r| assert!(r.is_ok())));
        assert!(op.completed());
        assert_eq!(op.handle_write(&ring), 0);
        op.succeed();
    }
}
