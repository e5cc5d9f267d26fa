//! The connection core.
//!
//! A connection owns one RC queue pair, an inbox ring and an outbox ring
//! (each 2 MiB, registered with the HCA), and two FIFO operation queues.
//! Its life has two stages: a TCP handshake that trades queue-pair setup
//! information and the inbox address/rkey with the peer, then an
//! established stage in which data moves exclusively by RDMA.
//!
//! Data path: `write` copies bytes into the outbox and posts RDMA writes
//! into the peer's inbox, skipping over bytes already in flight; the peer
//! drains its inbox into pending reads and acknowledges with a zero-length
//! send carrying the consumed count, which lets the outbox tail advance.
//! The outbox tail therefore only moves on acknowledgement, so the ring
//! keeps transmitted bytes intact until the peer has them.
//!
//! Every public entry point defers onto the loop; all state below is only
//! touched from the loop thread.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use nix::sys::epoll::EpollFlags;
use socket2::{Domain, Socket, Type};
use tracing::{debug, trace, warn};

use verbs::{AccessFlags, MemoryRegion, QueuePair, SetupInformation, Sge};

use crate::error::{Error, Result};
use crate::event_loop::{EventHandler, EventLoop};
use crate::operations::{
    BufferCallback, ChunkCallback, ReadOperation, WriteCallback, WriteOperation,
};
use crate::reactor::{QpEventHandler, Reactor, WriteRequest, ACK_REQUEST_ID, WRITE_REQUEST_ID};
use crate::ring::RingBuffer;
use crate::wire::{SetupBlob, SETUP_BLOB_SIZE};
use crate::BUFFER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initializing,
    SendAddr,
    RecvAddr,
    Established,
}

/// One ring and its registration. Field order matters: the memory region
/// must be released before the buffer it pins.
struct Mailbox {
    mr: MemoryRegion,
    ring: RingBuffer,
}

/// A point-to-point byte stream over an RC queue pair.
///
/// Dropping the handle closes the connection; queued operations then fail
/// with [`Error::ConnectionClosed`]. The underlying state stays alive
/// until every posted work request has completed or flushed.
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn dial(
        event_loop: Rc<EventLoop>,
        reactor: Rc<Reactor>,
        addr: SocketAddr,
        id: String,
    ) -> Self {
        let inner = ConnectionInner::new(event_loop, reactor, None, Some(addr), id);
        ConnectionInner::schedule_init(&inner);
        Self { inner }
    }

    pub(crate) fn from_stream(
        event_loop: Rc<EventLoop>,
        reactor: Rc<Reactor>,
        stream: TcpStream,
        id: String,
    ) -> Self {
        let inner = ConnectionInner::new(event_loop, reactor, Some(stream), None, id);
        ConnectionInner::schedule_init(&inner);
        Self { inner }
    }

    /// Deliver the next available chunk of bytes.
    pub fn read(&self, cb: impl FnOnce(Result<&[u8]>) + 'static) {
        let inner = self.inner.clone();
        self.inner.event_loop.defer(Box::new(move || {
            inner.read_unsized_from_loop(Box::new(cb));
        }));
    }

    /// Fill `buf` completely, then hand it back through the callback.
    pub fn read_exact(&self, buf: Vec<u8>, cb: impl FnOnce(Result<Vec<u8>>) + 'static) {
        let inner = self.inner.clone();
        self.inner.event_loop.defer(Box::new(move || {
            inner.read_sized_from_loop(buf, Box::new(cb));
        }));
    }

    /// Read one length-prefixed frame and deliver its payload.
    pub fn read_framed(&self, cb: impl FnOnce(Result<&[u8]>) + 'static) {
        let inner = self.inner.clone();
        self.inner.event_loop.defer(Box::new(move || {
            inner.read_framed_from_loop(Box::new(cb));
        }));
    }

    /// Write `data` to the peer.
    pub fn write(&self, data: Vec<u8>, cb: impl FnOnce(Result<()>) + 'static) {
        let inner = self.inner.clone();
        self.inner.event_loop.defer(Box::new(move || {
            inner.write_from_loop(data, Box::new(cb));
        }));
    }

    /// Write `data` as one length-prefixed frame.
    pub fn write_framed(&self, data: Vec<u8>, cb: impl FnOnce(Result<()>) + 'static) {
        let inner = self.inner.clone();
        self.inner.event_loop.defer(Box::new(move || {
            inner.write_framed_from_loop(data, Box::new(cb));
        }));
    }

    /// Relabel the connection in log output. No behavioural effect.
    pub fn set_id(&self, id: String) {
        let inner = self.inner.clone();
        self.inner.event_loop.defer(Box::new(move || {
            trace!(old = %inner.id.borrow(), new = %id, "connection renamed");
            *inner.id.borrow_mut() = id;
        }));
    }

    /// Begin teardown. Queued and future operations fail with
    /// [`Error::ConnectionClosed`]. Idempotent.
    pub fn close(&self) {
        let inner = self.inner.clone();
        self.inner.event_loop.defer(Box::new(move || {
            inner.close_from_loop();
        }));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct ConnectionInner {
    weak_self: Weak<ConnectionInner>,
    event_loop: Rc<EventLoop>,
    reactor: Rc<Reactor>,

    state: Cell<State>,
    error: RefCell<Option<Error>>,
    id: RefCell<String>,

    socket: RefCell<Option<TcpStream>>,
    dial_addr: Cell<Option<SocketAddr>>,
    fd_registered: Cell<bool>,

    qp: RefCell<Option<Rc<QueuePair>>>,
    self_setup: Cell<Option<SetupInformation>>,
    inbox: RefCell<Option<Mailbox>>,
    outbox: RefCell<Option<Mailbox>>,

    // Peer inbox key, pointer, and our local view of its head. The head
    // only ever advances, when a write is posted.
    peer_inbox_rkey: Cell<u32>,
    peer_inbox_addr: Cell<u64>,
    peer_inbox_head: Cell<u64>,

    /// Bytes handed to the HCA whose acknowledgement has not arrived yet.
    /// The write path skips over them when peeking the outbox for new
    /// data, because their ring space must not be reused.
    num_bytes_in_flight: Cell<u64>,
    /// Posted RDMA writes awaiting completion.
    num_writes_in_flight: Cell<u32>,
    /// Posted acknowledgement sends awaiting completion.
    num_acks_in_flight: Cell<u32>,

    read_ops: RefCell<VecDeque<ReadOperation>>,
    write_ops: RefCell<VecDeque<WriteOperation>>,

    next_read_seq: Cell<u64>,
    next_write_seq: Cell<u64>,
    next_read_callback: Cell<u64>,
    next_write_callback: Cell<u64>,

    closing_token: Cell<Option<u64>>,
}

impl ConnectionInner {
    fn new(
        event_loop: Rc<EventLoop>,
        reactor: Rc<Reactor>,
        stream: Option<TcpStream>,
        dial_addr: Option<SocketAddr>,
        id: String,
    ) -> Rc<Self> {
        debug_assert!(stream.is_some() ^ dial_addr.is_some());
        Rc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            event_loop,
            reactor,
            state: Cell::new(State::Initializing),
            error: RefCell::new(None),
            id: RefCell::new(id),
            socket: RefCell::new(stream),
            dial_addr: Cell::new(dial_addr),
            fd_registered: Cell::new(false),
            qp: RefCell::new(None),
            self_setup: Cell::new(None),
            inbox: RefCell::new(None),
            outbox: RefCell::new(None),
            peer_inbox_rkey: Cell::new(0),
            peer_inbox_addr: Cell::new(0),
            peer_inbox_head: Cell::new(0),
            num_bytes_in_flight: Cell::new(0),
            num_writes_in_flight: Cell::new(0),
            num_acks_in_flight: Cell::new(0),
            read_ops: RefCell::new(VecDeque::new()),
            write_ops: RefCell::new(VecDeque::new()),
            next_read_seq: Cell::new(0),
            next_write_seq: Cell::new(0),
            next_read_callback: Cell::new(0),
            next_write_callback: Cell::new(0),
            closing_token: Cell::new(None),
        })
    }

    fn schedule_init(inner: &Rc<Self>) {
        let inner = inner.clone();
        let event_loop = inner.event_loop.clone();
        event_loop.defer(Box::new(move || inner.init_from_loop()));
    }

    fn rc(&self) -> Option<Rc<Self>> {
        self.weak_self.upgrade()
    }

    fn init_from_loop(self: &Rc<Self>) {
        debug_assert!(self.event_loop.in_loop());
        let weak = Rc::downgrade(self);
        let token = self.reactor.closing_emitter().subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.set_error(Error::ConnectionClosed);
            }
        });
        self.closing_token.set(Some(token));
        if self.reactor.closing_emitter().is_closed() {
            self.set_error(Error::ConnectionClosed);
            return;
        }

        if let Err(e) = self.init_steps() {
            self.set_error(e);
        }
    }

    fn init_steps(self: &Rc<Self>) -> Result<()> {
        if self.socket.borrow().is_none() {
            let Some(addr) = self.dial_addr.get() else {
                return Err(Error::System {
                    context: "connect",
                    errno: libc::EINVAL,
                });
            };
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
                .map_err(|e| Error::system("socket", &e))?;
            socket
                .set_reuse_address(true)
                .map_err(|e| Error::system("setsockopt", &e))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| Error::system("fcntl", &e))?;
            match socket.connect(&addr.into()) {
                Ok(()) => {}
                Err(e)
                    if e.raw_os_error() == Some(libc::EINPROGRESS)
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::system("connect", &e)),
            }
            *self.socket.borrow_mut() = Some(socket.into());
        } else if let Some(stream) = self.socket.borrow().as_ref() {
            stream
                .set_nonblocking(true)
                .map_err(|e| Error::system("fcntl", &e))?;
        }

        let inbox_ring = RingBuffer::new(BUFFER_SIZE).map_err(|e| Error::system("mmap", &e))?;
        let inbox_mr = unsafe {
            self.reactor.pd().register(
                inbox_ring.as_ptr(),
                BUFFER_SIZE,
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )
        }
        .map_err(|e| Error::system("ibv_reg_mr", &e))?;
        *self.inbox.borrow_mut() = Some(Mailbox {
            mr: inbox_mr,
            ring: inbox_ring,
        });

        let outbox_ring = RingBuffer::new(BUFFER_SIZE).map_err(|e| Error::system("mmap", &e))?;
        let outbox_mr = unsafe {
            self.reactor
                .pd()
                .register(outbox_ring.as_ptr(), BUFFER_SIZE, AccessFlags::empty())
        }
        .map_err(|e| Error::system("ibv_reg_mr", &e))?;
        *self.outbox.borrow_mut() = Some(Mailbox {
            mr: outbox_mr,
            ring: outbox_ring,
        });

        let qp = self
            .reactor
            .pd()
            .create_rc_qp(
                self.reactor.cq(),
                self.reactor.srq(),
                self.reactor.max_send_wr(),
            )
            .map_err(|e| Error::system("ibv_create_qp", &e))?;
        qp.to_init(self.reactor.address())
            .map_err(|e| Error::system("ibv_modify_qp", &e))?;
        let qp = Rc::new(qp);
        self.self_setup.set(Some(SetupInformation::new(
            self.reactor.address(),
            qp.qp_num(),
            0,
        )));

        self.reactor.register_qp(qp.qp_num(), self.clone());
        *self.qp.borrow_mut() = Some(qp);

        // Our setup blob goes first: wait for writability.
        self.state.set(State::SendAddr);
        let fd = self.socket_fd().ok_or(Error::Eof)?;
        self.event_loop
            .register_descriptor(fd, EpollFlags::EPOLLOUT, self.clone())
            .map_err(|e| Error::system("epoll_ctl", &e))?;
        self.fd_registered.set(true);

        debug!(id = %self.id.borrow(), "connection initialized");
        Ok(())
    }

    fn socket_fd(&self) -> Option<RawFd> {
        self.socket.borrow().as_ref().map(|s| s.as_raw_fd())
    }

    // Read path ---------------------------------------------------------

    fn read_unsized_from_loop(&self, cb: ChunkCallback) {
        let seq = self.next_read_seq.get();
        self.next_read_seq.set(seq + 1);
        trace!(id = %self.id.borrow(), seq, "received an unsized read request");
        self.enqueue_read(ReadOperation::unsized_chunk(seq, cb));
    }

    fn read_sized_from_loop(&self, buf: Vec<u8>, cb: BufferCallback) {
        let seq = self.next_read_seq.get();
        self.next_read_seq.set(seq + 1);
        trace!(id = %self.id.borrow(), seq, len = buf.len(), "received a sized read request");
        self.enqueue_read(ReadOperation::sized(seq, buf, cb));
    }

    fn read_framed_from_loop(&self, cb: ChunkCallback) {
        let seq = self.next_read_seq.get();
        self.next_read_seq.set(seq + 1);
        trace!(id = %self.id.borrow(), seq, "received a framed read request");
        self.enqueue_read(ReadOperation::framed(seq, cb));
    }

    fn enqueue_read(&self, op: ReadOperation) {
        if let Some(err) = self.error.borrow().clone() {
            self.invoke_read_callback(op, Some(err));
            return;
        }
        self.read_ops.borrow_mut().push_back(op);
        // The inbox may already hold enough bytes to finish this.
        self.process_read_operations();
    }

    /// Drain the inbox into pending reads, in submission order, for as
    /// long as the head operation keeps making progress.
    fn process_read_operations(&self) {
        debug_assert!(self.event_loop.in_loop());
        if self.state.get() != State::Established {
            return;
        }
        loop {
            let progress = {
                let mut ops = self.read_ops.borrow_mut();
                let Some(op) = ops.front_mut() else { break };
                let inbox = self.inbox.borrow();
                let Some(mailbox) = inbox.as_ref() else { break };
                let (consumed, op_error) = op.handle_read(&mailbox.ring);
                (consumed, op_error, op.completed())
            };
            let (consumed, op_error, completed) = progress;

            if consumed > 0 {
                self.post_ack(consumed);
                if self.error.borrow().is_some() {
                    // A failed post poisoned the connection and the error
                    // path already drained the queues.
                    break;
                }
            }

            if let Some(op_error) = op_error {
                if let Some(op) = self.read_ops.borrow_mut().pop_front() {
                    self.invoke_read_callback(op, Some(op_error));
                }
                continue;
            }
            if completed {
                if let Some(op) = self.read_ops.borrow_mut().pop_front() {
                    self.invoke_read_callback(op, None);
                }
                continue;
            }
            break;
        }
    }

    fn post_ack(&self, len: u64) {
        let qp = self.qp.borrow().clone();
        let Some(qp) = qp else { return };
        trace!(
            id = %self.id.borrow(),
            len,
            qp_num = qp.qp_num(),
            "posting a send request acknowledging consumed bytes",
        );
        self.num_acks_in_flight
            .set(self.num_acks_in_flight.get() + 1);
        self.reactor.post_ack(&qp, len as u32);
    }

    fn invoke_read_callback(&self, op: ReadOperation, err: Option<Error>) {
        let seq = op.seq();
        debug_assert_eq!(seq, self.next_read_callback.get());
        self.next_read_callback.set(seq + 1);
        trace!(id = %self.id.borrow(), seq, "calling a read callback");
        match err {
            None => op.succeed(),
            Some(err) => op.fail(err),
        }
        trace!(id = %self.id.borrow(), seq, "done calling a read callback");
    }

    // Write path --------------------------------------------------------

    fn write_from_loop(&self, data: Vec<u8>, cb: WriteCallback) {
        let seq = self.next_write_seq.get();
        self.next_write_seq.set(seq + 1);
        trace!(id = %self.id.borrow(), seq, len = data.len(), "received a write request");
        self.enqueue_write(WriteOperation::raw(seq, data, cb));
    }

    fn write_framed_from_loop(&self, data: Vec<u8>, cb: WriteCallback) {
        let seq = self.next_write_seq.get();
        self.next_write_seq.set(seq + 1);
        trace!(id = %self.id.borrow(), seq, len = data.len(), "received a framed write request");
        self.enqueue_write(WriteOperation::framed(seq, data, cb));
    }

    fn enqueue_write(&self, op: WriteOperation) {
        if let Some(err) = self.error.borrow().clone() {
            self.invoke_write_callback(op, Some(err));
            return;
        }
        self.write_ops.borrow_mut().push_back(op);
        // The outbox may already have room for this.
        self.process_write_operations();
    }

    /// Move bytes from pending writes into the outbox and hand the fresh
    /// ones to the HCA, in submission order.
    fn process_write_operations(&self) {
        debug_assert!(self.event_loop.in_loop());
        if self.state.get() != State::Established {
            return;
        }
        loop {
            let progress = {
                let mut ops = self.write_ops.borrow_mut();
                let Some(op) = ops.front_mut() else { break };
                let outbox = self.outbox.borrow();
                let Some(mailbox) = outbox.as_ref() else { break };
                let produced = op.handle_write(&mailbox.ring);
                (produced, op.completed())
            };
            let (produced, completed) = progress;

            if produced > 0 {
                self.post_outbox_writes(produced);
                if self.error.borrow().is_some() {
                    break;
                }
            }

            if completed {
                if let Some(op) = self.write_ops.borrow_mut().pop_front() {
                    self.invoke_write_callback(op, None);
                }
                continue;
            }
            // Head operation stalled: the outbox is full until
            // acknowledgements free up space.
            break;
        }
    }

    /// Hand `produced` freshly committed outbox bytes to the HCA.
    ///
    /// This opens a peek transaction on the outbox, skips the bytes that
    /// are already in flight, and posts one RDMA write per contiguous
    /// span. The peek is then abandoned: the tail must stay put until the
    /// peer acknowledges, or the bytes could be overwritten while the HCA
    /// still reads them.
    fn post_outbox_writes(&self, produced: u64) {
        let mut requests: Vec<WriteRequest> = Vec::with_capacity(2);
        {
            let outbox = self.outbox.borrow();
            let Some(mailbox) = outbox.as_ref() else {
                return;
            };
            let Some(spans) = mailbox
                .ring
                .consume_peek(self.num_bytes_in_flight.get(), produced)
            else {
                return;
            };
            let mask = BUFFER_SIZE as u64 - 1;
            for span in spans.iter() {
                let remote_addr = self.peer_inbox_addr.get() + (self.peer_inbox_head.get() & mask);
                requests.push(WriteRequest {
                    local: Sge {
                        addr: mailbox.ring.base_addr() + span.offset as u64,
                        len: span.len as u32,
                        lkey: mailbox.mr.lkey(),
                    },
                    remote_addr,
                    rkey: self.peer_inbox_rkey.get(),
                    imm: span.len as u32,
                });
                self.peer_inbox_head
                    .set(self.peer_inbox_head.get() + span.len as u64);
            }
        }

        let qp = self.qp.borrow().clone();
        let Some(qp) = qp else { return };
        for request in requests {
            trace!(
                id = %self.id.borrow(),
                len = request.imm,
                qp_num = qp.qp_num(),
                "posting an RDMA write request",
            );
            self.num_writes_in_flight
                .set(self.num_writes_in_flight.get() + 1);
            self.reactor.post_write(&qp, request);
        }
        self.num_bytes_in_flight
            .set(self.num_bytes_in_flight.get() + produced);
    }

    fn invoke_write_callback(&self, op: WriteOperation, err: Option<Error>) {
        let seq = op.seq();
        debug_assert_eq!(seq, self.next_write_callback.get());
        self.next_write_callback.set(seq + 1);
        trace!(id = %self.id.borrow(), seq, "calling a write callback");
        match err {
            None => op.succeed(),
            Some(err) => op.fail(err),
        }
        trace!(id = %self.id.borrow(), seq, "done calling a write callback");
    }

    // Handshake ---------------------------------------------------------

    fn handle_event_in(&self) {
        match self.state.get() {
            State::RecvAddr => {
                let mut buf = [0u8; SETUP_BLOB_SIZE];
                let result = {
                    let mut socket = self.socket.borrow_mut();
                    let Some(socket) = socket.as_mut() else { return };
                    socket.read(&mut buf)
                };
                // The blob is far below any socket buffer size, so it is
                // expected to arrive in one piece once readable.
                match result {
                    Err(e) => self.set_error(Error::system("read", &e)),
                    Ok(0) => self.set_error(Error::Eof),
                    Ok(n) if n != SETUP_BLOB_SIZE => self.set_error(Error::ShortRead {
                        expected: SETUP_BLOB_SIZE,
                        actual: n,
                    }),
                    Ok(_) => self.finish_handshake(SetupBlob::from_bytes(&buf)),
                }
            }
            State::Established => {
                // Nothing is ever sent on the socket after the handshake;
                // readability means the peer closed it.
                self.set_error(Error::Eof);
            }
            state => {
                warn!(id = %self.id.borrow(), ?state, "unexpected EPOLLIN");
            }
        }
    }

    fn finish_handshake(&self, blob: SetupBlob) {
        let result = (|| -> Result<()> {
            let qp = self.qp.borrow().clone();
            let Some(qp) = qp else { return Err(Error::Eof) };
            let Some(self_setup) = self.self_setup.get() else {
                return Err(Error::Eof);
            };
            qp.to_rtr(self.reactor.address(), &blob.setup)
                .map_err(|e| Error::system("ibv_modify_qp", &e))?;
            qp.to_rts(&self_setup)
                .map_err(|e| Error::system("ibv_modify_qp", &e))?;
            Ok(())
        })();
        if let Err(e) = result {
            self.set_error(e);
            return;
        }

        self.peer_inbox_rkey.set(blob.inbox_rkey);
        self.peer_inbox_addr.set(blob.inbox_addr);

        debug!(id = %self.id.borrow(), "connection established");
        self.state.set(State::Established);
        self.process_write_operations();
        // A local read and a remote write may both have happened before
        // the handshake finished; drain reads too or the first read
        // callback would never fire.
        self.process_read_operations();
    }

    fn handle_event_out(&self) {
        match self.state.get() {
            State::SendAddr => {
                let Some(setup) = self.self_setup.get() else {
                    return;
                };
                let blob = {
                    let inbox = self.inbox.borrow();
                    let Some(mailbox) = inbox.as_ref() else {
                        return;
                    };
                    SetupBlob {
                        setup,
                        inbox_addr: mailbox.ring.base_addr(),
                        inbox_rkey: mailbox.mr.rkey(),
                    }
                };
                let bytes = blob.to_bytes();
                let result = {
                    let mut socket = self.socket.borrow_mut();
                    let Some(socket) = socket.as_mut() else { return };
                    socket.write(&bytes)
                };
                match result {
                    Err(e) => self.set_error(Error::system("write", &e)),
                    Ok(n) if n != SETUP_BLOB_SIZE => self.set_error(Error::ShortWrite {
                        expected: SETUP_BLOB_SIZE,
                        actual: n,
                    }),
                    Ok(_) => {
                        // Sent our half; wait for the peer's.
                        self.state.set(State::RecvAddr);
                        let (fd, rc) = (self.socket_fd(), self.rc());
                        if let (Some(fd), Some(rc)) = (fd, rc) {
                            if let Err(e) =
                                self.event_loop
                                    .register_descriptor(fd, EpollFlags::EPOLLIN, rc)
                            {
                                self.set_error(Error::system("epoll_ctl", &e));
                            }
                        }
                    }
                }
            }
            state => {
                warn!(id = %self.id.borrow(), ?state, "unexpected EPOLLOUT");
            }
        }
    }

    // Error handling and teardown ---------------------------------------

    fn close_from_loop(&self) {
        debug!(id = %self.id.borrow(), "connection closing");
        self.set_error(Error::ConnectionClosed);
    }

    /// Latch the first error and start teardown. Later calls are no-ops.
    fn set_error(&self, err: Error) {
        if self.error.borrow().is_some() {
            return;
        }
        *self.error.borrow_mut() = Some(err);
        self.handle_error();
    }

    fn handle_error(&self) {
        let Some(err) = self.error.borrow().clone() else {
            return;
        };
        debug!(id = %self.id.borrow(), error = %err, "connection handling error");

        let read_ops = std::mem::take(&mut *self.read_ops.borrow_mut());
        for op in read_ops {
            self.invoke_read_callback(op, Some(err.clone()));
        }
        let write_ops = std::mem::take(&mut *self.write_ops.borrow_mut());
        for op in write_ops {
            self.invoke_write_callback(op, Some(err.clone()));
        }

        // Flush every still-pending work request back through the CQ;
        // each flush arrives as a failed completion and decrements an
        // in-flight counter.
        let qp = self.qp.borrow().clone();
        if let Some(qp) = qp {
            if let Err(e) = qp.to_error() {
                warn!(id = %self.id.borrow(), error = %e, "transition to error state failed");
            }
        }

        self.try_cleanup();

        if self.fd_registered.get() {
            if let Some(fd) = self.socket_fd() {
                let _ = self.event_loop.unregister_descriptor(fd);
            }
            self.fd_registered.set(false);
        }
        *self.socket.borrow_mut() = None;
    }

    /// Tear down once nothing is in flight anymore. The actual cleanup is
    /// deferred so the reactor finishes draining its completion batch
    /// before the queue pair goes away.
    fn try_cleanup(&self) {
        if self.error.borrow().is_none() {
            return;
        }
        let writes = self.num_writes_in_flight.get();
        let acks = self.num_acks_in_flight.get();
        if writes == 0 && acks == 0 {
            debug!(id = %self.id.borrow(), "connection ready to clean up");
            if let Some(rc) = self.rc() {
                self.event_loop.defer(Box::new(move || rc.cleanup()));
            }
        } else {
            trace!(
                id = %self.id.borrow(),
                writes_in_flight = writes,
                acks_in_flight = acks,
                "connection waiting for in-flight requests before cleanup",
            );
        }
    }

    fn cleanup(&self) {
        debug!(id = %self.id.borrow(), "connection cleaning up");
        if let Some(qp) = self.qp.borrow_mut().take() {
            self.reactor.unregister_qp(qp.qp_num());
        }
        if let Some(token) = self.closing_token.take() {
            self.reactor.closing_emitter().unsubscribe(token);
        }
        self.inbox.borrow_mut().take();
        self.outbox.borrow_mut().take();
    }
}

impl EventHandler for ConnectionInner {
    fn handle_events(&self, events: EpollFlags) {
        debug_assert!(self.event_loop.in_loop());
        trace!(id = %self.id.borrow(), ?events, "connection handling socket event");
        // Handle one event class per dispatch. Errors come first: a
        // socket can be both failed and readable, and serving the
        // readable half forever would never reach the error. Hangup comes
        // last so pending data is drained before it.
        if events.contains(EpollFlags::EPOLLERR) {
            let Some(fd) = self.socket_fd() else { return };
            let mut so_error: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rv = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut so_error as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rv == -1 {
                self.set_error(Error::system(
                    "getsockopt",
                    &std::io::Error::last_os_error(),
                ));
            } else {
                self.set_error(Error::System {
                    context: "async error on socket",
                    errno: so_error,
                });
            }
            return;
        }
        if events.contains(EpollFlags::EPOLLIN) {
            self.handle_event_in();
            return;
        }
        if events.contains(EpollFlags::EPOLLOUT) {
            self.handle_event_out();
            return;
        }
        if events.contains(EpollFlags::EPOLLHUP) {
            self.set_error(Error::Eof);
        }
    }
}

impl QpEventHandler for ConnectionInner {
    fn on_remote_produced_data(&self, len: u32) {
        trace!(id = %self.id.borrow(), len, "bytes were written into the inbox");
        // This handler is the sole producer of the inbox, so the head can
        // be bumped directly.
        {
            let inbox = self.inbox.borrow();
            let Some(mailbox) = inbox.as_ref() else { return };
            mailbox.ring.produce_commit(len as u64);
        }
        self.process_read_operations();
    }

    fn on_remote_consumed_data(&self, len: u32) {
        trace!(id = %self.id.borrow(), len, "bytes were read from the outbox");
        // Sole consumer of the outbox, same shortcut.
        {
            let outbox = self.outbox.borrow();
            let Some(mailbox) = outbox.as_ref() else { return };
            mailbox.ring.consume_commit(len as u64);
        }
        self.num_bytes_in_flight
            .set(self.num_bytes_in_flight.get() - len as u64);
        self.process_write_operations();
    }

    fn on_write_completed(&self) {
        trace!(id = %self.id.borrow(), "done posting an RDMA write request");
        self.num_writes_in_flight
            .set(self.num_writes_in_flight.get() - 1);
        self.try_cleanup();
    }

    fn on_ack_completed(&self) {
        trace!(id = %self.id.borrow(), "done posting a send request");
        self.num_acks_in_flight
            .set(self.num_acks_in_flight.get() - 1);
        self.try_cleanup();
    }

    fn on_error(&self, status: ibverbs_sys::ibv_wc_status::Type, wr_id: u64) {
        self.set_error(Error::Ibv(verbs::wc_status_str(status)));
        // The failed completion may not disclose its opcode; the wr_id
        // says which counter it belongs to.
        if wr_id == WRITE_REQUEST_ID {
            self.on_write_completed();
        } else if wr_id == ACK_REQUEST_ID {
            self.on_ack_completed();
        }
    }
}
