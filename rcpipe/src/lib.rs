//! rcpipe - point-to-point byte streams over InfiniBand RC queue pairs.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Context                             │
//! │  ┌───────────────────────┐  ┌───────────────────────────┐  │
//! │  │        Reactor        │  │        EventLoop          │  │
//! │  │  device, PD, CQ, SRQ  │  │  epoll + deferred queue   │  │
//! │  │  completions by QPN   │  │  socket readiness         │  │
//! │  └───────────────────────┘  └───────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//!               │                         │
//!         ┌─────┴──────┐            ┌─────┴──────┐
//!         │ Connection │            │ Connection │
//!         │   RC QP    │            │   RC QP    │
//!         │ inbox ring │            │ inbox ring │
//!         │ outbox ring│            │ outbox ring│
//!         └────────────┘            └────────────┘
//! ```
//!
//! Each connection bootstraps over a TCP socket: both sides exchange one
//! fixed-size blob carrying queue-pair setup information plus the address
//! and rkey of their 2 MiB inbox ring. From then on data flows one way
//! only: a `write` lands bytes in the local outbox ring and posts RDMA
//! writes straight into the peer's inbox; the peer acknowledges consumed
//! bytes with a zero-length send carrying the count as immediate data.
//!
//! Everything is single-threaded and cooperative: whichever thread calls
//! [`Context::poll`] is the loop thread, and it alone mutates connection
//! state. `Connection` handles queue work onto the loop from any of their
//! methods, so submitting reads and writes from callbacks is fine. Reads
//! and writes complete strictly in submission order.
//!
//! ```ignore
//! let ctx = Context::builder().build()?;
//! let conn = ctx.connect("10.0.0.2:9999".parse().unwrap());
//! conn.write(b"hello".to_vec(), |r| r.unwrap());
//! conn.read(|r| println!("got {} bytes", r.unwrap().len()));
//! loop {
//!     ctx.poll(Duration::from_millis(10))?;
//! }
//! ```

mod buffer;
pub mod connection;
pub mod error;
pub mod event_loop;
mod operations;
pub mod reactor;
pub mod ring;
pub mod wire;

use std::cell::Cell;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::time::Duration;

pub use connection::Connection;
pub use error::{Error, Result};

use event_loop::EventLoop;
use reactor::{Reactor, ReactorConfig};

/// Capacity of the inbox and outbox rings. Both sides of a connection use
/// the same size, which is what lets the sender bound the peer's inbox
/// occupancy with its own outbox accounting.
pub const BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Default completion queue capacity.
pub const DEFAULT_CQ_CAPACITY: i32 = 4096;

/// Default shared receive queue capacity.
pub const DEFAULT_SRQ_CAPACITY: u32 = 1024;

/// Default cap on outstanding send work requests, per class.
pub const DEFAULT_MAX_SEND_WR: u32 = 1024;

/// Configuration for a [`Context`].
pub struct ContextBuilder {
    device_index: usize,
    port_num: u8,
    gid_index: u8,
    cq_capacity: i32,
    srq_capacity: u32,
    max_send_wr: u32,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            device_index: 0,
            port_num: 1,
            gid_index: 0,
            cq_capacity: DEFAULT_CQ_CAPACITY,
            srq_capacity: DEFAULT_SRQ_CAPACITY,
            max_send_wr: DEFAULT_MAX_SEND_WR,
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_index(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    pub fn port(mut self, port_num: u8) -> Self {
        self.port_num = port_num;
        self
    }

    pub fn gid_index(mut self, gid_index: u8) -> Self {
        self.gid_index = gid_index;
        self
    }

    pub fn cq_capacity(mut self, capacity: i32) -> Self {
        self.cq_capacity = capacity;
        self
    }

    pub fn srq_capacity(mut self, capacity: u32) -> Self {
        self.srq_capacity = capacity;
        self
    }

    pub fn max_send_wr(mut self, max: u32) -> Self {
        self.max_send_wr = max;
        self
    }

    /// Open the device and bring up the reactor and event loop.
    ///
    /// Fails when the host has no usable RDMA device; callers that can
    /// run without one (tests, probes) treat that as "skip".
    pub fn build(self) -> io::Result<Context> {
        let reactor = Reactor::new(&ReactorConfig {
            device_index: self.device_index,
            port_num: self.port_num,
            gid_index: self.gid_index,
            cq_capacity: self.cq_capacity,
            srq_capacity: self.srq_capacity,
            max_send_wr: self.max_send_wr,
        })?;
        Ok(Context {
            event_loop: EventLoop::new()?,
            reactor: Rc::new(reactor),
            connection_counter: Cell::new(0),
        })
    }
}

/// Process-wide owner of the RDMA device state and the event loop.
///
/// The thread that calls [`Context::poll`] is the loop thread; every
/// connection callback runs on it.
pub struct Context {
    event_loop: Rc<EventLoop>,
    reactor: Rc<Reactor>,
    connection_counter: Cell<u64>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Dial `addr` and return the connection immediately; the handshake
    /// runs on the loop.
    pub fn connect(&self, addr: SocketAddr) -> Connection {
        let id = self.next_connection_id();
        Connection::dial(self.event_loop.clone(), self.reactor.clone(), addr, id)
    }

    /// Adopt an already-connected socket, e.g. one produced by a
    /// listener's accept.
    pub fn accepted(&self, stream: TcpStream) -> Connection {
        let id = self.next_connection_id();
        Connection::from_stream(self.event_loop.clone(), self.reactor.clone(), stream, id)
    }

    fn next_connection_id(&self) -> String {
        let n = self.connection_counter.get();
        self.connection_counter.set(n + 1);
        format!("c{}", n)
    }

    /// Drain completions, dispatch socket readiness, run deferred work.
    /// `timeout` bounds the wait for socket readiness only; completion
    /// polling never blocks.
    pub fn poll(&self, timeout: Duration) -> io::Result<()> {
        self.reactor.poll()?;
        self.event_loop.poll_once(timeout)
    }

    /// Begin teardown of every connection created from this context.
    pub fn close(&self) {
        self.reactor.closing_emitter().emit();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}
