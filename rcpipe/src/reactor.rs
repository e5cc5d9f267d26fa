//! Process-wide owner of the RDMA device state.
//!
//! One reactor per context owns the device, protection domain, completion
//! queue and shared receive queue. Connections create their queue pairs
//! against these, register themselves by queue-pair number, and get
//! completion events routed back through [`QpEventHandler`].
//!
//! Posting goes through the reactor because only a bounded number of send
//! work requests may be outstanding at once: requests beyond the budget
//! wait in a queue and are posted as completions free slots. A request
//! accepted by `post_write`/`post_ack` is guaranteed a completion event,
//! successful or failed: if the HCA refuses the post outright, the
//! reactor synthesizes a failed completion so the caller's in-flight
//! accounting still balances.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use verbs::{Cq, IbvAddress, Pd, QueuePair, Sge, Srq};

/// wr_id of RDMA data writes. Failed work completions do not reliably
/// expose their opcode, so the id is what classifies them.
pub const WRITE_REQUEST_ID: u64 = 1;
/// wr_id of acknowledgement sends.
pub const ACK_REQUEST_ID: u64 = 2;
/// wr_id of the zero-SGE receives kept posted on the SRQ.
const SRQ_RECV_ID: u64 = 0;

/// How many work completions to drain from the CQ per poll round.
const POLLED_COMPLETIONS: usize = 32;

/// Receiver of completion events for one queue pair.
pub trait QpEventHandler {
    /// The peer's RDMA write carrying `len` bytes landed in our inbox.
    fn on_remote_produced_data(&self, len: u32);
    /// The peer acknowledged consuming `len` bytes from its inbox.
    fn on_remote_consumed_data(&self, len: u32);
    /// One of our RDMA writes left the send queue.
    fn on_write_completed(&self);
    /// One of our acknowledgement sends left the send queue.
    fn on_ack_completed(&self);
    /// A work completion failed; `wr_id` classifies the request.
    fn on_error(&self, status: ibverbs_sys::ibv_wc_status::Type, wr_id: u64);
}

/// An RDMA write into the peer's inbox.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest {
    pub local: Sge,
    pub remote_addr: u64,
    pub rkey: u32,
    pub imm: u32,
}

struct PendingWrite {
    qp: Rc<QueuePair>,
    req: WriteRequest,
}

struct PendingAck {
    qp: Rc<QueuePair>,
    imm: u32,
}

/// Broadcast point for process-wide shutdown: every connection subscribes
/// a closure that closes it, and `Context::close` fires them all.
#[derive(Default)]
pub struct ClosingEmitter {
    next_token: Cell<u64>,
    closed: Cell<bool>,
    subscribers: RefCell<Vec<(u64, Rc<dyn Fn()>)>>,
}

impl ClosingEmitter {
    pub fn subscribe(&self, f: impl Fn() + 'static) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.subscribers.borrow_mut().push((token, Rc::new(f)));
        token
    }

    /// Whether `emit` already ran. A connection whose deferred
    /// initialization runs after the context closed checks this instead
    /// of waiting for a signal that already fired.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn unsubscribe(&self, token: u64) {
        self.subscribers.borrow_mut().retain(|(t, _)| *t != token);
    }

    pub fn emit(&self) {
        self.closed.set(true);
        // Subscribers may unsubscribe while running (teardown does), so
        // snapshot the list and re-check each token before calling out.
        let snapshot: Vec<(u64, Rc<dyn Fn()>)> = self.subscribers.borrow().clone();
        for (token, f) in snapshot {
            let still_subscribed = self
                .subscribers
                .borrow()
                .iter()
                .any(|(t, _)| *t == token);
            if still_subscribed {
                f();
            }
        }
    }
}

pub struct ReactorConfig {
    pub device_index: usize,
    pub port_num: u8,
    pub gid_index: u8,
    pub cq_capacity: i32,
    pub srq_capacity: u32,
    pub max_send_wr: u32,
}

pub struct Reactor {
    ctx: verbs::Context,
    pd: Pd,
    cq: Cq,
    srq: Srq,
    addr: IbvAddress,
    max_send_wr: u32,
    srq_capacity: u32,
    srq_posted: Cell<u32>,
    handlers: RefCell<HashMap<u32, Rc<dyn QpEventHandler>>>,
    available_writes: Cell<u32>,
    available_acks: Cell<u32>,
    pending_writes: RefCell<VecDeque<PendingWrite>>,
    pending_acks: RefCell<VecDeque<PendingAck>>,
    closing: ClosingEmitter,
}

impl Reactor {
    pub fn new(config: &ReactorConfig) -> io::Result<Self> {
        let ctx = verbs::Context::open(config.device_index)?;
        debug!(device = %ctx.device_name(), port = config.port_num, "opened RDMA device");
        let addr = ctx.query_address(config.port_num, config.gid_index)?;
        let pd = ctx.alloc_pd()?;
        let cq = ctx.create_cq(config.cq_capacity)?;
        let srq = pd.create_srq(config.srq_capacity)?;

        for _ in 0..config.srq_capacity {
            srq.post_zero_recv(SRQ_RECV_ID)?;
        }

        Ok(Self {
            ctx,
            pd,
            cq,
            srq,
            addr,
            max_send_wr: config.max_send_wr,
            srq_capacity: config.srq_capacity,
            srq_posted: Cell::new(config.srq_capacity),
            handlers: RefCell::new(HashMap::new()),
            available_writes: Cell::new(config.max_send_wr),
            available_acks: Cell::new(config.max_send_wr),
            pending_writes: RefCell::new(VecDeque::new()),
            pending_acks: RefCell::new(VecDeque::new()),
            closing: ClosingEmitter::default(),
        })
    }

    pub fn device(&self) -> &verbs::Context {
        &self.ctx
    }

    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    pub fn cq(&self) -> &Cq {
        &self.cq
    }

    pub fn srq(&self) -> &Srq {
        &self.srq
    }

    pub fn address(&self) -> &IbvAddress {
        &self.addr
    }

    pub fn max_send_wr(&self) -> u32 {
        self.max_send_wr
    }

    pub fn closing_emitter(&self) -> &ClosingEmitter {
        &self.closing
    }

    /// Route completions for `qp_num` to `handler`.
    pub fn register_qp(&self, qp_num: u32, handler: Rc<dyn QpEventHandler>) {
        self.handlers.borrow_mut().insert(qp_num, handler);
    }

    /// Drop the handler registration; the last completion for the pair
    /// must already have been drained.
    pub fn unregister_qp(&self, qp_num: u32) {
        self.handlers.borrow_mut().remove(&qp_num);
    }

    fn handler(&self, qp_num: u32) -> Option<Rc<dyn QpEventHandler>> {
        self.handlers.borrow().get(&qp_num).cloned()
    }

    /// Post an RDMA write, or queue it when the send budget is exhausted.
    pub fn post_write(&self, qp: &Rc<QueuePair>, req: WriteRequest) {
        if self.available_writes.get() == 0 {
            self.pending_writes.borrow_mut().push_back(PendingWrite {
                qp: qp.clone(),
                req,
            });
            return;
        }
        self.do_post_write(qp, &req);
    }

    /// Post an acknowledgement send, or queue it when the budget is
    /// exhausted.
    pub fn post_ack(&self, qp: &Rc<QueuePair>, imm: u32) {
        if self.available_acks.get() == 0 {
            self.pending_acks.borrow_mut().push_back(PendingAck {
                qp: qp.clone(),
                imm,
            });
            return;
        }
        self.do_post_ack(qp, imm);
    }

    fn do_post_write(&self, qp: &Rc<QueuePair>, req: &WriteRequest) {
        self.available_writes.set(self.available_writes.get() - 1);
        if let Err(e) = qp.post_rdma_write_imm(
            WRITE_REQUEST_ID,
            req.local,
            req.remote_addr,
            req.rkey,
            req.imm,
        ) {
            warn!(qp_num = qp.qp_num(), error = %e, "posting RDMA write failed");
            self.available_writes.set(self.available_writes.get() + 1);
            self.fail_request(qp.qp_num(), WRITE_REQUEST_ID);
        }
    }

    fn do_post_ack(&self, qp: &Rc<QueuePair>, imm: u32) {
        self.available_acks.set(self.available_acks.get() - 1);
        if let Err(e) = qp.post_send_imm(ACK_REQUEST_ID, imm) {
            warn!(qp_num = qp.qp_num(), error = %e, "posting ack send failed");
            self.available_acks.set(self.available_acks.get() + 1);
            self.fail_request(qp.qp_num(), ACK_REQUEST_ID);
        }
    }

    /// Deliver a synthetic failed completion so the owner's in-flight
    /// counters stay balanced when a post never reaches the HCA.
    fn fail_request(&self, qp_num: u32, wr_id: u64) {
        if let Some(handler) = self.handler(qp_num) {
            handler.on_error(ibverbs_sys::ibv_wc_status::IBV_WC_FATAL_ERR, wr_id);
        }
    }

    /// Drain the completion queue and dispatch everything found, then post
    /// any queued requests that the freed budget now admits.
    pub fn poll(&self) -> io::Result<()> {
        let mut completions = [ibverbs_sys::ibv_wc::default(); POLLED_COMPLETIONS];
        loop {
            let polled = self.cq.poll(&mut completions)?;
            if polled.is_empty() {
                break;
            }
            for wc in polled.iter() {
                self.handle_completion(wc);
            }
        }
        self.replenish_srq();
        self.drain_pending();
        Ok(())
    }

    fn handle_completion(&self, wc: &ibverbs_sys::ibv_wc) {
        let qp_num = wc.qp_num;
        let wr_id = wc.wr_id();

        if let Some((status, _vendor)) = wc.error() {
            match wr_id {
                WRITE_REQUEST_ID => self.available_writes.set(self.available_writes.get() + 1),
                ACK_REQUEST_ID => self.available_acks.set(self.available_acks.get() + 1),
                _ => self.srq_posted.set(self.srq_posted.get().saturating_sub(1)),
            }
            trace!(qp_num, wr_id, status, "failed work completion");
            if let Some(handler) = self.handler(qp_num) {
                handler.on_error(status, wr_id);
            }
            return;
        }

        match wc.opcode() {
            ibverbs_sys::ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => {
                self.srq_posted.set(self.srq_posted.get() - 1);
                let len = wc.imm_data().map(u32::from_be).unwrap_or(0);
                if len == 0 {
                    warn!(qp_num, "RDMA write completion without immediate data");
                    return;
                }
                if let Some(handler) = self.handler(qp_num) {
                    handler.on_remote_produced_data(len);
                }
            }
            ibverbs_sys::ibv_wc_opcode::IBV_WC_RECV => {
                self.srq_posted.set(self.srq_posted.get() - 1);
                let len = wc.imm_data().map(u32::from_be).unwrap_or(0);
                if len == 0 {
                    warn!(qp_num, "ack completion without immediate data");
                    return;
                }
                if let Some(handler) = self.handler(qp_num) {
                    handler.on_remote_consumed_data(len);
                }
            }
            ibverbs_sys::ibv_wc_opcode::IBV_WC_RDMA_WRITE => {
                self.available_writes.set(self.available_writes.get() + 1);
                if let Some(handler) = self.handler(qp_num) {
                    handler.on_write_completed();
                }
            }
            ibverbs_sys::ibv_wc_opcode::IBV_WC_SEND => {
                self.available_acks.set(self.available_acks.get() + 1);
                if let Some(handler) = self.handler(qp_num) {
                    handler.on_ack_completed();
                }
            }
            opcode => {
                warn!(qp_num, opcode, "unexpected work completion opcode");
            }
        }
    }

    fn replenish_srq(&self) {
        let posted = self.srq_posted.get();
        if posted >= self.srq_capacity * 2 / 3 {
            return;
        }
        for _ in posted..self.srq_capacity {
            if let Err(e) = self.srq.post_zero_recv(SRQ_RECV_ID) {
                warn!(error = %e, "replenishing SRQ failed");
                return;
            }
            self.srq_posted.set(self.srq_posted.get() + 1);
        }
    }

    fn drain_pending(&self) {
        while self.available_writes.get() > 0 {
            let Some(pending) = self.pending_writes.borrow_mut().pop_front() else {
                break;
            };
            self.do_post_write(&pending.qp, &pending.req);
        }
        while self.available_acks.get() > 0 {
            let Some(pending) = self.pending_acks.borrow_mut().pop_front() else {
                break;
            };
            self.do_post_ack(&pending.qp, pending.imm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closing_emitter_fires_all_subscribers() {
        let emitter = ClosingEmitter::default();
        let hits = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            emitter.subscribe(move || hits.set(hits.get() + 1));
        }
        emitter.emit();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn test_closing_emitter_unsubscribe() {
        let emitter = ClosingEmitter::default();
        let hits = Rc::new(Cell::new(0));
        let token = {
            let hits = hits.clone();
            emitter.subscribe(move || hits.set(hits.get() + 1))
        };
        emitter.unsubscribe(token);
        emitter.emit();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_closing_emitter_subscriber_may_unsubscribe_itself() {
        // A connection's closing callback leads to teardown, which
        // unsubscribes; the emitter must tolerate that re-entry.
        let emitter = Rc::new(ClosingEmitter::default());
        let hits = Rc::new(Cell::new(0));
        let token_cell = Rc::new(Cell::new(0u64));
        let token = {
            let emitter = emitter.clone();
            let hits = hits.clone();
            let token_cell = token_cell.clone();
            emitter.clone().subscribe(move || {
                hits.set(hits.get() + 1);
                emitter.unsubscribe(token_cell.get());
            })
        };
        token_cell.set(token);
        emitter.emit();
        emitter.emit();
        assert_eq!(hits.get(), 1);
    }
}
