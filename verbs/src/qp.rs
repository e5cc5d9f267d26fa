//! Reliable-connection queue pairs.
//!
//! A queue pair starts in RESET, is brought to INIT right after creation,
//! and reaches RTS after the peers have exchanged their
//! [`SetupInformation`](crate::types::SetupInformation) out of band. Moving
//! it to ERROR makes the HCA flush every outstanding work request back
//! through the completion queue, which the owner uses to reclaim in-flight
//! requests before tearing the pair down.

use std::{io, ptr, ptr::NonNull};

use crate::cq::Cq;
use crate::pd::Pd;
use crate::srq::Srq;
use crate::types::{IbvAddress, SetupInformation, LINK_LAYER_ETHERNET};

/// A local scatter/gather entry for a posted work request.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// An RC queue pair bound to a shared CQ and SRQ; destroyed on drop.
///
/// Every send is signalled (`sq_sig_all = 1`), so each posted request is
/// guaranteed a completion event, successful or flushed.
pub struct QueuePair {
    qp: NonNull<ibverbs_sys::ibv_qp>,
    _cq: Cq,
    _srq: Srq,
    _pd: Pd,
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_qp(self.qp.as_ptr());
        }
    }
}

impl Pd {
    /// Create an RC queue pair whose send and receive completions both
    /// land on `cq` and whose receives come from `srq`.
    pub fn create_rc_qp(&self, cq: &Cq, srq: &Srq, max_send_wr: u32) -> io::Result<QueuePair> {
        let mut attr = ibverbs_sys::ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: cq.as_ptr(),
            recv_cq: cq.as_ptr(),
            srq: srq.as_ptr(),
            cap: ibverbs_sys::ibv_qp_cap {
                max_send_wr,
                max_recv_wr: 0,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            qp_type: ibverbs_sys::ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 1,
        };
        unsafe {
            let qp = ibverbs_sys::ibv_create_qp(self.as_ptr(), &mut attr);
            NonNull::new(qp).map_or(Err(io::Error::last_os_error()), |qp| {
                Ok(QueuePair {
                    qp,
                    _cq: cq.clone(),
                    _srq: srq.clone(),
                    _pd: self.clone(),
                })
            })
        }
    }
}

impl QueuePair {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_qp {
        self.qp.as_ptr()
    }

    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.qp.as_ptr()).qp_num }
    }

    fn modify(&self, attr: &mut ibverbs_sys::ibv_qp_attr, mask: ibverbs_sys::ibv_qp_attr_mask) -> io::Result<()> {
        let errno = unsafe { ibverbs_sys::ibv_modify_qp(self.as_ptr(), attr, mask.0 as i32) };
        if errno != 0 {
            Err(io::Error::from_raw_os_error(errno))
        } else {
            Ok(())
        }
    }

    /// RESET → INIT. The pair accepts remote writes into memory regions
    /// registered with remote-write access.
    pub fn to_init(&self, addr: &IbvAddress) -> io::Result<()> {
        let mut attr = ibverbs_sys::ibv_qp_attr {
            qp_state: ibverbs_sys::ibv_qp_state::IBV_QPS_INIT,
            pkey_index: 0,
            port_num: addr.port_num,
            qp_access_flags: (ibverbs_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
                .0,
            ..Default::default()
        };
        let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PORT
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        self.modify(&mut attr, mask)
    }

    /// INIT → RTR, addressed at the peer described by `remote`.
    ///
    /// Routing is global (GRH) when the port runs RoCE or when the peer
    /// reported no LID; plain LID routing otherwise.
    pub fn to_rtr(&self, addr: &IbvAddress, remote: &SetupInformation) -> io::Result<()> {
        let mut attr = ibverbs_sys::ibv_qp_attr {
            qp_state: ibverbs_sys::ibv_qp_state::IBV_QPS_RTR,
            path_mtu: addr.active_mtu.min(remote.mtu),
            dest_qp_num: remote.qp_num,
            rq_psn: remote.psn,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
            ah_attr: ibverbs_sys::ibv_ah_attr {
                dlid: remote.lid,
                sl: 0,
                src_path_bits: 0,
                // Egress port as advertised in the peer's setup blob.
                port_num: remote.port_num,
                grh: Default::default(),
                ..Default::default()
            },
            ..Default::default()
        };
        if addr.link_layer == LINK_LAYER_ETHERNET || remote.lid == 0 {
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid = remote.gid.into();
            attr.ah_attr.grh.hop_limit = 0xff;
            attr.ah_attr.grh.sgid_index = addr.gid_index;
        }
        let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_AV
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify(&mut attr, mask)
    }

    /// RTR → RTS, using this side's setup information for the send PSN.
    pub fn to_rts(&self, local: &SetupInformation) -> io::Result<()> {
        let mut attr = ibverbs_sys::ibv_qp_attr {
            qp_state: ibverbs_sys::ibv_qp_state::IBV_QPS_RTS,
            sq_psn: local.psn,
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            max_rd_atomic: 1,
            ..Default::default()
        };
        let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        self.modify(&mut attr, mask)
    }

    /// Force the pair into ERROR, flushing all outstanding work requests
    /// back through the completion queue as failed completions.
    pub fn to_error(&self) -> io::Result<()> {
        let mut attr = ibverbs_sys::ibv_qp_attr {
            qp_state: ibverbs_sys::ibv_qp_state::IBV_QPS_ERR,
            ..Default::default()
        };
        self.modify(&mut attr, ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE)
    }

    fn post_send_wr(&self, wr: &mut ibverbs_sys::ibv_send_wr) -> io::Result<()> {
        let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
        let qp = self.as_ptr();
        let errno = unsafe {
            let ctx = (*qp).context;
            let ops = &mut (*ctx).ops;
            ops.post_send.as_mut().unwrap()(qp, wr, &mut bad_wr)
        };
        if errno != 0 {
            Err(io::Error::from_raw_os_error(errno))
        } else {
            Ok(())
        }
    }

    /// Post a one-sided RDMA write carrying an immediate value. The
    /// immediate crosses the wire in network byte order.
    pub fn post_rdma_write_imm(
        &self,
        wr_id: u64,
        local: Sge,
        remote_addr: u64,
        rkey: u32,
        imm: u32,
    ) -> io::Result<()> {
        let sge = ibverbs_sys::ibv_sge {
            addr: local.addr,
            length: local.len,
            lkey: local.lkey,
        };
        let mut sg_list = [sge];
        let mut wr = ibverbs_sys::ibv_send_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: sg_list.as_mut_ptr(),
            num_sge: 1,
            opcode: ibverbs_sys::ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
            send_flags: ibverbs_sys::ibv_send_flags::IBV_SEND_SIGNALED.0,
            wr: ibverbs_sys::ibv_send_wr__bindgen_ty_2 {
                rdma: ibverbs_sys::ibv_send_wr__bindgen_ty_2__bindgen_ty_1 { remote_addr, rkey },
            },
            qp_type: Default::default(),
            __bindgen_anon_1: ibverbs_sys::ibv_send_wr__bindgen_ty_1 {
                imm_data: imm.to_be(),
            },
            __bindgen_anon_2: Default::default(),
        };
        self.post_send_wr(&mut wr)
    }

    /// Post a zero-payload send whose only content is the immediate value.
    pub fn post_send_imm(&self, wr_id: u64, imm: u32) -> io::Result<()> {
        let mut wr = ibverbs_sys::ibv_send_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: ptr::null_mut(),
            num_sge: 0,
            opcode: ibverbs_sys::ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
            send_flags: ibverbs_sys::ibv_send_flags::IBV_SEND_SIGNALED.0,
            wr: Default::default(),
            qp_type: Default::default(),
            __bindgen_anon_1: ibverbs_sys::ibv_send_wr__bindgen_ty_1 {
                imm_data: imm.to_be(),
            },
            __bindgen_anon_2: Default::default(),
        };
        self.post_send_wr(&mut wr)
    }
}
