//! Shared receive queue management.
//!
//! Both inbound message classes of the transport (RDMA write with
//! immediate, zero-length send with immediate) deliver their payload out of
//! band, so the receives posted here never reference memory: a zero-SGE
//! receive absorbs exactly one inbound completion.

use std::rc::Rc;
use std::{io, ptr, ptr::NonNull};

use crate::pd::Pd;

pub(crate) struct SrqInner {
    srq: NonNull<ibverbs_sys::ibv_srq>,
    _pd: Pd,
}

impl Drop for SrqInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_srq(self.srq.as_ptr());
        }
    }
}

/// A shared receive queue, consumed by every queue pair of the reactor.
#[derive(Clone)]
pub struct Srq(Rc<SrqInner>);

impl Pd {
    pub fn create_srq(&self, max_wr: u32) -> io::Result<Srq> {
        let mut attr = ibverbs_sys::ibv_srq_init_attr {
            srq_context: ptr::null_mut(),
            attr: ibverbs_sys::ibv_srq_attr {
                max_wr,
                max_sge: 1,
                srq_limit: 0,
            },
        };
        unsafe {
            let srq = ibverbs_sys::ibv_create_srq(self.as_ptr(), &mut attr);
            NonNull::new(srq).map_or(Err(io::Error::last_os_error()), |srq| {
                Ok(Srq(Rc::new(SrqInner {
                    srq,
                    _pd: self.clone(),
                })))
            })
        }
    }
}

impl Srq {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_srq {
        self.0.srq.as_ptr()
    }

    /// Post one zero-SGE receive.
    pub fn post_zero_recv(&self, wr_id: u64) -> io::Result<()> {
        let mut wr = ibverbs_sys::ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: ptr::null_mut(),
            num_sge: 0,
        };
        let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
        let srq = self.as_ptr();
        let errno = unsafe {
            let ctx = (*srq).context;
            let ops = &mut (*ctx).ops;
            ops.post_srq_recv.as_mut().unwrap()(srq, &mut wr, &mut bad_wr)
        };
        if errno != 0 {
            Err(io::Error::from_raw_os_error(errno))
        } else {
            Ok(())
        }
    }
}
