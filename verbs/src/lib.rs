//! Thin, scoped wrappers over libibverbs.
//!
//! Every resource (context, PD, CQ, SRQ, MR, QP) is a handle that releases
//! the underlying verbs object on drop. Handles that other resources depend
//! on (context, PD) are reference counted so the dependents can keep them
//! alive. All types are single-threaded by design; none of them is `Send`.
//!
//! Only what an RC byte-stream transport needs is exposed: RDMA write with
//! immediate, zero-length send with immediate, zero-SGE receives on a
//! shared receive queue, and the INIT → RTR → RTS → ERROR transitions.

#![allow(unsafe_op_in_unsafe_fn)]

pub mod cq;
pub mod device;
pub mod pd;
pub mod qp;
pub mod srq;
pub mod types;

pub use cq::Cq;
pub use device::Context;
pub use pd::{AccessFlags, MemoryRegion, Pd};
pub use qp::{QueuePair, Sge};
pub use srq::Srq;
pub use types::{Gid, IbvAddress, SetupInformation};

/// Human-readable form of a work-completion status.
pub fn wc_status_str(status: ibverbs_sys::ibv_wc_status::Type) -> String {
    unsafe {
        let s = ibverbs_sys::ibv_wc_status_str(status);
        if s.is_null() {
            return format!("unknown status {}", status);
        }
        std::ffi::CStr::from_ptr(s).to_string_lossy().into_owned()
    }
}
