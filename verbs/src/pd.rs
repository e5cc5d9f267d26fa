//! Protection domain and memory region management.
//!
//! Memory regions must be registered within a PD before the HCA can read
//! from or write into them. The inbox of a connection is registered with
//! remote-write access; the outbox is only ever a local RDMA source and is
//! registered with no access flags at all.

use std::rc::Rc;
use std::{io, ptr::NonNull};

use bitflags::bitflags;

use crate::device::Context;

bitflags! {
    /// Memory access flags for memory region registration.
    ///
    /// If `REMOTE_WRITE` is set, `LOCAL_WRITE` must also be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = ibverbs_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0;
        const REMOTE_WRITE = ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
        const REMOTE_READ = ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ.0;
    }
}

pub(crate) struct PdInner {
    pd: NonNull<ibverbs_sys::ibv_pd>,
    /// Keep the context alive while this PD exists.
    _ctx: Context,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_dealloc_pd(self.pd.as_ptr());
        }
    }
}

/// Protection domain. All resources that work together (QPs, MRs, SRQs)
/// must be created within the same PD. Cheaply cloneable.
#[derive(Clone)]
pub struct Pd(Rc<PdInner>);

impl Context {
    pub fn alloc_pd(&self) -> io::Result<Pd> {
        unsafe {
            let pd = ibverbs_sys::ibv_alloc_pd(self.as_ptr());
            NonNull::new(pd).map_or(Err(io::Error::last_os_error()), |pd| {
                Ok(Pd(Rc::new(PdInner {
                    pd,
                    _ctx: self.clone(),
                })))
            })
        }
    }
}

impl Pd {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_pd {
        self.0.pd.as_ptr()
    }

    /// Register a memory region with the HCA.
    ///
    /// # Safety
    /// The buffer at `addr..addr + len` must stay valid for the lifetime of
    /// the returned `MemoryRegion`.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let mr = ibverbs_sys::ibv_reg_mr(
            self.as_ptr(),
            addr as *mut std::ffi::c_void,
            len,
            access.bits() as i32,
        );
        NonNull::new(mr).map_or(Err(io::Error::last_os_error()), |mr| {
            Ok(MemoryRegion {
                mr,
                _pd: self.clone(),
            })
        })
    }
}

/// A registered memory region; deregistered on drop.
pub struct MemoryRegion {
    mr: NonNull<ibverbs_sys::ibv_mr>,
    /// Keep the PD alive while this MR exists.
    _pd: Pd,
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_dereg_mr(self.mr.as_ptr());
        }
    }
}

impl MemoryRegion {
    /// Local key, used in scatter/gather entries of posted work requests.
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    /// Remote key, handed to the peer to authorise RDMA writes into this
    /// region.
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    pub fn addr(&self) -> *mut u8 {
        unsafe { (*self.mr.as_ptr()).addr as *mut u8 }
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.mr.as_ptr()).length }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
