//! Completion queue creation and polling.

use std::rc::Rc;
use std::{io, ptr, ptr::NonNull};

use crate::device::Context;

pub(crate) struct CqInner {
    cq: NonNull<ibverbs_sys::ibv_cq>,
    _ctx: Context,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_cq(self.cq.as_ptr());
        }
    }
}

/// A completion queue. One per reactor; shared by the send and receive
/// sides of every queue pair in the process.
#[derive(Clone)]
pub struct Cq(Rc<CqInner>);

impl Context {
    pub fn create_cq(&self, capacity: i32) -> io::Result<Cq> {
        unsafe {
            let cq = ibverbs_sys::ibv_create_cq(
                self.as_ptr(),
                capacity,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            NonNull::new(cq).map_or(Err(io::Error::last_os_error()), |cq| {
                Ok(Cq(Rc::new(CqInner {
                    cq,
                    _ctx: self.clone(),
                })))
            })
        }
    }
}

impl Cq {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_cq {
        self.0.cq.as_ptr()
    }

    /// Drain up to `completions.len()` work completions without blocking.
    /// Returns the filled prefix of `completions`.
    pub fn poll<'c>(
        &self,
        completions: &'c mut [ibverbs_sys::ibv_wc],
    ) -> io::Result<&'c mut [ibverbs_sys::ibv_wc]> {
        let cq = self.as_ptr();
        let n = unsafe {
            let ctx = (*cq).context;
            let ops = &mut (*ctx).ops;
            ops.poll_cq.as_mut().unwrap()(cq, completions.len() as i32, completions.as_mut_ptr())
        };
        if n < 0 {
            Err(io::Error::other("ibv_poll_cq failed"))
        } else {
            Ok(&mut completions[0..n as usize])
        }
    }
}
