//! Device context management.
//!
//! There is no standalone device-list type here: the transport only ever
//! opens one device by index, so enumeration, the name lookup, and the
//! open happen in one step and the list is released before `open`
//! returns. `query_address` then validates that the chosen port can
//! actually carry RC traffic before any queue pair is built on it.

use std::ffi::CStr;
use std::rc::Rc;
use std::{io, ptr::NonNull};

use crate::types::{Gid, IbvAddress, LINK_LAYER_ETHERNET, LINK_LAYER_INFINIBAND};

pub(crate) struct ContextInner {
    ctx: NonNull<ibverbs_sys::ibv_context>,
    name: String,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_close_device(self.ctx.as_ptr());
        }
    }
}

/// An open device context. Cheaply cloneable; the device is closed when
/// the last clone drops.
#[derive(Clone)]
pub struct Context(Rc<ContextInner>);

impl Context {
    /// Open the `device_index`-th RDMA device on the host.
    pub fn open(device_index: usize) -> io::Result<Context> {
        let mut num_devices = 0i32;
        let list = unsafe { ibverbs_sys::ibv_get_device_list(&mut num_devices) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }

        let opened = if device_index >= num_devices as usize {
            Err(io::Error::other(format!(
                "RDMA device {} not found ({} present)",
                device_index, num_devices
            )))
        } else {
            unsafe {
                let device = *list.add(device_index);
                let name_ptr = ibverbs_sys::ibv_get_device_name(device);
                let name = if name_ptr.is_null() {
                    String::from("<unnamed>")
                } else {
                    CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
                };
                NonNull::new(ibverbs_sys::ibv_open_device(device))
                    .map(|ctx| (ctx, name))
                    .ok_or_else(io::Error::last_os_error)
            }
        };
        unsafe { ibverbs_sys::ibv_free_device_list(list) };

        let (ctx, name) = opened?;
        Ok(Context(Rc::new(ContextInner { ctx, name })))
    }

    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_context {
        self.0.ctx.as_ptr()
    }

    pub fn device_name(&self) -> &str {
        &self.0.name
    }

    pub fn query_port(&self, port_num: u8) -> io::Result<ibverbs_sys::ibv_port_attr> {
        let mut port_attr = ibverbs_sys::ibv_port_attr::default();
        let errno = unsafe {
            ibverbs_sys::ibv_query_port(
                self.as_ptr(),
                port_num,
                &mut port_attr as *mut ibverbs_sys::ibv_port_attr as *mut _,
            )
        };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(port_attr)
    }

    pub fn query_gid(&self, port_num: u8, index: i32) -> io::Result<Gid> {
        let mut gid = ibverbs_sys::ibv_gid::default();
        let errno = unsafe { ibverbs_sys::ibv_query_gid(self.as_ptr(), port_num, index, &mut gid) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(Gid::from(gid))
    }

    /// Snapshot the addressing information of one port, for queue-pair
    /// setup, rejecting ports that cannot carry an RC byte stream: the
    /// port must be active, and a RoCE port needs a populated GID at
    /// `gid_index` because its peers are reached by global routing.
    pub fn query_address(&self, port_num: u8, gid_index: u8) -> io::Result<IbvAddress> {
        let port_attr = self.query_port(port_num)?;
        if port_attr.state != ibverbs_sys::ibv_port_state::IBV_PORT_ACTIVE {
            return Err(io::Error::other(format!(
                "port {} of {} is not active",
                port_num,
                self.device_name()
            )));
        }
        if port_attr.link_layer != LINK_LAYER_INFINIBAND
            && port_attr.link_layer != LINK_LAYER_ETHERNET
        {
            return Err(io::Error::other(format!(
                "port {} of {} has unsupported link layer {}",
                port_num,
                self.device_name(),
                port_attr.link_layer
            )));
        }
        let gid = self.query_gid(port_num, gid_index as i32)?;
        if port_attr.link_layer == LINK_LAYER_ETHERNET && gid.is_null() {
            return Err(io::Error::other(format!(
                "port {} of {} has no GID at index {}",
                port_num,
                self.device_name(),
                gid_index
            )));
        }
        Ok(IbvAddress {
            port_num,
            lid: port_attr.lid,
            gid,
            gid_index,
            link_layer: port_attr.link_layer,
            active_mtu: port_attr.active_mtu,
        })
    }
}
