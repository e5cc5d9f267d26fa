//! Addressing types shared between the reactor and the handshake.

/// A 128-bit global identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    pub fn from_bytes(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.raw
    }

    /// All-zero GID, reported by ports that have no GID table entry at the
    /// queried index.
    pub fn is_null(&self) -> bool {
        self.raw == [0u8; 16]
    }
}

impl From<ibverbs_sys::ibv_gid> for Gid {
    fn from(gid: ibverbs_sys::ibv_gid) -> Self {
        Self {
            raw: unsafe { gid.raw },
        }
    }
}

impl From<Gid> for ibverbs_sys::ibv_gid {
    fn from(gid: Gid) -> Self {
        ibverbs_sys::ibv_gid { raw: gid.raw }
    }
}

/// Link layer constants from `ibv_port_attr.link_layer`.
pub const LINK_LAYER_INFINIBAND: u8 = 1;
pub const LINK_LAYER_ETHERNET: u8 = 2;

/// Local addressing information of the port a reactor drives. Captured
/// once at reactor construction and reused by every queue pair.
#[derive(Debug, Clone, Copy)]
pub struct IbvAddress {
    pub port_num: u8,
    pub lid: u16,
    pub gid: Gid,
    pub gid_index: u8,
    pub link_layer: u8,
    pub active_mtu: ibverbs_sys::ibv_mtu::Type,
}

/// Everything one endpoint must tell the other to bring a queue pair to
/// RTS: addressing (port, LID, GID), queue pair number, initial packet
/// sequence number and the port MTU. Exchanged once over TCP during the
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupInformation {
    pub port_num: u8,
    pub lid: u16,
    pub gid: Gid,
    pub qp_num: u32,
    pub psn: u32,
    pub mtu: u32,
}

impl SetupInformation {
    pub fn new(addr: &IbvAddress, qp_num: u32, psn: u32) -> Self {
        Self {
            port_num: addr.port_num,
            lid: addr.lid,
            gid: addr.gid,
            qp_num,
            psn,
            mtu: addr.active_mtu,
        }
    }
}
