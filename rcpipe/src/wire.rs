//! Wire codec for the handshake setup blob.
//!
//! The blob is sent exactly once in each direction over the TCP socket,
//! straight after connect/accept. Fixed layout, little-endian:
//!
//! ```text
//! offset  size  field
//!      0     2  lid
//!      2    16  gid
//!     18     4  qp_num
//!     22     4  psn
//!     26     4  mtu
//!     30     1  port_num
//!     31     8  inbox buffer virtual address
//!     39     4  inbox rkey
//! ```

use verbs::{Gid, SetupInformation};

/// Serialized size of the setup blob.
pub const SETUP_BLOB_SIZE: usize = 43;

/// One side's half of the handshake: how to reach its queue pair, and
/// where its inbox lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupBlob {
    pub setup: SetupInformation,
    pub inbox_addr: u64,
    pub inbox_rkey: u32,
}

impl SetupBlob {
    pub fn to_bytes(&self) -> [u8; SETUP_BLOB_SIZE] {
        let mut buf = [0u8; SETUP_BLOB_SIZE];
        buf[0..2].copy_from_slice(&self.setup.lid.to_le_bytes());
        buf[2..18].copy_from_slice(self.setup.gid.as_bytes());
        buf[18..22].copy_from_slice(&self.setup.qp_num.to_le_bytes());
        buf[22..26].copy_from_slice(&self.setup.psn.to_le_bytes());
        buf[26..30].copy_from_slice(&self.setup.mtu.to_le_bytes());
        buf[30] = self.setup.port_num;
        buf[31..39].copy_from_slice(&self.inbox_addr.to_le_bytes());
        buf[39..43].copy_from_slice(&self.inbox_rkey.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SETUP_BLOB_SIZE]) -> Self {
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[2..18]);
        Self {
            setup: SetupInformation {
                lid: u16::from_le_bytes([buf[0], buf[1]]),
                gid: Gid::from_bytes(gid),
                qp_num: u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]),
                psn: u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]),
                mtu: u32::from_le_bytes([buf[26], buf[27], buf[28], buf[29]]),
                port_num: buf[30],
            },
            inbox_addr: u64::from_le_bytes([
                buf[31], buf[32], buf[33], buf[34], buf[35], buf[36], buf[37], buf[38],
            ]),
            inbox_rkey: u32::from_le_bytes([buf[39], buf[40], buf[41], buf[42]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SetupBlob {
        SetupBlob {
            setup: SetupInformation {
                port_num: 2,
                lid: 0x1234,
                gid: Gid::from_bytes([
                    0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x02, 0x11, 0x22, 0xff, 0xfe, 0x33, 0x44, 0x55,
                ]),
                qp_num: 0x00AB_CDEF,
                psn: 0x0013_57BD,
                mtu: 5,
            },
            inbox_addr: 0x7f00_dead_beef_0000,
            inbox_rkey: 0x90AB_12CD,
        }
    }

    #[test]
    fn test_roundtrip() {
        let blob = sample();
        let bytes = blob.to_bytes();
        assert_eq!(SetupBlob::from_bytes(&bytes), blob);
    }

    #[test]
    fn test_layout_is_little_endian() {
        let blob = sample();
        let bytes = blob.to_bytes();
        assert_eq!(&bytes[0..2], &[0x34, 0x12]);
        assert_eq!(&bytes[18..22], &[0xEF, 0xCD, 0xAB, 0x00]);
        assert_eq!(bytes[30], 2);
        assert_eq!(&bytes[39..43], &[0xCD, 0x12, 0xAB, 0x90]);
    }

    #[test]
    fn test_size_matches_layout() {
        assert_eq!(SETUP_BLOB_SIZE, 2 + 16 + 4 + 4 + 4 + 1 + 8 + 4);
        assert_eq!(sample().to_bytes().len(), SETUP_BLOB_SIZE);
    }
}
