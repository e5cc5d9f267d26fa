//! Page-aligned anonymous mappings for the ring buffers.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

/// A private anonymous mapping. Page alignment comes for free from mmap,
/// which is what memory region registration wants.
pub(crate) struct MappedBuffer {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl MappedBuffer {
    pub(crate) fn new(len: usize) -> io::Result<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length mapping"))?;
        let ptr = mmap_anonymous(
            None,
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
        .map_err(io::Error::from)?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // Nothing useful to do on failure; the mapping leaks.
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_zeroed_and_writable() {
        let buf = MappedBuffer::new(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        unsafe {
            assert_eq!(*buf.as_ptr(), 0);
            *buf.as_ptr() = 0xAB;
            assert_eq!(*buf.as_ptr(), 0xAB);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(MappedBuffer::new(0).is_err());
    }

    #[test]
    fn test_page_aligned() {
        let buf = MappedBuffer::new(4096).unwrap();
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
    }
}
