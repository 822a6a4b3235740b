//! Size-class allocator over hugepage-backed slabs.
//!
//! Each slab is mapped once, registered once with the transport, and carved
//! into power-of-two objects; every MsgBuffer inherits its slab's memory
//! handle. Allocation and free are O(1) list operations. The allocator is
//! owned by a single RPC instance, so there is no locking.

use std::ptr::NonNull;

use log::warn;

use crate::buffer::MsgBuffer;
use crate::error::{Error, Result};
use crate::transport::{MemHandle, MemRegistrar};

/// Smallest size class.
const MIN_CLASS_SIZE: usize = 64;

/// Largest size class (8 MiB).
const MAX_CLASS_SIZE: usize = 8 << 20;

/// Number of power-of-two classes, 64 B through 8 MiB.
const NUM_CLASSES: usize = 18;

/// Preferred slab mapping size; one 2 MiB hugepage.
const SLAB_SIZE: usize = 2 << 20;

/// Allocation surface handed to foreground request handlers, for
/// responses that do not fit the preallocated buffer. Background handlers
/// run off the owning thread and are limited to the preallocated response.
pub trait MsgAlloc {
    fn alloc_msg_buffer(&mut self, size: usize) -> Result<MsgBuffer>;
    fn free_msg_buffer(&mut self, buf: MsgBuffer);
}

struct RawBuf {
    ptr: NonNull<u8>,
    lkey: MemHandle,
}

struct Slab {
    ptr: NonNull<u8>,
    len: usize,
}

/// Hugepage slab allocator with per-class free lists.
pub struct HugeAlloc {
    freelists: Vec<Vec<RawBuf>>,
    slabs: Vec<Slab>,
    total_mapped: usize,
    hugepages_unavailable: bool,
}

impl HugeAlloc {
    pub fn new() -> Self {
        Self {
            freelists: (0..NUM_CLASSES).map(|_| Vec::new()).collect(),
            slabs: Vec::new(),
            total_mapped: 0,
            hugepages_unavailable: false,
        }
    }

    /// Size class for an allocation, or None if it exceeds the largest
    /// class (such requests get a dedicated slab).
    fn class_for(size: usize) -> Option<usize> {
        if size > MAX_CLASS_SIZE {
            return None;
        }
        let rounded = size.next_power_of_two().max(MIN_CLASS_SIZE);
        Some(rounded.trailing_zeros() as usize - MIN_CLASS_SIZE.trailing_zeros() as usize)
    }

    #[inline]
    fn class_size(class: usize) -> usize {
        MIN_CLASS_SIZE << class
    }

    /// Map an anonymous region, preferring 2 MiB hugepages and falling
    /// back to ordinary pages when none are configured.
    fn map_region(&mut self, len: usize) -> Result<NonNull<u8>> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let base_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        if !self.hugepages_unavailable {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    prot,
                    base_flags | libc::MAP_HUGETLB,
                    -1,
                    0,
                )
            };
            if ptr != libc::MAP_FAILED {
                return Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) });
            }
            self.hugepages_unavailable = true;
            warn!("hugepage mapping failed, falling back to 4 KiB pages");
        }

        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, base_flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }
        Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
    }

    /// Map and register a new slab, then carve it into `class` objects.
    fn refill_class(&mut self, class: usize, reg: &mut dyn MemRegistrar) -> Result<()> {
        let obj_size = Self::class_size(class);
        let slab_len = SLAB_SIZE.max(obj_size);
        let ptr = self.map_region(slab_len)?;
        let lkey = reg.reg_mr(ptr, slab_len).map_err(|_| Error::OutOfMemory)?;

        self.slabs.push(Slab { ptr, len: slab_len });
        self.total_mapped += slab_len;

        let count = slab_len / obj_size;
        for i in 0..count {
            let obj = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(i * obj_size)) };
            self.freelists[class].push(RawBuf { ptr: obj, lkey });
        }
        Ok(())
    }

    fn alloc_raw(&mut self, size: usize, reg: &mut dyn MemRegistrar) -> Result<(RawBuf, u8)> {
        match Self::class_for(size) {
            Some(class) => {
                if self.freelists[class].is_empty() {
                    self.refill_class(class, reg)?;
                }
                let buf = self.freelists[class].pop().ok_or(Error::OutOfMemory)?;
                Ok((buf, class as u8))
            }
            None => {
                // Direct slab mapping for outsized allocations; freed
                // objects of this kind are not recycled.
                let ptr = self.map_region(size)?;
                let lkey = reg.reg_mr(ptr, size).map_err(|_| Error::OutOfMemory)?;
                self.slabs.push(Slab { ptr, len: size });
                self.total_mapped += size;
                Ok((RawBuf { ptr, lkey }, u8::MAX))
            }
        }
    }

    /// Allocate a MsgBuffer with headroom for one packet header per
    /// fragment at the given MTU payload capacity.
    pub fn alloc_msg_buffer(
        &mut self,
        max_data_size: usize,
        max_data_per_pkt: usize,
        reg: &mut dyn MemRegistrar,
    ) -> Result<MsgBuffer> {
        let total = MsgBuffer::alloc_size(max_data_size, max_data_per_pkt);
        let (raw, class) = self.alloc_raw(total, reg)?;
        Ok(MsgBuffer::from_raw(
            raw.ptr,
            max_data_size,
            max_data_per_pkt,
            raw.lkey,
            class,
        ))
    }

    /// Return a MsgBuffer's memory to its class free list.
    pub fn free_msg_buffer(&mut self, buf: MsgBuffer) {
        let class = buf.class();
        if class == u8::MAX {
            // Dedicated slab; reclaimed with the allocator.
            return;
        }
        self.freelists[class as usize].push(RawBuf {
            ptr: buf.base_ptr(),
            lkey: buf.lkey(),
        });
    }

    /// Total bytes mapped from the OS.
    #[inline]
    pub fn total_mapped(&self) -> usize {
        self.total_mapped
    }
}

impl Default for HugeAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HugeAlloc {
    fn drop(&mut self) {
        for slab in &self.slabs {
            unsafe {
                libc::munmap(slab.ptr.as_ptr() as *mut libc::c_void, slab.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopRegistrar;

    impl MemRegistrar for NoopRegistrar {
        fn reg_mr(&mut self, _ptr: NonNull<u8>, _len: usize) -> Result<MemHandle> {
            Ok(MemHandle(0x1234))
        }
    }

    #[test]
    fn test_class_rounding() {
        assert_eq!(HugeAlloc::class_for(1), Some(0));
        assert_eq!(HugeAlloc::class_for(64), Some(0));
        assert_eq!(HugeAlloc::class_for(65), Some(1));
        assert_eq!(HugeAlloc::class_for(4096), Some(6));
        assert_eq!(HugeAlloc::class_for(MAX_CLASS_SIZE), Some(NUM_CLASSES - 1));
        assert_eq!(HugeAlloc::class_for(MAX_CLASS_SIZE + 1), None);
    }

    #[test]
    fn test_alloc_free_recycles() {
        let mut alloc = HugeAlloc::new();
        let mut reg = NoopRegistrar;

        let buf = alloc.alloc_msg_buffer(1000, 1024, &mut reg).unwrap();
        assert_eq!(buf.data_size(), 1000);
        assert_eq!(buf.lkey(), MemHandle(0x1234));
        let mapped = alloc.total_mapped();
        let ptr = buf.base_ptr();

        alloc.free_msg_buffer(buf);
        let buf2 = alloc.alloc_msg_buffer(1000, 1024, &mut reg).unwrap();
        assert_eq!(buf2.base_ptr(), ptr);
        assert_eq!(alloc.total_mapped(), mapped);
        alloc.free_msg_buffer(buf2);
    }

    #[test]
    fn test_buffers_are_writable() {
        let mut alloc = HugeAlloc::new();
        let mut reg = NoopRegistrar;

        let mut buf = alloc.alloc_msg_buffer(4096, 1024, &mut reg).unwrap();
        for (i, b) in buf.data_mut().iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(buf.data()[255], 255);
        alloc.free_msg_buffer(buf);
    }

    #[test]
    fn test_distinct_buffers_disjoint() {
        let mut alloc = HugeAlloc::new();
        let mut reg = NoopRegistrar;

        let a = alloc.alloc_msg_buffer(1024, 1024, &mut reg).unwrap();
        let b = alloc.alloc_msg_buffer(1024, 1024, &mut reg).unwrap();
        let sz = MsgBuffer::alloc_size(1024, 1024);
        let (pa, pb) = (a.base_ptr().as_ptr() as usize, b.base_ptr().as_ptr() as usize);
        assert!(pa + sz <= pb || pb + sz <= pa);
        alloc.free_msg_buffer(a);
        alloc.free_msg_buffer(b);
    }
}
