//! Message buffers with reserved packet-header headroom.
//!
//! A MsgBuffer is carved from a DMA-registered slab and serves both the
//! application payload and the wire framing of every fragment: header slot
//! 0 immediately precedes the payload, header slots 1..n-1 trail the
//! payload capacity region at fixed offsets. Resizing adjusts the logical
//! size and fragment count in O(1) and never reallocates.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::packet::{PktHdr, PKT_HDR_SIZE};
use crate::transport::MemHandle;

/// A message buffer.
///
/// Created by `Rpc::alloc_msg_buffer`, freed by `Rpc::free_msg_buffer`.
/// While attached to an in-flight RPC the buffer is loaned to the engine
/// and must not be mutated or freed by the caller.
pub struct MsgBuffer {
    /// Payload start; header slot 0 sits `PKT_HDR_SIZE` bytes before it.
    buf: NonNull<u8>,
    data_size: usize,
    max_data_size: usize,
    num_pkts: u16,
    max_num_pkts: u16,
    max_data_per_pkt: u32,
    lkey: MemHandle,
    class: u8,
}

// A MsgBuffer owns exclusive access to its slab range; request handles
// carry buffers to background workers.
unsafe impl Send for MsgBuffer {}

impl MsgBuffer {
    /// Total allocation needed for a buffer of `max_data_size` payload
    /// bytes fragmented at `max_data_per_pkt`.
    pub(crate) fn alloc_size(max_data_size: usize, max_data_per_pkt: usize) -> usize {
        let max_pkts = PktHdr::calc_num_pkts(max_data_size, max_data_per_pkt) as usize;
        PKT_HDR_SIZE + max_data_size + (max_pkts - 1) * PKT_HDR_SIZE
    }

    /// Wrap raw slab memory. `base` points at the start of the allocation
    /// (header slot 0), not the payload.
    pub(crate) fn from_raw(
        base: NonNull<u8>,
        max_data_size: usize,
        max_data_per_pkt: usize,
        lkey: MemHandle,
        class: u8,
    ) -> Self {
        let max_num_pkts = PktHdr::calc_num_pkts(max_data_size, max_data_per_pkt);
        Self {
            buf: unsafe { NonNull::new_unchecked(base.as_ptr().add(PKT_HDR_SIZE)) },
            data_size: max_data_size,
            max_data_size,
            num_pkts: max_num_pkts,
            max_num_pkts,
            max_data_per_pkt: max_data_per_pkt as u32,
            lkey,
            class,
        }
    }

    /// Current logical payload size.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Maximum payload size fixed at allocation.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Fragments in the current message.
    #[inline]
    pub fn num_pkts(&self) -> u16 {
        self.num_pkts
    }

    #[inline]
    pub fn max_num_pkts(&self) -> u16 {
        self.max_num_pkts
    }

    #[inline]
    pub(crate) fn lkey(&self) -> MemHandle {
        self.lkey
    }

    #[inline]
    pub(crate) fn class(&self) -> u8 {
        self.class
    }

    /// Start of the underlying allocation (header slot 0).
    #[inline]
    pub(crate) fn base_ptr(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.buf.as_ptr().sub(PKT_HDR_SIZE)) }
    }

    /// The payload as a slice.
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), self.data_size) }
    }

    /// The payload as a mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.buf.as_ptr(), self.data_size) }
    }

    /// Raw payload pointer.
    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Header slot for fragment `idx`. Slot 0 leads the payload; slots
    /// 1..n-1 trail the payload capacity region.
    #[inline]
    pub(crate) fn pkt_hdr_ptr(&self, idx: u16) -> *mut u8 {
        debug_assert!(idx < self.max_num_pkts);
        unsafe {
            if idx == 0 {
                self.buf.as_ptr().sub(PKT_HDR_SIZE)
            } else {
                self.buf
                    .as_ptr()
                    .add(self.max_data_size + (idx as usize - 1) * PKT_HDR_SIZE)
            }
        }
    }

    /// Payload pointer for fragment `idx`.
    #[inline]
    pub(crate) fn frag_ptr(&self, idx: u16) -> *const u8 {
        unsafe {
            self.buf
                .as_ptr()
                .add(idx as usize * self.max_data_per_pkt as usize)
        }
    }

    /// Payload bytes carried by fragment `idx` of the current message.
    #[inline]
    pub(crate) fn frag_len(&self, idx: u16) -> usize {
        let per = self.max_data_per_pkt as usize;
        let start = idx as usize * per;
        debug_assert!(start < self.data_size || self.data_size == 0);
        (self.data_size - start).min(per)
    }

    /// Copy a received fragment payload into place.
    pub(crate) fn copy_in_frag(&mut self, idx: u16, payload: &[u8]) {
        let per = self.max_data_per_pkt as usize;
        let start = idx as usize * per;
        debug_assert!(start + payload.len() <= self.max_data_size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.buf.as_ptr().add(start),
                payload.len(),
            );
        }
    }

    /// Shrink or regrow the logical message size, up to the allocated
    /// maximum. Never reallocates.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size > self.max_data_size {
            return Err(Error::InvalidArgument(format!(
                "resize to {} exceeds buffer maximum {}",
                new_size, self.max_data_size
            )));
        }
        self.data_size = new_size;
        self.num_pkts = PktHdr::calc_num_pkts(new_size, self.max_data_per_pkt as usize);
        Ok(())
    }

    /// Second handle to the same memory, for loaning a caller-owned
    /// buffer to the engine. Exactly one of the aliases may be freed.
    pub(crate) fn alias(&self) -> MsgBuffer {
        MsgBuffer {
            buf: self.buf,
            data_size: self.data_size,
            max_data_size: self.max_data_size,
            num_pkts: self.num_pkts,
            max_num_pkts: self.max_num_pkts,
            max_data_per_pkt: self.max_data_per_pkt,
            lkey: self.lkey,
            class: self.class,
        }
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("data_size", &self.data_size)
            .field("max_data_size", &self.max_data_size)
            .field("num_pkts", &self.num_pkts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_buf(max_data: usize, per_pkt: usize) -> (Vec<u8>, MsgBuffer) {
        let mut mem = vec![0u8; MsgBuffer::alloc_size(max_data, per_pkt)];
        let base = NonNull::new(mem.as_mut_ptr()).unwrap();
        let buf = MsgBuffer::from_raw(base, max_data, per_pkt, MemHandle(0), 0);
        (mem, buf)
    }

    #[test]
    fn test_alloc_size_headroom() {
        // One header per fragment, always.
        assert_eq!(MsgBuffer::alloc_size(100, 1024), PKT_HDR_SIZE + 100);
        assert_eq!(
            MsgBuffer::alloc_size(3000, 1024),
            PKT_HDR_SIZE + 3000 + 2 * PKT_HDR_SIZE
        );
    }

    #[test]
    fn test_fragment_addressing() {
        let (_mem, buf) = make_buf(2500, 1024);
        assert_eq!(buf.num_pkts(), 3);
        assert_eq!(buf.frag_len(0), 1024);
        assert_eq!(buf.frag_len(1), 1024);
        assert_eq!(buf.frag_len(2), 452);
        assert_eq!(buf.frag_ptr(1) as usize - buf.frag_ptr(0) as usize, 1024);
    }

    #[test]
    fn test_hdr_slots_disjoint_from_payload() {
        let (_mem, buf) = make_buf(2500, 1024);
        let payload_start = buf.data_ptr() as usize;
        let payload_end = payload_start + buf.max_data_size();
        assert_eq!(buf.pkt_hdr_ptr(0) as usize + PKT_HDR_SIZE, payload_start);
        for i in 1..buf.max_num_pkts() {
            assert!(buf.pkt_hdr_ptr(i) as usize >= payload_end);
        }
    }

    #[test]
    fn test_resize_idempotent() {
        let (_mem, mut buf) = make_buf(4096, 1024);
        buf.resize(3000).unwrap();
        buf.resize(100).unwrap();
        assert_eq!(buf.data_size(), 100);
        assert_eq!(buf.num_pkts(), 1);

        let (_mem2, mut direct) = make_buf(4096, 1024);
        direct.resize(100).unwrap();
        assert_eq!(direct.data_size(), buf.data_size());
        assert_eq!(direct.num_pkts(), buf.num_pkts());

        // Regrow within the allocation.
        buf.resize(4096).unwrap();
        assert_eq!(buf.num_pkts(), 4);
    }

    #[test]
    fn test_resize_past_max_rejected() {
        let (_mem, mut buf) = make_buf(1024, 1024);
        assert!(buf.resize(1025).is_err());
        assert_eq!(buf.data_size(), 1024);
    }

    #[test]
    fn test_copy_in_frag_roundtrip() {
        let (_mem, mut buf) = make_buf(2048, 1024);
        let a: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let b: Vec<u8> = (0..1024u32).map(|i| (i as u8).wrapping_add(7)).collect();
        buf.copy_in_frag(0, &a);
        buf.copy_in_frag(1, &b);
        assert_eq!(&buf.data()[..1024], &a[..]);
        assert_eq!(&buf.data()[1024..], &b[..]);
    }
}
