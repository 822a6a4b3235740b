//! Packet header and packet kinds for the datapath wire protocol.
//!
//! The header is 16 bytes, little-endian, and carries everything needed for
//! request/response correlation, fragmentation, and flow control. Field
//! widths are locked for cross-version compatibility.

use crate::error::{Error, Result};

/// Packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 16;

/// Magic number for valid datapath packets.
pub const PKT_MAGIC: u8 = 0xCE;

/// Maximum message size representable on the wire (32-bit field); the
/// runtime limit is [`crate::config::MAX_MSG_SIZE`].
pub const MAX_WIRE_MSG_SIZE: usize = u32::MAX as usize;

/// Maximum request number (48 bits).
pub const MAX_REQ_NUM: u64 = (1 << 48) - 1;

/// Maximum fragment index (13 bits).
pub const MAX_PKT_IDX: u16 = (1 << 13) - 1;

/// Packet kind (3 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktKind {
    /// Single-fragment request.
    SmallReq = 0,
    /// Fragment of a multi-fragment request.
    LargeReq = 1,
    /// Explicit credit return for one received fragment (no payload).
    ExplicitCR = 2,
    /// Single-fragment response.
    SmallResp = 3,
    /// Fragment of a multi-fragment response.
    LargeResp = 4,
    /// Selective retransmission request carrying the next expected
    /// fragment index (no payload).
    Nack = 5,
}

impl TryFrom<u8> for PktKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PktKind::SmallReq),
            1 => Ok(PktKind::LargeReq),
            2 => Ok(PktKind::ExplicitCR),
            3 => Ok(PktKind::SmallResp),
            4 => Ok(PktKind::LargeResp),
            5 => Ok(PktKind::Nack),
            _ => Err(Error::InvalidPacket("unknown packet kind")),
        }
    }
}

/// Datapath packet header (16 bytes).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       1     magic
/// 1       1     req_type
/// 2       2     dest_session_num (u16 LE)
/// 4       4     msg_size (u32 LE)
/// 8       6     req_num (48-bit LE)
/// 14      2     pkt_kind (3 bits) | pkt_idx (13 bits), u16 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PktHdr {
    magic: u8,
    req_type: u8,
    dest_session_bytes: [u8; 2],
    msg_size_bytes: [u8; 4],
    req_num_bytes: [u8; 6],
    kind_idx_bytes: [u8; 2],
}

impl PktHdr {
    /// Create a new packet header.
    pub fn new(
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        kind: PktKind,
        pkt_idx: u16,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= MAX_WIRE_MSG_SIZE);
        debug_assert!(pkt_idx <= MAX_PKT_IDX);
        debug_assert!(req_num <= MAX_REQ_NUM);

        let kind_idx = ((kind as u16) << 13) | (pkt_idx & MAX_PKT_IDX);
        Self {
            magic: PKT_MAGIC,
            req_type,
            dest_session_bytes: dest_session_num.to_le_bytes(),
            msg_size_bytes: (msg_size as u32).to_le_bytes(),
            req_num_bytes: {
                let b = req_num.to_le_bytes();
                [b[0], b[1], b[2], b[3], b[4], b[5]]
            },
            kind_idx_bytes: kind_idx.to_le_bytes(),
        }
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    #[inline]
    pub fn dest_session_num(&self) -> u16 {
        u16::from_le_bytes(self.dest_session_bytes)
    }

    #[inline]
    pub fn msg_size(&self) -> usize {
        u32::from_le_bytes(self.msg_size_bytes) as usize
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        let b = &self.req_num_bytes;
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0])
    }

    /// Get the packet kind. Headers are validated on receive, so the
    /// stored value is always in range.
    #[inline]
    pub fn pkt_kind(&self) -> PktKind {
        match u16::from_le_bytes(self.kind_idx_bytes) >> 13 {
            0 => PktKind::SmallReq,
            1 => PktKind::LargeReq,
            2 => PktKind::ExplicitCR,
            3 => PktKind::SmallResp,
            4 => PktKind::LargeResp,
            _ => PktKind::Nack,
        }
    }

    /// Get the fragment index within the message.
    #[inline]
    pub fn pkt_idx(&self) -> u16 {
        u16::from_le_bytes(self.kind_idx_bytes) & MAX_PKT_IDX
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(self.pkt_kind(), PktKind::SmallReq | PktKind::LargeReq)
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        matches!(self.pkt_kind(), PktKind::SmallResp | PktKind::LargeResp)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == PKT_MAGIC
    }

    /// Serialize the header into a buffer.
    ///
    /// # Safety
    /// The destination must have at least `PKT_HDR_SIZE` writable bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, PKT_HDR_SIZE);
    }

    /// Deserialize a header from raw memory without validation.
    ///
    /// # Safety
    /// The source must have at least `PKT_HDR_SIZE` readable bytes.
    #[inline]
    pub unsafe fn read_from(src: *const u8) -> Self {
        let mut hdr = std::mem::MaybeUninit::<Self>::uninit();
        std::ptr::copy_nonoverlapping(src, hdr.as_mut_ptr() as *mut u8, PKT_HDR_SIZE);
        hdr.assume_init()
    }

    /// Parse and validate a header from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PKT_HDR_SIZE {
            return Err(Error::InvalidPacket("short packet"));
        }
        let hdr = unsafe { Self::read_from(bytes.as_ptr()) };
        if !hdr.is_valid() {
            return Err(Error::InvalidPacket("bad magic"));
        }
        PktKind::try_from((u16::from_le_bytes(hdr.kind_idx_bytes) >> 13) as u8)?;
        Ok(hdr)
    }

    /// Number of fragments needed for a message, given the per-fragment
    /// payload capacity. Zero-byte messages still occupy one fragment.
    pub fn calc_num_pkts(msg_size: usize, max_data_per_pkt: usize) -> u16 {
        if msg_size == 0 {
            1
        } else {
            ((msg_size + max_data_per_pkt - 1) / max_data_per_pkt) as u16
        }
    }
}

/// Wrap-safe comparison of 48-bit request numbers: true if `a` is newer
/// than `b`.
#[inline]
pub fn req_num_newer(a: u64, b: u64) -> bool {
    a != b && (a.wrapping_sub(b) & MAX_REQ_NUM) < (1 << 47)
}
