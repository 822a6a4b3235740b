//! Transport capability for the RPC engine.
//!
//! The engine is generic over this capability rather than a concrete NIC
//! wrapper: post a batch of bounded-size packets, poll a receive ring,
//! register memory, report the link MTU. Transport errors are fatal; the
//! engine's reliability layer handles packet loss, not the transport.

use std::fmt;
use std::ptr::NonNull;

use crate::error::Result;
use crate::packet::PKT_HDR_SIZE;

/// Maximum size of a transport routing-info blob.
pub const ROUTING_INFO_SIZE: usize = 48;

/// Opaque endpoint address bytes, produced by one transport instance and
/// interpreted only by its peer. Carried through the session-management
/// plane during connect.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingInfo {
    pub len: u8,
    pub data: [u8; ROUTING_INFO_SIZE],
}

impl RoutingInfo {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= ROUTING_INFO_SIZE);
        let mut data = [0u8; ROUTING_INFO_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            len: bytes.len() as u8,
            data,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingInfo({:02x?})", self.as_bytes())
    }
}

/// Handle to a registered memory region. All buffers carved from one slab
/// share the slab's handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemHandle(pub u64);

/// One staged outbound packet: a 16-byte header written into MsgBuffer
/// headroom, plus the fragment payload. Pointers stay valid while the
/// owning MsgBuffer is loaned to the engine.
#[derive(Debug, Clone, Copy)]
pub struct TxPkt {
    pub ri: RoutingInfo,
    pub hdr: *const u8,
    pub payload: *const u8,
    pub payload_len: u32,
}

impl TxPkt {
    /// Total wire size of this packet.
    #[inline]
    pub fn wire_size(&self) -> usize {
        PKT_HDR_SIZE + self.payload_len as usize
    }
}

/// Descriptor for one received packet, borrowing a ring buffer owned by
/// the transport. Must be released back so the buffer can be reposted.
#[derive(Debug, Clone, Copy)]
pub struct RxDesc {
    pub buf_idx: u32,
    pub len: u32,
}

/// Memory registration, split out so the allocator can register slabs
/// without seeing the rest of the transport surface.
pub trait MemRegistrar {
    /// Register a memory region for DMA. Errors are fatal.
    fn reg_mr(&mut self, ptr: NonNull<u8>, len: usize) -> Result<MemHandle>;
}

/// The transport capability.
pub trait Transport: MemRegistrar {
    /// Maximum on-wire packet size (header plus payload).
    fn mtu(&self) -> usize;

    /// Maximum application payload per fragment.
    #[inline]
    fn max_data_per_pkt(&self) -> usize {
        self.mtu() - PKT_HDR_SIZE
    }

    /// Maximum inline payload size, zero if the transport has no inline
    /// fast path.
    fn max_inline(&self) -> usize {
        0
    }

    /// Address bytes a peer can use to reach this endpoint.
    fn routing_info(&self) -> RoutingInfo;

    /// Whether a peer's routing blob is resolvable by this transport.
    fn check_routing(&self, ri: &RoutingInfo) -> bool;

    /// Post the staged batch, draining it. Returns the number of packets
    /// handed to the wire. Errors are fatal (link down).
    fn tx_burst(&mut self, batch: &mut Vec<TxPkt>) -> Result<usize>;

    /// Poll up to [`crate::config::RX_BATCH_SIZE`] received packets,
    /// non-blockingly. Returns the number of descriptors appended.
    fn rx_burst(&mut self, out: &mut Vec<RxDesc>) -> usize;

    /// Read a received packet's bytes.
    fn rx_slice(&self, desc: RxDesc) -> &[u8];

    /// Return a receive buffer to the ring for reposting.
    fn rx_release(&mut self, desc: RxDesc);
}
