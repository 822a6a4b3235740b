//! UDP datagram implementation of the transport capability.
//!
//! UDP gives exactly the contract the engine is built for: unreliable,
//! unordered, MTU-limited packets. This is the reference software
//! transport and the one the test suite runs on; kernel-bypass transports
//! implement the same trait out of tree.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::ptr::NonNull;

use fnv::FnvHashMap;
use log::trace;

use crate::config::RX_BATCH_SIZE;
use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;
use crate::transport::{MemHandle, MemRegistrar, RoutingInfo, RxDesc, Transport, TxPkt};

/// Default on-wire packet size: Ethernet MTU minus IP and UDP headers.
pub const DEFAULT_UDP_MTU: usize = 1472;

/// Default receive ring depth.
pub const DEFAULT_NUM_RX_BUFS: usize = 512;

const RI_KIND_V4: u8 = 4;
const RI_KIND_V6: u8 = 6;

/// Transport over a non-blocking UDP socket with a fixed receive ring.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    mtu: usize,
    rx_bufs: Vec<Box<[u8]>>,
    rx_free: Vec<u32>,
    tx_scratch: Vec<u8>,
    routes: FnvHashMap<RoutingInfo, SocketAddr>,
}

impl UdpTransport {
    /// Bind a datapath socket. `bind_addr` may use port 0 for an
    /// ephemeral port; the advertised routing info carries the actual
    /// bound address.
    pub fn new(bind_addr: &str) -> Result<Self> {
        Self::with_mtu(bind_addr, DEFAULT_UDP_MTU, DEFAULT_NUM_RX_BUFS)
    }

    /// Bind with an explicit MTU and receive ring depth. A small MTU
    /// forces fragmentation with small messages, which the tests use.
    pub fn with_mtu(bind_addr: &str, mtu: usize, num_rx_bufs: usize) -> Result<Self> {
        if mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidArgument(format!("mtu {} too small", mtu)));
        }
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let rx_bufs: Vec<Box<[u8]>> = (0..num_rx_bufs)
            .map(|_| vec![0u8; mtu].into_boxed_slice())
            .collect();
        let rx_free = (0..num_rx_bufs as u32).rev().collect();

        Ok(Self {
            socket,
            local_addr,
            mtu,
            rx_bufs,
            rx_free,
            tx_scratch: vec![0u8; mtu],
            routes: FnvHashMap::default(),
        })
    }

    /// The bound datapath address.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encode a socket address as an opaque routing blob.
    pub fn encode_routing(addr: SocketAddr) -> RoutingInfo {
        let mut bytes = [0u8; 19];
        bytes[1..3].copy_from_slice(&addr.port().to_le_bytes());
        match addr.ip() {
            IpAddr::V4(ip) => {
                bytes[0] = RI_KIND_V4;
                bytes[3..7].copy_from_slice(&ip.octets());
                RoutingInfo::new(&bytes[..7])
            }
            IpAddr::V6(ip) => {
                bytes[0] = RI_KIND_V6;
                bytes[3..19].copy_from_slice(&ip.octets());
                RoutingInfo::new(&bytes[..19])
            }
        }
    }

    /// Decode a routing blob back to a socket address.
    pub fn decode_routing(ri: &RoutingInfo) -> Option<SocketAddr> {
        let b = ri.as_bytes();
        if b.len() < 7 {
            return None;
        }
        let port = u16::from_le_bytes([b[1], b[2]]);
        match b[0] {
            RI_KIND_V4 => {
                let ip = Ipv4Addr::new(b[3], b[4], b[5], b[6]);
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
            RI_KIND_V6 if b.len() >= 19 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(&b[3..19]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(o)), port))
            }
            _ => None,
        }
    }

    fn route(&mut self, ri: &RoutingInfo) -> Option<SocketAddr> {
        if let Some(addr) = self.routes.get(ri) {
            return Some(*addr);
        }
        let addr = Self::decode_routing(ri)?;
        self.routes.insert(*ri, addr);
        Some(addr)
    }
}

/// Resolve a `host:port` URI to a socket address.
pub fn resolve_uri(uri: &str) -> Result<SocketAddr> {
    uri.to_socket_addrs()
        .map_err(|e| Error::InvalidArgument(format!("cannot resolve {}: {}", uri, e)))?
        .next()
        .ok_or_else(|| Error::InvalidArgument(format!("no address for {}", uri)))
}

impl MemRegistrar for UdpTransport {
    fn reg_mr(&mut self, _ptr: NonNull<u8>, _len: usize) -> Result<MemHandle> {
        // No DMA registration over sockets.
        Ok(MemHandle(0))
    }
}

impl Transport for UdpTransport {
    #[inline]
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn routing_info(&self) -> RoutingInfo {
        Self::encode_routing(self.local_addr)
    }

    fn check_routing(&self, ri: &RoutingInfo) -> bool {
        Self::decode_routing(ri).is_some()
    }

    fn tx_burst(&mut self, batch: &mut Vec<TxPkt>) -> Result<usize> {
        let mut sent = 0;
        for pkt in batch.drain(..) {
            let addr = match self.route(&pkt.ri) {
                Some(a) => a,
                None => {
                    trace!("tx_burst: undecodable routing info, dropping packet");
                    continue;
                }
            };
            let wire = pkt.wire_size();
            debug_assert!(wire <= self.mtu);
            unsafe {
                std::ptr::copy_nonoverlapping(pkt.hdr, self.tx_scratch.as_mut_ptr(), PKT_HDR_SIZE);
                if pkt.payload_len > 0 {
                    std::ptr::copy_nonoverlapping(
                        pkt.payload,
                        self.tx_scratch.as_mut_ptr().add(PKT_HDR_SIZE),
                        pkt.payload_len as usize,
                    );
                }
            }
            match self.socket.send_to(&self.tx_scratch[..wire], addr) {
                Ok(_) => sent += 1,
                // A full socket buffer loses the packet, exactly like a
                // full NIC queue; the reliability layer recovers it.
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                // ICMP unreachable from an earlier send; not fatal.
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {}
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Ok(sent)
    }

    fn rx_burst(&mut self, out: &mut Vec<RxDesc>) -> usize {
        let mut n = 0;
        while n < RX_BATCH_SIZE {
            let idx = match self.rx_free.last() {
                Some(&idx) => idx,
                None => break,
            };
            match self.socket.recv_from(&mut self.rx_bufs[idx as usize]) {
                Ok((len, _from)) => {
                    self.rx_free.pop();
                    out.push(RxDesc {
                        buf_idx: idx,
                        len: len as u32,
                    });
                    n += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => continue,
                Err(_) => break,
            }
        }
        n
    }

    #[inline]
    fn rx_slice(&self, desc: RxDesc) -> &[u8] {
        &self.rx_bufs[desc.buf_idx as usize][..desc.len as usize]
    }

    #[inline]
    fn rx_release(&mut self, desc: RxDesc) {
        self.rx_free.push(desc.buf_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PktHdr, PktKind};

    #[test]
    fn test_routing_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:31850".parse().unwrap();
        let ri = UdpTransport::encode_routing(addr);
        assert_eq!(UdpTransport::decode_routing(&ri), Some(addr));

        let addr6: SocketAddr = "[::1]:9999".parse().unwrap();
        let ri6 = UdpTransport::encode_routing(addr6);
        assert_eq!(UdpTransport::decode_routing(&ri6), Some(addr6));
    }

    #[test]
    fn test_bad_routing_rejected() {
        assert_eq!(UdpTransport::decode_routing(&RoutingInfo::new(&[7, 0, 0])), None);
        let t = UdpTransport::with_mtu("127.0.0.1:0", 256, 8).unwrap();
        assert!(!t.check_routing(&RoutingInfo::new(&[0xFF; 7])));
        assert!(t.check_routing(&t.routing_info()));
    }

    #[test]
    fn test_loopback_burst() {
        let mut a = UdpTransport::with_mtu("127.0.0.1:0", 256, 8).unwrap();
        let mut b = UdpTransport::with_mtu("127.0.0.1:0", 256, 8).unwrap();

        let hdr = PktHdr::new(1, 5, 3, PktKind::SmallReq, 0, 9);
        let mut hdr_bytes = [0u8; PKT_HDR_SIZE];
        unsafe { hdr.write_to(hdr_bytes.as_mut_ptr()) };
        let payload = *b"hello";

        let mut batch = vec![TxPkt {
            ri: b.routing_info(),
            hdr: hdr_bytes.as_ptr(),
            payload: payload.as_ptr(),
            payload_len: payload.len() as u32,
        }];
        assert_eq!(a.tx_burst(&mut batch).unwrap(), 1);
        assert!(batch.is_empty());

        // Loopback delivery is fast but not instant.
        let mut descs = Vec::new();
        for _ in 0..100 {
            if b.rx_burst(&mut descs) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(descs.len(), 1);
        let bytes = b.rx_slice(descs[0]);
        let rx_hdr = PktHdr::from_bytes(bytes).unwrap();
        assert_eq!(rx_hdr, hdr);
        assert_eq!(&bytes[PKT_HDR_SIZE..], b"hello");
        b.rx_release(descs[0]);
    }
}
