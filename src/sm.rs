//! Session-management wire packets.
//!
//! The control plane runs over plain UDP datagrams exchanged between
//! nexus management sockets: a three-way connect handshake and a
//! symmetric, idempotent disconnect. The layout is fixed at 64 bytes,
//! little-endian, field widths locked.

use std::fmt;

use crate::error::{Error, Result};
use crate::transport::{RoutingInfo, ROUTING_INFO_SIZE};

/// Session-management packet size on the wire.
pub const SM_PKT_SIZE: usize = 64;

/// Magic number for session-management packets.
pub const SM_MAGIC: u8 = 0x5A;

/// Session-management packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktKind {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
}

impl TryFrom<u8> for SmPktKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmPktKind::ConnectReq),
            1 => Ok(SmPktKind::ConnectResp),
            2 => Ok(SmPktKind::DisconnectReq),
            3 => Ok(SmPktKind::DisconnectResp),
            _ => Err(Error::InvalidPacket("unknown SM packet kind")),
        }
    }
}

/// Why a connect request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    /// No RPC instance with the requested id at the server's nexus.
    InvalidRemoteRpcId = 1,
    /// Admitting the session would exceed the server's unexpected-packet
    /// window.
    NoRingEntriesAvailable = 2,
    /// The server could not allocate session resources.
    OutOfMemory = 3,
    /// The server's transport cannot interpret the client's routing info.
    RoutingResolutionFailed = 4,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::InvalidRemoteRpcId => "invalid remote RPC id",
            RejectReason::NoRingEntriesAvailable => "no ring entries available",
            RejectReason::OutOfMemory => "server out of memory",
            RejectReason::RoutingResolutionFailed => "routing resolution failed",
        };
        f.write_str(s)
    }
}

impl RejectReason {
    fn from_wire(value: u8) -> Result<Option<Self>> {
        match value {
            0 => Ok(None),
            1 => Ok(Some(RejectReason::InvalidRemoteRpcId)),
            2 => Ok(Some(RejectReason::NoRingEntriesAvailable)),
            3 => Ok(Some(RejectReason::OutOfMemory)),
            4 => Ok(Some(RejectReason::RoutingResolutionFailed)),
            _ => Err(Error::InvalidPacket("unknown reject reason")),
        }
    }
}

/// One session-management datagram.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       1     magic
/// 1       1     kind
/// 2       1     reject reason (0 = accepted)
/// 3       1     client_rpc_id
/// 4       1     server_rpc_id
/// 5       1     routing_len
/// 6       2     client_session_num (u16 LE)
/// 8       2     server_session_num (u16 LE)
/// 10      2     sender's management UDP port (u16 LE)
/// 12      2     reserved
/// 14      48    routing info
/// 62      2     reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmPkt {
    pub kind: SmPktKind,
    pub reject: Option<RejectReason>,
    pub client_rpc_id: u8,
    pub server_rpc_id: u8,
    pub client_session_num: u16,
    pub server_session_num: u16,
    /// Management port of the sender, so replies reach the right nexus
    /// even through address rewriting.
    pub mgmt_port: u16,
    /// Datapath routing info of the sender's transport.
    pub routing: RoutingInfo,
}

impl SmPkt {
    /// The RPC id this packet should be demultiplexed to on arrival.
    pub fn target_rpc_id(&self) -> u8 {
        match self.kind {
            SmPktKind::ConnectReq | SmPktKind::DisconnectReq => self.server_rpc_id,
            SmPktKind::ConnectResp | SmPktKind::DisconnectResp => self.client_rpc_id,
        }
    }

    /// Build the reject reply for a connect request.
    pub fn reject_reply(&self, reason: RejectReason, mgmt_port: u16) -> SmPkt {
        SmPkt {
            kind: SmPktKind::ConnectResp,
            reject: Some(reason),
            mgmt_port,
            routing: RoutingInfo::new(&[]),
            ..*self
        }
    }

    pub fn encode(&self) -> [u8; SM_PKT_SIZE] {
        let mut b = [0u8; SM_PKT_SIZE];
        b[0] = SM_MAGIC;
        b[1] = self.kind as u8;
        b[2] = self.reject.map_or(0, |r| r as u8);
        b[3] = self.client_rpc_id;
        b[4] = self.server_rpc_id;
        b[5] = self.routing.len;
        b[6..8].copy_from_slice(&self.client_session_num.to_le_bytes());
        b[8..10].copy_from_slice(&self.server_session_num.to_le_bytes());
        b[10..12].copy_from_slice(&self.mgmt_port.to_le_bytes());
        b[14..14 + ROUTING_INFO_SIZE].copy_from_slice(&self.routing.data);
        b
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_PKT_SIZE {
            return Err(Error::InvalidPacket("short SM packet"));
        }
        if bytes[0] != SM_MAGIC {
            return Err(Error::InvalidPacket("bad SM magic"));
        }
        let kind = SmPktKind::try_from(bytes[1])?;
        let reject = RejectReason::from_wire(bytes[2])?;
        let routing_len = bytes[5];
        if routing_len as usize > ROUTING_INFO_SIZE {
            return Err(Error::InvalidPacket("oversized routing info"));
        }
        let mut routing = RoutingInfo::new(&[]);
        routing.len = routing_len;
        routing.data.copy_from_slice(&bytes[14..14 + ROUTING_INFO_SIZE]);

        Ok(Self {
            kind,
            reject,
            client_rpc_id: bytes[3],
            server_rpc_id: bytes[4],
            client_session_num: u16::from_le_bytes([bytes[6], bytes[7]]),
            server_session_num: u16::from_le_bytes([bytes[8], bytes[9]]),
            mgmt_port: u16::from_le_bytes([bytes[10], bytes[11]]),
            routing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SmPkt {
        SmPkt {
            kind: SmPktKind::ConnectReq,
            reject: None,
            client_rpc_id: 3,
            server_rpc_id: 7,
            client_session_num: 12,
            server_session_num: 0,
            mgmt_port: 31850,
            routing: RoutingInfo::new(&[4, 0x6a, 0x7c, 127, 0, 0, 1]),
        }
    }

    #[test]
    fn test_sm_roundtrip() {
        let pkt = sample();
        let decoded = SmPkt::decode(&pkt.encode()).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn test_sm_reject_roundtrip() {
        let mut pkt = sample();
        pkt.kind = SmPktKind::ConnectResp;
        pkt.reject = Some(RejectReason::NoRingEntriesAvailable);
        let decoded = SmPkt::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.reject, Some(RejectReason::NoRingEntriesAvailable));
    }

    #[test]
    fn test_sm_bad_input_rejected() {
        let pkt = sample();
        let mut bytes = pkt.encode();

        assert!(SmPkt::decode(&bytes[..10]).is_err());

        bytes[0] = 0;
        assert!(SmPkt::decode(&bytes).is_err());

        let mut bytes = pkt.encode();
        bytes[1] = 9;
        assert!(SmPkt::decode(&bytes).is_err());

        let mut bytes = pkt.encode();
        bytes[2] = 200;
        assert!(SmPkt::decode(&bytes).is_err());
    }

    #[test]
    fn test_target_rpc_id() {
        let mut pkt = sample();
        assert_eq!(pkt.target_rpc_id(), 7);
        pkt.kind = SmPktKind::ConnectResp;
        assert_eq!(pkt.target_rpc_id(), 3);
        pkt.kind = SmPktKind::DisconnectResp;
        assert_eq!(pkt.target_rpc_id(), 3);
    }
}
