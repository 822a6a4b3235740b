//! Session and slot state.
//!
//! A session is one directional RPC channel to a remote `(host, mgmt-port,
//! rpc-id)` endpoint. It holds the connect/disconnect state machine, the
//! credit count, and one slot per credit tracking an in-flight
//! request/response. Slot assignment is fixed: slot `i` carries request
//! numbers `i, i + credits, i + 2*credits, ...`, so a request number maps
//! to its slot in O(1).

use std::net::SocketAddr;

use crate::buffer::MsgBuffer;
use crate::flow_control::Timely;
use crate::transport::RoutingInfo;

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no connect attempt yet.
    Init,
    /// ConnectReq sent, awaiting ConnectResp.
    ConnectInFlight,
    /// Ready for requests.
    Connected,
    /// DisconnectReq sent, awaiting DisconnectResp.
    DisconnectInFlight,
    /// destroy_session was called while the connect was still in flight;
    /// resources are reclaimed once the handshake resolves or times out.
    ResetInFlight,
    /// Handshake complete, session dead.
    Disconnected,
    /// Connect failed or the peer stopped responding.
    Error,
}

/// Which side of the channel this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Client-side slot state for one in-flight request.
pub struct ClientSlot<P> {
    /// Caller-supplied completion state (continuation and tag).
    pub pending: P,
    pub req_type: u8,
    /// Engine's handle on the caller's request buffer.
    pub req: MsgBuffer,
    /// Engine's handle on the caller's pre-allocated response buffer.
    pub resp: MsgBuffer,
    /// Request fragments sent so far.
    pub num_tx: u16,
    pub req_num_pkts: u16,
    /// Explicit credit returns received for request fragments.
    pub cr_rcvd: u16,
    /// Response fragments received; also the next expected index.
    pub resp_rcvd: u16,
    /// Zero until the first response fragment reveals the size.
    pub resp_num_pkts: u16,
    /// When request fragment 0 was sent, for RTT sampling.
    pub tx_ts_us: u64,
    /// Last time this request made forward progress.
    pub progress_ts_us: u64,
    pub rto_us: u64,
    pub rto_doublings: u8,
}

/// A response owned by a server-side slot, kept until the slot's next
/// request so lost response fragments can be re-sent.
pub struct ServerResp {
    pub buf: MsgBuffer,
    /// Dynamic buffers are freed on slot reuse; preallocated ones persist.
    pub dynamic: bool,
    /// Response fragments sent so far.
    pub num_tx: u16,
    /// Explicit credit returns received for response fragments.
    pub cr_rcvd: u16,
}

/// Server-side slot state for one request in reception or response.
pub struct ServerSlot {
    pub req_type: u8,
    /// Accumulating request buffer; moved into the request handle at
    /// dispatch.
    pub req: Option<MsgBuffer>,
    /// Request fragments received; also the next expected index.
    pub req_rcvd: u16,
    pub req_num_pkts: u16,
    /// Dispatched to a handler that has not yet enqueued a response.
    pub handler_live: bool,
    pub resp: Option<ServerResp>,
}

/// Role-specific slot state.
pub enum SlotInner<P> {
    Free,
    Client(ClientSlot<P>),
    Server(ServerSlot),
}

/// One per-credit request/response slot.
pub struct SSlot<P> {
    /// The request number this slot is serving (when busy) or will serve
    /// next (when free). Advances by the session's credit count on reuse.
    pub req_num: u64,
    pub inner: SlotInner<P>,
}

impl<P> SSlot<P> {
    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self.inner, SlotInner::Free)
    }
}

/// One RPC session.
pub struct Session<P> {
    pub role: Role,
    pub state: SessionState,
    pub local_session_num: u16,
    pub remote_session_num: u16,
    pub remote_rpc_id: u8,
    /// Peer nexus management address, for SM datagrams.
    pub remote_sm_addr: Option<SocketAddr>,
    /// Peer datapath routing info, installed at connect.
    pub remote_ri: Option<RoutingInfo>,
    /// Available request credits.
    pub credits: usize,
    pub slots: Vec<SSlot<P>>,
    /// Preallocated single-MTU response buffers, one per slot (server
    /// role only).
    pub pre_resp: Vec<MsgBuffer>,
    /// Smoothed RTT in microseconds; zero before the first sample.
    pub srtt_us: u64,
    pub timely: Option<Timely>,
    /// Pacing: earliest departure for the next packet.
    pub next_departure_us: u64,
    /// Packets of this session currently parked in the pacing wheel.
    pub in_wheel: u16,
    // Session-management retry bookkeeping.
    pub sm_last_tx_us: u64,
    pub sm_attempts: u32,
    /// Deferred reconnect deadline after an InvalidRemoteRpcId reject.
    pub reconnect_at_us: Option<u64>,
}

impl<P> Session<P> {
    pub fn new(
        local_session_num: u16,
        role: Role,
        num_credits: usize,
        timely: Option<Timely>,
    ) -> Self {
        let slots = (0..num_credits)
            .map(|i| SSlot {
                req_num: i as u64,
                inner: SlotInner::Free,
            })
            .collect();
        Self {
            role,
            state: SessionState::Init,
            local_session_num,
            remote_session_num: 0,
            remote_rpc_id: 0,
            remote_sm_addr: None,
            remote_ri: None,
            credits: num_credits,
            slots,
            pre_resp: Vec::new(),
            srtt_us: 0,
            timely,
            next_departure_us: 0,
            in_wheel: 0,
            sm_last_tx_us: 0,
            sm_attempts: 0,
            reconnect_at_us: None,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Slot index for a request number under fixed assignment.
    #[inline]
    pub fn slot_idx(&self, req_num: u64) -> usize {
        (req_num % self.slots.len() as u64) as usize
    }

    /// Index of a free slot, if any.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    /// Count of slots with an in-flight request or response.
    pub fn busy_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    /// Record an RTT sample into the smoothed estimate (EWMA 7/8).
    pub fn record_rtt(&mut self, rtt_us: u64) {
        self.srtt_us = if self.srtt_us == 0 {
            rtt_us
        } else {
            (self.srtt_us * 7 + rtt_us) / 8
        };
    }

    /// Initial retransmission timeout: `max(mult * srtt, floor)`.
    pub fn initial_rto_us(&self, rto_mult: u64, rto_min_us: u64) -> u64 {
        (self.srtt_us * rto_mult).max(rto_min_us)
    }
}

/// Session table indexed by local session number.
pub struct SessionTable<P> {
    sessions: Vec<Option<Session<P>>>,
    next_session_num: u16,
}

impl<P> SessionTable<P> {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: (0..max_sessions).map(|_| None).collect(),
            next_session_num: 0,
        }
    }

    /// Find an unused session number, scanning from the last allocation.
    fn alloc_session_num(&mut self) -> Option<u16> {
        let start = self.next_session_num as usize;
        for i in 0..self.sessions.len() {
            let idx = (start + i) % self.sessions.len();
            if self.sessions[idx].is_none() {
                self.next_session_num = ((idx + 1) % self.sessions.len()) as u16;
                return Some(idx as u16);
            }
        }
        None
    }

    /// Insert a new session built by `make` and return its number.
    pub fn create<F>(&mut self, make: F) -> Option<u16>
    where
        F: FnOnce(u16) -> Session<P>,
    {
        let num = self.alloc_session_num()?;
        self.sessions[num as usize] = Some(make(num));
        Some(num)
    }

    pub fn get(&self, session_num: u16) -> Option<&Session<P>> {
        self.sessions.get(session_num as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, session_num: u16) -> Option<&mut Session<P>> {
        self.sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, session_num: u16) -> Option<Session<P>> {
        self.sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.take())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<P>> {
        self.sessions.iter_mut().filter_map(|s| s.as_mut())
    }

    /// Session numbers currently in use.
    pub fn session_nums(&self) -> Vec<u16> {
        self.sessions
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u16))
            .collect()
    }
}
