//! The per-thread RPC engine.
//!
//! An `Rpc` owns one transport, one allocator, and a session table, and is
//! driven by its creating thread through `run_event_loop`. Each loop turn
//! drains the session-management queue, polls the transport receive ring,
//! replays matured paced packets, scans retransmission timers, and flushes
//! the staged transmit batch. All state lives behind `RefCell`s; borrows
//! are dropped before any application callback runs, so handlers and
//! continuations may re-enter the engine.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::ThreadId;

use crossbeam_channel::{bounded, Receiver, Sender};
use fnv::FnvHashMap;
use log::{debug, error, trace, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::buffer::MsgBuffer;
use crate::config::{RpcConfig, TX_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::flow_control::Timely;
use crate::huge_alloc::{HugeAlloc, MsgAlloc};
use crate::nexus::{BgWork, Nexus, ReqFunc, SmWorkItem};
use crate::packet::{req_num_newer, PktHdr, PktKind, MAX_REQ_NUM, PKT_HDR_SIZE};
use crate::session::{
    ClientSlot, Role, ServerResp, ServerSlot, Session, SessionState, SessionTable, SlotInner,
};
use crate::sm::{RejectReason, SmPkt, SmPktKind};
use crate::timing::{now_us, TimingWheel};
use crate::transport::{RoutingInfo, RxDesc, Transport, TxPkt};
use crate::udp::resolve_uri;

/// Control packets (CR/Nack) cycled through this many headers-only
/// buffers; the ring is deep enough that an entry is on the wire long
/// before it is reused.
const CTRL_RING_DEPTH: usize = 64;

/// Depth of the queue carrying completed background handles back to the
/// owning thread.
const BG_DONE_DEPTH: usize = 1024;

/// Minimum interval between retransmission/SM timer scans.
const TIMER_SCAN_INTERVAL_US: u64 = 1000;

/// How a completed request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The response arrived; the response buffer holds it.
    Success,
    /// The session was reset with the request outstanding; the response
    /// buffer is zero-sized.
    SessionReset,
}

/// Delivered to a continuation when its request completes.
pub struct Completion {
    /// The caller's tag from `enqueue_request`.
    pub tag: u64,
    pub status: CompletionStatus,
    /// The caller's response buffer with its final logical size.
    pub resp: MsgBuffer,
}

/// Response-completion callback.
pub type Continuation<C> = Box<dyn FnOnce(&mut C, Completion)>;

/// Why a connect attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Rejected(RejectReason),
    Timeout,
}

/// Session-management events observed from inside the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    Connected,
    ConnectFailed(ConnectFailure),
    Disconnected,
    /// The session errored out or was reset with work outstanding.
    Reset,
}

/// Session-management callback.
pub type SmHandler<C> = Box<dyn Fn(&mut C, u16, SmEvent)>;

/// Client-side completion state parked in a slot.
struct PendingReq<C> {
    cont: Option<Continuation<C>>,
    tag: u64,
}

/// The response buffer inside a request handle: the slot's preallocated
/// single-MTU buffer, or a dynamic one the handler substituted.
enum RespBuf {
    Prealloc(MsgBuffer),
    Dynamic(MsgBuffer),
}

/// An in-progress request on the server side, handed to the registered
/// handler. The handler writes the response into `resp_msgbuf` (resizing
/// it first) or substitutes a larger dynamic buffer, then the handle goes
/// back to the engine via `enqueue_response`.
pub struct ReqHandle {
    session_num: u16,
    req_num: u64,
    req_type: u8,
    req: MsgBuffer,
    resp: RespBuf,
}

impl ReqHandle {
    /// The received request.
    #[inline]
    pub fn req_msgbuf(&self) -> &MsgBuffer {
        &self.req
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// The current response buffer.
    #[inline]
    pub fn resp_msgbuf(&mut self) -> &mut MsgBuffer {
        match &mut self.resp {
            RespBuf::Prealloc(b) | RespBuf::Dynamic(b) => b,
        }
    }

    /// Substitute a dynamic response buffer for responses that exceed the
    /// preallocated capacity. Returns the previously substituted dynamic
    /// buffer, if any, which the caller should free.
    pub fn set_dyn_resp(&mut self, buf: MsgBuffer) -> Option<MsgBuffer> {
        match std::mem::replace(&mut self.resp, RespBuf::Dynamic(buf)) {
            RespBuf::Prealloc(_) => None,
            RespBuf::Dynamic(old) => Some(old),
        }
    }
}

/// One paced packet parked in the timing wheel.
struct WheelEntry {
    pkt: TxPkt,
    session_num: u16,
}

/// Headers-only buffers for credit-return and nack packets.
struct CtrlRing {
    bufs: Vec<MsgBuffer>,
    next: usize,
}

/// A server session torn down while background handlers still held its
/// preallocated buffers; the memory is reclaimed when the last handle
/// comes back.
struct ZombieSession {
    live: usize,
    bufs: Vec<MsgBuffer>,
}

#[derive(Debug, Default, Clone)]
struct DpathStats {
    num_re_tx: u64,
    still_in_wheel_during_retx: u64,
    rx_bursts: u64,
    rx_pkts: u64,
    tx_bursts: u64,
    tx_pkts: u64,
    rx_drop_invalid: u64,
    rx_drop_stale: u64,
    rx_dup: u64,
    fault_dropped: u64,
}

struct AllocFacade<'a, T: Transport> {
    alloc: &'a RefCell<HugeAlloc>,
    transport: &'a RefCell<T>,
    max_data_per_pkt: usize,
    max_msg_size: usize,
}

impl<T: Transport> MsgAlloc for AllocFacade<'_, T> {
    fn alloc_msg_buffer(&mut self, size: usize) -> Result<MsgBuffer> {
        if size == 0 || size > self.max_msg_size {
            return Err(Error::InvalidArgument(format!("bad buffer size {}", size)));
        }
        self.alloc.borrow_mut().alloc_msg_buffer(
            size,
            self.max_data_per_pkt,
            &mut *self.transport.borrow_mut(),
        )
    }

    fn free_msg_buffer(&mut self, buf: MsgBuffer) {
        self.alloc.borrow_mut().free_msg_buffer(buf);
    }
}

/// A per-thread RPC engine bound to one transport endpoint.
pub struct Rpc<C, T: Transport> {
    nexus: Arc<Nexus<C>>,
    context: RefCell<C>,
    rpc_id: u8,
    sm_handler: SmHandler<C>,
    handlers: Vec<Option<Arc<ReqFunc<C>>>>,
    transport: RefCell<T>,
    alloc: RefCell<HugeAlloc>,
    sessions: RefCell<SessionTable<PendingReq<C>>>,
    sm_rx: Receiver<SmWorkItem>,
    bg_done_tx: Sender<ReqHandle>,
    bg_done_rx: Receiver<ReqHandle>,
    tx_batch: RefCell<Vec<TxPkt>>,
    wheel: RefCell<TimingWheel<WheelEntry>>,
    ctrl_ring: RefCell<CtrlRing>,
    zombies: RefCell<FnvHashMap<u16, ZombieSession>>,
    /// Server-side map from (peer nexus, peer rpc id, peer session) to
    /// the local session, for idempotent connect handling.
    sm_peer_map: RefCell<FnvHashMap<(SocketAddr, u8, u16), u16>>,
    stats: RefCell<DpathStats>,
    config: RpcConfig,
    retry_connect_on_invalid_rpc_id: Cell<bool>,
    pkt_drop_prob: Cell<f64>,
    rng: RefCell<SmallRng>,
    /// Remaining unexpected-window admission budget (server side).
    unexp_credits: Cell<usize>,
    mtu: usize,
    max_data_per_pkt: usize,
    creation_us: u64,
    last_scan_us: Cell<u64>,
    shutdown: Cell<bool>,
    owner: ThreadId,
}

impl<C: 'static, T: Transport> Rpc<C, T> {
    /// Create an RPC instance bound to `transport`, register it with the
    /// nexus under `rpc_id`, and freeze the nexus handler registry.
    pub fn new(
        nexus: Arc<Nexus<C>>,
        context: C,
        rpc_id: u8,
        sm_handler: SmHandler<C>,
        mut transport: T,
        config: RpcConfig,
    ) -> Result<Self> {
        let sm_rx = nexus.register_hook(rpc_id)?;
        let handlers = nexus.freeze_and_snapshot();

        let mtu = transport.mtu();
        let max_data_per_pkt = mtu - PKT_HDR_SIZE;

        let mut alloc = HugeAlloc::new();
        let mut ctrl_bufs = Vec::with_capacity(CTRL_RING_DEPTH);
        for _ in 0..CTRL_RING_DEPTH {
            ctrl_bufs.push(alloc.alloc_msg_buffer(0, max_data_per_pkt, &mut transport)?);
        }

        let (bg_done_tx, bg_done_rx) = bounded(BG_DONE_DEPTH);

        let now = now_us();
        let mut wheel = TimingWheel::for_pacing();
        wheel.init(now);

        debug!("rpc {} created, mtu {}", rpc_id, mtu);
        Ok(Self {
            context: RefCell::new(context),
            rpc_id,
            sm_handler,
            handlers,
            transport: RefCell::new(transport),
            alloc: RefCell::new(alloc),
            sessions: RefCell::new(SessionTable::new(config.max_sessions)),
            sm_rx,
            bg_done_tx,
            bg_done_rx,
            tx_batch: RefCell::new(Vec::with_capacity(TX_BATCH_SIZE * 2)),
            wheel: RefCell::new(wheel),
            ctrl_ring: RefCell::new(CtrlRing {
                bufs: ctrl_bufs,
                next: 0,
            }),
            zombies: RefCell::new(FnvHashMap::default()),
            sm_peer_map: RefCell::new(FnvHashMap::default()),
            stats: RefCell::new(DpathStats::default()),
            retry_connect_on_invalid_rpc_id: Cell::new(config.retry_connect_on_invalid_rpc_id),
            pkt_drop_prob: Cell::new(config.pkt_drop_prob),
            rng: RefCell::new(SmallRng::seed_from_u64(0x7572_7063 ^ rpc_id as u64)),
            unexp_credits: Cell::new(config.unexp_pkt_window),
            config,
            nexus,
            mtu,
            max_data_per_pkt,
            creation_us: now,
            last_scan_us: Cell::new(0),
            shutdown: Cell::new(false),
            owner: std::thread::current().id(),
        })
    }

    fn check_owner(&self) -> Result<()> {
        if std::thread::current().id() != self.owner {
            return Err(Error::InvalidArgument(
                "RPC instances are single-threaded; call from the creating thread".into(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Allocate a message buffer with header headroom for every fragment.
    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        self.check_owner()?;
        if size == 0 || size > self.config.max_msg_size {
            return Err(Error::InvalidArgument(format!("bad buffer size {}", size)));
        }
        self.alloc.borrow_mut().alloc_msg_buffer(
            size,
            self.max_data_per_pkt,
            &mut *self.transport.borrow_mut(),
        )
    }

    /// Return a buffer to the allocator. The buffer must not be attached
    /// to an in-flight RPC.
    pub fn free_msg_buffer(&self, buf: MsgBuffer) {
        self.alloc.borrow_mut().free_msg_buffer(buf);
    }

    /// Adjust a buffer's logical size without reallocating.
    pub fn resize_msg_buffer(&self, buf: &mut MsgBuffer, new_size: usize) -> Result<()> {
        buf.resize(new_size)
    }

    // ------------------------------------------------------------------
    // Session management
    // ------------------------------------------------------------------

    /// Begin connecting to `(remote_uri, remote_rpc_id)`. Completion is
    /// observed through the session-management callback.
    pub fn create_session(&self, remote_uri: &str, remote_rpc_id: u8) -> Result<u16> {
        self.check_owner()?;
        let remote_addr = resolve_uri(remote_uri)?;

        let timely = self.new_timely();
        let credits = self.config.session_credits;
        let session_num = {
            let mut sessions = self.sessions.borrow_mut();
            sessions
                .create(|n| {
                    let mut s = Session::new(n, Role::Client, credits, timely);
                    s.state = SessionState::ConnectInFlight;
                    s.remote_rpc_id = remote_rpc_id;
                    s.remote_sm_addr = Some(remote_addr);
                    s
                })
                .ok_or(Error::OutOfMemory)?
        };

        self.send_connect_req(session_num)?;
        debug!(
            "session {}: connecting to {} rpc {}",
            session_num, remote_uri, remote_rpc_id
        );
        Ok(session_num)
    }

    /// Begin disconnecting a client session. Outstanding requests fail
    /// with `SessionReset`; completion is observed through the
    /// session-management callback.
    pub fn destroy_session(&self, session_num: u16) -> Result<()> {
        self.check_owner()?;
        let now = now_us();
        let mut completions = Vec::new();
        let mut events = Vec::new();

        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(session_num)
                .ok_or(Error::SessionNotFound(session_num))?;
            if sess.role != Role::Client {
                return Err(Error::InvalidArgument(
                    "server sessions are torn down by the client".into(),
                ));
            }

            match sess.state {
                SessionState::Connected => {
                    Self::fail_outstanding(sess, &mut completions);
                    sess.state = SessionState::DisconnectInFlight;
                    sess.sm_attempts = 0;
                    sess.sm_last_tx_us = now;
                    let pkt = self.sm_pkt_for(sess, SmPktKind::DisconnectReq);
                    let to = sess.remote_sm_addr.unwrap();
                    self.nexus.send_sm(&pkt, to)?;
                }
                SessionState::ConnectInFlight => {
                    sess.state = SessionState::ResetInFlight;
                    sess.sm_attempts = 0;
                    sess.sm_last_tx_us = now;
                }
                SessionState::Init | SessionState::Error => {
                    Self::fail_outstanding(sess, &mut completions);
                    sessions.remove(session_num);
                    events.push((session_num, SmEvent::Disconnected));
                }
                SessionState::DisconnectInFlight
                | SessionState::ResetInFlight
                | SessionState::Disconnected => {
                    return Err(Error::InvalidArgument(
                        "session is already disconnecting".into(),
                    ));
                }
            }
        }

        self.deliver_completions(completions);
        self.deliver_sm_events(events);
        Ok(())
    }

    /// Count of sessions in the table, all states.
    pub fn num_active_sessions(&self) -> usize {
        self.sessions.borrow().active_count()
    }

    // ------------------------------------------------------------------
    // Datapath: enqueue
    // ------------------------------------------------------------------

    /// Enqueue a request. `req` and `resp` are loaned to the engine until
    /// the continuation fires and must not be mutated or freed before
    /// then; the continuation receives the response buffer back with its
    /// final size. Never blocks: with no credit available it returns
    /// `NoCredits` and the caller retries after running the event loop.
    pub fn enqueue_request(
        &self,
        session_num: u16,
        req_type: u8,
        req: &MsgBuffer,
        resp: &MsgBuffer,
        cont: Continuation<C>,
        tag: u64,
    ) -> Result<()> {
        self.check_owner()?;
        let msg_size = req.data_size();
        if msg_size == 0 || msg_size > self.config.max_msg_size {
            return Err(Error::InvalidArgument(format!(
                "bad request size {}",
                msg_size
            )));
        }

        let now = now_us();
        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(session_num)
                .ok_or(Error::SessionNotFound(session_num))?;
            if sess.role != Role::Client {
                return Err(Error::InvalidArgument(
                    "requests go out on client sessions".into(),
                ));
            }
            if !sess.is_connected() {
                return Err(Error::SessionNotConnected(session_num));
            }
            if sess.credits == 0 {
                return Err(Error::NoCredits);
            }

            let idx = sess.find_free_slot().expect("credit without a free slot");
            let remote_sn = sess.remote_session_num;
            let req_num = sess.slots[idx].req_num;

            let num_pkts = req.num_pkts();
            let kind = if num_pkts == 1 {
                PktKind::SmallReq
            } else {
                PktKind::LargeReq
            };
            for i in 0..num_pkts {
                let hdr = PktHdr::new(req_type, msg_size, remote_sn, kind, i, req_num);
                unsafe { hdr.write_to(req.pkt_hdr_ptr(i)) };
            }

            let first = TxPkt {
                ri: sess.remote_ri.expect("connected session without routing"),
                hdr: req.pkt_hdr_ptr(0),
                payload: req.frag_ptr(0),
                payload_len: req.frag_len(0) as u32,
            };

            let rto = sess.initial_rto_us(self.config.rto_mult, self.config.rto_min_us);
            sess.slots[idx].inner = SlotInner::Client(ClientSlot {
                pending: PendingReq {
                    cont: Some(cont),
                    tag,
                },
                req_type,
                req: req.alias(),
                resp: resp.alias(),
                num_tx: 1,
                req_num_pkts: num_pkts,
                cr_rcvd: 0,
                resp_rcvd: 0,
                resp_num_pkts: 0,
                tx_ts_us: now,
                progress_ts_us: now,
                rto_us: rto,
                rto_doublings: 0,
            });
            sess.credits -= 1;

            self.push_dpath_pkt(sess, first, now);
            trace!(
                "session {}: req {} enqueued, {} pkts",
                session_num,
                req_num,
                num_pkts
            );
        }

        self.maybe_flush();
        Ok(())
    }

    /// Transmit the response held by a request handle. Called by the
    /// event loop after a foreground handler returns, and for background
    /// handlers when the completed handle is marshaled back to this
    /// thread.
    pub fn enqueue_response(&self, handle: ReqHandle) -> Result<()> {
        self.check_owner()?;
        let now = now_us();
        let sn = handle.session_num;
        let rn = handle.req_num;

        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut(sn) {
                Some(s) if s.role == Role::Server => s,
                _ => {
                    drop(sessions);
                    self.reclaim_orphan_handle(handle);
                    return Ok(());
                }
            };
            let idx = sess.slot_idx(rn);
            if sess.slots[idx].req_num != rn {
                drop(sessions);
                self.reclaim_orphan_handle(handle);
                return Ok(());
            }

            let remote_sn = sess.remote_session_num;
            let ReqHandle {
                req,
                resp,
                req_type,
                ..
            } = handle;
            self.alloc.borrow_mut().free_msg_buffer(req);

            let (buf, dynamic) = match resp {
                RespBuf::Prealloc(b) => (b, false),
                RespBuf::Dynamic(b) => (b, true),
            };
            let msg_size = buf.data_size();
            let num_pkts = buf.num_pkts();
            let kind = if num_pkts == 1 {
                PktKind::SmallResp
            } else {
                PktKind::LargeResp
            };
            for i in 0..num_pkts {
                let hdr = PktHdr::new(req_type, msg_size, remote_sn, kind, i, rn);
                unsafe { hdr.write_to(buf.pkt_hdr_ptr(i)) };
            }

            let first = TxPkt {
                ri: sess.remote_ri.expect("server session without routing"),
                hdr: buf.pkt_hdr_ptr(0),
                payload: buf.frag_ptr(0),
                payload_len: buf.frag_len(0) as u32,
            };

            let slot = &mut sess.slots[idx];
            match &mut slot.inner {
                SlotInner::Server(srv) => {
                    srv.handler_live = false;
                    srv.resp = Some(ServerResp {
                        buf,
                        dynamic,
                        num_tx: 1,
                        cr_rcvd: 0,
                    });
                }
                _ => {
                    warn!("response for session {} req {} hit a non-server slot", sn, rn);
                    if dynamic {
                        self.alloc.borrow_mut().free_msg_buffer(buf);
                    }
                    return Ok(());
                }
            }

            self.push_dpath_pkt(sess, first, now);
            trace!("session {}: resp for req {} enqueued, {} pkts", sn, rn, num_pkts);
        }

        self.maybe_flush();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run the event loop for roughly `ms` milliseconds, or until
    /// `shutdown` is requested.
    pub fn run_event_loop(&self, ms: u64) {
        let deadline = now_us() + ms * 1000;
        loop {
            self.run_event_loop_once();
            if self.shutdown.get() || now_us() >= deadline {
                break;
            }
        }
    }

    /// One event-loop turn. Returns the number of packets and events
    /// processed.
    pub fn run_event_loop_once(&self) -> usize {
        debug_assert!(self.check_owner().is_ok());
        let mut events = 0;
        events += self.process_sm_queue();
        events += self.process_bg_done();
        events += self.process_rx();
        let now = now_us();
        self.reap_wheel(now);
        self.scan_timers(now);
        self.flush_tx();
        events
    }

    /// Ask the event loop to wind down; `run_event_loop` returns at the
    /// end of the current turn.
    pub fn shutdown(&self) {
        self.shutdown.set(true);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    /// Datapath retransmissions since creation or the last reset.
    pub fn num_re_tx(&self) -> u64 {
        self.stats.borrow().num_re_tx
    }

    /// Retransmissions that raced a copy still parked in the pacing
    /// wheel.
    pub fn still_in_wheel_during_retx(&self) -> u64 {
        self.stats.borrow().still_in_wheel_during_retx
    }

    /// Mean packets per non-empty receive burst.
    pub fn avg_rx_batch(&self) -> f64 {
        let s = self.stats.borrow();
        if s.rx_bursts == 0 {
            0.0
        } else {
            s.rx_pkts as f64 / s.rx_bursts as f64
        }
    }

    /// Mean packets per transmit burst.
    pub fn avg_tx_batch(&self) -> f64 {
        let s = self.stats.borrow();
        if s.tx_bursts == 0 {
            0.0
        } else {
            s.tx_pkts as f64 / s.tx_bursts as f64
        }
    }

    /// Received packets dropped as malformed, stale, or duplicate.
    pub fn num_rx_dropped(&self) -> u64 {
        let s = self.stats.borrow();
        s.rx_drop_invalid + s.rx_drop_stale + s.rx_dup
    }

    /// Outbound packets discarded by fault injection.
    pub fn num_fault_dropped(&self) -> u64 {
        self.stats.borrow().fault_dropped
    }

    /// Clear the datapath counters.
    pub fn reset_dpath_stats(&self) {
        *self.stats.borrow_mut() = DpathStats::default();
    }

    /// The session's current Timely rate, if congestion control is on.
    pub fn session_rate_gbps(&self, session_num: u16) -> Option<f64> {
        self.sessions
            .borrow()
            .get(session_num)?
            .timely
            .as_ref()
            .map(Timely::rate_gbps)
    }

    /// Seconds since this instance was created.
    pub fn sec_since_creation(&self) -> f64 {
        (now_us() - self.creation_us) as f64 / 1e6
    }

    /// Bytes of slab memory mapped by this instance's allocator.
    pub fn mem_mapped_bytes(&self) -> usize {
        self.alloc.borrow().total_mapped()
    }

    /// Set the outbound packet-drop probability for loss testing.
    pub fn fault_inject_set_pkt_drop_prob(&self, prob: f64) {
        assert!((0.0..=1.0).contains(&prob));
        self.pkt_drop_prob.set(prob);
    }

    /// Retry connects rejected with InvalidRemoteRpcId.
    pub fn set_retry_connect_on_invalid_rpc_id(&self, retry: bool) {
        self.retry_connect_on_invalid_rpc_id.set(retry);
    }

    #[inline]
    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Application payload bytes per fragment.
    #[inline]
    pub fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    #[inline]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Available credits on a session, for backpressure-aware callers.
    pub fn available_credits(&self, session_num: u16) -> Option<usize> {
        self.sessions.borrow().get(session_num).map(|s| s.credits)
    }

    /// Shared view of the transport, for endpoint introspection.
    pub fn transport(&self) -> std::cell::Ref<'_, T> {
        self.transport.borrow()
    }

    // ------------------------------------------------------------------
    // TX internals
    // ------------------------------------------------------------------

    fn new_timely(&self) -> Option<Timely> {
        self.config
            .enable_cc
            .then(|| Timely::new(self.config.link_rate_gbps))
    }

    /// Stage one packet, through the pacing wheel when congestion control
    /// is enabled.
    fn push_dpath_pkt(&self, sess: &mut Session<PendingReq<C>>, pkt: TxPkt, now: u64) {
        if self.fault_drop() {
            return;
        }
        if let Some(timely) = &sess.timely {
            let spacing = timely.pkt_spacing_us(pkt.wire_size());
            let departure = sess.next_departure_us.max(now);
            sess.next_departure_us = departure + spacing.ceil() as u64;
            if departure > now {
                sess.in_wheel += 1;
                self.wheel.borrow_mut().insert(
                    departure,
                    WheelEntry {
                        pkt,
                        session_num: sess.local_session_num,
                    },
                );
                return;
            }
        }
        self.tx_batch.borrow_mut().push(pkt);
    }

    /// Stage a control packet; CR/Nack bypass pacing.
    fn send_ctrl(&self, ri: RoutingInfo, hdr: PktHdr) {
        if self.fault_drop() {
            return;
        }
        let pkt = {
            let mut ring = self.ctrl_ring.borrow_mut();
            let next = ring.next;
            ring.next = (next + 1) % ring.bufs.len();
            let buf = &ring.bufs[next];
            unsafe { hdr.write_to(buf.pkt_hdr_ptr(0)) };
            TxPkt {
                ri,
                hdr: buf.pkt_hdr_ptr(0),
                payload: buf.data_ptr(),
                payload_len: 0,
            }
        };
        self.tx_batch.borrow_mut().push(pkt);
    }

    fn fault_drop(&self) -> bool {
        let prob = self.pkt_drop_prob.get();
        if prob > 0.0 && self.rng.borrow_mut().gen_bool(prob) {
            self.stats.borrow_mut().fault_dropped += 1;
            return true;
        }
        false
    }

    /// Flush when the batch has grown past the burst size; full flushes
    /// happen at the fixed points in the event loop.
    fn maybe_flush(&self) {
        if self.tx_batch.borrow().len() >= TX_BATCH_SIZE {
            self.flush_tx();
        }
    }

    fn flush_tx(&self) {
        let mut batch = self.tx_batch.borrow_mut();
        if batch.is_empty() {
            return;
        }
        {
            let mut stats = self.stats.borrow_mut();
            stats.tx_bursts += 1;
            stats.tx_pkts += batch.len() as u64;
        }
        match self.transport.borrow_mut().tx_burst(&mut batch) {
            Ok(_) => {}
            Err(e) => {
                // Fatal by contract: the link is gone.
                error!("transport tx_burst failed: {}", e);
                panic!("transport failure: {}", e);
            }
        }
    }

    /// Replay paced packets whose departure time has matured.
    fn reap_wheel(&self, now: u64) {
        if self.wheel.borrow().is_empty() {
            return;
        }
        let mut matured = Vec::new();
        self.wheel.borrow_mut().advance_into(now, &mut matured);
        if matured.is_empty() {
            return;
        }
        let mut sessions = self.sessions.borrow_mut();
        let mut batch = self.tx_batch.borrow_mut();
        for ent in matured {
            if let Some(sess) = sessions.get_mut(ent.session_num) {
                sess.in_wheel = sess.in_wheel.saturating_sub(1);
            }
            batch.push(ent.pkt);
        }
    }

    // ------------------------------------------------------------------
    // RX path
    // ------------------------------------------------------------------

    fn process_rx(&self) -> usize {
        let mut descs: Vec<RxDesc> = Vec::new();
        self.transport.borrow_mut().rx_burst(&mut descs);
        if descs.is_empty() {
            return 0;
        }
        let n_pkts = descs.len();
        {
            let mut stats = self.stats.borrow_mut();
            stats.rx_bursts += 1;
            stats.rx_pkts += n_pkts as u64;
        }

        let mut scratch = Vec::with_capacity(self.mtu);
        for desc in descs {
            let hdr = {
                let transport = self.transport.borrow();
                let bytes = transport.rx_slice(desc);
                match PktHdr::from_bytes(bytes) {
                    Ok(h) => {
                        scratch.clear();
                        scratch.extend_from_slice(&bytes[PKT_HDR_SIZE..]);
                        Some(h)
                    }
                    Err(_) => None,
                }
            };
            self.transport.borrow_mut().rx_release(desc);

            match hdr {
                Some(hdr) => self.dispatch_pkt(hdr, &scratch),
                None => {
                    self.stats.borrow_mut().rx_drop_invalid += 1;
                    trace!("dropping malformed packet");
                }
            }
        }
        self.maybe_flush();
        n_pkts
    }

    fn dispatch_pkt(&self, hdr: PktHdr, payload: &[u8]) {
        match hdr.pkt_kind() {
            PktKind::SmallReq | PktKind::LargeReq => self.process_req_pkt(hdr, payload),
            PktKind::SmallResp | PktKind::LargeResp => self.process_resp_pkt(hdr, payload),
            PktKind::ExplicitCR => self.process_cr(hdr),
            PktKind::Nack => self.process_nack(hdr),
        }
    }

    /// Server side: accumulate request fragments, credit each one, and
    /// dispatch the handler on the last.
    fn process_req_pkt(&self, hdr: PktHdr, payload: &[u8]) {
        let sn = hdr.dest_session_num();
        let rn = hdr.req_num();
        let idx16 = hdr.pkt_idx();
        let now = now_us();

        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut(sn) {
                Some(s) if s.role == Role::Server && s.is_connected() => s,
                _ => {
                    self.stats.borrow_mut().rx_drop_invalid += 1;
                    return;
                }
            };
            let ri = sess.remote_ri.expect("server session without routing");
            let remote_sn = sess.remote_session_num;
            let slot_idx = sess.slot_idx(rn);

            // A new request number on this slot retires the previous
            // request's stored response. The very first request a slot
            // serves arrives with the slot's preassigned number.
            let is_new = req_num_newer(rn, sess.slots[slot_idx].req_num)
                || (rn == sess.slots[slot_idx].req_num
                    && sess.slots[slot_idx].is_free());
            if is_new {
                let prev = std::mem::replace(&mut sess.slots[slot_idx].inner, SlotInner::Free);
                if let SlotInner::Server(prev) = prev {
                    if prev.handler_live {
                        // The handler for the old request is still out;
                        // re-arming the slot would corrupt it.
                        warn!(
                            "session {}: new req {} while handler busy, dropping",
                            sn, rn
                        );
                        sess.slots[slot_idx].inner = SlotInner::Server(prev);
                        return;
                    }
                    if let Some(resp) = prev.resp {
                        if resp.dynamic {
                            self.alloc.borrow_mut().free_msg_buffer(resp.buf);
                        }
                    }
                } else if !matches!(prev, SlotInner::Free) {
                    sess.slots[slot_idx].inner = prev;
                    self.stats.borrow_mut().rx_drop_invalid += 1;
                    return;
                }

                let msg_size = hdr.msg_size();
                let num_pkts = PktHdr::calc_num_pkts(msg_size, self.max_data_per_pkt);
                if msg_size > self.config.max_msg_size
                    || (num_pkts == 1) != (hdr.pkt_kind() == PktKind::SmallReq)
                {
                    self.stats.borrow_mut().rx_drop_invalid += 1;
                    return;
                }
                let req_buf = match self.alloc.borrow_mut().alloc_msg_buffer(
                    msg_size.max(1),
                    self.max_data_per_pkt,
                    &mut *self.transport.borrow_mut(),
                ) {
                    Ok(mut b) => {
                        // A zero-size request still has one fragment.
                        let _ = b.resize(msg_size);
                        b
                    }
                    Err(_) => {
                        warn!("session {}: no memory for {}-byte request", sn, msg_size);
                        return;
                    }
                };
                sess.slots[slot_idx].req_num = rn;
                sess.slots[slot_idx].inner = SlotInner::Server(ServerSlot {
                    req_type: hdr.req_type(),
                    req: Some(req_buf),
                    req_rcvd: 0,
                    req_num_pkts: num_pkts,
                    handler_live: false,
                    resp: None,
                });
            } else if req_num_newer(sess.slots[slot_idx].req_num, rn) {
                self.stats.borrow_mut().rx_drop_stale += 1;
                return;
            }

            let mut resend_resp = None;
            let mut dispatch: Option<(MsgBuffer, u8)> = None;
            {
                let slot = &mut sess.slots[slot_idx];
                let srv = match &mut slot.inner {
                    SlotInner::Server(srv) => srv,
                    _ => {
                        self.stats.borrow_mut().rx_drop_invalid += 1;
                        return;
                    }
                };

                if srv.handler_live || srv.resp.is_some() {
                    // Retransmitted fragment of a request we already
                    // dispatched; if the response exists the client must
                    // have lost its first fragment.
                    self.stats.borrow_mut().rx_dup += 1;
                    if let Some(resp) = &srv.resp {
                        resend_resp = Some(TxPkt {
                            ri,
                            hdr: resp.buf.pkt_hdr_ptr(0),
                            payload: resp.buf.frag_ptr(0),
                            payload_len: resp.buf.frag_len(0) as u32,
                        });
                    }
                } else {
                    let expected = srv.req_rcvd;
                    if idx16 < expected {
                        // Duplicate, probably from a lost credit return;
                        // re-issue it.
                        self.stats.borrow_mut().rx_dup += 1;
                        if idx16 + 1 < srv.req_num_pkts {
                            self.send_cr(ri, remote_sn, rn, idx16);
                        }
                        return;
                    }
                    if idx16 > expected {
                        self.send_nack(ri, remote_sn, rn, expected);
                        return;
                    }

                    let req_buf = srv.req.as_mut().unwrap();
                    if payload.len() != req_buf.frag_len(idx16) {
                        self.stats.borrow_mut().rx_drop_invalid += 1;
                        return;
                    }
                    req_buf.copy_in_frag(idx16, payload);
                    srv.req_rcvd += 1;
                    if idx16 + 1 < srv.req_num_pkts {
                        self.send_cr(ri, remote_sn, rn, idx16);
                    }

                    if srv.req_rcvd == srv.req_num_pkts {
                        srv.handler_live = true;
                        let req = srv.req.take().unwrap();
                        dispatch = Some((req, srv.req_type));
                    }
                }
            }

            if let Some(pkt) = resend_resp {
                self.stats.borrow_mut().num_re_tx += 1;
                self.push_dpath_pkt(sess, pkt, now);
                return;
            }

            if let Some((req, req_type)) = dispatch {
                let mut pre = sess.pre_resp[slot_idx].alias();
                let cap = pre.max_data_size();
                let _ = pre.resize(cap);
                let handle = ReqHandle {
                    session_num: sn,
                    req_num: rn,
                    req_type,
                    req,
                    resp: RespBuf::Prealloc(pre),
                };
                drop(sessions);
                self.dispatch_handler(handle);
            }
        }
    }

    fn dispatch_handler(&self, mut handle: ReqHandle) {
        let func = match self.handlers[handle.req_type as usize].as_ref() {
            Some(f) => f.clone(),
            None => {
                error!(
                    "no handler registered for request type {}, dropping request",
                    handle.req_type
                );
                self.stats.borrow_mut().rx_drop_invalid += 1;
                self.reclaim_aborted_handle(handle);
                return;
            }
        };

        match &*func {
            ReqFunc::Foreground(f) => {
                {
                    let mut ctx = self.context.borrow_mut();
                    let mut facade = AllocFacade {
                        alloc: &self.alloc,
                        transport: &self.transport,
                        max_data_per_pkt: self.max_data_per_pkt,
                        max_msg_size: self.config.max_msg_size,
                    };
                    f(&mut handle, &mut ctx, &mut facade);
                }
                if let Err(e) = self.enqueue_response(handle) {
                    error!("enqueue_response failed: {}", e);
                }
            }
            ReqFunc::Background(bf) => {
                let work = BgWork {
                    handler: bf.clone(),
                    handle,
                    done: self.bg_done_tx.clone(),
                };
                let injector = self
                    .nexus
                    .bg_injector()
                    .expect("background handler without background threads");
                if let Err(e) = injector.send(work) {
                    // Nexus is shutting down; reclaim the handle.
                    self.reclaim_aborted_handle(e.into_inner().handle);
                }
            }
        }
    }

    /// A handler will never respond to this handle; release the request
    /// and un-arm the slot so a retransmitted request can be served.
    fn reclaim_aborted_handle(&self, handle: ReqHandle) {
        let ReqHandle {
            session_num,
            req_num,
            req,
            resp,
            ..
        } = handle;
        self.alloc.borrow_mut().free_msg_buffer(req);
        if let RespBuf::Dynamic(b) = resp {
            self.alloc.borrow_mut().free_msg_buffer(b);
        }
        let mut sessions = self.sessions.borrow_mut();
        if let Some(sess) = sessions.get_mut(session_num) {
            let idx = sess.slot_idx(req_num);
            if sess.slots[idx].req_num == req_num {
                if let SlotInner::Server(srv) = &mut sess.slots[idx].inner {
                    srv.handler_live = false;
                }
            }
        }
    }

    /// The session vanished while the handle was out with a handler.
    fn reclaim_orphan_handle(&self, handle: ReqHandle) {
        let ReqHandle {
            session_num,
            req,
            resp,
            ..
        } = handle;
        self.alloc.borrow_mut().free_msg_buffer(req);
        if let RespBuf::Dynamic(b) = resp {
            self.alloc.borrow_mut().free_msg_buffer(b);
        }
        let mut zombies = self.zombies.borrow_mut();
        if let Some(z) = zombies.get_mut(&session_num) {
            z.live -= 1;
            if z.live == 0 {
                let z = zombies.remove(&session_num).unwrap();
                let mut alloc = self.alloc.borrow_mut();
                for b in z.bufs {
                    alloc.free_msg_buffer(b);
                }
            }
        }
    }

    /// Client side: accumulate response fragments, credit each one, and
    /// fire the continuation on the last.
    fn process_resp_pkt(&self, hdr: PktHdr, payload: &[u8]) {
        let sn = hdr.dest_session_num();
        let rn = hdr.req_num();
        let idx16 = hdr.pkt_idx();
        let now = now_us();
        let mut completion = None;
        let mut rtt_sample = None;

        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut(sn) {
                Some(s) if s.role == Role::Client && s.is_connected() => s,
                _ => {
                    self.stats.borrow_mut().rx_drop_invalid += 1;
                    return;
                }
            };
            let ri = sess.remote_ri.expect("connected session without routing");
            let remote_sn = sess.remote_session_num;
            let slot_idx = sess.slot_idx(rn);
            let num_slots = sess.slots.len() as u64;

            {
                let slot = &mut sess.slots[slot_idx];
                if slot.req_num != rn {
                    self.stats.borrow_mut().rx_drop_stale += 1;
                    return;
                }
                let cs = match &mut slot.inner {
                    SlotInner::Client(cs) => cs,
                    _ => {
                        self.stats.borrow_mut().rx_drop_stale += 1;
                        return;
                    }
                };

                if cs.resp_num_pkts == 0 {
                    let msg_size = hdr.msg_size();
                    if msg_size > cs.resp.max_data_size() {
                        // The caller's pre-allocated response buffer
                        // cannot hold this response; that is a contract
                        // violation we cannot recover from.
                        panic!(
                            "response of {} bytes exceeds the {}-byte response buffer",
                            msg_size,
                            cs.resp.max_data_size()
                        );
                    }
                    cs.resp.resize(msg_size).unwrap();
                    cs.resp_num_pkts = cs.resp.num_pkts();
                    rtt_sample = Some(now.saturating_sub(cs.tx_ts_us));
                }

                let expected = cs.resp_rcvd;
                if idx16 < expected {
                    self.stats.borrow_mut().rx_dup += 1;
                    if idx16 + 1 < cs.resp_num_pkts {
                        self.send_cr(ri, remote_sn, rn, idx16);
                    }
                    return;
                }
                if idx16 > expected {
                    self.send_nack(ri, remote_sn, rn, expected);
                    return;
                }
                if payload.len() != cs.resp.frag_len(idx16) {
                    self.stats.borrow_mut().rx_drop_invalid += 1;
                    return;
                }

                cs.resp.copy_in_frag(idx16, payload);
                cs.resp_rcvd += 1;
                cs.progress_ts_us = now;
                cs.rto_doublings = 0;
                if idx16 + 1 < cs.resp_num_pkts {
                    self.send_cr(ri, remote_sn, rn, idx16);
                }

                if cs.resp_rcvd == cs.resp_num_pkts {
                    // Completed: free the slot and hand everything back.
                    let inner = std::mem::replace(&mut slot.inner, SlotInner::Free);
                    slot.req_num = (slot.req_num + num_slots) & MAX_REQ_NUM;
                    if let SlotInner::Client(mut cs) = inner {
                        completion = Some((
                            cs.pending.cont.take().expect("continuation already taken"),
                            Completion {
                                tag: cs.pending.tag,
                                status: CompletionStatus::Success,
                                resp: cs.resp,
                            },
                        ));
                    }
                }
            }

            if completion.is_some() {
                sess.credits += 1;
            }
            if let Some(rtt) = rtt_sample {
                sess.record_rtt(rtt);
                if let Some(t) = &sess.timely {
                    t.update(rtt, now);
                }
            }
        }

        if let Some((cont, comp)) = completion {
            let mut ctx = self.context.borrow_mut();
            cont(&mut ctx, comp);
        }
    }

    /// A credit return allows the next fragment of the message the
    /// receiver is crediting: request fragments on client slots, response
    /// fragments on server slots.
    fn process_cr(&self, hdr: PktHdr) {
        let sn = hdr.dest_session_num();
        let rn = hdr.req_num();
        let idx16 = hdr.pkt_idx();
        let now = now_us();
        let mut to_send: Vec<TxPkt> = Vec::new();

        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(sn) {
            Some(s) if s.is_connected() => s,
            _ => {
                self.stats.borrow_mut().rx_drop_invalid += 1;
                return;
            }
        };
        let ri = sess.remote_ri.expect("connected session without routing");
        let slot_idx = sess.slot_idx(rn);

        {
            let slot = &mut sess.slots[slot_idx];
            if slot.req_num != rn {
                self.stats.borrow_mut().rx_drop_stale += 1;
                return;
            }
            match &mut slot.inner {
                SlotInner::Client(cs) => {
                    if idx16 != cs.cr_rcvd {
                        self.stats.borrow_mut().rx_dup += 1;
                        return;
                    }
                    cs.cr_rcvd += 1;
                    cs.progress_ts_us = now;
                    cs.rto_doublings = 0;
                    let allowed = cs.cr_rcvd + 1;
                    while cs.num_tx < cs.req_num_pkts && cs.num_tx < allowed {
                        let i = cs.num_tx;
                        to_send.push(TxPkt {
                            ri,
                            hdr: cs.req.pkt_hdr_ptr(i),
                            payload: cs.req.frag_ptr(i),
                            payload_len: cs.req.frag_len(i) as u32,
                        });
                        cs.num_tx += 1;
                    }
                }
                SlotInner::Server(srv) => {
                    let resp = match &mut srv.resp {
                        Some(r) => r,
                        None => {
                            self.stats.borrow_mut().rx_drop_stale += 1;
                            return;
                        }
                    };
                    if idx16 != resp.cr_rcvd {
                        self.stats.borrow_mut().rx_dup += 1;
                        return;
                    }
                    resp.cr_rcvd += 1;
                    let allowed = resp.cr_rcvd + 1;
                    let total = resp.buf.num_pkts();
                    while resp.num_tx < total && resp.num_tx < allowed {
                        let i = resp.num_tx;
                        to_send.push(TxPkt {
                            ri,
                            hdr: resp.buf.pkt_hdr_ptr(i),
                            payload: resp.buf.frag_ptr(i),
                            payload_len: resp.buf.frag_len(i) as u32,
                        });
                        resp.num_tx += 1;
                    }
                }
                SlotInner::Free => {
                    self.stats.borrow_mut().rx_drop_stale += 1;
                    return;
                }
            }
        }

        for pkt in to_send {
            self.push_dpath_pkt(sess, pkt, now);
        }
    }

    /// Selective retransmission: the peer names the fragment it expects.
    fn process_nack(&self, hdr: PktHdr) {
        let sn = hdr.dest_session_num();
        let rn = hdr.req_num();
        let idx16 = hdr.pkt_idx();
        let now = now_us();
        let mut resend = None;

        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(sn) {
            Some(s) if s.is_connected() => s,
            _ => {
                self.stats.borrow_mut().rx_drop_invalid += 1;
                return;
            }
        };
        let ri = sess.remote_ri.expect("connected session without routing");
        let slot_idx = sess.slot_idx(rn);

        {
            let slot = &mut sess.slots[slot_idx];
            if slot.req_num != rn {
                self.stats.borrow_mut().rx_drop_stale += 1;
                return;
            }
            match &mut slot.inner {
                SlotInner::Client(cs) => {
                    if idx16 < cs.num_tx {
                        resend = Some(TxPkt {
                            ri,
                            hdr: cs.req.pkt_hdr_ptr(idx16),
                            payload: cs.req.frag_ptr(idx16),
                            payload_len: cs.req.frag_len(idx16) as u32,
                        });
                        cs.progress_ts_us = now;
                    }
                }
                SlotInner::Server(srv) => {
                    if let Some(resp) = &srv.resp {
                        if idx16 < resp.num_tx {
                            resend = Some(TxPkt {
                                ri,
                                hdr: resp.buf.pkt_hdr_ptr(idx16),
                                payload: resp.buf.frag_ptr(idx16),
                                payload_len: resp.buf.frag_len(idx16) as u32,
                            });
                        }
                    }
                }
                SlotInner::Free => {}
            }
        }

        if let Some(pkt) = resend {
            self.stats.borrow_mut().num_re_tx += 1;
            if sess.in_wheel > 0 {
                self.stats.borrow_mut().still_in_wheel_during_retx += 1;
            }
            self.push_dpath_pkt(sess, pkt, now);
        } else {
            self.stats.borrow_mut().rx_drop_stale += 1;
        }
    }

    fn send_cr(&self, ri: RoutingInfo, remote_sn: u16, req_num: u64, pkt_idx: u16) {
        let hdr = PktHdr::new(0, 0, remote_sn, PktKind::ExplicitCR, pkt_idx, req_num);
        self.send_ctrl(ri, hdr);
    }

    fn send_nack(&self, ri: RoutingInfo, remote_sn: u16, req_num: u64, expected: u16) {
        let hdr = PktHdr::new(0, 0, remote_sn, PktKind::Nack, expected, req_num);
        self.send_ctrl(ri, hdr);
    }

    // ------------------------------------------------------------------
    // Background handler completions
    // ------------------------------------------------------------------

    fn process_bg_done(&self) -> usize {
        let mut n = 0;
        while let Ok(handle) = self.bg_done_rx.try_recv() {
            if let Err(e) = self.enqueue_response(handle) {
                error!("background enqueue_response failed: {}", e);
            }
            n += 1;
        }
        n
    }

    // ------------------------------------------------------------------
    // Session management plumbing
    // ------------------------------------------------------------------

    fn sm_pkt_for(&self, sess: &Session<PendingReq<C>>, kind: SmPktKind) -> SmPkt {
        let (client_rpc_id, server_rpc_id, client_sn, server_sn) = match sess.role {
            Role::Client => (
                self.rpc_id,
                sess.remote_rpc_id,
                sess.local_session_num,
                sess.remote_session_num,
            ),
            Role::Server => (
                sess.remote_rpc_id,
                self.rpc_id,
                sess.remote_session_num,
                sess.local_session_num,
            ),
        };
        SmPkt {
            kind,
            reject: None,
            client_rpc_id,
            server_rpc_id,
            client_session_num: client_sn,
            server_session_num: server_sn,
            mgmt_port: self.nexus.mgmt_port(),
            routing: self.transport.borrow().routing_info(),
        }
    }

    fn send_connect_req(&self, session_num: u16) -> Result<()> {
        let mut sessions = self.sessions.borrow_mut();
        let sess = sessions
            .get_mut(session_num)
            .ok_or(Error::SessionNotFound(session_num))?;
        let pkt = self.sm_pkt_for(sess, SmPktKind::ConnectReq);
        let to = sess.remote_sm_addr.unwrap();
        sess.sm_last_tx_us = now_us();
        sess.sm_attempts += 1;
        self.nexus.send_sm(&pkt, to)
    }

    fn process_sm_queue(&self) -> usize {
        let mut n = 0;
        while let Ok(item) = self.sm_rx.try_recv() {
            self.handle_sm_item(item);
            n += 1;
        }
        n
    }

    fn handle_sm_item(&self, item: SmWorkItem) {
        match item.pkt.kind {
            SmPktKind::ConnectReq => self.handle_connect_req(item),
            SmPktKind::ConnectResp => self.handle_connect_resp(item),
            SmPktKind::DisconnectReq => self.handle_disconnect_req(item),
            SmPktKind::DisconnectResp => self.handle_disconnect_resp(item),
        }
    }

    fn handle_connect_req(&self, item: SmWorkItem) {
        let pkt = item.pkt;
        let key = (item.from, pkt.client_rpc_id, pkt.client_session_num);

        // Re-send the accept for a retransmitted connect.
        if let Some(&sn) = self.sm_peer_map.borrow().get(&key) {
            let sessions = self.sessions.borrow();
            if let Some(sess) = sessions.get(sn) {
                let reply = self.sm_pkt_for(sess, SmPktKind::ConnectResp);
                let _ = self.nexus.send_sm(&reply, item.from);
            }
            return;
        }

        let credits = self.config.session_credits;
        if self.unexp_credits.get() < credits {
            let reply = pkt.reject_reply(
                RejectReason::NoRingEntriesAvailable,
                self.nexus.mgmt_port(),
            );
            let _ = self.nexus.send_sm(&reply, item.from);
            return;
        }
        if !self.transport.borrow().check_routing(&pkt.routing) {
            let reply = pkt.reject_reply(
                RejectReason::RoutingResolutionFailed,
                self.nexus.mgmt_port(),
            );
            let _ = self.nexus.send_sm(&reply, item.from);
            return;
        }

        let timely = self.new_timely();
        let created = {
            let mut sessions = self.sessions.borrow_mut();
            sessions.create(|n| {
                let mut s = Session::new(n, Role::Server, credits, timely);
                s.state = SessionState::Connected;
                s.remote_rpc_id = pkt.client_rpc_id;
                s.remote_session_num = pkt.client_session_num;
                s.remote_sm_addr = Some(item.from);
                s.remote_ri = Some(pkt.routing);
                s
            })
        };
        let session_num = match created {
            Some(n) => n,
            None => {
                let reply = pkt.reject_reply(RejectReason::OutOfMemory, self.nexus.mgmt_port());
                let _ = self.nexus.send_sm(&reply, item.from);
                return;
            }
        };

        // Preallocated single-MTU response buffers, one per slot.
        let mut pre_resp = Vec::with_capacity(credits);
        for _ in 0..credits {
            match self.alloc.borrow_mut().alloc_msg_buffer(
                self.max_data_per_pkt,
                self.max_data_per_pkt,
                &mut *self.transport.borrow_mut(),
            ) {
                Ok(b) => pre_resp.push(b),
                Err(_) => {
                    let mut sessions = self.sessions.borrow_mut();
                    sessions.remove(session_num);
                    let mut alloc = self.alloc.borrow_mut();
                    for b in pre_resp {
                        alloc.free_msg_buffer(b);
                    }
                    drop(alloc);
                    drop(sessions);
                    let reply =
                        pkt.reject_reply(RejectReason::OutOfMemory, self.nexus.mgmt_port());
                    let _ = self.nexus.send_sm(&reply, item.from);
                    return;
                }
            }
        }

        let reply = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions.get_mut(session_num).unwrap();
            sess.pre_resp = pre_resp;
            self.sm_pkt_for(sess, SmPktKind::ConnectResp)
        };
        self.unexp_credits.set(self.unexp_credits.get() - credits);
        self.sm_peer_map.borrow_mut().insert(key, session_num);
        let _ = self.nexus.send_sm(&reply, item.from);
        debug!(
            "session {}: accepted connect from {} rpc {}",
            session_num, item.from, pkt.client_rpc_id
        );
    }

    fn handle_connect_resp(&self, item: SmWorkItem) {
        let pkt = item.pkt;
        let sn = pkt.client_session_num;
        let now = now_us();
        let mut events = Vec::new();

        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut(sn) {
                Some(s)
                    if s.role == Role::Client
                        && matches!(
                            s.state,
                            SessionState::ConnectInFlight | SessionState::ResetInFlight
                        ) =>
                {
                    s
                }
                _ => return, // duplicate or late response
            };

            match pkt.reject {
                None => {
                    sess.remote_session_num = pkt.server_session_num;
                    sess.remote_ri = Some(pkt.routing);
                    if sess.state == SessionState::ResetInFlight {
                        // The caller already abandoned this session; turn
                        // the fresh connection straight around.
                        sess.state = SessionState::DisconnectInFlight;
                        sess.sm_attempts = 0;
                        sess.sm_last_tx_us = now;
                        let bye = self.sm_pkt_for(sess, SmPktKind::DisconnectReq);
                        let to = sess.remote_sm_addr.unwrap();
                        let _ = self.nexus.send_sm(&bye, to);
                    } else {
                        sess.state = SessionState::Connected;
                        events.push((sn, SmEvent::Connected));
                        debug!("session {}: connected", sn);
                    }
                }
                Some(RejectReason::InvalidRemoteRpcId)
                    if self.retry_connect_on_invalid_rpc_id.get()
                        && sess.state == SessionState::ConnectInFlight =>
                {
                    sess.reconnect_at_us =
                        Some(now + self.config.reconnect_delay_ms * 1000);
                    sess.sm_attempts = 0;
                    debug!("session {}: remote RPC not ready, will retry", sn);
                }
                Some(reason) => {
                    if sess.state == SessionState::ResetInFlight {
                        sessions.remove(sn);
                        events.push((sn, SmEvent::Disconnected));
                    } else {
                        sess.state = SessionState::Error;
                        events.push((sn, SmEvent::ConnectFailed(ConnectFailure::Rejected(reason))));
                        debug!("session {}: connect rejected: {}", sn, reason);
                    }
                }
            }
        }

        self.deliver_sm_events(events);
    }

    fn handle_disconnect_req(&self, item: SmWorkItem) {
        let pkt = item.pkt;
        let sn = pkt.server_session_num;

        let known = {
            let sessions = self.sessions.borrow();
            matches!(
                sessions.get(sn),
                Some(s) if s.role == Role::Server
                    && s.remote_session_num == pkt.client_session_num
            )
        };
        if known {
            self.teardown_server_session(sn);
        }
        // Reply unconditionally so a client retrying over a lost reply
        // still completes its teardown.
        let mut reply = pkt;
        reply.kind = SmPktKind::DisconnectResp;
        reply.mgmt_port = self.nexus.mgmt_port();
        let _ = self.nexus.send_sm(&reply, item.from);
    }

    fn handle_disconnect_resp(&self, item: SmWorkItem) {
        let sn = item.pkt.client_session_num;
        let mut events = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            let matches = matches!(
                sessions.get(sn),
                Some(s) if s.role == Role::Client
                    && s.state == SessionState::DisconnectInFlight
            );
            if matches {
                sessions.remove(sn);
                events.push((sn, SmEvent::Disconnected));
                debug!("session {}: disconnected", sn);
            }
        }
        self.deliver_sm_events(events);
    }

    /// Release everything a server session holds. Preallocated response
    /// buffers go to a zombie list if background handlers still hold
    /// aliases into them.
    fn teardown_server_session(&self, session_num: u16) {
        let sess = match self.sessions.borrow_mut().remove(session_num) {
            Some(s) => s,
            None => return,
        };
        let num_credits = sess.slots.len();
        let mut live = 0usize;
        {
            let mut alloc = self.alloc.borrow_mut();
            for slot in sess.slots {
                if let SlotInner::Server(srv) = slot.inner {
                    if srv.handler_live {
                        live += 1;
                    }
                    if let Some(req) = srv.req {
                        alloc.free_msg_buffer(req);
                    }
                    if let Some(resp) = srv.resp {
                        if resp.dynamic {
                            alloc.free_msg_buffer(resp.buf);
                        }
                    }
                }
            }
        }
        if live > 0 {
            self.zombies.borrow_mut().insert(
                session_num,
                ZombieSession {
                    live,
                    bufs: sess.pre_resp,
                },
            );
        } else {
            let mut alloc = self.alloc.borrow_mut();
            for b in sess.pre_resp {
                alloc.free_msg_buffer(b);
            }
        }
        self.unexp_credits
            .set(self.unexp_credits.get() + num_credits);
        self.sm_peer_map
            .borrow_mut()
            .retain(|_, &mut v| v != session_num);
        debug!("session {}: server side released", session_num);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Coarse timer pass: datapath RTOs and session-management retries.
    /// Runs at most once per [`TIMER_SCAN_INTERVAL_US`].
    fn scan_timers(&self, now: u64) {
        if now.saturating_sub(self.last_scan_us.get()) < TIMER_SCAN_INTERVAL_US {
            return;
        }
        self.last_scan_us.set(now);

        let sm_retry_us = self.config.sm_retry_ms * 1000;
        let sm_budget = self.config.sm_retry_budget;
        let mut events = Vec::new();
        let mut to_fail = Vec::new();
        let mut to_remove = Vec::new();
        let mut connect_resend = Vec::new();

        {
            let mut sessions = self.sessions.borrow_mut();
            for sess in sessions.iter_mut() {
                let sn = sess.local_session_num;
                match sess.state {
                    SessionState::ConnectInFlight => {
                        if let Some(at) = sess.reconnect_at_us {
                            if now >= at {
                                sess.reconnect_at_us = None;
                                connect_resend.push(sn);
                            }
                        } else if now.saturating_sub(sess.sm_last_tx_us) >= sm_retry_us {
                            if sess.sm_attempts >= sm_budget {
                                sess.state = SessionState::Error;
                                events
                                    .push((sn, SmEvent::ConnectFailed(ConnectFailure::Timeout)));
                            } else {
                                connect_resend.push(sn);
                            }
                        }
                    }
                    SessionState::ResetInFlight => {
                        if now.saturating_sub(sess.sm_last_tx_us) >= sm_retry_us {
                            sess.sm_last_tx_us = now;
                            sess.sm_attempts += 1;
                            if sess.sm_attempts >= sm_budget {
                                to_remove.push((sn, SmEvent::Reset));
                            }
                        }
                    }
                    SessionState::DisconnectInFlight => {
                        if now.saturating_sub(sess.sm_last_tx_us) >= sm_retry_us {
                            if sess.sm_attempts >= sm_budget {
                                to_remove.push((sn, SmEvent::Disconnected));
                            } else {
                                sess.sm_attempts += 1;
                                sess.sm_last_tx_us = now;
                                let pkt = self.sm_pkt_for(sess, SmPktKind::DisconnectReq);
                                let to = sess.remote_sm_addr.unwrap();
                                let _ = self.nexus.send_sm(&pkt, to);
                            }
                        }
                    }
                    SessionState::Connected if sess.role == Role::Client => {
                        self.scan_session_rtos(sess, now, &mut to_fail);
                    }
                    _ => {}
                }
            }
        }

        for sn in connect_resend {
            let _ = self.send_connect_req(sn);
        }
        for (sn, event) in to_remove {
            self.sessions.borrow_mut().remove(sn);
            events.push((sn, event));
        }
        for sn in to_fail {
            self.fail_session(sn, &mut events);
        }
        self.deliver_sm_events(events);
    }

    /// Per-slot RTO check for one connected client session.
    fn scan_session_rtos(
        &self,
        sess: &mut Session<PendingReq<C>>,
        now: u64,
        to_fail: &mut Vec<u16>,
    ) {
        let ri = match sess.remote_ri {
            Some(ri) => ri,
            None => return,
        };
        let remote_sn = sess.remote_session_num;
        let in_wheel = sess.in_wheel;
        let mut resend: Vec<TxPkt> = Vec::new();
        let mut nacks: Vec<(u64, u16)> = Vec::new();
        let mut failed = false;

        for slot in &mut sess.slots {
            let rn = slot.req_num;
            if let SlotInner::Client(cs) = &mut slot.inner {
                if now.saturating_sub(cs.progress_ts_us) < cs.rto_us {
                    continue;
                }
                if cs.rto_doublings >= self.config.rto_max_doublings {
                    failed = true;
                    break;
                }
                if cs.num_tx < cs.req_num_pkts {
                    // Request partially sent: re-send the earliest
                    // fragment the server has not credited.
                    let i = cs.cr_rcvd.min(cs.num_tx.saturating_sub(1));
                    resend.push(TxPkt {
                        ri,
                        hdr: cs.req.pkt_hdr_ptr(i),
                        payload: cs.req.frag_ptr(i),
                        payload_len: cs.req.frag_len(i) as u32,
                    });
                } else if cs.resp_num_pkts == 0 && cs.req_num_pkts == 1 {
                    // Single-fragment request with nothing back yet.
                    resend.push(TxPkt {
                        ri,
                        hdr: cs.req.pkt_hdr_ptr(0),
                        payload: cs.req.frag_ptr(0),
                        payload_len: cs.req.frag_len(0) as u32,
                    });
                } else if cs.resp_num_pkts == 0 {
                    // Fully-sent multi-fragment request: the last
                    // fragment or the whole response went missing.
                    resend.push(TxPkt {
                        ri,
                        hdr: cs.req.pkt_hdr_ptr(cs.req_num_pkts - 1),
                        payload: cs.req.frag_ptr(cs.req_num_pkts - 1),
                        payload_len: cs.req.frag_len(cs.req_num_pkts - 1) as u32,
                    });
                } else {
                    // Mid-response: ask for the fragment we expect.
                    nacks.push((rn, cs.resp_rcvd));
                }
                cs.rto_us *= 2;
                cs.rto_doublings += 1;
                cs.progress_ts_us = now;
            }
        }

        let n_retx = (resend.len() + nacks.len()) as u64;
        if n_retx > 0 {
            let mut stats = self.stats.borrow_mut();
            stats.num_re_tx += n_retx;
            if in_wheel > 0 {
                stats.still_in_wheel_during_retx += n_retx;
            }
        }
        for pkt in resend {
            self.push_dpath_pkt(sess, pkt, now);
        }
        for (rn, expected) in nacks {
            self.send_nack(ri, remote_sn, rn, expected);
        }
        if failed {
            to_fail.push(sess.local_session_num);
        }
    }

    /// Transition a session to Error and fail its outstanding requests.
    fn fail_session(&self, session_num: u16, events: &mut Vec<(u16, SmEvent)>) {
        let mut completions = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            if let Some(sess) = sessions.get_mut(session_num) {
                warn!("session {}: no progress after repeated timeouts", session_num);
                sess.state = SessionState::Error;
                Self::fail_outstanding(sess, &mut completions);
            }
        }
        events.push((session_num, SmEvent::Reset));
        self.deliver_completions(completions);
    }

    /// Pull every in-flight request off a client session, producing
    /// `SessionReset` completions with zero-size responses.
    fn fail_outstanding(
        sess: &mut Session<PendingReq<C>>,
        out: &mut Vec<(Continuation<C>, Completion)>,
    ) {
        let num_slots = sess.slots.len() as u64;
        for slot in &mut sess.slots {
            if let SlotInner::Client(_) = &slot.inner {
                let inner = std::mem::replace(&mut slot.inner, SlotInner::Free);
                slot.req_num = (slot.req_num + num_slots) & MAX_REQ_NUM;
                if let SlotInner::Client(mut cs) = inner {
                    let mut resp = cs.resp;
                    let _ = resp.resize(0);
                    if let Some(cont) = cs.pending.cont.take() {
                        out.push((
                            cont,
                            Completion {
                                tag: cs.pending.tag,
                                status: CompletionStatus::SessionReset,
                                resp,
                            },
                        ));
                    }
                    sess.credits += 1;
                }
            }
        }
    }

    fn deliver_completions(&self, completions: Vec<(Continuation<C>, Completion)>) {
        for (cont, comp) in completions {
            let mut ctx = self.context.borrow_mut();
            cont(&mut ctx, comp);
        }
    }

    fn deliver_sm_events(&self, events: Vec<(u16, SmEvent)>) {
        for (sn, event) in events {
            let mut ctx = self.context.borrow_mut();
            (self.sm_handler)(&mut ctx, sn, event);
        }
    }
}

impl<C, T: Transport> Drop for Rpc<C, T> {
    fn drop(&mut self) {
        self.nexus.unregister_hook(self.rpc_id);
    }
}
