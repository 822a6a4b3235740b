//! Shared harness for the integration tests.
//!
//! Builds a client/server RPC pair over UDP loopback, both owned by the
//! test thread and co-polled, sharing one nexus the way instances in one
//! process do.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use urpc::{
    Completion, CompletionStatus, Continuation, Nexus, ReqFunc, Rpc, RpcConfig, SmEvent,
    SmHandler, UdpTransport,
};

/// Echo request type served by a foreground handler.
pub const ECHO_REQ: u8 = 1;
/// Echo request type served by a background handler.
pub const ECHO_REQ_BG: u8 = 2;

/// Everything the callbacks record for the test body to inspect.
#[derive(Default)]
pub struct TestState {
    /// (tag, status, response bytes) per fired continuation.
    pub completed: Vec<(u64, CompletionStatus, Vec<u8>)>,
    pub sm_events: Vec<(u16, SmEvent)>,
}

pub type Ctx = Rc<RefCell<TestState>>;

pub struct Pair {
    pub nexus: Arc<Nexus<Ctx>>,
    pub server: Rpc<Ctx, UdpTransport>,
    pub client: Rpc<Ctx, UdpTransport>,
    pub server_state: Ctx,
    pub client_state: Ctx,
}

fn sm_recorder() -> SmHandler<Ctx> {
    Box::new(|ctx: &mut Ctx, sn, ev| {
        ctx.borrow_mut().sm_events.push((sn, ev));
    })
}

fn register_echo_handlers(nexus: &Nexus<Ctx>, with_bg: bool) {
    nexus.register_req_func(
        ECHO_REQ,
        ReqFunc::foreground(|req, _ctx: &mut Ctx, alloc| {
            let n = req.req_msgbuf().data_size();
            let data = req.req_msgbuf().data().to_vec();
            if n <= req.resp_msgbuf().max_data_size() {
                let resp = req.resp_msgbuf();
                resp.resize(n).unwrap();
                resp.data_mut().copy_from_slice(&data);
            } else {
                let mut buf = alloc.alloc_msg_buffer(n).unwrap();
                buf.data_mut().copy_from_slice(&data);
                if let Some(old) = req.set_dyn_resp(buf) {
                    alloc.free_msg_buffer(old);
                }
            }
        }),
    );
    if with_bg {
        nexus.register_req_func(
            ECHO_REQ_BG,
            ReqFunc::background(|req| {
                let n = req.req_msgbuf().data_size();
                let data = req.req_msgbuf().data().to_vec();
                let resp = req.resp_msgbuf();
                assert!(n <= resp.max_data_size());
                resp.resize(n).unwrap();
                resp.data_mut().copy_from_slice(&data);
            }),
        );
    }
}

/// Build a connected-capable pair: one nexus, a server instance (rpc id
/// 0) and a client instance (rpc id 1), both driven by this thread.
pub fn make_pair(server_cfg: RpcConfig, client_cfg: RpcConfig) -> Pair {
    make_pair_opts(server_cfg, client_cfg, 0)
}

pub fn make_pair_opts(
    server_cfg: RpcConfig,
    client_cfg: RpcConfig,
    num_bg_threads: usize,
) -> Pair {
    let nexus = Arc::new(Nexus::new("127.0.0.1:0", 0, num_bg_threads).unwrap());
    register_echo_handlers(&nexus, num_bg_threads > 0);

    let server_state: Ctx = Ctx::default();
    let client_state: Ctx = Ctx::default();

    let server = Rpc::new(
        nexus.clone(),
        server_state.clone(),
        0,
        sm_recorder(),
        UdpTransport::new("127.0.0.1:0").unwrap(),
        server_cfg,
    )
    .unwrap();
    let client = Rpc::new(
        nexus.clone(),
        client_state.clone(),
        1,
        sm_recorder(),
        UdpTransport::new("127.0.0.1:0").unwrap(),
        client_cfg,
    )
    .unwrap();

    Pair {
        nexus,
        server,
        client,
        server_state,
        client_state,
    }
}

impl Pair {
    pub fn server_uri(&self) -> String {
        self.nexus.sm_addr().to_string()
    }

    /// Connect a client session to the server instance and wait for the
    /// handshake.
    pub fn connect(&self) -> u16 {
        let sn = self.client.create_session(&self.server_uri(), 0).unwrap();
        let ok = self.poll_until(Duration::from_secs(5), || {
            self.client_state
                .borrow()
                .sm_events
                .iter()
                .any(|&(s, ev)| s == sn && ev == SmEvent::Connected)
        });
        assert!(ok, "session {} failed to connect", sn);
        sn
    }

    /// Co-poll both instances until `cond` holds or `timeout` passes.
    pub fn poll_until<F: FnMut() -> bool>(&self, timeout: Duration, mut cond: F) -> bool {
        let start = Instant::now();
        loop {
            self.client.run_event_loop_once();
            self.server.run_event_loop_once();
            if cond() {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
        }
    }
}

/// Continuation that records into the shared state.
pub fn recording_cont() -> Continuation<Ctx> {
    Box::new(|ctx: &mut Ctx, comp: Completion| {
        ctx.borrow_mut()
            .completed
            .push((comp.tag, comp.status, comp.resp.data().to_vec()));
    })
}

/// The checkable fill pattern: `buf[0]` is a seed and `buf[j] = buf[0] + j`.
pub fn fill_pattern(buf: &mut [u8], seed: u8) {
    if buf.is_empty() {
        return;
    }
    buf[0] = seed;
    for j in 1..buf.len() {
        buf[j] = seed.wrapping_add(j as u8);
    }
}

pub fn check_pattern(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    let seed = buf[0];
    buf.iter()
        .enumerate()
        .all(|(j, &b)| b == seed.wrapping_add(j as u8))
}
