//! # urpc - user-space RPC for kernel-bypass transports
//!
//! This crate implements a request/response RPC runtime over unreliable,
//! MTU-limited packet transports, targeting microsecond-scale latency. The
//! underlying transports expose only unreliable datagrams, so the runtime
//! carries its own reliability, flow control, fragmentation, and optional
//! congestion control.
//!
//! ## Features
//!
//! - **Connection-oriented sessions** with a three-way UDP connect
//!   handshake and idempotent disconnect
//! - **Credit-based flow control**: a fixed number of in-flight requests
//!   per session, with explicit credit returns pacing multi-fragment
//!   messages
//! - **Selective retransmission**: coarse per-slot timers plus
//!   next-expected-fragment nacks
//! - **Timely congestion control**: optional RTT-gradient rate control
//!   enforced by a hashed pacing wheel
//! - **Zero-copy-friendly buffers**: MsgBuffers carry per-fragment packet
//!   header headroom and live in hugepage slabs registered with the
//!   transport
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use urpc::{Nexus, ReqFunc, Rpc, RpcConfig, UdpTransport};
//!
//! // Server process: register handlers, then create the instance.
//! let nexus = Arc::new(Nexus::new("10.0.0.1:31850", 0, 0)?);
//! nexus.register_req_func(1, ReqFunc::foreground(|req, _ctx, _alloc| {
//!     let n = req.req_msgbuf().data_size();
//!     let resp = req.resp_msgbuf();
//!     resp.resize(n).unwrap();
//!     // ... fill resp.data_mut() ...
//! }));
//! let rpc = Rpc::new(nexus, (), 0, Box::new(|_, _, _| {}),
//!                    UdpTransport::new("10.0.0.1:0")?, RpcConfig::default())?;
//!
//! // Client side: connect, enqueue, poll.
//! let session = rpc.create_session("10.0.0.1:31850", 0)?;
//! rpc.enqueue_request(session, 1, &req_buf, &resp_buf,
//!                     Box::new(|_ctx, comp| { /* response in comp.resp */ }), 0)?;
//! loop {
//!     rpc.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: configuration and protocol constants
//! - [`packet`]: datapath packet header
//! - [`buffer`]: message buffers with header headroom
//! - [`huge_alloc`]: hugepage size-class allocator
//! - [`transport`]: the transport capability trait
//! - [`udp`]: UDP reference transport
//! - [`session`]: sessions and request slots
//! - [`sm`]: session-management wire protocol
//! - [`nexus`]: process-wide registry and SM demultiplexer
//! - [`flow_control`]: Timely congestion control
//! - [`timing`]: timestamps and the pacing wheel
//! - [`rpc`]: the per-thread engine and public API
//!
//! Each RPC instance is strictly single-threaded: every call must come
//! from the thread that created it. Instances in one process share a
//! [`Nexus`] and run independently on their own cores.

pub mod buffer;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod huge_alloc;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;
pub mod udp;

pub use buffer::MsgBuffer;
pub use config::{RpcConfig, MAX_MSG_SIZE, SESSION_CREDITS, UNEXP_PKT_WINDOW};
pub use error::{Error, Result};
pub use flow_control::Timely;
pub use huge_alloc::{HugeAlloc, MsgAlloc};
pub use nexus::{Nexus, ReqFunc};
pub use packet::{PktHdr, PktKind, PKT_HDR_SIZE};
pub use rpc::{
    Completion, CompletionStatus, ConnectFailure, Continuation, ReqHandle, Rpc, SmEvent, SmHandler,
};
pub use session::SessionState;
pub use sm::RejectReason;
pub use transport::{MemHandle, MemRegistrar, RoutingInfo, RxDesc, Transport, TxPkt};
pub use udp::UdpTransport;
