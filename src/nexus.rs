//! Process-wide nexus: request-handler registry and session-management
//! demultiplexer.
//!
//! One nexus serves every RPC instance in the process. It owns the UDP
//! management socket and a listener thread that shuttles SM datagrams into
//! per-instance SPSC queues, the `{req_type -> handler}` registry (frozen
//! once the first RPC instance is created), and an optional pool of
//! background worker threads for handlers that must not run on the
//! datapath thread.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use fnv::FnvHashMap;
use log::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::huge_alloc::MsgAlloc;
use crate::rpc::ReqHandle;
use crate::sm::{RejectReason, SmPkt, SmPktKind};
use crate::udp::resolve_uri;

/// Depth of each per-instance session-management queue. SM traffic is
/// rare; overflow means the owning event loop has stalled and is fatal.
const SM_QUEUE_DEPTH: usize = 64;

/// A session-management datagram routed to an RPC instance.
#[derive(Debug, Clone, Copy)]
pub struct SmWorkItem {
    pub pkt: SmPkt,
    pub from: SocketAddr,
}

/// A request handler registered with the nexus.
///
/// Foreground-terminal handlers run inline on the owning instance's event
/// loop with the instance's context and an allocator for responses larger
/// than the preallocated buffer, and must complete the response before
/// returning. Background handlers run on nexus worker threads, see only
/// the request handle, and respond through the preallocated buffer.
pub enum ReqFunc<C> {
    Foreground(Box<dyn Fn(&mut ReqHandle, &mut C, &mut dyn MsgAlloc) + Send + Sync>),
    Background(Arc<dyn Fn(&mut ReqHandle) + Send + Sync>),
}

impl<C> ReqFunc<C> {
    pub fn foreground<F>(f: F) -> Self
    where
        F: Fn(&mut ReqHandle, &mut C, &mut dyn MsgAlloc) + Send + Sync + 'static,
    {
        ReqFunc::Foreground(Box::new(f))
    }

    pub fn background<F>(f: F) -> Self
    where
        F: Fn(&mut ReqHandle) + Send + Sync + 'static,
    {
        ReqFunc::Background(Arc::new(f))
    }
}

/// Work shipped to a background worker: run the handler over the handle,
/// then marshal the handle back to the owning instance's queue.
pub(crate) struct BgWork {
    pub handler: Arc<dyn Fn(&mut ReqHandle) + Send + Sync>,
    pub handle: ReqHandle,
    pub done: Sender<ReqHandle>,
}

/// State shared with the SM listener thread; deliberately free of the
/// context type so the thread closure stays simple.
struct SmShared {
    socket: Arc<UdpSocket>,
    mgmt_port: u16,
    hooks: Mutex<FnvHashMap<u8, Sender<SmWorkItem>>>,
    shutdown: AtomicBool,
}

struct Registry<C> {
    funcs: Vec<Option<Arc<ReqFunc<C>>>>,
    frozen: bool,
}

struct BgPool {
    injector: Option<Sender<BgWork>>,
    workers: Vec<JoinHandle<()>>,
}

/// Process-wide registry and session-management demultiplexer.
pub struct Nexus<C> {
    sm_addr: SocketAddr,
    #[allow(dead_code)]
    numa_node: usize,
    shared: Arc<SmShared>,
    registry: Mutex<Registry<C>>,
    sm_thread: Option<JoinHandle<()>>,
    bg: Option<BgPool>,
}

impl<C: 'static> Nexus<C> {
    /// Bind the management socket at `local_uri` (`host:udp_port`), start
    /// the SM listener, and spawn `num_bg_threads` background workers.
    pub fn new(local_uri: &str, numa_node: usize, num_bg_threads: usize) -> Result<Self> {
        let bind_addr = resolve_uri(local_uri)?;
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(20)))?;
        let sm_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let shared = Arc::new(SmShared {
            socket: socket.clone(),
            mgmt_port: sm_addr.port(),
            hooks: Mutex::new(FnvHashMap::default()),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let sm_thread = std::thread::Builder::new()
            .name("urpc-sm".into())
            .spawn(move || sm_thread_loop(thread_shared))
            .map_err(Error::Transport)?;

        let bg = if num_bg_threads > 0 {
            let (tx, rx) = unbounded::<BgWork>();
            let workers = (0..num_bg_threads)
                .map(|i| {
                    let rx = rx.clone();
                    std::thread::Builder::new()
                        .name(format!("urpc-bg-{}", i))
                        .spawn(move || bg_worker_loop(rx))
                        .map_err(Error::Transport)
                })
                .collect::<Result<Vec<_>>>()?;
            Some(BgPool {
                injector: Some(tx),
                workers,
            })
        } else {
            None
        };

        debug!("nexus listening on {} (numa {})", sm_addr, numa_node);
        Ok(Self {
            sm_addr,
            numa_node,
            shared,
            registry: Mutex::new(Registry {
                funcs: (0..=u8::MAX as usize).map(|_| None).collect(),
                frozen: false,
            }),
            sm_thread: Some(sm_thread),
            bg,
        })
    }

    /// Register a request handler. Must happen before any RPC instance is
    /// created; duplicate or late registration is a programming bug and
    /// panics.
    pub fn register_req_func(&self, req_type: u8, func: ReqFunc<C>) {
        if matches!(func, ReqFunc::Background(_)) && self.bg.is_none() {
            panic!("background handler registered but the nexus has no background threads");
        }
        let mut reg = self.registry.lock().unwrap();
        if reg.frozen {
            panic!("handler registration after an RPC instance was created");
        }
        if reg.funcs[req_type as usize].is_some() {
            panic!("duplicate handler registration for request type {}", req_type);
        }
        reg.funcs[req_type as usize] = Some(Arc::new(func));
    }

    /// Freeze the registry and hand the caller an immutable snapshot.
    pub(crate) fn freeze_and_snapshot(&self) -> Vec<Option<Arc<ReqFunc<C>>>> {
        let mut reg = self.registry.lock().unwrap();
        reg.frozen = true;
        reg.funcs.clone()
    }
}

impl<C> Nexus<C> {
    /// The bound management address.
    #[inline]
    pub fn sm_addr(&self) -> SocketAddr {
        self.sm_addr
    }

    /// Attach an RPC instance's SM queue.
    pub(crate) fn register_hook(&self, rpc_id: u8) -> Result<Receiver<SmWorkItem>> {
        let mut hooks = self.shared.hooks.lock().unwrap();
        if hooks.contains_key(&rpc_id) {
            return Err(Error::InvalidArgument(format!(
                "RPC id {} already registered with this nexus",
                rpc_id
            )));
        }
        let (tx, rx) = bounded(SM_QUEUE_DEPTH);
        hooks.insert(rpc_id, tx);
        Ok(rx)
    }

    pub(crate) fn unregister_hook(&self, rpc_id: u8) {
        self.shared.hooks.lock().unwrap().remove(&rpc_id);
    }

    /// Send a session-management packet from the management socket.
    pub(crate) fn send_sm(&self, pkt: &SmPkt, to: SocketAddr) -> Result<()> {
        trace!("sm tx {:?} -> {}", pkt.kind, to);
        self.shared.socket.send_to(&pkt.encode(), to)?;
        Ok(())
    }

    pub(crate) fn bg_injector(&self) -> Option<&Sender<BgWork>> {
        self.bg.as_ref().and_then(|p| p.injector.as_ref())
    }

    #[inline]
    pub(crate) fn mgmt_port(&self) -> u16 {
        self.shared.mgmt_port
    }
}

impl<C> Drop for Nexus<C> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(t) = self.sm_thread.take() {
            let _ = t.join();
        }
        if let Some(mut pool) = self.bg.take() {
            // Closing the channel ends the worker loops.
            pool.injector.take();
            for w in pool.workers.drain(..) {
                let _ = w.join();
            }
        }
    }
}

fn sm_thread_loop(shared: Arc<SmShared>) {
    let mut buf = [0u8; 256];
    while !shared.shutdown.load(Ordering::Acquire) {
        let (len, from) = match shared.socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
            Err(e) => {
                error!("nexus management socket failed: {}", e);
                break;
            }
        };

        let pkt = match SmPkt::decode(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed SM packet from {}: {}", from, e);
                continue;
            }
        };

        let target = pkt.target_rpc_id();
        let hooks = shared.hooks.lock().unwrap();
        match hooks.get(&target) {
            Some(tx) => {
                if tx.try_send(SmWorkItem { pkt, from }).is_err() {
                    // A full SM queue means the owning thread stopped
                    // running its event loop.
                    panic!("SM queue overflow for RPC id {}", target);
                }
            }
            None => {
                if pkt.kind == SmPktKind::ConnectReq {
                    trace!("connect for unknown RPC id {}, rejecting", target);
                    let reply = pkt.reject_reply(RejectReason::InvalidRemoteRpcId, shared.mgmt_port);
                    let _ = shared.socket.send_to(&reply.encode(), from);
                } else {
                    trace!("SM packet for unknown RPC id {}, dropping", target);
                }
            }
        }
    }
}

fn bg_worker_loop(rx: Receiver<BgWork>) {
    while let Ok(work) = rx.recv() {
        let mut handle = work.handle;
        (work.handler)(&mut handle);
        // The owning instance may already be gone; that path frees the
        // handle's buffers.
        let _ = work.done.send(handle);
    }
}
