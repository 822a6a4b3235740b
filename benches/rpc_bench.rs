//! Loopback echo benchmarks.
//!
//! Measures full round trips through two co-polled instances over UDP
//! loopback: socket, wire protocol, credit machinery, and dispatch. Not a
//! NIC-rate benchmark; it tracks regressions in per-RPC engine overhead.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use urpc::{Completion, Nexus, ReqFunc, Rpc, RpcConfig, UdpTransport};

const ECHO_REQ: u8 = 1;

type Ctx = Rc<Cell<u64>>;

struct Pair {
    server: Rpc<Ctx, UdpTransport>,
    client: Rpc<Ctx, UdpTransport>,
    completions: Ctx,
    session: u16,
}

fn make_pair() -> Pair {
    let nexus = Arc::new(Nexus::new("127.0.0.1:0", 0, 0).unwrap());
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
                req.set_dyn_resp(buf);
            }
        }),
    );

    let completions: Ctx = Rc::new(Cell::new(0));
    let cfg = RpcConfig::default().with_max_msg_size(256 * 1024);
    let server = Rpc::new(
        nexus.clone(),
        completions.clone(),
        0,
        Box::new(|_: &mut Ctx, _, _| {}),
        UdpTransport::new("127.0.0.1:0").unwrap(),
        cfg.clone(),
    )
    .unwrap();

    let connected = Rc::new(Cell::new(false));
    let connected_flag = connected.clone();
    let client = Rpc::new(
        nexus.clone(),
        completions.clone(),
        1,
        Box::new(move |_: &mut Ctx, _, ev| {
            if ev == urpc::SmEvent::Connected {
                connected_flag.set(true);
            }
        }),
        UdpTransport::new("127.0.0.1:0").unwrap(),
        cfg,
    )
    .unwrap();

    let session = client
        .create_session(&nexus.sm_addr().to_string(), 0)
        .unwrap();
    while !connected.get() {
        client.run_event_loop_once();
        server.run_event_loop_once();
    }

    Pair {
        server,
        client,
        completions,
        session,
    }
}

fn echo_round_trip(pair: &Pair, session: u16, size: usize) {
    let req = pair.client.alloc_msg_buffer(size).unwrap();
    let resp = pair.client.alloc_msg_buffer(size).unwrap();
    let before = pair.completions.get();

    pair.client
        .enqueue_request(
            session,
            ECHO_REQ,
            &req,
            &resp,
            Box::new(|ctx: &mut Ctx, _comp: Completion| {
                ctx.set(ctx.get() + 1);
            }),
            0,
        )
        .unwrap();

    while pair.completions.get() == before {
        pair.client.run_event_loop_once();
        pair.server.run_event_loop_once();
    }

    pair.client.free_msg_buffer(req);
    pair.client.free_msg_buffer(resp);
}

fn bench_echo(c: &mut Criterion) {
    let pair = make_pair();
    let session = pair.session;

    let mut group = c.benchmark_group("loopback_echo");
    for size in [64usize, 1024, 16 * 1024, 128 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| echo_round_trip(&pair, session, size));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_echo);
criterion_main!(benches);
