//! Tunnel echo server
//!
//! Accepts tunnel connections on every shard and echoes each stream back to
//! its opener. A stream is closed as soon as the client half-closes it.
//!
//! Usage:
//!     cargo build --release -p tunnel-server
//!     ./target/release/tunnel-server [addr] [shards]
//!
//! Defaults: 127.0.0.1:7000, one shard per CPU.
//! Reactor and multiplexer settings come from MUXLINE_* / MUXLINE_MUX_*.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use muxline_core::logging;
use muxline_reactor::{AcceptContext, Connection, ConnectionFactory, ReactorConfig, Server};
use muxline_tunnel::{
    MuxConfig, Multiplexer, Role, StreamCtx, StreamHandler, StreamId, TunnelConnection, TunnelEvents,
};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

struct Echo;

impl StreamHandler for Echo {
    fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]) {
        if let Err(e) = cx.send(id, data) {
            tracing::debug!(stream_id = id, error = %e, "echo failed");
            return;
        }
        if let Err(e) = cx.try_send_window_update(id, data.len()) {
            tracing::debug!(stream_id = id, error = %e, "window update not sent");
        }
    }

    fn on_remote_close(&mut self, cx: &mut StreamCtx<'_>, id: StreamId) {
        let _ = cx.close_stream(id, false);
    }
}

/// Per-tunnel log lines.
struct Peer {
    addr: Option<SocketAddr>,
    shard: usize,
}

impl TunnelEvents for Peer {
    fn on_ready(&mut self, _cx: &mut StreamCtx<'_>) {
        tracing::info!(peer = ?self.addr, shard = self.shard, "tunnel up");
    }

    fn on_closed(&mut self, mux: &Multiplexer) {
        tracing::info!(peer = ?self.addr, going_away = mux.is_going_away(), "tunnel down");
    }
}

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let addr: SocketAddr = match args.get(1).map(|s| s.parse()) {
        Some(Ok(a)) => a,
        Some(Err(e)) => {
            eprintln!("tunnel-server: bad address {:?}: {}", args[1], e);
            std::process::exit(2);
        }
        None => SocketAddr::from(([127, 0, 0, 1], 7000)),
    };
    let shards: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    let mux_config = MuxConfig::from_env();
    if let Err(e) = mux_config.validate() {
        eprintln!("tunnel-server: {}", e);
        std::process::exit(2);
    }

    let factory: ConnectionFactory = Arc::new(move |ctx: &AcceptContext| {
        let mut mux = Multiplexer::with_pool(Role::Server, mux_config.clone(), ctx.pool.clone());
        mux.set_acceptor(|_cx: &mut StreamCtx<'_>, id: StreamId| {
            tracing::debug!(stream_id = id, "stream accepted");
            Some(Box::new(Echo) as Box<dyn StreamHandler>)
        });
        Some(Box::new(TunnelConnection::from_mux(
            mux,
            Box::new(Peer {
                addr: ctx.peer,
                shard: ctx.shard,
            }),
        )) as Box<dyn Connection>)
    });

    let mut server = match Server::start(ReactorConfig::from_env(), shards, &[addr], factory) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("tunnel-server: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(addrs = ?server.local_addrs(), shards = server.shards(), "listening");

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutting down");
    server.stop();
}
