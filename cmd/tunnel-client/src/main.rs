//! Tunnel client
//!
//! Connects to a tunnel-server, opens N streams over the one connection,
//! sends a message on each and waits for every echo. Once all streams have
//! closed it sends GoAway(Normal) and reports.
//!
//! Usage:
//!     cargo build --release -p tunnel-client
//!     ./target/release/tunnel-client [host:port] [streams] [message_bytes]
//!
//! Defaults: 127.0.0.1:7000, 16 streams, 4096 bytes.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use muxline_core::logging;
use muxline_reactor::{Reactor, ReactorConfig};
use muxline_tunnel::{
    GoAwayCode, MuxConfig, Multiplexer, Role, StreamCtx, StreamHandler, StreamId, TunnelConnection,
    TunnelEvents,
};

const DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct Report {
    opened: usize,
    matched: usize,
    mismatched: usize,
    closed: usize,
    tunnel_down: bool,
    connect_failed: bool,
}

type Shared = Rc<RefCell<Report>>;

struct Checker {
    expect: Rc<Vec<u8>>,
    got: Vec<u8>,
    report: Shared,
}

impl StreamHandler for Checker {
    fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]) {
        self.got.extend_from_slice(data);
        if let Err(e) = cx.try_send_window_update(id, data.len()) {
            tracing::debug!(stream_id = id, error = %e, "window update not sent");
        }
    }

    fn on_close(&mut self, cx: &mut StreamCtx<'_>, id: StreamId) {
        let all_done = {
            let mut r = self.report.borrow_mut();
            if self.got == *self.expect {
                r.matched += 1;
            } else {
                tracing::warn!(stream_id = id, expected = self.expect.len(), got = self.got.len(), "echo mismatch");
                r.mismatched += 1;
            }
            r.closed += 1;
            r.closed == r.opened
        };
        if all_done {
            cx.shutdown(GoAwayCode::Normal);
        }
    }
}

struct Client {
    streams: usize,
    message: Rc<Vec<u8>>,
    report: Shared,
}

impl TunnelEvents for Client {
    fn on_ready(&mut self, cx: &mut StreamCtx<'_>) {
        tracing::info!(streams = self.streams, bytes = self.message.len(), "tunnel up, opening streams");
        let _ = cx.ping(0x7E57);
        for _ in 0..self.streams {
            let checker = Checker {
                expect: Rc::clone(&self.message),
                got: Vec::with_capacity(self.message.len()),
                report: Rc::clone(&self.report),
            };
            let id = match cx.open_stream(Box::new(checker)) {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(error = %e, "open failed");
                    break;
                }
            };
            self.report.borrow_mut().opened += 1;
            if let Err(e) = cx.send(id, &self.message) {
                tracing::error!(stream_id = id, error = %e, "send failed");
            }
            // Half-close: the server closes its side after echoing.
            let _ = cx.close_stream(id, false);
        }
    }

    fn on_connect_failed(&mut self) {
        self.report.borrow_mut().connect_failed = true;
    }

    fn on_closed(&mut self, mux: &Multiplexer) {
        tracing::info!(last_pong = ?mux.last_pong(), "tunnel down");
        self.report.borrow_mut().tunnel_down = true;
    }
}

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let target = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:7000");
    let streams: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(16);
    let size: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(4096);

    let Some((host, port)) = target.rsplit_once(':').and_then(|(h, p)| Some((h, p.parse::<u16>().ok()?))) else {
        eprintln!("tunnel-client: expected host:port, got {:?}", target);
        std::process::exit(2);
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let mut reactor = match Reactor::new(ReactorConfig::from_env(), 0) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("tunnel-client: {}", e);
            std::process::exit(1);
        }
    };

    let report = Shared::default();
    let message: Vec<u8> = (0..size).map(|i| b'a' + (i % 26) as u8).collect();
    let events = Client {
        streams,
        message: Rc::new(message),
        report: Rc::clone(&report),
    };
    let tunnel = TunnelConnection::new(
        Role::Client,
        MuxConfig::from_env(),
        reactor.pool().clone(),
        Box::new(events),
    );
    let start = Instant::now();
    reactor.connect(host, port, Box::new(tunnel));

    while !report.borrow().tunnel_down && start.elapsed() < DEADLINE {
        if let Err(e) = reactor.poll_once(Duration::from_millis(100)) {
            eprintln!("tunnel-client: {}", e);
            break;
        }
    }
    reactor.shutdown();

    let r = report.borrow();
    let elapsed = start.elapsed();
    println!(
        "streams={} matched={} mismatched={} closed={} elapsed={:.1}ms",
        r.opened,
        r.matched,
        r.mismatched,
        r.closed,
        elapsed.as_secs_f64() * 1000.0
    );
    if r.connect_failed {
        eprintln!("tunnel-client: connect to {} failed", target);
        std::process::exit(1);
    }
    if r.matched != streams {
        std::process::exit(1);
    }
}
