//! Reactor binding
//!
//! [`TunnelConnection`] is a reactor [`Connection`] that runs a
//! [`Multiplexer`] over its socket: reads feed the frame parser, frames go
//! out through the socket's send path (and therefore its backpressure).

use muxline_core::BufferPool;
use muxline_reactor::{Connection, SocketCtx};

use crate::config::MuxConfig;
use crate::mux::{Multiplexer, Role, StreamCtx, Transport};

/// Tunnel lifecycle hooks.
pub trait TunnelEvents {
    /// The transport is connected (outbound) or accepted (inbound); streams
    /// may be opened from here.
    fn on_ready(&mut self, _cx: &mut StreamCtx<'_>) {}

    /// Outbound connect failed; `on_closed` follows.
    fn on_connect_failed(&mut self) {}

    /// The transport closed. Every stream has already seen `on_close`.
    fn on_closed(&mut self, _mux: &Multiplexer) {}
}

impl TunnelEvents for () {}

/// Frames written to a reactor socket.
struct SocketTransport<'a, 'b> {
    cx: &'a mut SocketCtx<'b>,
}

impl Transport for SocketTransport<'_, '_> {
    #[inline]
    fn write_parts(&mut self, parts: &[&[u8]]) -> bool {
        self.cx.send_vectored(parts)
    }

    fn close(&mut self, force: bool) {
        if force {
            self.cx.abort();
        } else {
            self.cx.close();
        }
    }
}

pub struct TunnelConnection {
    mux: Multiplexer,
    events: Box<dyn TunnelEvents>,
}

impl TunnelConnection {
    /// Tunnel whose multiplexer draws from `pool`, normally the pool of
    /// the shard that owns the socket.
    pub fn new(role: Role, config: MuxConfig, pool: BufferPool, events: Box<dyn TunnelEvents>) -> Self {
        Self::from_mux(Multiplexer::with_pool(role, config, pool), events)
    }

    /// Wrap a configured multiplexer (e.g. one with an acceptor installed).
    pub fn from_mux(mux: Multiplexer, events: Box<dyn TunnelEvents>) -> Self {
        Self { mux, events }
    }

    #[inline]
    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    #[inline]
    pub fn mux_mut(&mut self) -> &mut Multiplexer {
        &mut self.mux
    }

    /// Work with the streams from outside a callback, typically through
    /// `Reactor::with_connection::<TunnelConnection, _>`.
    pub fn with_streams<R>(&mut self, cx: &mut SocketCtx<'_>, f: impl FnOnce(&mut StreamCtx<'_>) -> R) -> R {
        let mut io = SocketTransport { cx };
        f(&mut StreamCtx::new(&mut self.mux, &mut io))
    }

    fn ready(&mut self, cx: &mut SocketCtx<'_>) {
        tracing::debug!(role = ?self.mux.role(), peer = ?cx.peer_addr(), "tunnel ready");
        let mut io = SocketTransport { cx };
        self.events.on_ready(&mut StreamCtx::new(&mut self.mux, &mut io));
    }
}

impl Connection for TunnelConnection {
    #[inline]
    fn on_data(&mut self, cx: &mut SocketCtx<'_>, data: &[u8]) {
        let mut io = SocketTransport { cx };
        self.mux.on_receive_data(&mut io, data);
    }

    fn on_accepted(&mut self, cx: &mut SocketCtx<'_>) {
        self.ready(cx);
    }

    fn on_connected(&mut self, cx: &mut SocketCtx<'_>) {
        self.ready(cx);
    }

    fn on_connect_failed(&mut self, _cx: &mut SocketCtx<'_>) {
        self.events.on_connect_failed();
    }

    fn on_close(&mut self, cx: &mut SocketCtx<'_>) {
        tracing::debug!(streams = self.mux.stream_count(), "tunnel closed");
        let mut io = SocketTransport { cx };
        self.mux.abort_all(&mut io);
        self.events.on_closed(&self.mux);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::GoAwayCode;
    use crate::stream::{StreamHandler, StreamId};
    use muxline_reactor::{sys, Reactor, ReactorConfig};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    struct Echo;

    impl StreamHandler for Echo {
        fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]) {
            let _ = cx.send(id, data);
            let _ = cx.try_send_window_update(id, data.len());
        }

        fn on_remote_close(&mut self, cx: &mut StreamCtx<'_>, id: StreamId) {
            let _ = cx.close_stream(id, false);
        }
    }

    #[derive(Default)]
    struct Seen {
        echoed: Vec<u8>,
        stream_closed: bool,
        tunnel_closed: bool,
    }

    struct Collect(Rc<RefCell<Seen>>);

    impl StreamHandler for Collect {
        fn on_data(&mut self, _cx: &mut StreamCtx<'_>, _id: StreamId, data: &[u8]) {
            self.0.borrow_mut().echoed.extend_from_slice(data);
        }

        fn on_close(&mut self, _cx: &mut StreamCtx<'_>, _id: StreamId) {
            self.0.borrow_mut().stream_closed = true;
        }
    }

    struct Client(Rc<RefCell<Seen>>);

    impl TunnelEvents for Client {
        fn on_ready(&mut self, cx: &mut StreamCtx<'_>) {
            let id = cx.open_stream(Box::new(Collect(Rc::clone(&self.0)))).unwrap();
            cx.send(id, b"hello over the tunnel").unwrap();
            cx.close_stream(id, false).unwrap();
        }

        fn on_closed(&mut self, _mux: &Multiplexer) {
            self.0.borrow_mut().tunnel_closed = true;
        }
    }

    #[test]
    fn test_echo_over_socket_pair() {
        let cfg = ReactorConfig::new().max_fds(4096).pool_size(4 * 1024 * 1024);
        let mut reactor = Reactor::new(cfg, 0).unwrap();
        let (a, b) = sys::stream_pair().unwrap();

        let mut server = Multiplexer::new(Role::Server, MuxConfig::default());
        server.set_acceptor(|_cx: &mut StreamCtx<'_>, _id: StreamId| Some(Box::new(Echo) as Box<dyn StreamHandler>));
        reactor
            .adopt(a, None, Box::new(TunnelConnection::from_mux(server, Box::new(()))))
            .unwrap();

        let seen = Rc::new(RefCell::new(Seen::default()));
        let client = TunnelConnection::new(
            Role::Client,
            MuxConfig::default(),
            reactor.pool().clone(),
            Box::new(Client(Rc::clone(&seen))),
        );
        let handle = reactor.adopt(b, None, Box::new(client)).unwrap();

        for _ in 0..50 {
            if seen.borrow().stream_closed {
                break;
            }
            reactor.poll_once(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(seen.borrow().echoed, b"hello over the tunnel");
        assert!(seen.borrow().stream_closed);

        let streams = reactor
            .with_connection::<TunnelConnection, _>(handle, |t, cx| {
                t.with_streams(cx, |s| s.shutdown(GoAwayCode::Normal));
                t.mux().stream_count()
            })
            .unwrap();
        assert_eq!(streams, 0);

        for _ in 0..50 {
            if reactor.connection_count() == 0 {
                break;
            }
            reactor.poll_once(Duration::from_millis(10)).unwrap();
        }
        assert!(seen.borrow().tunnel_closed);
        assert_eq!(reactor.connection_count(), 0);
    }

    struct Flood(Rc<RefCell<Option<StreamId>>>);

    impl TunnelEvents for Flood {
        fn on_ready(&mut self, cx: &mut StreamCtx<'_>) {
            let id = cx
                .open_stream(Box::new(|_cx: &mut StreamCtx<'_>, _id: StreamId, _data: &[u8]| {}))
                .unwrap();
            cx.send(id, &[9u8; 5000]).unwrap();
            *self.0.borrow_mut() = Some(id);
        }
    }

    #[test]
    fn test_pending_stream_data_lives_in_shard_pool() {
        let cfg = ReactorConfig::new().max_fds(4096).pool_size(4 * 1024 * 1024);
        let mut reactor = Reactor::new(cfg, 0).unwrap();
        let shard_pool = reactor.pool().clone();
        let (a, b) = sys::stream_pair().unwrap();
        let mux_cfg = MuxConfig::default().initial_window(1024).window_update_threshold(256);

        // The peer reads but never acknowledges, so the client runs out of window.
        let mut server = Multiplexer::new(Role::Server, mux_cfg.clone());
        server.set_acceptor(|_cx: &mut StreamCtx<'_>, _id: StreamId| {
            Some(Box::new(|_cx: &mut StreamCtx<'_>, _id: StreamId, _data: &[u8]| {}) as Box<dyn StreamHandler>)
        });
        reactor
            .adopt(a, None, Box::new(TunnelConnection::from_mux(server, Box::new(()))))
            .unwrap();

        let opened = Rc::new(RefCell::new(None));
        let client = TunnelConnection::new(
            Role::Client,
            mux_cfg,
            shard_pool.clone(),
            Box::new(Flood(Rc::clone(&opened))),
        );
        let handle = reactor.adopt(b, None, Box::new(client)).unwrap();
        for _ in 0..5 {
            reactor.poll_once(Duration::from_millis(10)).unwrap();
        }
        let id = opened.borrow().expect("stream opened on ready");

        let (shared, pending) = reactor
            .with_connection::<TunnelConnection, _>(handle, |t, _cx| {
                (t.mux().pool().ptr_eq(&shard_pool), t.mux().stream(id).map(|s| s.pending_bytes()))
            })
            .unwrap();
        assert!(shared);
        assert_eq!(pending, Some(5000 - 1024));
        assert!(shard_pool.in_use() >= 5000 - 1024);
    }
}
