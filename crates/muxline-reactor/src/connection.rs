//! Connection capability trait
//!
//! One method per lifecycle event. `on_data` is the hot path and is called
//! once per successful read with the bytes of that read; it must consume or
//! buffer them before returning because the read buffer is reused.
//!
//! Every callback gets a [`SocketCtx`] that can send, close and reach the
//! owning [`Reactor`].

use std::any::Any;
use std::net::SocketAddr;
use std::time::Instant;

use muxline_core::BufferPool;

use crate::reactor::Reactor;
use crate::socket::{Socket, Status};
use crate::table::SocketHandle;

/// Lets `Reactor::with_connection` recover the concrete type behind a
/// `Box<dyn Connection>`.
pub trait AsAny: Any {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub trait Connection: AsAny {
    /// Bytes from one read.
    fn on_data(&mut self, cx: &mut SocketCtx<'_>, data: &[u8]);

    /// Registered after accept (or adopt), already Connected.
    fn on_accepted(&mut self, _cx: &mut SocketCtx<'_>) {}

    /// Outbound connect is in progress.
    fn on_connecting(&mut self, _cx: &mut SocketCtx<'_>) {}

    fn on_connected(&mut self, _cx: &mut SocketCtx<'_>) {}

    /// Resolution or connect failed; `on_close` follows.
    fn on_connect_failed(&mut self, _cx: &mut SocketCtx<'_>) {}

    /// Reads were paused because the send queue passed the ceiling.
    fn on_pause(&mut self, _cx: &mut SocketCtx<'_>) {}

    /// The send queue drained to the low watermark and reads resumed.
    fn on_resume(&mut self, _cx: &mut SocketCtx<'_>) {}

    /// The socket reached Closed. Called exactly once.
    fn on_close(&mut self, _cx: &mut SocketCtx<'_>) {}
}

/// Where an accepted connection came from, handed to the accept factory.
#[derive(Debug, Clone)]
pub struct AcceptContext {
    pub peer: Option<SocketAddr>,
    pub local: SocketAddr,
    pub shard: usize,
    /// The accepting shard's pool, for connections that keep their own
    /// buffers on top of the socket's.
    pub pool: BufferPool,
}

/// Access to one socket (and its reactor) from inside a callback.
pub struct SocketCtx<'a> {
    pub(crate) socket: &'a mut Socket,
    pub(crate) reactor: &'a mut Reactor,
}

impl<'a> SocketCtx<'a> {
    /// Send immediately where possible, queue the rest. `false` once the
    /// socket is closed, after a local close, or if the connection had to be
    /// aborted.
    #[inline]
    pub fn send(&mut self, data: &[u8]) -> bool {
        self.socket.send_parts(self.reactor, &[data])
    }

    /// Send several slices as one contiguous write.
    #[inline]
    pub fn send_vectored(&mut self, parts: &[&[u8]]) -> bool {
        self.socket.send_parts(self.reactor, parts)
    }

    /// Graceful close: queued bytes drain first.
    pub fn close(&mut self) {
        self.socket.close(self.reactor, false);
    }

    /// Drop queued bytes and close now.
    pub fn abort(&mut self) {
        self.socket.close(self.reactor, true);
    }

    /// Stop reading until [`resume_reading`](Self::resume_reading).
    pub fn pause_reading(&mut self) {
        self.socket.set_app_paused(self.reactor, true);
    }

    pub fn resume_reading(&mut self) {
        self.socket.set_app_paused(self.reactor, false);
    }

    /// `None` before an outbound socket is registered.
    #[inline]
    pub fn handle(&self) -> Option<SocketHandle> {
        self.socket.handle()
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.socket.status()
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.socket.queued_bytes()
    }

    #[inline]
    pub fn is_read_paused(&self) -> bool {
        self.socket.is_read_paused()
    }

    #[inline]
    pub fn pool(&self) -> &BufferPool {
        self.reactor.pool()
    }

    /// Loop time of the current iteration.
    #[inline]
    pub fn now(&self) -> Instant {
        self.reactor.now()
    }

    #[inline]
    pub fn reactor(&mut self) -> &mut Reactor {
        self.reactor
    }
}
