//! Logical streams
//!
//! A [`Stream`] is one flow-controlled byte stream inside a tunnel. Its
//! record lives in the multiplexer's table; the application reaches it
//! through a [`StreamHandler`] attached at open or accept time.

use muxline_core::PooledSendQueue;

use crate::mux::StreamCtx;

pub type StreamId = u32;

/// Per-stream application callbacks.
///
/// Handlers run on the tunnel's thread and get a [`StreamCtx`] that can send,
/// close and open streams. `data` borrows the read buffer (or the fragment
/// buffer) and is only valid for the duration of the call.
pub trait StreamHandler {
    fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]);

    /// The peer sent FIN; our side may still send.
    fn on_remote_close(&mut self, _cx: &mut StreamCtx<'_>, _id: StreamId) {}

    /// The stream left the table. Called exactly once.
    fn on_close(&mut self, _cx: &mut StreamCtx<'_>, _id: StreamId) {}
}

impl<F> StreamHandler for F
where
    F: FnMut(&mut StreamCtx<'_>, StreamId, &[u8]),
{
    fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]) {
        self(cx, id, data)
    }
}

/// Decides on remote-opened streams. Returning `None` resets the stream.
pub trait StreamAcceptor {
    fn accept(&mut self, cx: &mut StreamCtx<'_>, id: StreamId) -> Option<Box<dyn StreamHandler>>;
}

impl<F> StreamAcceptor for F
where
    F: FnMut(&mut StreamCtx<'_>, StreamId) -> Option<Box<dyn StreamHandler>>,
{
    fn accept(&mut self, cx: &mut StreamCtx<'_>, id: StreamId) -> Option<Box<dyn StreamHandler>> {
        self(cx, id)
    }
}

/// Stream record.
///
/// `send_window` only shrinks by data sent and grows by window updates
/// received. `recv_window` only shrinks by data received and grows when the
/// application acknowledges consumption.
pub struct Stream {
    pub(crate) id: StreamId,
    pub(crate) send_window: u32,
    pub(crate) recv_window: u32,
    pub(crate) unacked_recv: u32,
    pub(crate) local_closed: bool,
    pub(crate) remote_closed: bool,
    /// Graceful close requested while data was pending
    pub(crate) fin_deferred: bool,
    /// Peer answered our SYN (or we answered theirs)
    pub(crate) established: bool,
    pub(crate) pending_out: PooledSendQueue,
    pub(crate) handler: Option<Box<dyn StreamHandler>>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, window: u32, handler: Option<Box<dyn StreamHandler>>) -> Self {
        Self {
            id,
            send_window: window,
            recv_window: window,
            unacked_recv: 0,
            local_closed: false,
            remote_closed: false,
            fin_deferred: false,
            established: false,
            pending_out: PooledSendQueue::new(),
            handler,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Bytes we may still send before the peer's next window update.
    #[inline]
    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    #[inline]
    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    /// Acknowledged bytes not yet advertised to the peer.
    #[inline]
    pub fn unacked_recv(&self) -> u32 {
        self.unacked_recv
    }

    #[inline]
    pub fn is_local_closed(&self) -> bool {
        self.local_closed
    }

    #[inline]
    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Bytes waiting for send window.
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.pending_out.size()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("send_window", &self.send_window)
            .field("recv_window", &self.recv_window)
            .field("unacked_recv", &self.unacked_recv)
            .field("local_closed", &self.local_closed)
            .field("remote_closed", &self.remote_closed)
            .field("pending", &self.pending_out.size())
            .finish()
    }
}
