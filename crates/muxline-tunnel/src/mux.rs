//! Stream multiplexer
//!
//! Transport-agnostic protocol engine: it consumes bytes handed to
//! [`Multiplexer::on_receive_data`] and emits frames through a
//! [`Transport`]. The reactor binding lives in [`crate::tunnel`]; tests drive
//! it over in-memory pipes.
//!
//! ## Reassembly
//!
//! Each read is processed in three phases:
//!
//! 1. A frame left incomplete by the previous read is topped up in the
//!    fragment buffer (header first, then payload) and dispatched once whole.
//! 2. Frames fully contained in the new bytes are dispatched in place; the
//!    payload handed to handlers points into the caller's buffer.
//! 3. A trailing partial frame is copied into the fragment buffer.
//!
//! Only bytes that straddle a read boundary are ever copied.

use std::collections::HashMap;

use muxline_core::{BufferPool, PoolBuf};
use thiserror::Error;

use crate::config::MuxConfig;
use crate::frame::{Flags, FrameType, GoAwayCode, Header, HEADER_SIZE};
use crate::stream::{Stream, StreamAcceptor, StreamHandler, StreamId};

/// Where frames go.
pub trait Transport {
    /// Write the concatenation of `parts` as one unit. `false` when the
    /// transport no longer accepts data.
    fn write_parts(&mut self, parts: &[&[u8]]) -> bool;

    /// Close after queued data drains, or immediately when `force`.
    fn close(&mut self, force: bool);
}

/// Which half of the stream id space we allocate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Odd ids, starting at 1
    Client,
    /// Even ids, starting at 2
    Server,
}

impl Role {
    fn first_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to the peer's half.
    fn is_remote(self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 0,
            Role::Server => id % 2 == 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MuxError {
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} is closed for sending")]
    StreamClosed(StreamId),

    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    #[error("tunnel is going away")]
    GoingAway,

    #[error("transport closed")]
    TransportClosed,

    #[error("buffer pool exhausted on stream {0}")]
    PoolExhausted(StreamId),
}

/// The multiplexer and its transport, handed to stream callbacks.
pub struct StreamCtx<'a> {
    pub(crate) mux: &'a mut Multiplexer,
    pub(crate) io: &'a mut dyn Transport,
}

impl<'a> StreamCtx<'a> {
    pub fn new(mux: &'a mut Multiplexer, io: &'a mut dyn Transport) -> Self {
        Self { mux, io }
    }

    pub fn send(&mut self, id: StreamId, data: &[u8]) -> Result<(), MuxError> {
        self.mux.send(self.io, id, data)
    }

    pub fn close_stream(&mut self, id: StreamId, rst: bool) -> Result<(), MuxError> {
        self.mux.close_stream(self.io, id, rst)
    }

    pub fn open_stream(&mut self, handler: Box<dyn StreamHandler>) -> Result<StreamId, MuxError> {
        self.mux.open_stream(self.io, handler)
    }

    pub fn try_send_window_update(&mut self, id: StreamId, consumed: usize) -> Result<bool, MuxError> {
        self.mux.try_send_window_update(self.io, id, consumed)
    }

    pub fn ping(&mut self, value: u32) -> Result<(), MuxError> {
        self.mux.ping(self.io, value)
    }

    pub fn shutdown(&mut self, code: GoAwayCode) {
        self.mux.shutdown(self.io, code)
    }

    #[inline]
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.mux.stream(id)
    }

    #[inline]
    pub fn mux(&self) -> &Multiplexer {
        self.mux
    }
}

fn write_frame(io: &mut dyn Transport, header: &Header, payload: &[u8]) -> bool {
    let head = header.encode();
    if payload.is_empty() {
        io.write_parts(&[&head])
    } else {
        io.write_parts(&[&head, payload])
    }
}

pub struct Multiplexer {
    role: Role,
    config: MuxConfig,
    pool: BufferPool,
    /// 0 once the id space is used up
    next_id: StreamId,
    streams: HashMap<StreamId, Stream>,
    acceptor: Option<Box<dyn StreamAcceptor>>,
    /// Fragment of a frame split across reads
    parse: Option<PoolBuf>,
    /// We sent GoAway
    going_away: bool,
    /// The peer sent GoAway
    remote_going_away: bool,
    terminated: bool,
    last_pong: Option<u32>,
}

impl Multiplexer {
    /// Multiplexer with its own buffer pool of `config.pool_budget` bytes.
    pub fn new(role: Role, config: MuxConfig) -> Self {
        let pool = BufferPool::new(config.pool_budget);
        Self::with_pool(role, config, pool)
    }

    /// Multiplexer drawing from a shared pool, e.g. its shard's.
    ///
    /// A configuration that fails `MuxConfig::validate` is clamped to the
    /// nearest valid one.
    pub fn with_pool(role: Role, config: MuxConfig, pool: BufferPool) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(reason) => {
                tracing::warn!(reason, "multiplexer config out of range, clamping");
                config.clamped()
            }
        };
        Self {
            role,
            next_id: role.first_id(),
            config,
            pool,
            streams: HashMap::new(),
            acceptor: None,
            parse: None,
            going_away: false,
            remote_going_away: false,
            terminated: false,
            last_pong: None,
        }
    }

    /// Install the callback deciding on remote-opened streams. Without one
    /// every remote open is reset.
    pub fn set_acceptor<A: StreamAcceptor + 'static>(&mut self, acceptor: A) {
        self.acceptor = Some(Box::new(acceptor));
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[inline]
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    #[inline]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Ids of live streams, ascending.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Value of the most recent ping answer.
    #[inline]
    pub fn last_pong(&self) -> Option<u32> {
        self.last_pong
    }

    /// GoAway sent or received.
    #[inline]
    pub fn is_going_away(&self) -> bool {
        self.going_away || self.remote_going_away
    }

    /// No more frames are processed or produced.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Bytes of an incomplete frame held between reads.
    pub fn buffered_fragment(&self) -> usize {
        self.parse.as_ref().map_or(0, PoolBuf::len)
    }

    /// Replace the handler of a live stream.
    pub fn set_handler(&mut self, id: StreamId, handler: Box<dyn StreamHandler>) -> Result<(), MuxError> {
        let s = self.streams.get_mut(&id).ok_or(MuxError::UnknownStream(id))?;
        s.handler = Some(handler);
        Ok(())
    }

    // ========================================================================
    // Local operations
    // ========================================================================

    /// Open a stream and announce it with SYN.
    pub fn open_stream(
        &mut self,
        io: &mut dyn Transport,
        handler: Box<dyn StreamHandler>,
    ) -> Result<StreamId, MuxError> {
        if self.terminated {
            return Err(MuxError::TransportClosed);
        }
        if self.is_going_away() {
            return Err(MuxError::GoingAway);
        }
        if self.next_id == 0 {
            return Err(MuxError::StreamIdsExhausted);
        }
        let id = self.next_id;
        self.next_id = id.checked_add(2).unwrap_or(0);

        self.streams
            .insert(id, Stream::new(id, self.config.initial_window, Some(handler)));
        if !write_frame(io, &Header::data(Flags::SYN, id, 0), &[]) {
            self.streams.remove(&id);
            return Err(MuxError::TransportClosed);
        }
        tracing::trace!(stream_id = id, "stream opened");
        Ok(id)
    }

    /// Send `data` on `id`, as far as the send window allows. The rest waits
    /// in the stream's pending queue for window updates; nothing is ever
    /// sent past the window.
    pub fn send(&mut self, io: &mut dyn Transport, id: StreamId, data: &[u8]) -> Result<(), MuxError> {
        if self.terminated {
            return Err(MuxError::TransportClosed);
        }
        let max = self.config.max_frame_payload;
        let s = self.streams.get_mut(&id).ok_or(MuxError::UnknownStream(id))?;
        if s.local_closed {
            return Err(MuxError::StreamClosed(id));
        }

        let mut rest = data;
        if s.pending_out.is_empty() {
            while !rest.is_empty() && s.send_window > 0 {
                let n = rest.len().min(s.send_window as usize).min(max);
                if !write_frame(io, &Header::data(Flags::empty(), id, n as u32), &rest[..n]) {
                    return Err(MuxError::TransportClosed);
                }
                s.send_window -= n as u32;
                rest = &rest[n..];
            }
        }
        if rest.is_empty() {
            return Ok(());
        }
        if s.pending_out.push(&self.pool, rest).is_err() {
            tracing::warn!(stream_id = id, bytes = rest.len(), "pool exhausted, resetting stream");
            self.reset(io, id);
            return Err(MuxError::PoolExhausted(id));
        }
        tracing::trace!(stream_id = id, pending = s.pending_out.size(), "send window exhausted");
        Ok(())
    }

    /// Close our side of `id`: FIN, or RST when `rst`.
    ///
    /// A graceful close with data still pending sends its FIN once the data
    /// has drained. Closing an already closed side does nothing, except that
    /// a reset may still cut short a deferred FIN.
    pub fn close_stream(&mut self, io: &mut dyn Transport, id: StreamId, rst: bool) -> Result<(), MuxError> {
        let s = self.streams.get_mut(&id).ok_or(MuxError::UnknownStream(id))?;
        if s.local_closed && !(rst && s.fin_deferred) {
            return Ok(());
        }
        if rst {
            self.reset(io, id);
            return Ok(());
        }
        s.local_closed = true;
        if !s.pending_out.is_empty() {
            s.fin_deferred = true;
            return Ok(());
        }
        let remote_closed = s.remote_closed;
        write_frame(io, &Header::data(Flags::FIN, id, 0), &[]);
        if remote_closed {
            self.erase(io, id);
        }
        Ok(())
    }

    /// Acknowledge `consumed` delivered bytes on `id`. Acknowledgements
    /// accumulate until they reach the update threshold, then one window
    /// update carries them all. Returns whether an update was sent.
    pub fn try_send_window_update(
        &mut self,
        io: &mut dyn Transport,
        id: StreamId,
        consumed: usize,
    ) -> Result<bool, MuxError> {
        if self.terminated {
            return Err(MuxError::TransportClosed);
        }
        let initial = self.config.initial_window;
        let threshold = self.config.window_update_threshold;
        let s = self.streams.get_mut(&id).ok_or(MuxError::UnknownStream(id))?;

        // Never credit more than was actually received.
        let outstanding = initial.saturating_sub(s.recv_window);
        let consumed = u32::try_from(consumed).unwrap_or(u32::MAX);
        s.unacked_recv = s.unacked_recv.saturating_add(consumed).min(outstanding);
        if s.unacked_recv < threshold || s.unacked_recv == 0 {
            return Ok(false);
        }
        let delta = s.unacked_recv;
        if !write_frame(io, &Header::window_update(Flags::empty(), id, delta), &[]) {
            return Err(MuxError::TransportClosed);
        }
        s.recv_window += delta;
        s.unacked_recv = 0;
        tracing::trace!(stream_id = id, delta, "window update sent");
        Ok(true)
    }

    pub fn ping(&mut self, io: &mut dyn Transport, value: u32) -> Result<(), MuxError> {
        if self.terminated {
            return Err(MuxError::TransportClosed);
        }
        if write_frame(io, &Header::ping(Flags::empty(), value), &[]) {
            Ok(())
        } else {
            Err(MuxError::TransportClosed)
        }
    }

    /// Announce GoAway and close the transport gracefully. New opens are
    /// refused from here on. Idempotent.
    pub fn shutdown(&mut self, io: &mut dyn Transport, code: GoAwayCode) {
        if self.going_away || self.terminated {
            return;
        }
        self.going_away = true;
        tracing::debug!(?code, streams = self.streams.len(), "sending go away");
        write_frame(io, &Header::go_away(code), &[]);
        io.close(false);
    }

    /// Drop every stream, calling each handler's `on_close`. Used when the
    /// transport is gone; no frames are sent.
    pub fn abort_all(&mut self, io: &mut dyn Transport) {
        self.terminated = true;
        self.parse = None;
        for id in self.stream_ids() {
            if let Some(s) = self.streams.get_mut(&id) {
                s.local_closed = true;
                s.remote_closed = true;
                s.pending_out.clear();
            }
            self.erase(io, id);
        }
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Feed bytes read from the transport.
    pub fn on_receive_data(&mut self, io: &mut dyn Transport, data: &[u8]) {
        if self.terminated {
            return;
        }
        let mut data = data;

        if self.parse.as_ref().is_some_and(|b| !b.is_empty()) {
            match self.complete_fragment(io, data) {
                Some(rest) => data = rest,
                None => return,
            }
        }

        let max = self.config.max_frame_payload;
        while !self.terminated && data.len() >= HEADER_SIZE {
            let header = match Header::decode_checked(data, max) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "bad frame");
                    self.fail(io, GoAwayCode::ProtocolError);
                    return;
                }
            };
            let total = header.frame_len();
            if data.len() < total {
                break;
            }
            self.dispatch(io, header, &data[HEADER_SIZE..total]);
            data = &data[total..];
        }

        if self.terminated || data.is_empty() {
            return;
        }
        self.stash(io, data);
    }

    /// Top up the buffered fragment from `data`. Returns the unconsumed
    /// bytes once the fragment was completed and dispatched, `None` when
    /// everything was absorbed or the tunnel failed.
    fn complete_fragment<'d>(&mut self, io: &mut dyn Transport, data: &'d [u8]) -> Option<&'d [u8]> {
        let mut buf = self.parse.take()?;
        let mut data = data;

        if buf.len() < HEADER_SIZE {
            let n = (HEADER_SIZE - buf.len()).min(data.len());
            buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if buf.len() < HEADER_SIZE {
                self.parse = Some(buf);
                return None;
            }
        }

        let header = match Header::decode_checked(&buf[..HEADER_SIZE], self.config.max_frame_payload) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "bad frame");
                self.fail(io, GoAwayCode::ProtocolError);
                return None;
            }
        };
        let total = header.frame_len();
        if total > buf.capacity() {
            buf = match self.pool.reallocate(buf, total) {
                Ok(grown) => grown,
                Err(_) => {
                    tracing::warn!(bytes = total, "cannot grow fragment buffer");
                    self.fail(io, GoAwayCode::InternalError);
                    return None;
                }
            };
        }

        let n = (total - buf.len()).min(data.len());
        buf.extend_from_slice(&data[..n]);
        data = &data[n..];
        if buf.len() < total {
            self.parse = Some(buf);
            return None;
        }

        self.dispatch(io, header, &buf[HEADER_SIZE..total]);
        buf.clear();
        // Keep the default-sized buffer around, hand back grown ones.
        if !self.terminated && self.parse.is_none() && buf.capacity() <= self.config.parse_buffer_size {
            self.parse = Some(buf);
        }
        if self.terminated {
            None
        } else {
            Some(data)
        }
    }

    fn stash(&mut self, io: &mut dyn Transport, data: &[u8]) {
        let buf = match self.parse.take() {
            Some(b) if b.capacity() >= data.len() => Some(b),
            _ => self.pool.allocate(self.config.parse_buffer_size.max(data.len())),
        };
        let Some(mut buf) = buf else {
            tracing::warn!(bytes = data.len(), "cannot allocate fragment buffer");
            self.fail(io, GoAwayCode::InternalError);
            return;
        };
        buf.extend_from_slice(data);
        self.parse = Some(buf);
    }

    fn dispatch(&mut self, io: &mut dyn Transport, header: Header, payload: &[u8]) {
        tracing::trace!(frame = ?header, "frame");
        match header.frame_type {
            FrameType::Data => self.handle_data(io, header, payload),
            FrameType::WindowUpdate => self.handle_window_update(io, header),
            FrameType::Ping => self.handle_ping(io, header),
            FrameType::GoAway => self.handle_go_away(io, header),
        }
    }

    /// Accept a SYN for an unknown id. Returns whether the stream now exists.
    fn open_remote(&mut self, io: &mut dyn Transport, id: StreamId, flags: Flags) -> bool {
        if id == 0 || !self.role.is_remote(id) {
            tracing::debug!(stream_id = id, "ignoring open with foreign stream id");
            return false;
        }
        if self.is_going_away() || self.acceptor.is_none() {
            write_frame(io, &Header::data(Flags::RST, id, 0), &[]);
            return false;
        }

        self.streams
            .insert(id, Stream::new(id, self.config.initial_window, None));
        let handler = match self.acceptor.take() {
            Some(mut acceptor) => {
                let handler = acceptor.accept(&mut StreamCtx::new(self, io), id);
                if self.acceptor.is_none() {
                    self.acceptor = Some(acceptor);
                }
                handler
            }
            None => None,
        };

        let Some(handler) = handler else {
            tracing::debug!(stream_id = id, "stream refused");
            if self.streams.remove(&id).is_some() {
                write_frame(io, &Header::data(Flags::RST, id, 0), &[]);
            }
            return false;
        };
        let Some(s) = self.streams.get_mut(&id) else {
            // Closed from inside the acceptor.
            let mut handler = handler;
            handler.on_close(&mut StreamCtx::new(self, io), id);
            return false;
        };
        s.handler = Some(handler);
        s.established = true;
        if !flags.contains(Flags::RST) {
            write_frame(io, &Header::data(Flags::ACK, id, 0), &[]);
        }
        tracing::trace!(stream_id = id, "stream accepted");
        true
    }

    fn handle_data(&mut self, io: &mut dyn Transport, h: Header, payload: &[u8]) {
        let id = h.stream_id;
        if id == 0 {
            return;
        }
        if h.flags.contains(Flags::SYN) && !self.streams.contains_key(&id) && !self.open_remote(io, id, h.flags) {
            return;
        }
        let Some(s) = self.streams.get_mut(&id) else {
            tracing::trace!(stream_id = id, "data for unknown stream");
            return;
        };
        if h.flags.contains(Flags::ACK) {
            s.established = true;
        }

        if !payload.is_empty() {
            let len = payload.len() as u32;
            if len > s.recv_window || s.remote_closed {
                tracing::warn!(
                    stream_id = id,
                    len,
                    window = s.recv_window,
                    "receive window violated, resetting stream"
                );
                self.reset(io, id);
                return;
            }
            s.recv_window -= len;
            self.deliver(io, id, payload);
            if self.config.auto_acknowledge && !self.terminated {
                if let Err(e) = self.try_send_window_update(io, id, payload.len()) {
                    // The handler may have reset the stream from on_data.
                    tracing::trace!(stream_id = id, error = %e, "window update not sent");
                }
            }
        }

        if h.flags.intersects(Flags::FIN | Flags::RST) {
            self.remote_close(io, id, h.flags.contains(Flags::RST));
        }
    }

    fn deliver(&mut self, io: &mut dyn Transport, id: StreamId, payload: &[u8]) {
        let Some(mut handler) = self.streams.get_mut(&id).and_then(|s| s.handler.take()) else {
            return;
        };
        handler.on_data(&mut StreamCtx::new(self, io), id, payload);
        match self.streams.get_mut(&id) {
            Some(s) => {
                if s.handler.is_none() {
                    s.handler = Some(handler);
                }
            }
            // Erased from inside the callback; it missed its on_close.
            None => handler.on_close(&mut StreamCtx::new(self, io), id),
        }
    }

    fn remote_close(&mut self, io: &mut dyn Transport, id: StreamId, rst: bool) {
        let Some(s) = self.streams.get_mut(&id) else {
            return;
        };
        if rst {
            s.local_closed = true;
            s.remote_closed = true;
            s.pending_out.clear();
            self.erase(io, id);
            return;
        }
        if s.remote_closed {
            return;
        }
        s.remote_closed = true;
        if s.local_closed && !s.fin_deferred {
            self.erase(io, id);
            return;
        }

        let Some(mut handler) = s.handler.take() else {
            return;
        };
        handler.on_remote_close(&mut StreamCtx::new(self, io), id);
        match self.streams.get_mut(&id) {
            Some(s) => {
                if s.handler.is_none() {
                    s.handler = Some(handler);
                }
            }
            None => handler.on_close(&mut StreamCtx::new(self, io), id),
        }
    }

    fn handle_window_update(&mut self, io: &mut dyn Transport, h: Header) {
        let id = h.stream_id;
        if id == 0 {
            return;
        }
        if h.flags.contains(Flags::SYN) && !self.streams.contains_key(&id) && !self.open_remote(io, id, h.flags) {
            return;
        }
        let Some(s) = self.streams.get_mut(&id) else {
            return;
        };
        if h.flags.contains(Flags::ACK) {
            s.established = true;
        }
        s.send_window = s.send_window.saturating_add(h.length);
        self.process_pending(io, id);

        if h.flags.intersects(Flags::FIN | Flags::RST) {
            self.remote_close(io, id, h.flags.contains(Flags::RST));
        }
    }

    /// Drain pending data as far as the window allows, splitting a buffer
    /// that does not fit. Sends a deferred FIN once the queue is empty.
    fn process_pending(&mut self, io: &mut dyn Transport, id: StreamId) {
        let max = self.config.max_frame_payload;
        let Some(s) = self.streams.get_mut(&id) else {
            return;
        };
        while s.send_window > 0 {
            let n = match s.pending_out.front() {
                // Nothing to send; consume drops the empty buffer.
                Some([]) => 0,
                Some(chunk) => {
                    let n = chunk.len().min(s.send_window as usize).min(max);
                    if !write_frame(io, &Header::data(Flags::empty(), id, n as u32), &chunk[..n]) {
                        return;
                    }
                    n
                }
                None => break,
            };
            s.pending_out.consume(n);
            s.send_window -= n as u32;
        }

        if s.fin_deferred && s.pending_out.is_empty() {
            s.fin_deferred = false;
            let remote_closed = s.remote_closed;
            write_frame(io, &Header::data(Flags::FIN, id, 0), &[]);
            if remote_closed {
                self.erase(io, id);
            }
        }
    }

    fn handle_ping(&mut self, io: &mut dyn Transport, h: Header) {
        if h.flags.contains(Flags::ACK) {
            self.last_pong = Some(h.length);
            return;
        }
        write_frame(io, &Header::ping(Flags::ACK, h.length), &[]);
    }

    fn handle_go_away(&mut self, io: &mut dyn Transport, h: Header) {
        match GoAwayCode::from_code(h.length) {
            Some(GoAwayCode::Normal) => tracing::debug!("peer going away"),
            Some(code) => tracing::warn!(?code, "peer going away"),
            None => tracing::warn!(code = h.length, "peer going away with unknown code"),
        }
        self.remote_going_away = true;
        self.abort_all(io);
        io.close(true);
    }

    // ========================================================================
    // Teardown helpers
    // ========================================================================

    /// Hard reset: send RST and drop the stream now.
    fn reset(&mut self, io: &mut dyn Transport, id: StreamId) {
        if let Some(s) = self.streams.get_mut(&id) {
            s.local_closed = true;
            s.remote_closed = true;
            s.fin_deferred = false;
            s.pending_out.clear();
            write_frame(io, &Header::data(Flags::RST, id, 0), &[]);
            self.erase(io, id);
        }
    }

    /// Remove `id` from the table and notify its handler.
    fn erase(&mut self, io: &mut dyn Transport, id: StreamId) {
        if let Some(mut s) = self.streams.remove(&id) {
            tracing::trace!(stream_id = id, "stream closed");
            if let Some(mut handler) = s.handler.take() {
                handler.on_close(&mut StreamCtx::new(self, io), id);
            }
        }
    }

    /// Connection-level failure: GoAway with `code`, drop all streams and
    /// close the transport. Nothing is processed afterwards.
    fn fail(&mut self, io: &mut dyn Transport, code: GoAwayCode) {
        if !self.going_away {
            self.going_away = true;
            write_frame(io, &Header::go_away(code), &[]);
        }
        self.abort_all(io);
        io.close(false);
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.role)
            .field("streams", &self.streams.len())
            .field("going_away", &self.going_away)
            .field("remote_going_away", &self.remote_going_away)
            .field("terminated", &self.terminated)
            .finish()
    }
}
