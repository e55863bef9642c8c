//! Socket - per-connection state machine
//!
//! ```text
//! Ready -> Connecting -> Connected -> Closing -> Closed
//!   \__________________/^
//!         (accept)
//! ```
//!
//! Status only moves forward and `Closed` is sticky. Reads land in a pooled
//! buffer and are handed to the owner one read at a time. Writes go straight
//! to the kernel when nothing is queued; whatever the kernel refuses is
//! copied into the [`PooledSendQueue`] and drained on write readiness with
//! batched `sendmsg`.
//!
//! Backpressure: once more than `backpressure_ceiling` bytes are queued,
//! read interest is dropped; it comes back only when the queue has drained
//! to `low_watermark` or below.
//!
//! Callbacks are not invoked from inside socket operations. Operations post
//! [`Notice`]s that [`ConnSlot::flush_notices`] delivers once the operation
//! has returned, so a handler never re-enters itself.

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

use bitflags::bitflags;
use muxline_core::{PoolBuf, PooledSendQueue};
use nix::errno::Errno;

use crate::connection::{Connection, SocketCtx};
use crate::reactor::Reactor;
use crate::sys;
use crate::table::SocketHandle;

pub(crate) const EV_IN: u32 = libc::EPOLLIN as u32;
pub(crate) const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EV_ERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub(crate) const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub(crate) const EV_ET: u32 = libc::EPOLLET as u32;

/// Interest of every connected socket.
pub(crate) const BASE_INTEREST: u32 = EV_IN | EV_RDHUP | EV_ET;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Ready,
    Connecting,
    Connected,
    Closing,
    Closed,
}

bitflags! {
    /// Lifecycle events waiting to be delivered to the handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct Notice: u8 {
        const CONNECTED = 0x01;
        const CONNECT_FAILED = 0x02;
        const PAUSED = 0x04;
        const RESUMED = 0x08;
        const CLOSED = 0x10;
    }
}

pub struct Socket {
    fd: RawFd,
    handle: Option<SocketHandle>,
    interest: u32,
    status: Status,
    /// Paused by backpressure
    read_paused: bool,
    /// Paused by the owner
    app_paused: bool,
    /// Close once the send queue is empty
    pending_close: bool,
    /// Local close requested; no new sends accepted
    write_closed: bool,
    /// Outbound connect not yet confirmed by SO_ERROR; outlives a
    /// graceful close started while connecting
    connecting: bool,
    rbuf: Option<PoolBuf>,
    queue: PooledSendQueue,
    peer: Option<SocketAddr>,
    last_active: Instant,
    status_since: Instant,
    notices: Notice,
}

impl Socket {
    /// A socket with no fd yet, for an outbound connect awaiting DNS.
    pub(crate) fn detached(now: Instant) -> Self {
        Self {
            fd: -1,
            handle: None,
            interest: 0,
            status: Status::Ready,
            read_paused: false,
            app_paused: false,
            pending_close: false,
            write_closed: false,
            connecting: false,
            rbuf: None,
            queue: PooledSendQueue::new(),
            peer: None,
            last_active: now,
            status_since: now,
            notices: Notice::empty(),
        }
    }

    /// Bind a registered fd to this socket.
    pub(crate) fn attach(
        &mut self,
        handle: SocketHandle,
        peer: Option<SocketAddr>,
        rbuf: PoolBuf,
        interest: u32,
        now: Instant,
    ) {
        self.fd = handle.fd();
        self.handle = Some(handle);
        self.peer = peer;
        self.rbuf = Some(rbuf);
        self.interest = interest;
        self.last_active = now;
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn handle(&self) -> Option<SocketHandle> {
        self.handle
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.queue.size()
    }

    #[inline]
    pub fn is_read_paused(&self) -> bool {
        self.read_paused || self.app_paused
    }

    #[inline]
    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// When the current status was entered.
    #[inline]
    pub fn status_since(&self) -> Instant {
        self.status_since
    }

    /// Forward-only transition; nothing leaves Closed.
    pub(crate) fn set_status(&mut self, next: Status, now: Instant) {
        if self.status == Status::Closed || next < self.status {
            return;
        }
        if next != self.status {
            self.status = next;
            self.status_since = now;
        }
    }

    /// A non-blocking connect is in flight on the attached fd.
    pub(crate) fn begin_connect(&mut self, now: Instant) {
        self.connecting = true;
        self.set_status(Status::Connecting, now);
    }

    #[inline]
    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting
    }

    pub(crate) fn post(&mut self, notice: Notice) {
        self.notices |= notice;
    }

    fn take_notices(&mut self) -> Notice {
        std::mem::take(&mut self.notices)
    }

    // ------------------------------------------------------------------
    // Interest helpers
    // ------------------------------------------------------------------

    fn add_interest(&mut self, reactor: &mut Reactor, flags: u32) {
        if let Some(h) = self.handle {
            reactor.add_flags(h, &mut self.interest, flags);
        }
    }

    fn remove_interest(&mut self, reactor: &mut Reactor, flags: u32) {
        if let Some(h) = self.handle {
            reactor.remove_flags(h, &mut self.interest, flags);
        }
    }

    fn sync_read_interest(&mut self, reactor: &mut Reactor) {
        if self.is_read_paused() {
            self.remove_interest(reactor, EV_IN);
        } else {
            self.add_interest(reactor, EV_IN);
        }
    }

    fn pause_reading(&mut self, reactor: &mut Reactor) {
        if !self.read_paused {
            self.read_paused = true;
            self.sync_read_interest(reactor);
            self.post(Notice::PAUSED);
        }
    }

    fn resume_reading(&mut self, reactor: &mut Reactor) {
        if self.read_paused {
            self.read_paused = false;
            self.sync_read_interest(reactor);
            self.post(Notice::RESUMED);
        }
    }

    pub(crate) fn set_app_paused(&mut self, reactor: &mut Reactor, paused: bool) {
        if self.is_closed() || self.app_paused == paused {
            return;
        }
        self.app_paused = paused;
        self.sync_read_interest(reactor);
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    pub(crate) fn send_parts(&mut self, reactor: &mut Reactor, parts: &[&[u8]]) -> bool {
        if self.is_closed() || self.write_closed || (self.fd < 0 && self.status != Status::Ready) {
            return false;
        }
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total == 0 {
            return true;
        }

        let mut sent = 0;
        if self.queue.is_empty() && self.status >= Status::Connected && self.fd >= 0 {
            match self.write_now(reactor, parts) {
                Ok(n) => sent = n,
                Err(errno) => {
                    tracing::debug!(fd = self.fd, %errno, "send failed, aborting");
                    self.close(reactor, true);
                    return false;
                }
            }
            if sent == total {
                self.last_active = reactor.now();
                return true;
            }
        }

        let mut skip = sent;
        for part in parts {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            if let Err(e) = self.queue.push(reactor.pool(), &part[skip..]) {
                tracing::warn!(fd = self.fd, error = %e, "cannot queue outbound bytes, aborting");
                self.close(reactor, true);
                return false;
            }
            skip = 0;
        }

        self.add_interest(reactor, EV_OUT);
        if self.queue.size() > reactor.config().backpressure_ceiling {
            self.pause_reading(reactor);
        }
        true
    }

    /// One non-blocking write attempt; would-block counts as zero bytes.
    fn write_now(&mut self, reactor: &mut Reactor, parts: &[&[u8]]) -> Result<usize, Errno> {
        loop {
            let res = if parts.len() == 1 {
                sys::send(self.fd, parts[0])
            } else {
                let iov: Vec<libc::iovec> = parts
                    .iter()
                    .filter(|p| !p.is_empty())
                    .take(reactor.iov_max())
                    .map(|p| sys::iovec(p))
                    .collect();
                sys::send_vectored(self.fd, &iov)
            };
            match res {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain the queue with batched vectored writes until it empties or
    /// the kernel pushes back.
    fn drain(&mut self, reactor: &mut Reactor) {
        let max_iov = reactor.iov_max();
        let max_bytes = reactor.config().max_batch_bytes;
        let mut iov = reactor.take_iov_scratch();

        while !self.queue.is_empty() {
            iov.clear();
            let mut batch = 0;
            for chunk in self.queue.chunks() {
                if iov.len() == max_iov || batch >= max_bytes {
                    break;
                }
                let take = chunk.len().min(max_bytes - batch);
                iov.push(sys::iovec(&chunk[..take]));
                batch += take;
            }
            match sys::send_vectored(self.fd, &iov) {
                Ok(n) => {
                    self.queue.consume(n);
                    self.last_active = reactor.now();
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(errno) => {
                    iov.clear();
                    reactor.restore_iov_scratch(iov);
                    tracing::debug!(fd = self.fd, %errno, "write failed, aborting");
                    self.close(reactor, true);
                    return;
                }
            }
        }
        iov.clear();
        reactor.restore_iov_scratch(iov);

        if self.queue.is_empty() {
            if self.pending_close {
                self.terminate(reactor);
                return;
            }
            self.remove_interest(reactor, EV_OUT);
        }
        if self.queue.size() <= reactor.config().low_watermark {
            self.resume_reading(reactor);
        }
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    pub(crate) fn on_writable(&mut self, reactor: &mut Reactor) {
        if self.connecting {
            self.connecting = false;
            match sys::take_socket_error(self.fd) {
                Ok(None) => {
                    // Stays Closing if a graceful close is already draining.
                    self.set_status(Status::Connected, reactor.now());
                    self.last_active = reactor.now();
                    self.post(Notice::CONNECTED);
                    if self.queue.is_empty() {
                        self.remove_interest(reactor, EV_OUT);
                        return;
                    }
                }
                Ok(Some(errno)) | Err(errno) => {
                    tracing::debug!(fd = self.fd, %errno, "connect failed");
                    self.post(Notice::CONNECT_FAILED);
                    self.close(reactor, true);
                    return;
                }
            }
        }
        if !self.is_closed() {
            self.drain(reactor);
        }
    }

    /// Read side reached EOF.
    fn on_peer_eof(&mut self, reactor: &mut Reactor) {
        if self.queue.is_empty() {
            self.close(reactor, false);
        } else {
            self.begin_drain_close(reactor);
        }
    }

    /// Read-side hang-up: confirm with a peek, then drain or close.
    pub(crate) fn handle_half_close(&mut self, reactor: &mut Reactor) {
        if self.is_closed() || self.pending_close {
            return;
        }
        match sys::peek_one(self.fd) {
            Ok(0) => self.on_peer_eof(reactor),
            // Unread data; the read loop reaches EOF later.
            Ok(_) => {}
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(errno) => {
                tracing::debug!(fd = self.fd, %errno, "peek after hang-up failed");
                self.close(reactor, true);
                return;
            }
        }
        if !self.is_closed() {
            if let Ok(Some(errno)) = sys::take_socket_error(self.fd) {
                tracing::debug!(fd = self.fd, %errno, "pending socket error after hang-up");
                self.close(reactor, true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Graceful close drains the queue first; forced close drops it.
    pub(crate) fn close(&mut self, reactor: &mut Reactor, force: bool) {
        if self.is_closed() {
            return;
        }
        self.write_closed = true;
        if force || self.queue.is_empty() || self.fd < 0 {
            if force {
                self.queue.clear();
            }
            self.terminate(reactor);
        } else {
            self.begin_drain_close(reactor);
        }
    }

    fn begin_drain_close(&mut self, reactor: &mut Reactor) {
        if self.pending_close {
            return;
        }
        self.pending_close = true;
        self.set_status(Status::Closing, reactor.now());
        self.add_interest(reactor, EV_OUT);
    }

    fn terminate(&mut self, reactor: &mut Reactor) {
        self.set_status(Status::Closed, reactor.now());
        if let Some(h) = self.handle {
            reactor.unregister_connection(h);
        }
        self.rbuf = None;
        self.queue.clear();
        if self.fd >= 0 {
            sys::shutdown_write(self.fd);
            sys::close(self.fd);
            self.fd = -1;
        }
        self.post(Notice::CLOSED);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        sys::close(self.fd);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("status", &self.status)
            .field("queued", &self.queue.size())
            .field("read_paused", &self.is_read_paused())
            .finish()
    }
}

/// A socket and the handler that owns its events.
pub(crate) struct ConnSlot {
    pub(crate) socket: Socket,
    pub(crate) handler: Box<dyn Connection>,
}

impl ConnSlot {
    pub(crate) fn new(socket: Socket, handler: Box<dyn Connection>) -> Box<Self> {
        Box::new(Self { socket, handler })
    }

    /// Run `f` against the handler, then deliver whatever it triggered.
    pub(crate) fn invoke<R>(
        &mut self,
        reactor: &mut Reactor,
        f: impl FnOnce(&mut dyn Connection, &mut SocketCtx<'_>) -> R,
    ) -> R {
        let r = {
            let mut cx = SocketCtx {
                socket: &mut self.socket,
                reactor: &mut *reactor,
            };
            f(&mut *self.handler, &mut cx)
        };
        self.flush_notices(reactor);
        r
    }

    pub(crate) fn flush_notices(&mut self, reactor: &mut Reactor) {
        loop {
            let n = self.socket.take_notices();
            if n.is_empty() {
                return;
            }
            let mut cx = SocketCtx {
                socket: &mut self.socket,
                reactor: &mut *reactor,
            };
            let h = &mut *self.handler;
            if n.contains(Notice::CONNECTED) {
                h.on_connected(&mut cx);
            }
            if n.contains(Notice::CONNECT_FAILED) {
                h.on_connect_failed(&mut cx);
            }
            if n.contains(Notice::PAUSED) {
                h.on_pause(&mut cx);
            }
            if n.contains(Notice::RESUMED) {
                h.on_resume(&mut cx);
            }
            if n.contains(Notice::CLOSED) {
                h.on_close(&mut cx);
            }
        }
    }

    /// Translate one readiness event.
    pub(crate) fn on_events(&mut self, reactor: &mut Reactor, events: u32) {
        if events & EV_ERR != 0 {
            if let Ok(Some(errno)) = sys::take_socket_error(self.socket.fd) {
                tracing::debug!(fd = self.socket.fd, %errno, "socket error");
            }
            if self.socket.connecting {
                self.socket.connecting = false;
                self.socket.post(Notice::CONNECT_FAILED);
            }
            self.socket.close(reactor, true);
            self.flush_notices(reactor);
            return;
        }

        if events & EV_OUT != 0 {
            self.socket.on_writable(reactor);
            self.flush_notices(reactor);
        }
        if events & EV_IN != 0 && !self.socket.is_closed() {
            self.on_readable(reactor);
        }
        if events & (EV_HUP | EV_RDHUP) != 0 && !self.socket.is_closed() {
            if events & EV_HUP != 0 && self.socket.queue.is_empty() {
                self.socket.close(reactor, false);
            } else {
                self.socket.handle_half_close(reactor);
            }
            self.flush_notices(reactor);
        }
    }

    /// Read until would-block, EOF, error, pause or close.
    pub(crate) fn on_readable(&mut self, reactor: &mut Reactor) {
        loop {
            if self.socket.is_closed() || self.socket.is_read_paused() {
                break;
            }
            let Some(mut buf) = self.socket.rbuf.take() else { break };
            buf.clear();
            match sys::recv(self.socket.fd, buf.spare_mut()) {
                Ok(0) => {
                    self.socket.rbuf = Some(buf);
                    self.socket.on_peer_eof(reactor);
                    break;
                }
                Ok(n) => {
                    buf.commit(n);
                    self.socket.last_active = reactor.now();
                    {
                        let mut cx = SocketCtx {
                            socket: &mut self.socket,
                            reactor: &mut *reactor,
                        };
                        self.handler.on_data(&mut cx, buf.as_slice());
                    }
                    if !self.socket.is_closed() {
                        self.socket.rbuf = Some(buf);
                    }
                    self.flush_notices(reactor);
                }
                Err(Errno::EINTR) => {
                    self.socket.rbuf = Some(buf);
                }
                Err(Errno::EAGAIN) => {
                    self.socket.rbuf = Some(buf);
                    break;
                }
                Err(errno) => {
                    self.socket.rbuf = Some(buf);
                    tracing::debug!(fd = self.socket.fd, %errno, "read failed, aborting");
                    self.socket.close(reactor, true);
                    break;
                }
            }
        }
        self.flush_notices(reactor);
    }
}
