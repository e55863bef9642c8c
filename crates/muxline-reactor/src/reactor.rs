//! # Reactor - one epoll loop per shard
//!
//! The reactor owns everything a shard touches: the epoll instance, the
//! generation-checked [`SocketTable`], the [`BufferPool`], the timer wheel,
//! the DNS resolver and the deferred reclaim list. None of it is shared, so
//! none of it is locked. Other threads reach a shard only through its
//! [`Inbox`], a bounded lock-free queue paired with a wake eventfd.
//!
//! ## Dispatch
//!
//! Every registration carries `(generation << 32) | fd` as epoll user data.
//! An event whose generation no longer matches the table is stale (the fd was
//! closed and maybe reused within the same batch) and is dropped.
//!
//! A connection's [`ConnSlot`] is checked out of the table for the duration
//! of its callbacks and checked back in afterwards, or retired to the
//! reclaim list if the socket closed meanwhile. A callback may therefore
//! close its own socket, register new ones or look up *other* connections
//! freely; a lookup of the connection being dispatched simply misses.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use muxline_core::{BufferPool, DeferredReclaimList, Error, PoolStats, ReactorConfig, Result};
use nix::errno::Errno;

use crate::connection::{AcceptContext, Connection, SocketCtx};
use crate::dns::{literal_addrs, DnsResolver, QueryType, Resolution, ResolveStatus, Resolver};
use crate::socket::{ConnSlot, Notice, Socket, Status, BASE_INTEREST, EV_ET, EV_IN, EV_OUT};
use crate::sys;
use crate::table::{EventKey, SocketHandle, SocketKind, SocketRecord, SocketTable};
use crate::timer::{TimerId, TimerManager};

/// Work shipped to a shard from another thread.
pub type Command = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Builds the handler for an accepted connection; `None` refuses it.
pub type Acceptor = Box<dyn FnMut(&AcceptContext) -> Option<Box<dyn Connection>>>;

type ResolveCallback = Box<dyn FnOnce(&mut Reactor, &str, &[IpAddr])>;

pub(crate) enum Owner {
    Listener { fd: OwnedFd, local: SocketAddr },
    /// `None` while checked out for dispatch
    Connection(Option<Box<ConnSlot>>),
    Timer,
    Dns,
    Waker,
}

enum TimerTask {
    IdleSweep,
    StalledSweep,
    ReclaimFlush,
    DnsTick,
    Callback(Box<dyn FnMut(&mut Reactor)>),
}

enum PendingResolve {
    Callback(ResolveCallback),
    Connect { slot: Box<ConnSlot>, port: u16 },
}

/// Cross-thread entry point of one shard.
pub struct Inbox {
    queue: ArrayQueue<Command>,
    wake: OwnedFd,
    shard: usize,
}

impl Inbox {
    fn new(capacity: usize, shard: usize) -> Result<Self> {
        Ok(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            wake: sys::eventfd().map_err(|e| Error::os("eventfd", e))?,
            shard,
        })
    }

    /// Queue `cmd` for the shard thread and wake it.
    pub fn submit(&self, cmd: Command) -> Result<()> {
        self.queue.push(cmd).map_err(|_| Error::InboxFull(self.shard))?;
        self.wake();
        Ok(())
    }

    /// Interrupt the shard's wait.
    pub fn wake(&self) {
        if let Err(errno) = sys::eventfd_signal(self.wake.as_raw_fd()) {
            tracing::warn!(shard = self.shard, %errno, "wake failed");
        }
    }

    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub struct Reactor {
    shard: usize,
    config: ReactorConfig,
    epoll: OwnedFd,
    table: SocketTable<Owner>,
    pool: BufferPool,
    reclaim: DeferredReclaimList<Box<ConnSlot>>,
    timers: TimerManager<TimerTask>,
    resolver: Option<Box<dyn Resolver>>,
    resolver_handle: Option<SocketHandle>,
    dns_tick: Option<TimerId>,
    resolves: HashMap<u64, PendingResolve>,
    next_token: u64,
    inbox: Arc<Inbox>,
    acceptor: Option<Acceptor>,
    now: Instant,
    events: Vec<libc::epoll_event>,
    iov_scratch: Vec<libc::iovec>,
    iov_max: usize,
    stop_requested: bool,
}

impl Reactor {
    pub fn new(config: ReactorConfig, shard: usize) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let capacity = if config.max_fds == 0 {
            sys::fd_limit()
        } else {
            config.max_fds
        };
        let epoll = sys::epoll_create().map_err(|e| Error::os("epoll_create1", e))?;
        let timers = TimerManager::new().map_err(|e| Error::os("timerfd_create", e))?;
        let inbox = Arc::new(Inbox::new(config.inbox_capacity, shard)?);
        let now = Instant::now();

        let mut reactor = Self {
            shard,
            epoll,
            table: SocketTable::with_capacity(capacity),
            pool: BufferPool::new(config.pool_size),
            reclaim: DeferredReclaimList::new(config.reclaim_threshold, config.reclaim_max_age),
            timers,
            resolver: None,
            resolver_handle: None,
            dns_tick: None,
            resolves: HashMap::new(),
            next_token: 0,
            inbox,
            acceptor: None,
            now,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; config.max_events],
            iov_scratch: Vec::new(),
            iov_max: sys::iov_max(),
            stop_requested: false,
            config,
        };

        let timer_fd = reactor.timers.fd();
        reactor.register_fd(timer_fd, SocketKind::Timer, Owner::Timer, EV_IN)?;
        let wake_fd = reactor.inbox.wake.as_raw_fd();
        reactor.register_fd(wake_fd, SocketKind::Waker, Owner::Waker, EV_IN)?;

        if !reactor.config.idle_timeout.is_zero() {
            let every = reactor.config.idle_sweep_interval;
            reactor.timers.schedule_repeating(now, every, TimerTask::IdleSweep);
        }
        let every = reactor.config.stalled_sweep_interval;
        reactor.timers.schedule_repeating(now, every, TimerTask::StalledSweep);
        let every = reactor.config.reclaim_interval;
        reactor.timers.schedule_repeating(now, every, TimerTask::ReclaimFlush);

        tracing::debug!(shard, capacity, "reactor created");
        Ok(reactor)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    #[inline]
    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Loop time, refreshed once per wait.
    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Registered connections, including ones still closing.
    #[inline]
    pub fn connection_count(&self) -> usize {
        self.table.active_len()
    }

    /// Closed connections awaiting destruction.
    #[inline]
    pub fn pending_reclaim(&self) -> usize {
        self.reclaim.len()
    }

    pub fn inbox(&self) -> Arc<Inbox> {
        Arc::clone(&self.inbox)
    }

    /// Bound addresses of every listener.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.table
            .handles_of_kind(SocketKind::Listener)
            .into_iter()
            .filter_map(|h| match self.table.lookup(h) {
                Some(SocketRecord {
                    owner: Owner::Listener { local, .. },
                    ..
                }) => Some(*local),
                _ => None,
            })
            .collect()
    }

    #[inline]
    pub(crate) fn iov_max(&self) -> usize {
        self.iov_max
    }

    pub(crate) fn take_iov_scratch(&mut self) -> Vec<libc::iovec> {
        std::mem::take(&mut self.iov_scratch)
    }

    pub(crate) fn restore_iov_scratch(&mut self, iov: Vec<libc::iovec>) {
        self.iov_scratch = iov;
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Poll until `stop` is set or [`stop`](Self::stop) is called, then shut
    /// down gracefully.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        tracing::debug!(shard = self.shard, "reactor running");
        while !stop.load(Ordering::Acquire) && !self.stop_requested {
            self.poll_once(self.config.poll_timeout)?;
        }
        self.shutdown();
        tracing::debug!(shard = self.shard, "reactor stopped");
        Ok(())
    }

    /// Ask [`run`](Self::run) to return after the current iteration.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// One wait and the dispatch of its events. A wait that returns nothing
    /// doubles as the idle tick. Only a failing `epoll_wait` is an error.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<usize> {
        let mut events = std::mem::take(&mut self.events);
        let n = loop {
            match sys::epoll_wait(&self.epoll, &mut events, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    self.events = events;
                    tracing::error!(shard = self.shard, %errno, "epoll_wait failed");
                    return Err(Error::os("epoll_wait", errno));
                }
            }
        };
        self.now = Instant::now();

        for i in 0..n {
            let bits = events[i].events;
            let key = EventKey::from_raw(events[i].u64);
            self.dispatch(key.handle(), bits);
        }
        self.events = events;

        if n == 0 {
            self.idle_tick();
        }
        Ok(n)
    }

    fn dispatch(&mut self, handle: SocketHandle, bits: u32) {
        let Some(kind) = self.table.lookup(handle).map(|r| r.kind) else {
            tracing::trace!(?handle, "stale event");
            return;
        };
        match kind {
            SocketKind::Connection => {
                self.with_slot(handle, |slot, reactor| slot.on_events(reactor, bits));
            }
            SocketKind::Listener => self.accept_loop(handle),
            SocketKind::Timer => self.fire_timers(),
            SocketKind::DnsQuery => self.on_dns_readable(),
            SocketKind::Waker => self.drain_inbox(),
        }
    }

    fn idle_tick(&mut self) {
        if self.config.deferred_reclaim {
            self.reclaim.flush_at(self.now);
        } else {
            self.reclaim.flush_all();
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn register_fd(&mut self, fd: RawFd, kind: SocketKind, owner: Owner, events: u32) -> Result<SocketHandle> {
        let handle = self.table.add(fd, kind, owner)?;
        if let Err(errno) = sys::epoll_ctl(&self.epoll, libc::EPOLL_CTL_ADD, fd, events, handle.key().raw()) {
            self.table.remove(fd);
            return Err(Error::os("epoll_ctl(ADD)", errno));
        }
        Ok(handle)
    }

    fn deregister_fd(&mut self, handle: SocketHandle) -> Option<Owner> {
        self.table.lookup(handle)?;
        if let Err(errno) = sys::epoll_ctl(&self.epoll, libc::EPOLL_CTL_DEL, handle.fd(), 0, 0) {
            tracing::debug!(?handle, %errno, "epoll_ctl(DEL) failed");
        }
        self.table.remove(handle.fd()).map(|r| r.owner)
    }

    /// Called by a socket as it closes, before its fd is released.
    pub(crate) fn unregister_connection(&mut self, handle: SocketHandle) {
        if let Some(Owner::Connection(Some(slot))) = self.deregister_fd(handle) {
            self.retire(slot);
        }
    }

    pub(crate) fn add_flags(&mut self, handle: SocketHandle, interest: &mut u32, flags: u32) {
        let next = *interest | flags;
        self.modify(handle, interest, next);
    }

    pub(crate) fn remove_flags(&mut self, handle: SocketHandle, interest: &mut u32, flags: u32) {
        let next = *interest & !flags;
        self.modify(handle, interest, next);
    }

    fn modify(&mut self, handle: SocketHandle, interest: &mut u32, next: u32) {
        if next == *interest || !self.table.contains(handle) {
            return;
        }
        match sys::epoll_ctl(&self.epoll, libc::EPOLL_CTL_MOD, handle.fd(), next, handle.key().raw()) {
            Ok(()) => *interest = next,
            Err(errno) => tracing::warn!(?handle, %errno, "epoll_ctl(MOD) failed"),
        }
    }

    // ========================================================================
    // Connection slots
    // ========================================================================

    fn checkout(&mut self, handle: SocketHandle) -> Option<Box<ConnSlot>> {
        match self.table.lookup_mut(handle) {
            Some(SocketRecord {
                owner: Owner::Connection(slot),
                ..
            }) => slot.take(),
            _ => None,
        }
    }

    /// Check a slot back in, or retire it if it closed.
    fn settle(&mut self, handle: SocketHandle, slot: Box<ConnSlot>) {
        if !slot.socket.is_closed() {
            if let Some(SocketRecord {
                owner: Owner::Connection(place),
                ..
            }) = self.table.lookup_mut(handle)
            {
                if place.is_none() {
                    *place = Some(slot);
                    return;
                }
            }
            tracing::warn!(?handle, "open connection lost its table slot");
        }
        self.retire(slot);
    }

    fn retire(&mut self, slot: Box<ConnSlot>) {
        self.reclaim.retire_at(slot, self.now);
    }

    fn with_slot<R>(&mut self, handle: SocketHandle, f: impl FnOnce(&mut ConnSlot, &mut Reactor) -> R) -> Option<R> {
        let mut slot = self.checkout(handle)?;
        let r = f(&mut slot, self);
        slot.flush_notices(self);
        self.settle(handle, slot);
        Some(r)
    }

    /// Run `f` against the connection behind `handle` if it is a `T`.
    /// `None` if the handle is stale, the type differs, or the connection is
    /// the one currently being dispatched.
    pub fn with_connection<T, R>(
        &mut self,
        handle: SocketHandle,
        f: impl FnOnce(&mut T, &mut SocketCtx<'_>) -> R,
    ) -> Option<R>
    where
        T: Connection,
    {
        self.with_slot(handle, |slot, reactor| {
            slot.invoke(reactor, |conn, cx| conn.as_any_mut().downcast_mut::<T>().map(|c| f(c, cx)))
        })
        .flatten()
    }

    /// Send on a connection from outside its callbacks.
    pub fn send(&mut self, handle: SocketHandle, data: &[u8]) -> bool {
        self.with_slot(handle, |slot, reactor| slot.socket.send_parts(reactor, &[data]))
            .unwrap_or(false)
    }

    /// Close a connection from outside its callbacks.
    pub fn close(&mut self, handle: SocketHandle, force: bool) -> bool {
        self.with_slot(handle, |slot, reactor| slot.socket.close(reactor, force))
            .is_some()
    }

    pub fn status(&self, handle: SocketHandle) -> Option<Status> {
        match self.table.lookup(handle) {
            Some(SocketRecord {
                owner: Owner::Connection(Some(slot)),
                ..
            }) => Some(slot.socket.status()),
            _ => None,
        }
    }

    // ========================================================================
    // Listeners and accept
    // ========================================================================

    /// Install the handler factory used for accepted connections.
    pub fn set_acceptor<F>(&mut self, f: F)
    where
        F: FnMut(&AcceptContext) -> Option<Box<dyn Connection>> + 'static,
    {
        self.acceptor = Some(Box::new(f));
    }

    /// Bind and listen on `addr` (edge-triggered). Returns the bound address,
    /// useful with port 0.
    pub fn add_listener(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let raw = sys::tcp_listener(&addr, self.config.listen_backlog).map_err(|e| Error::os("listen", e))?;
        // SAFETY: freshly created and owned by nothing else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let local = sys::local_addr(raw).map_err(|e| Error::os("getsockname", e))?;
        self.register_fd(raw, SocketKind::Listener, Owner::Listener { fd, local }, EV_IN | EV_ET)?;
        tracing::info!(shard = self.shard, %local, "listening");
        Ok(local)
    }

    pub fn stop_listeners(&mut self) {
        for h in self.table.handles_of_kind(SocketKind::Listener) {
            if let Some(Owner::Listener { local, .. }) = self.deregister_fd(h) {
                tracing::debug!(shard = self.shard, %local, "listener closed");
            }
        }
    }

    fn accept_loop(&mut self, handle: SocketHandle) {
        let (lfd, local) = match self.table.lookup(handle) {
            Some(SocketRecord {
                owner: Owner::Listener { fd, local },
                ..
            }) => (fd.as_raw_fd(), *local),
            _ => return,
        };
        loop {
            match sys::accept(lfd) {
                Ok((fd, peer)) => self.on_accept(fd, peer, local),
                Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
                Err(Errno::EAGAIN) => break,
                Err(errno) => {
                    tracing::warn!(shard = self.shard, %local, %errno, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_accept(&mut self, fd: RawFd, peer: Option<SocketAddr>, local: SocketAddr) {
        if let Err(errno) = sys::set_nodelay(fd) {
            tracing::trace!(fd, %errno, "TCP_NODELAY not applied");
        }
        let ctx = AcceptContext {
            peer,
            local,
            shard: self.shard,
            pool: self.pool.clone(),
        };
        let Some(handler) = self.acceptor.as_mut().and_then(|make| make(&ctx)) else {
            tracing::debug!(fd, ?peer, "connection refused by acceptor");
            sys::close(fd);
            return;
        };
        if let Err(e) = self.adopt(fd, peer, handler) {
            tracing::warn!(shard = self.shard, ?peer, error = %e, "cannot register accepted connection");
        }
    }

    /// Take ownership of a connected, non-blocking stream fd. The handler
    /// gets `on_accepted`. On error the fd is closed.
    pub fn adopt(&mut self, fd: RawFd, peer: Option<SocketAddr>, handler: Box<dyn Connection>) -> Result<SocketHandle> {
        let requested = self.config.read_buffer_size;
        let Some(rbuf) = self.pool.allocate(requested) else {
            sys::close(fd);
            return Err(Error::PoolExhausted { requested });
        };
        let handle = match self.register_fd(fd, SocketKind::Connection, Owner::Connection(None), BASE_INTEREST) {
            Ok(h) => h,
            Err(e) => {
                sys::close(fd);
                return Err(e);
            }
        };
        let mut socket = Socket::detached(self.now);
        socket.attach(handle, peer, rbuf, BASE_INTEREST, self.now);
        socket.set_status(Status::Connected, self.now);

        let mut slot = ConnSlot::new(socket, handler);
        slot.invoke(self, |h, cx| h.on_accepted(cx));
        self.settle(handle, slot);
        Ok(handle)
    }

    // ========================================================================
    // Outbound connect
    // ========================================================================

    /// Resolve `host` and connect. Progress is reported through the
    /// handler: `on_connecting`, then `on_connected`, or
    /// `on_connect_failed` followed by `on_close`.
    pub fn connect(&mut self, host: &str, port: u16, handler: Box<dyn Connection>) {
        let slot = ConnSlot::new(Socket::detached(self.now), handler);
        if let Some(addrs) = literal_addrs(host, QueryType::A) {
            self.finish_connect(slot, addrs.first().copied(), port);
            return;
        }
        let token = self.next_token();
        self.resolves.insert(token, PendingResolve::Connect { slot, port });
        self.start_resolve(host, QueryType::A, token);
    }

    fn finish_connect(&mut self, mut slot: Box<ConnSlot>, addr: Option<IpAddr>, port: u16) {
        let Some(ip) = addr else {
            tracing::debug!(port, "no address to connect to");
            return self.fail_connect(slot);
        };
        let target = SocketAddr::new(ip, port);
        let fd = match sys::tcp_socket(&target) {
            Ok(fd) => fd,
            Err(errno) => {
                tracing::warn!(%target, %errno, "socket failed");
                return self.fail_connect(slot);
            }
        };
        if let Err(errno) = sys::set_keepalive(fd, &self.config.keepalive) {
            tracing::trace!(fd, %errno, "keep-alive not applied");
        }
        let _ = sys::set_nodelay(fd);
        let _ = sys::set_reuse_addr(fd);

        let in_progress = match sys::connect(fd, &target) {
            Ok(()) => false,
            Err(Errno::EINPROGRESS) => true,
            Err(errno) => {
                tracing::debug!(%target, %errno, "connect failed");
                sys::close(fd);
                return self.fail_connect(slot);
            }
        };

        let requested = self.config.read_buffer_size;
        let Some(rbuf) = self.pool.allocate(requested) else {
            sys::close(fd);
            return self.fail_connect(slot);
        };
        // Write interest reports connect completion and drains anything
        // queued before the socket existed.
        let interest = BASE_INTEREST | EV_OUT;
        let handle = match self.register_fd(fd, SocketKind::Connection, Owner::Connection(None), interest) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(%target, error = %e, "cannot register outbound connection");
                sys::close(fd);
                return self.fail_connect(slot);
            }
        };
        slot.socket.attach(handle, Some(target), rbuf, interest, self.now);

        if in_progress {
            slot.socket.begin_connect(self.now);
            slot.invoke(self, |h, cx| h.on_connecting(cx));
        } else {
            slot.socket.set_status(Status::Connected, self.now);
            slot.socket.post(Notice::CONNECTED);
            slot.flush_notices(self);
        }
        self.settle(handle, slot);
    }

    fn fail_connect(&mut self, mut slot: Box<ConnSlot>) {
        slot.socket.post(Notice::CONNECT_FAILED);
        slot.socket.close(self, true);
        slot.flush_notices(self);
        self.retire(slot);
    }

    // ========================================================================
    // DNS
    // ========================================================================

    /// Replace the resolver. Lookups still outstanding on the old one fail.
    pub fn set_resolver(&mut self, resolver: Box<dyn Resolver>) -> Result<()> {
        if let Some(h) = self.resolver_handle.take() {
            self.deregister_fd(h);
        }
        if self.resolver.take().is_some() {
            let orphaned: Vec<u64> = self.resolves.keys().copied().collect();
            for token in orphaned {
                self.complete_resolve(Resolution {
                    token,
                    host: String::new(),
                    qtype: QueryType::A,
                    addrs: Vec::new(),
                });
            }
        }

        if let Some(fd) = resolver.fd() {
            self.resolver_handle = Some(self.register_fd(fd, SocketKind::DnsQuery, Owner::Dns, EV_IN)?);
        }
        if self.dns_tick.is_none() {
            let every = self.config.dns.tick_interval;
            self.dns_tick = Some(self.timers.schedule_repeating(Instant::now(), every, TimerTask::DnsTick));
        }
        self.resolver = Some(resolver);
        Ok(())
    }

    /// Resolve `host`. Literals and `localhost` answer synchronously;
    /// failures answer with an empty slice.
    pub fn resolve<F>(&mut self, host: &str, qtype: QueryType, cb: F)
    where
        F: FnOnce(&mut Reactor, &str, &[IpAddr]) + 'static,
    {
        if let Some(addrs) = literal_addrs(host, qtype) {
            cb(self, host, &addrs);
            return;
        }
        let token = self.next_token();
        self.resolves.insert(token, PendingResolve::Callback(Box::new(cb)));
        self.start_resolve(host, qtype, token);
    }

    fn start_resolve(&mut self, host: &str, qtype: QueryType, token: u64) {
        if self.resolver.is_none() {
            let created = DnsResolver::new(&self.config.dns).and_then(|r| self.set_resolver(Box::new(r)));
            if let Err(e) = created {
                tracing::warn!(host, error = %e, "resolver unavailable");
            }
        }
        let now = self.now;
        let status = match self.resolver.as_mut() {
            Some(r) => r.resolve(host, qtype, token, now),
            None => ResolveStatus::Failed,
        };
        let addrs = match status {
            ResolveStatus::Pending => return,
            ResolveStatus::Ready(addrs) => addrs,
            ResolveStatus::Failed => Vec::new(),
        };
        self.complete_resolve(Resolution {
            token,
            host: host.to_string(),
            qtype,
            addrs,
        });
    }

    fn complete_resolve(&mut self, res: Resolution) {
        let Some(pending) = self.resolves.remove(&res.token) else {
            return;
        };
        match pending {
            PendingResolve::Callback(cb) => cb(self, &res.host, &res.addrs),
            PendingResolve::Connect { slot, port } => {
                if res.addrs.is_empty() {
                    tracing::debug!(host = %res.host, "no address for host");
                }
                self.finish_connect(slot, res.addrs.first().copied(), port)
            }
        }
    }

    fn on_dns_readable(&mut self) {
        let mut done = Vec::new();
        if let Some(r) = self.resolver.as_mut() {
            r.on_readable(self.now, &mut done);
        }
        for res in done {
            self.complete_resolve(res);
        }
    }

    fn on_dns_tick(&mut self) {
        let mut done = Vec::new();
        if let Some(r) = self.resolver.as_mut() {
            r.tick(self.now, &mut done);
        }
        for res in done {
            self.complete_resolve(res);
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Run `f` on this shard after `delay`.
    pub fn schedule_once<F>(&mut self, delay: Duration, f: F) -> TimerId
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        let mut f = Some(f);
        let task = TimerTask::Callback(Box::new(move |r: &mut Reactor| {
            if let Some(f) = f.take() {
                f(r)
            }
        }));
        self.timers.schedule_once(Instant::now(), delay, task)
    }

    /// Run `f` on this shard every `interval` until cancelled.
    pub fn schedule_repeating<F>(&mut self, interval: Duration, f: F) -> TimerId
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.timers
            .schedule_repeating(Instant::now(), interval, TimerTask::Callback(Box::new(f)))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id, Instant::now())
    }

    fn fire_timers(&mut self) {
        self.timers.acknowledge();
        self.now = Instant::now();
        for id in self.timers.pop_due(self.now) {
            let Some(mut task) = self.timers.take_task(id) else {
                continue;
            };
            match &mut task {
                TimerTask::IdleSweep => self.sweep_idle(),
                TimerTask::StalledSweep => self.sweep_stalled(),
                TimerTask::ReclaimFlush => {
                    self.reclaim.flush_at(self.now);
                }
                TimerTask::DnsTick => self.on_dns_tick(),
                TimerTask::Callback(f) => f(self),
            }
            self.timers.restore_task(id, task);
        }
        self.timers.rearm(Instant::now());
    }

    /// Gracefully close connections idle for `idle_timeout`.
    fn sweep_idle(&mut self) {
        let timeout = self.config.idle_timeout;
        let now = self.now;
        let mut closed = 0usize;
        for h in self.table.active_handles() {
            self.with_slot(h, |slot, reactor| {
                let s = &mut slot.socket;
                if s.status() == Status::Connected && now.saturating_duration_since(s.last_active()) >= timeout {
                    s.close(reactor, false);
                    closed += 1;
                }
            });
        }
        if closed > 0 {
            tracing::debug!(shard = self.shard, closed, "idle connections closed");
        }
    }

    /// Force close connections stuck connecting or draining.
    fn sweep_stalled(&mut self) {
        let (connect_timeout, closing_timeout) = (self.config.connect_timeout, self.config.closing_timeout);
        let now = self.now;
        for h in self.table.active_handles() {
            self.with_slot(h, |slot, reactor| {
                let s = &mut slot.socket;
                let age = now.saturating_duration_since(s.status_since());
                match s.status() {
                    Status::Connecting if age >= connect_timeout => {
                        tracing::debug!(fd = s.fd(), "connect timed out");
                        s.post(Notice::CONNECT_FAILED);
                        s.close(reactor, true);
                    }
                    Status::Closing if age >= closing_timeout => {
                        tracing::debug!(fd = s.fd(), queued = s.queued_bytes(), "close timed out");
                        if s.is_connecting() {
                            s.post(Notice::CONNECT_FAILED);
                        }
                        s.close(reactor, true);
                    }
                    _ => {}
                }
            });
        }
    }

    // ========================================================================
    // Inbox and shutdown
    // ========================================================================

    fn drain_inbox(&mut self) {
        sys::drain_counter(self.inbox.wake.as_raw_fd());
        let inbox = Arc::clone(&self.inbox);
        while let Some(cmd) = inbox.queue.pop() {
            cmd(self);
        }
    }

    /// Stop accepting, close every connection gracefully, give them
    /// `shutdown_grace` to drain, then force close whatever is left.
    pub fn shutdown(&mut self) {
        self.stop_listeners();
        for h in self.table.active_handles() {
            self.close(h, false);
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.table.active_len() > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            if let Err(e) = self.poll_once(wait) {
                tracing::warn!(shard = self.shard, error = %e, "poll failed during shutdown");
                break;
            }
        }

        let stragglers = self.table.active_handles();
        if !stragglers.is_empty() {
            tracing::info!(shard = self.shard, count = stragglers.len(), "forcing close after grace period");
        }
        for h in stragglers {
            self.close(h, true);
        }

        let pending: Vec<PendingResolve> = self.resolves.drain().map(|(_, p)| p).collect();
        for p in pending {
            if let PendingResolve::Connect { slot, .. } = p {
                self.fail_connect(slot);
            }
        }
        self.reclaim.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn small_config() -> ReactorConfig {
        ReactorConfig::new()
            .max_fds(4096)
            .pool_size(4 * 1024 * 1024)
            .shutdown_grace(Duration::from_millis(200))
    }

    struct Log(Rc<RefCell<Vec<String>>>);

    impl Connection for Log {
        fn on_data(&mut self, _cx: &mut SocketCtx<'_>, data: &[u8]) {
            self.0.borrow_mut().push(format!("data:{}", data.len()));
        }
        fn on_accepted(&mut self, _cx: &mut SocketCtx<'_>) {
            self.0.borrow_mut().push("accepted".into());
        }
        fn on_connect_failed(&mut self, _cx: &mut SocketCtx<'_>) {
            self.0.borrow_mut().push("connect_failed".into());
        }
        fn on_close(&mut self, _cx: &mut SocketCtx<'_>) {
            self.0.borrow_mut().push("close".into());
        }
    }

    #[test]
    fn test_inbox_command_runs_on_shard() {
        let mut r = Reactor::new(small_config(), 3).unwrap();
        let inbox = r.inbox();
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        inbox
            .submit(Box::new(move |r: &mut Reactor| {
                assert_eq!(r.shard(), 3);
                flag.store(true, Ordering::Release);
            }))
            .unwrap();
        r.poll_once(Duration::from_millis(100)).unwrap();
        assert!(hit.load(Ordering::Acquire));
    }

    #[test]
    fn test_inbox_full() {
        let cfg = small_config();
        let r = Reactor::new(ReactorConfig { inbox_capacity: 1, ..cfg }, 0).unwrap();
        let inbox = r.inbox();
        inbox.submit(Box::new(|_| {})).unwrap();
        assert!(matches!(inbox.submit(Box::new(|_| {})), Err(Error::InboxFull(0))));
    }

    #[test]
    fn test_timer_callback_fires() {
        let mut r = Reactor::new(small_config(), 0).unwrap();
        let hits = Rc::new(RefCell::new(0));
        let h = Rc::clone(&hits);
        r.schedule_once(Duration::from_millis(5), move |_| *h.borrow_mut() += 1);
        let cancelled = r.schedule_once(Duration::from_millis(5), |_| panic!("cancelled timer ran"));
        assert!(r.cancel_timer(cancelled));

        let deadline = Instant::now() + Duration::from_secs(2);
        while *hits.borrow() == 0 && Instant::now() < deadline {
            r.poll_once(Duration::from_millis(20)).unwrap();
        }
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_adopt_delivers_data_and_close_once() {
        let mut r = Reactor::new(small_config(), 0).unwrap();
        let (a, b) = sys::stream_pair().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let h = r.adopt(a, None, Box::new(Log(Rc::clone(&log)))).unwrap();
        assert_eq!(r.connection_count(), 1);
        assert_eq!(r.status(h), Some(Status::Connected));

        sys::send(b, b"hello").unwrap();
        r.poll_once(Duration::from_millis(100)).unwrap();
        sys::close(b);
        for _ in 0..5 {
            r.poll_once(Duration::from_millis(20)).unwrap();
        }
        assert_eq!(*log.borrow(), vec!["accepted", "data:5", "close"]);
        assert_eq!(r.connection_count(), 0);
        assert!(r.status(h).is_none());
        assert!(!r.close(h, true));
    }

    #[test]
    fn test_connect_refused_reports_failure_then_close() {
        let mut r = Reactor::new(small_config(), 0).unwrap();
        // Bind then drop a listener to find a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let log = Rc::new(RefCell::new(Vec::new()));
        r.connect("127.0.0.1", port, Box::new(Log(Rc::clone(&log))));

        let deadline = Instant::now() + Duration::from_secs(2);
        while log.borrow().is_empty() && Instant::now() < deadline {
            r.poll_once(Duration::from_millis(20)).unwrap();
        }
        assert_eq!(*log.borrow(), vec!["connect_failed", "close"]);
    }

    /// Queues a message and closes gracefully before the connect completes.
    struct SendThenClose(Rc<RefCell<Vec<String>>>);

    impl Connection for SendThenClose {
        fn on_data(&mut self, _cx: &mut SocketCtx<'_>, _data: &[u8]) {}
        fn on_connecting(&mut self, cx: &mut SocketCtx<'_>) {
            assert!(cx.send(b"hello"));
            cx.close();
            self.0.borrow_mut().push(format!("{:?}", cx.status()));
        }
        fn on_connected(&mut self, _cx: &mut SocketCtx<'_>) {
            self.0.borrow_mut().push("connected".into());
        }
        fn on_connect_failed(&mut self, _cx: &mut SocketCtx<'_>) {
            self.0.borrow_mut().push("connect_failed".into());
        }
        fn on_close(&mut self, _cx: &mut SocketCtx<'_>) {
            self.0.borrow_mut().push("close".into());
        }
    }

    #[test]
    fn test_close_while_connecting_still_confirms_connect() {
        use std::io::Read;

        let mut r = Reactor::new(small_config(), 0).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Rc::new(RefCell::new(Vec::new()));
        r.connect("127.0.0.1", port, Box::new(SendThenClose(Rc::clone(&log))));

        let deadline = Instant::now() + Duration::from_secs(2);
        while r.connection_count() > 0 && Instant::now() < deadline {
            r.poll_once(Duration::from_millis(20)).unwrap();
        }
        assert_eq!(*log.borrow(), vec!["Closing", "connected", "close"]);

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn test_resolve_literal_is_synchronous() {
        let mut r = Reactor::new(small_config(), 0).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = Rc::clone(&got);
        r.resolve("localhost", QueryType::A, move |_, host, addrs| {
            assert_eq!(host, "localhost");
            g.borrow_mut().extend_from_slice(addrs);
        });
        assert_eq!(*got.borrow(), vec![IpAddr::from([127, 0, 0, 1])]);
    }
}
