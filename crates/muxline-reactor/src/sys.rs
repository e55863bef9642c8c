//! Thin wrappers over the Linux syscalls the reactor needs.
//!
//! Everything returns `Result<_, Errno>`; callers decide which errnos are
//! transient. All sockets are created non-blocking and close-on-exec.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use muxline_core::KeepAlive;
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};

pub type SysResult<T> = Result<T, Errno>;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Upper bound on iovecs per sendmsg.
        pub fn iov_max() -> usize {
            let n = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
            if n > 0 { n as usize } else { 1024 }
        }
    } else {
        pub fn iov_max() -> usize {
            1024
        }
    }
}

#[inline]
fn cvt(ret: libc::c_int) -> SysResult<libc::c_int> {
    Errno::result(ret)
}

#[inline]
fn cvt_size(ret: libc::ssize_t) -> SysResult<usize> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as usize)
    }
}

/// Soft RLIMIT_NOFILE, used to size the socket table.
pub fn fd_limit() -> usize {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) if soft != libc::RLIM_INFINITY => soft as usize,
        _ => 65536,
    }
}

// ============================================================================
// Socket addresses
// ============================================================================

pub fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn family_of(addr: &SocketAddr) -> libc::c_int {
    match addr.ip() {
        IpAddr::V4(_) => libc::AF_INET,
        IpAddr::V6(_) => libc::AF_INET6,
    }
}

// ============================================================================
// Socket options
// ============================================================================

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> SysResult<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    cvt(ret).map(drop)
}

pub fn set_nodelay(fd: RawFd) -> SysResult<()> {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

pub fn set_reuse_addr(fd: RawFd) -> SysResult<()> {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

pub fn set_reuse_port(fd: RawFd) -> SysResult<()> {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
}

pub fn set_keepalive(fd: RawFd, ka: &KeepAlive) -> SysResult<()> {
    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, ka.idle.as_secs() as libc::c_int)?;
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, ka.interval.as_secs() as libc::c_int)?;
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, ka.probes as libc::c_int)
}

/// Read and clear SO_ERROR. `Ok(None)` means no pending error.
pub fn take_socket_error(fd: RawFd) -> SysResult<Option<Errno>> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    cvt(ret)?;
    Ok((err != 0).then(|| Errno::from_raw(err)))
}

pub fn local_addr(fd: RawFd) -> SysResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    cvt(ret)?;
    from_sockaddr(&storage).ok_or(Errno::EAFNOSUPPORT)
}

// ============================================================================
// TCP
// ============================================================================

pub fn tcp_socket(addr: &SocketAddr) -> SysResult<RawFd> {
    let fd = unsafe {
        libc::socket(
            family_of(addr),
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    cvt(fd)
}

/// Bound, listening, non-blocking socket with SO_REUSEADDR and SO_REUSEPORT
/// so every shard can bind the same address.
pub fn tcp_listener(addr: &SocketAddr, backlog: i32) -> SysResult<RawFd> {
    let fd = tcp_socket(addr)?;
    let setup = || -> SysResult<()> {
        set_reuse_addr(fd)?;
        set_reuse_port(fd)?;
        let (storage, len) = to_sockaddr(addr);
        cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
        cvt(unsafe { libc::listen(fd, backlog) })?;
        Ok(())
    };
    if let Err(e) = setup() {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Accept one pending connection as a non-blocking fd.
pub fn accept(listener: RawFd) -> SysResult<(RawFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(
            listener,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    let fd = cvt(fd)?;
    Ok((fd, from_sockaddr(&storage)))
}

/// Start a connect. `Err(EINPROGRESS)` is the normal non-blocking outcome.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> SysResult<()> {
    let (storage, len) = to_sockaddr(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    cvt(ret).map(drop)
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> SysResult<usize> {
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    cvt_size(ret)
}

/// Non-destructive one byte read; `Ok(0)` means the peer finished sending.
pub fn peek_one(fd: RawFd) -> SysResult<usize> {
    let mut byte = 0u8;
    let ret = unsafe {
        libc::recv(
            fd,
            &mut byte as *mut u8 as *mut libc::c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    cvt_size(ret)
}

pub fn send(fd: RawFd, buf: &[u8]) -> SysResult<usize> {
    let ret = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
        )
    };
    cvt_size(ret)
}

/// Gather-write `iov` in one sendmsg.
pub fn send_vectored(fd: RawFd, iov: &[libc::iovec]) -> SysResult<usize> {
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;
    let ret = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT) };
    cvt_size(ret)
}

#[inline]
pub fn iovec(part: &[u8]) -> libc::iovec {
    libc::iovec {
        iov_base: part.as_ptr() as *mut libc::c_void,
        iov_len: part.len(),
    }
}

pub fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub fn close(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Non-blocking AF_UNIX stream pair, used by tests and in-process tunnels.
pub fn stream_pair() -> SysResult<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    cvt(ret)?;
    Ok((fds[0], fds[1]))
}

// ============================================================================
// UDP
// ============================================================================

pub fn udp_socket_v4() -> SysResult<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    Ok(unsafe { OwnedFd::from_raw_fd(cvt(fd)?) })
}

pub fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr) -> SysResult<usize> {
    let (storage, len) = to_sockaddr(addr);
    let ret = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    cvt_size(ret)
}

pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> SysResult<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    let n = cvt_size(ret)?;
    Ok((n, from_sockaddr(&storage)))
}

// ============================================================================
// epoll / eventfd / timerfd
// ============================================================================

pub fn epoll_create() -> SysResult<OwnedFd> {
    let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn epoll_ctl(epfd: &OwnedFd, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> SysResult<()> {
    let mut ev = libc::epoll_event { events, u64: key };
    cvt(unsafe { libc::epoll_ctl(epfd.as_raw_fd(), op, fd, &mut ev) }).map(drop)
}

pub fn epoll_wait(epfd: &OwnedFd, events: &mut [libc::epoll_event], timeout: Duration) -> SysResult<usize> {
    let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let n = unsafe {
        libc::epoll_wait(epfd.as_raw_fd(), events.as_mut_ptr(), events.len() as libc::c_int, ms)
    };
    Ok(cvt(n)? as usize)
}

pub fn eventfd() -> SysResult<OwnedFd> {
    let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bump an eventfd counter. A saturated counter already means "wake".
pub fn eventfd_signal(fd: RawFd) -> SysResult<()> {
    let val: u64 = 1;
    let ret = unsafe { libc::write(fd, &val as *const u64 as *const libc::c_void, 8) };
    match cvt_size(ret) {
        Ok(_) | Err(Errno::EAGAIN) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read and reset an eventfd or timerfd counter.
pub fn drain_counter(fd: RawFd) -> u64 {
    let mut val: u64 = 0;
    let ret = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
    if ret == 8 {
        val
    } else {
        0
    }
}

pub fn timerfd() -> SysResult<OwnedFd> {
    let fd = cvt(unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// One-shot arm after `delay`; `None` disarms.
pub fn timerfd_arm(fd: &OwnedFd, delay: Option<Duration>) -> SysResult<()> {
    let value = match delay {
        // A zero it_value disarms, so round up to one nanosecond.
        Some(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos().max(if d.as_secs() == 0 { 1 } else { 0 }) as libc::c_long,
        },
        None => libc::timespec { tv_sec: 0, tv_nsec: 0 },
    };
    let spec = libc::itimerspec {
        it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        it_value: value,
    };
    cvt(unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) }).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip() {
        for s in ["127.0.0.1:8080", "[::1]:443", "10.1.2.3:0"] {
            let addr: SocketAddr = s.parse().unwrap();
            let (storage, _) = to_sockaddr(&addr);
            assert_eq!(from_sockaddr(&storage), Some(addr));
        }
    }

    #[test]
    fn test_stream_pair_send_recv_peek() {
        let (a, b) = stream_pair().unwrap();
        assert_eq!(recv(b, &mut [0u8; 4]), Err(Errno::EAGAIN));

        let iov = [iovec(b"he"), iovec(b"llo")];
        assert_eq!(send_vectored(a, &iov), Ok(5));
        assert_eq!(peek_one(b), Ok(1));

        let mut buf = [0u8; 16];
        assert_eq!(recv(b, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");

        shutdown_write(a);
        assert_eq!(peek_one(b), Ok(0));
        close(a);
        close(b);
    }

    #[test]
    fn test_eventfd_counter() {
        let efd = eventfd().unwrap();
        eventfd_signal(efd.as_raw_fd()).unwrap();
        eventfd_signal(efd.as_raw_fd()).unwrap();
        assert_eq!(drain_counter(efd.as_raw_fd()), 2);
        assert_eq!(drain_counter(efd.as_raw_fd()), 0);
    }

    #[test]
    fn test_listener_reports_bound_port() {
        let fd = tcp_listener(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = local_addr(fd).unwrap();
        assert_ne!(addr.port(), 0);
        close(fd);
    }

    #[test]
    fn test_fd_limit_positive() {
        assert!(fd_limit() > 0);
        assert!(iov_max() >= 16);
    }
}
