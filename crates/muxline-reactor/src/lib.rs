//! # muxline-reactor
//!
//! Sharded, edge-triggered epoll reactor.
//!
//! Each shard is one thread running one [`Reactor`]: an epoll instance, a
//! generation-checked [`SocketTable`], a slab [`BufferPool`](muxline_core::BufferPool),
//! a timerfd-driven [`TimerManager`] and a UDP [`DnsResolver`]. Connections
//! are [`Socket`] state machines owned by the shard that accepted or opened
//! them; application code implements [`Connection`] and reacts to callbacks.
//!
//! ## Modules
//!
//! - `table` - fd-indexed records with generation tags, epoll event keys
//! - `socket` - per-connection state machine, send path, backpressure
//! - `connection` - handler trait and callback context
//! - `reactor` - event loop, accept, connect, sweeps, shutdown
//! - `timer` - timerfd-backed one-shot and repeating timers
//! - `dns` - asynchronous resolver with cache and retries
//! - `server` - one reactor thread per shard behind SO_REUSEPORT
//! - `sys` - thin syscall wrappers

pub mod connection;
pub mod dns;
pub mod reactor;
pub mod server;
pub mod socket;
pub mod sys;
pub mod table;
pub mod timer;

pub use connection::{AcceptContext, Connection, SocketCtx};
pub use dns::{DnsResolver, QueryType, Resolution, ResolveStatus, Resolver};
pub use reactor::{Acceptor, Command, Inbox, Reactor};
pub use server::{ConnectionFactory, Server};
pub use socket::{Socket, Status};
pub use table::{EventKey, SocketHandle, SocketKind, SocketTable};
pub use timer::{TimerId, TimerManager};

pub use muxline_core::{Error, ReactorConfig, Result};
