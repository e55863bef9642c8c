//! # muxline-tunnel
//!
//! Many independent byte streams over one ordered, reliable transport.
//!
//! Every frame carries a 12-byte header (see [`frame`]). Streams are opened
//! with SYN, answered with ACK, half-closed with FIN and reset with RST.
//! Each direction of each stream has its own window: senders never exceed
//! it, receivers widen it with window updates once the application
//! acknowledges consumed bytes. Ping and GoAway are connection-level.
//!
//! ## Modules
//!
//! - `frame` - header codec, frame types, flags, go-away codes
//! - `stream` - stream record and handler traits
//! - `mux` - protocol engine and frame reassembly, independent of I/O
//! - `tunnel` - reactor [`Connection`](muxline_reactor::Connection) running a multiplexer
//! - `config` - window and frame sizing

pub mod config;
pub mod frame;
pub mod mux;
pub mod stream;
pub mod tunnel;

pub use config::MuxConfig;
pub use frame::{Flags, FrameError, FrameType, GoAwayCode, Header, HEADER_SIZE, PROTOCOL_VERSION};
pub use mux::{Multiplexer, MuxError, Role, StreamCtx, Transport};
pub use stream::{Stream, StreamAcceptor, StreamHandler, StreamId};
pub use tunnel::{TunnelConnection, TunnelEvents};
