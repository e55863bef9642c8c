//! # muxline-core
//!
//! Platform-agnostic building blocks shared by the reactor and the tunnel.
//!
//! ## Modules
//!
//! - `pool` - per-shard slab buffer pool
//! - `send_queue` - pooled outbound byte queue with size/count accounting
//! - `reclaim` - age and size gated deferred destruction
//! - `config` - reactor configuration
//! - `error` - error types
//! - `env` - environment variable utilities
//! - `logging` - tracing subscriber bootstrap

pub mod config;
pub mod env;
pub mod error;
pub mod logging;
pub mod pool;
pub mod reclaim;
pub mod send_queue;

// Re-exports for convenience
pub use config::{DnsConfig, KeepAlive, ReactorConfig};
pub use env::{env_get, env_get_bool, env_get_bytes, env_get_duration_ms, env_get_opt};
pub use error::{Error, Result};
pub use pool::{BufferPool, PoolBuf, PoolStats};
pub use reclaim::DeferredReclaimList;
pub use send_queue::PooledSendQueue;

/// Sizing constants
pub mod constants {
    /// Per-connection read buffer (one slab)
    pub const READ_BUFFER_SIZE: usize = 8 * 1024;

    /// Queued bytes above which a socket stops reading
    pub const BACKPRESSURE_CEILING: usize = 128 * 1024;

    /// Queued bytes at or below which reading resumes
    pub const LOW_WATERMARK: usize = 64 * 1024;

    /// Upper bound on bytes per vectored write
    pub const MAX_BATCH_BYTES: usize = 256 * 1024;

    /// Events fetched per epoll_wait
    pub const MAX_EVENTS: usize = 1024;

    pub const LISTEN_BACKLOG: i32 = 4096;

    /// Default buffer pool budget (64 MB)
    pub const DEFAULT_POOL_SIZE: usize = 64 * 1024 * 1024;

    /// Smallest pool block
    pub const MIN_POOL_BLOCK: usize = 256;

    /// Largest pool block; bigger payloads span several blocks
    pub const MAX_POOL_BLOCK: usize = 256 * 1024;

    /// Retired objects tolerated before the reclaim list flushes
    pub const RECLAIM_THRESHOLD: usize = 1024;
}
