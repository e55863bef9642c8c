//! Reactor configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::constants::*;
use crate::env::{env_get, env_get_bool, env_get_bytes, env_get_duration_ms};

/// TCP keep-alive probing applied to outbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Idle time before the first probe
    pub idle: Duration,
    /// Interval between probes
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped
    pub probes: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(240),
            interval: Duration::from_secs(30),
            probes: 4,
        }
    }
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Timeout of the first attempt; doubles on every retry
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Upper bound on how long an answer stays cached
    pub cache_ttl: Duration,
    /// Maximum cached (host, type) entries
    pub cache_capacity: usize,
    /// Maximum queries waiting for an answer
    pub max_inflight: usize,
    /// How often timeouts are checked
    pub tick_interval: Duration,
    /// Explicit nameservers; empty means read /etc/resolv.conf
    pub nameservers: Vec<SocketAddr>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_retries: 3,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1024,
            max_inflight: 256,
            tick_interval: Duration::from_millis(200),
            nameservers: Vec::new(),
        }
    }
}

/// Configuration for one reactor (one shard).
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Events fetched per wait
    pub max_events: usize,

    /// Wait timeout, bounds how late a stop request is observed
    pub poll_timeout: Duration,

    /// Socket table capacity; 0 means the soft RLIMIT_NOFILE
    pub max_fds: usize,

    /// Byte budget of the buffer pool arena
    pub pool_size: usize,

    /// Per-connection read buffer size
    pub read_buffer_size: usize,

    /// Queued bytes above which reads are paused
    pub backpressure_ceiling: usize,

    /// Queued bytes at or below which paused reads resume
    pub low_watermark: usize,

    /// Upper bound on bytes handed to one vectored write
    pub max_batch_bytes: usize,

    /// listen(2) backlog
    pub listen_backlog: i32,

    /// Destroy closed connections through the age-gated reclaim list.
    /// When off, everything retired is dropped on the next idle tick.
    pub deferred_reclaim: bool,

    /// Retired objects tolerated before `flush` reclaims anything
    pub reclaim_threshold: usize,

    /// Minimum age before a retired object is reclaimed
    pub reclaim_max_age: Duration,

    /// Period of the reclaim flush timer
    pub reclaim_interval: Duration,

    /// Inactivity after which a connection is closed; zero disables
    pub idle_timeout: Duration,

    /// Period of the idle sweep
    pub idle_sweep_interval: Duration,

    /// Period of the stalled-connection sweep
    pub stalled_sweep_interval: Duration,

    /// Longest a graceful close may wait for its queue to drain
    pub closing_timeout: Duration,

    /// Longest an outbound connect may stay in progress
    pub connect_timeout: Duration,

    /// Longest shutdown waits for connections to finish closing
    pub shutdown_grace: Duration,

    /// Capacity of the cross-thread command inbox
    pub inbox_capacity: usize,

    pub keepalive: KeepAlive,

    pub dns: DnsConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_events: MAX_EVENTS,
            poll_timeout: Duration::from_millis(1000),
            max_fds: 0,
            pool_size: DEFAULT_POOL_SIZE,
            read_buffer_size: READ_BUFFER_SIZE,
            backpressure_ceiling: BACKPRESSURE_CEILING,
            low_watermark: LOW_WATERMARK,
            max_batch_bytes: MAX_BATCH_BYTES,
            listen_backlog: LISTEN_BACKLOG,
            deferred_reclaim: true,
            reclaim_threshold: RECLAIM_THRESHOLD,
            reclaim_max_age: Duration::from_secs(10),
            reclaim_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            idle_sweep_interval: Duration::from_secs(30),
            stalled_sweep_interval: Duration::from_secs(10),
            closing_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            inbox_capacity: 1024,
            keepalive: KeepAlive::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `MUXLINE_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `MUXLINE_MAX_EVENTS` | `max_events` |
    /// | `MUXLINE_MAX_FDS` | `max_fds` |
    /// | `MUXLINE_POOL_SIZE` | `pool_size` (accepts K/M/G) |
    /// | `MUXLINE_READ_BUFFER` | `read_buffer_size` |
    /// | `MUXLINE_BACKPRESSURE` | `backpressure_ceiling` |
    /// | `MUXLINE_LOW_WATERMARK` | `low_watermark` |
    /// | `MUXLINE_DEFERRED_RECLAIM` | `deferred_reclaim` |
    /// | `MUXLINE_IDLE_TIMEOUT_MS` | `idle_timeout` |
    /// | `MUXLINE_CONNECT_TIMEOUT_MS` | `connect_timeout` |
    /// | `MUXLINE_DNS_TIMEOUT_MS` | `dns.timeout` |
    /// | `MUXLINE_DNS_RETRIES` | `dns.max_retries` |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_events: env_get("MUXLINE_MAX_EVENTS", d.max_events),
            max_fds: env_get("MUXLINE_MAX_FDS", d.max_fds),
            pool_size: env_get_bytes("MUXLINE_POOL_SIZE", d.pool_size),
            read_buffer_size: env_get_bytes("MUXLINE_READ_BUFFER", d.read_buffer_size),
            backpressure_ceiling: env_get_bytes("MUXLINE_BACKPRESSURE", d.backpressure_ceiling),
            low_watermark: env_get_bytes("MUXLINE_LOW_WATERMARK", d.low_watermark),
            deferred_reclaim: env_get_bool("MUXLINE_DEFERRED_RECLAIM", d.deferred_reclaim),
            idle_timeout: env_get_duration_ms("MUXLINE_IDLE_TIMEOUT_MS", d.idle_timeout),
            connect_timeout: env_get_duration_ms("MUXLINE_CONNECT_TIMEOUT_MS", d.connect_timeout),
            dns: DnsConfig {
                timeout: env_get_duration_ms("MUXLINE_DNS_TIMEOUT_MS", d.dns.timeout),
                max_retries: env_get("MUXLINE_DNS_RETRIES", d.dns.max_retries),
                ..d.dns
            },
            ..d
        }
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn max_fds(mut self, n: usize) -> Self {
        self.max_fds = n;
        self
    }

    pub fn pool_size(mut self, bytes: usize) -> Self {
        self.pool_size = bytes;
        self
    }

    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Set both backpressure thresholds
    pub fn watermarks(mut self, ceiling: usize, low: usize) -> Self {
        self.backpressure_ceiling = ceiling;
        self.low_watermark = low;
        self
    }

    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.max_batch_bytes = bytes;
        self
    }

    pub fn deferred_reclaim(mut self, enable: bool) -> Self {
        self.deferred_reclaim = enable;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn closing_timeout(mut self, d: Duration) -> Self {
        self.closing_timeout = d;
        self
    }

    pub fn shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }

    pub fn dns(mut self, dns: DnsConfig) -> Self {
        self.dns = dns;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_events == 0 {
            return Err("max_events must be at least 1");
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be non-zero");
        }
        if self.read_buffer_size > MAX_POOL_BLOCK {
            return Err("read_buffer_size exceeds the largest pool block");
        }
        if self.pool_size < self.read_buffer_size {
            return Err("pool_size must hold at least one read buffer");
        }
        if self.low_watermark >= self.backpressure_ceiling {
            return Err("low_watermark must be below backpressure_ceiling");
        }
        if self.max_batch_bytes == 0 {
            return Err("max_batch_bytes must be non-zero");
        }
        if self.inbox_capacity == 0 {
            return Err("inbox_capacity must be at least 1");
        }
        if self.dns.max_inflight == 0 || self.dns.cache_capacity == 0 {
            return Err("dns pools must be non-empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ReactorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_watermark_order_enforced() {
        let cfg = ReactorConfig::new().watermarks(64 * 1024, 64 * 1024);
        assert_eq!(
            cfg.validate(),
            Err("low_watermark must be below backpressure_ceiling")
        );
    }

    #[test]
    fn test_builder_chain() {
        let cfg = ReactorConfig::new()
            .max_events(16)
            .pool_size(1 << 20)
            .deferred_reclaim(false)
            .idle_timeout(Duration::ZERO);
        assert_eq!(cfg.max_events, 16);
        assert_eq!(cfg.pool_size, 1 << 20);
        assert!(!cfg.deferred_reclaim);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("MUXLINE_POOL_SIZE", "2M");
        std::env::set_var("MUXLINE_DNS_RETRIES", "5");
        let cfg = ReactorConfig::from_env();
        assert_eq!(cfg.pool_size, 2 << 20);
        assert_eq!(cfg.dns.max_retries, 5);
        assert_eq!(cfg.max_events, MAX_EVENTS);
        std::env::remove_var("MUXLINE_POOL_SIZE");
        std::env::remove_var("MUXLINE_DNS_RETRIES");
    }
}
