//! Environment variable utilities
//!
//! Every tunable in [`ReactorConfig`](crate::config::ReactorConfig) can be
//! overridden from the environment with a `MUXLINE_` prefixed variable.
//!
//! # Usage
//!
//! ```ignore
//! use muxline_core::env::{env_get, env_get_bool, env_get_duration_ms};
//!
//! let events: usize = env_get("MUXLINE_MAX_EVENTS", 1024);
//! let deferred = env_get_bool("MUXLINE_DEFERRED_RECLAIM", true);
//! let idle = env_get_duration_ms("MUXLINE_IDLE_TIMEOUT_MS", Duration::from_secs(300));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default.
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) are true, anything else set
/// is false, unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a duration expressed in milliseconds.
#[inline]
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Get a byte size. Accepts a plain number or a `K`/`M`/`G` suffix
/// (binary multiples), e.g. `64M`.
pub fn env_get_bytes(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bytes(&v))
        .unwrap_or(default)
}

fn parse_bytes(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, shift) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 10),
        'm' | 'M' => (&raw[..raw.len() - 1], 20),
        'g' | 'G' => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}

// ============================================================================
// Tests
// ============================================================================
