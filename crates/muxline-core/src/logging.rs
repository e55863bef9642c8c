//! Logging bootstrap.
//!
//! The library crates only emit `tracing` events; binaries call [`init`]
//! once to install a stderr subscriber.
//!
//! Filter resolution order: `MUXLINE_LOG`, then `RUST_LOG`, then `info`.
//!
//! ```bash
//! MUXLINE_LOG=debug ./tunnel-server 0.0.0.0:7000
//! MUXLINE_LOG=muxline_tunnel=trace,info ./tunnel-client 127.0.0.1:7000
//! ```

use tracing_subscriber::EnvFilter;

/// Environment variable consulted first for the log filter.
pub const LOG_ENV: &str = "MUXLINE_LOG";

/// Install the global fmt subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
