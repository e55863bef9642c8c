//! Multiplexer configuration

use muxline_core::constants::MAX_POOL_BLOCK;
use muxline_core::{env_get, env_get_bool, env_get_bytes};

use crate::frame::HEADER_SIZE;

/// Per-stream window a peer starts with
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Acknowledged bytes batched before a window update is sent
pub const WINDOW_UPDATE_THRESHOLD: u32 = 8 * 1024;

/// Initial size of the fragment buffer
pub const PARSE_BUFFER_SIZE: usize = 8 * 1024;

/// Largest Data payload accepted or produced
pub const MAX_FRAME_PAYLOAD: usize = 128 * 1024;

/// Budget of a multiplexer's own buffer pool
pub const DEFAULT_POOL_BUDGET: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub initial_window: u32,

    pub window_update_threshold: u32,

    pub parse_buffer_size: usize,

    /// Frames announcing more payload than this are a protocol error;
    /// outbound data is chunked to it.
    pub max_frame_payload: usize,

    /// Acknowledge every delivered payload right after its data callback
    /// instead of waiting for `try_send_window_update`.
    pub auto_acknowledge: bool,

    /// Byte budget for pending stream data and fragments
    pub pool_budget: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_window: INITIAL_WINDOW,
            window_update_threshold: WINDOW_UPDATE_THRESHOLD,
            parse_buffer_size: PARSE_BUFFER_SIZE,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            auto_acknowledge: false,
            pool_budget: DEFAULT_POOL_BUDGET,
        }
    }
}

impl MuxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `MUXLINE_MUX_*` environment variables:
    /// `INITIAL_WINDOW`, `UPDATE_THRESHOLD`, `MAX_PAYLOAD` (all accept
    /// K/M/G), `AUTO_ACK`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            initial_window: env_get_bytes("MUXLINE_MUX_INITIAL_WINDOW", d.initial_window as usize)
                .min(u32::MAX as usize) as u32,
            window_update_threshold: env_get_bytes(
                "MUXLINE_MUX_UPDATE_THRESHOLD",
                d.window_update_threshold as usize,
            )
            .min(u32::MAX as usize) as u32,
            max_frame_payload: env_get_bytes("MUXLINE_MUX_MAX_PAYLOAD", d.max_frame_payload),
            auto_acknowledge: env_get_bool("MUXLINE_MUX_AUTO_ACK", d.auto_acknowledge),
            pool_budget: env_get("MUXLINE_MUX_POOL_BUDGET", d.pool_budget),
            ..d
        }
    }

    pub fn initial_window(mut self, bytes: u32) -> Self {
        self.initial_window = bytes;
        self
    }

    pub fn window_update_threshold(mut self, bytes: u32) -> Self {
        self.window_update_threshold = bytes;
        self
    }

    pub fn max_frame_payload(mut self, bytes: usize) -> Self {
        self.max_frame_payload = bytes;
        self
    }

    pub fn auto_acknowledge(mut self, enable: bool) -> Self {
        self.auto_acknowledge = enable;
        self
    }

    pub fn pool_budget(mut self, bytes: usize) -> Self {
        self.pool_budget = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_window == 0 {
            return Err("initial_window must be non-zero");
        }
        if self.window_update_threshold == 0 || self.window_update_threshold > self.initial_window {
            return Err("window_update_threshold must be within the initial window");
        }
        if self.max_frame_payload == 0 || self.max_frame_payload + HEADER_SIZE > MAX_POOL_BLOCK {
            return Err("max_frame_payload must fit one pool block with its header");
        }
        if self.parse_buffer_size < HEADER_SIZE || self.parse_buffer_size > MAX_POOL_BLOCK {
            return Err("parse_buffer_size must hold a header and fit one pool block");
        }
        if self.pool_budget < self.parse_buffer_size {
            return Err("pool_budget too small");
        }
        Ok(())
    }

    /// Nearest configuration that passes `validate`.
    pub fn clamped(mut self) -> Self {
        self.max_frame_payload = self.max_frame_payload.clamp(1, MAX_POOL_BLOCK - HEADER_SIZE);
        self.parse_buffer_size = self.parse_buffer_size.clamp(HEADER_SIZE, MAX_POOL_BLOCK);
        self.initial_window = self.initial_window.max(1);
        self.window_update_threshold = self.window_update_threshold.clamp(1, self.initial_window);
        self.pool_budget = self.pool_budget.max(self.parse_buffer_size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MuxConfig::default();
        assert_eq!(cfg.initial_window, 256 * 1024);
        assert_eq!(cfg.window_update_threshold, 8 * 1024);
        assert_eq!(cfg.max_frame_payload, 128 * 1024);
        assert!(!cfg.auto_acknowledge);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_frames() {
        let cfg = MuxConfig::new().max_frame_payload(MAX_POOL_BLOCK);
        assert!(cfg.validate().is_err());
        let cfg = MuxConfig::new().initial_window(1024).window_update_threshold(2048);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_clamped_is_valid() {
        let cfg = MuxConfig::new()
            .initial_window(0)
            .window_update_threshold(4096)
            .max_frame_payload(MAX_POOL_BLOCK)
            .pool_budget(0)
            .clamped();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.initial_window, 1);
        assert_eq!(cfg.window_update_threshold, 1);
        assert_eq!(cfg.max_frame_payload, MAX_POOL_BLOCK - HEADER_SIZE);
        assert_eq!(cfg.pool_budget, PARSE_BUFFER_SIZE);

        let cfg = MuxConfig::new().initial_window(1024).window_update_threshold(2048).clamped();
        assert_eq!(cfg.window_update_threshold, 1024);

        let defaults = MuxConfig::default().clamped();
        assert_eq!(defaults.max_frame_payload, MAX_FRAME_PAYLOAD);
        assert_eq!(defaults.window_update_threshold, WINDOW_UPDATE_THRESHOLD);
    }
}
