//! Tuning surface. Mirrors the reference implementation's `ServerConfig`
//! field set. No file or environment loading lives here — wiring a config
//! file is outside this crate's scope; callers who want that can deserialize
//! a [`Config`] themselves with `serde` and hand it to the constructors.

use serde::{Deserialize, Serialize};

/// Thread pool sizing and I/O loop count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Minimum worker threads kept alive even when idle. `0` lets the pool
    /// pick a default based on available parallelism.
    pub core_threads: usize,
    /// Maximum worker threads the pool will spawn under load.
    pub max_threads: usize,
    /// Bound on the task queue before `post` blocks / `try_post` rejects.
    pub queue_capacity: usize,
    /// Number of worker event loops besides the main accept loop. `0` means
    /// the main loop also owns connections.
    pub io_threads: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig {
            core_threads: 0,
            max_threads: 0,
            queue_capacity: 1024,
            io_threads: 0,
        }
    }
}

/// Per-IP fixed-window rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Width of the fixed window, in seconds.
    pub window_seconds: u64,
    /// Requests permitted per window per source IP.
    pub max_requests: u32,
    /// Whether limiting is enforced at all.
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            window_seconds: 60,
            max_requests: 60,
            enabled: true,
        }
    }
}

/// Top-level tuning surface for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listening port of the main HTTP façade.
    pub port: u16,
    /// Worker pool sizing.
    pub thread_pool: ThreadPoolConfig,
    /// Seconds of heartbeat silence before a session is considered dead.
    pub heartbeat_timeout_seconds: u64,
    /// Cadence of the session cleanup timer.
    pub session_cleanup_interval_seconds: u64,
    /// Validation ceiling on message body length.
    pub max_message_length: usize,
    /// Validation ceiling on username length.
    pub max_username_length: usize,
    /// Per-IP rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Ceiling on buffered-but-unframed request bytes before a 413 is sent.
    pub max_request_size: usize,
    /// Output buffer size, in bytes, above which `highWaterMarkCallback`
    /// fires on a `send`.
    pub high_water_mark: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            thread_pool: ThreadPoolConfig::default(),
            heartbeat_timeout_seconds: 60,
            session_cleanup_interval_seconds: 30,
            max_message_length: 1024,
            max_username_length: 32,
            rate_limit: RateLimitConfig::default(),
            max_request_size: 10 * 1024 * 1024,
            high_water_mark: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_matches_reference_values() {
        let cfg = Config::default();
        assert_eq!(8080, cfg.port);
        assert_eq!(60, cfg.heartbeat_timeout_seconds);
        assert_eq!(1024, cfg.max_message_length);
        assert_eq!(32, cfg.max_username_length);
        assert!(cfg.rate_limit.enabled);
    }
}
