//! Per-IP fixed-window rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

struct Entry {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window limiter: each IP gets `max_requests` within a rolling
/// `window_seconds` window that resets wholesale once it expires (matching
/// the reference implementation's single `reset_time` per entry rather than
/// a sliding log).
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    /// Creates a limiter from `config`.
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `ip` is still under its limit, incrementing its
    /// counter as a side effect. Always `true` when limiting is disabled or
    /// `ip` is empty (no address to key on).
    pub fn check(&self, ip: &str) -> bool {
        if !self.config.enabled || ip.is_empty() {
            return true;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(ip.to_string()).or_insert_with(|| Entry {
            count: 0,
            reset_at: now + Duration::from_secs(self.config.window_seconds),
        });

        if entry.reset_at < now {
            entry.count = 0;
            entry.reset_at = now + Duration::from_secs(self.config.window_seconds);
        }

        if entry.count >= self.config.max_requests {
            return false;
        }

        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(max: u32) -> RateLimitConfig {
        RateLimitConfig {
            window_seconds: 60,
            max_requests: max,
            enabled: true,
        }
    }

    #[test]
    fn allows_requests_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(config(2));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn tracks_ips_independently() {
        let limiter = RateLimiter::new(config(1));
        assert!(limiter.check("1.1.1.1"));
        assert!(limiter.check("2.2.2.2"));
        assert!(!limiter.check("1.1.1.1"));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let mut cfg = config(1);
        cfg.enabled = false;
        let limiter = RateLimiter::new(cfg);
        assert!(limiter.check("1.1.1.1"));
        assert!(limiter.check("1.1.1.1"));
    }

    #[test]
    fn empty_ip_is_always_allowed() {
        let limiter = RateLimiter::new(config(1));
        assert!(limiter.check(""));
        assert!(limiter.check(""));
    }
}
