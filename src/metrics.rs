//! Request/error counters and Prometheus text exposition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Thread-safe counters for HTTP requests, errors, active sessions and
/// stored messages, exposed both as JSON and Prometheus text.
pub struct MetricsCollector {
    request_counts: Mutex<HashMap<(String, String), u64>>,
    error_counts: Mutex<HashMap<String, u64>>,
    active_sessions: AtomicUsize,
    message_count: AtomicUsize,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Creates a collector with its uptime clock started now.
    pub fn new() -> Self {
        MetricsCollector {
            request_counts: Mutex::new(HashMap::new()),
            error_counts: Mutex::new(HashMap::new()),
            active_sessions: AtomicUsize::new(0),
            message_count: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records one request to `method path`.
    pub fn record_request(&self, method: &str, path: &str) {
        let mut counts = self.request_counts.lock().unwrap();
        *counts.entry((method.to_string(), path.to_string())).or_insert(0) += 1;
    }

    /// Records one error of kind `error_type` (e.g. `"login_error"`).
    pub fn record_error(&self, error_type: &str) {
        let mut counts = self.error_counts.lock().unwrap();
        *counts.entry(error_type.to_string()).or_insert(0) += 1;
    }

    /// Overwrites the active session gauge.
    pub fn update_active_sessions(&self, count: usize) {
        self.active_sessions.store(count, Ordering::Relaxed);
    }

    /// Overwrites the stored-message gauge.
    pub fn update_message_count(&self, count: usize) {
        self.message_count.store(count, Ordering::Relaxed);
    }

    /// Renders `text/plain; version=0.0.4` Prometheus exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let uptime = self.start_time.elapsed().as_secs();

        out.push_str("# HELP chatroom_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE chatroom_uptime_seconds gauge\n");
        out.push_str(&format!("chatroom_uptime_seconds {}\n", uptime));

        out.push_str("# HELP chatroom_active_sessions Number of active sessions\n");
        out.push_str("# TYPE chatroom_active_sessions gauge\n");
        out.push_str(&format!(
            "chatroom_active_sessions {}\n",
            self.active_sessions.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP chatroom_stored_messages Number of messages in memory\n");
        out.push_str("# TYPE chatroom_stored_messages gauge\n");
        out.push_str(&format!(
            "chatroom_stored_messages {}\n",
            self.message_count.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP chatroom_requests_total Total number of HTTP requests\n");
        out.push_str("# TYPE chatroom_requests_total counter\n");
        for ((method, path), count) in self.request_counts.lock().unwrap().iter() {
            out.push_str(&format!(
                "chatroom_requests_total{{method=\"{}\",path=\"{}\"}} {}\n",
                method, path, count
            ));
        }

        out.push_str("# HELP chatroom_errors_total Total number of errors\n");
        out.push_str("# TYPE chatroom_errors_total counter\n");
        for (error_type, count) in self.error_counts.lock().unwrap().iter() {
            out.push_str(&format!(
                "chatroom_errors_total{{type=\"{}\"}} {}\n",
                error_type, count
            ));
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_prometheus_includes_recorded_request() {
        let metrics = MetricsCollector::new();
        metrics.record_request("POST", "/login");
        let text = metrics.render_prometheus();
        assert!(text.contains("chatroom_requests_total{method=\"POST\",path=\"/login\"} 1"));
    }

    #[test]
    fn render_prometheus_includes_recorded_error() {
        let metrics = MetricsCollector::new();
        metrics.record_error("login_error");
        let text = metrics.render_prometheus();
        assert!(text.contains("chatroom_errors_total{type=\"login_error\"} 1"));
    }

    #[test]
    fn active_sessions_gauge_reflects_last_update() {
        let metrics = MetricsCollector::new();
        metrics.update_active_sessions(3);
        let text = metrics.render_prometheus();
        assert!(text.contains("chatroom_active_sessions 3"));
    }
}
