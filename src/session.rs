//! User session table with heartbeat-driven expiry (§4.10).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::event_loop::EventLoop;
use crate::metrics::MetricsCollector;

use std::sync::Arc;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_connection_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let id = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn-{}-{}", millis, id)
}

/// A live user session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Chosen at login; unique across live sessions.
    pub username: String,
    /// `conn-<unix_millis>-<counter>`.
    pub connection_id: String,
    /// Last value reported via `/heartbeat`, empty until the first one.
    pub client_version: String,
    /// When the session was created.
    pub login_time: Instant,
    /// Updated by every successful heartbeat; drives expiry.
    pub last_heartbeat: Instant,
}

/// Outcome of a login attempt.
#[derive(Debug, Clone)]
pub struct LoginResult {
    /// Whether the username was available.
    pub success: bool,
    /// Assigned id on success.
    pub connection_id: String,
}

/// Keyed by `connection_id`. Usernames are unique across live sessions.
/// Periodic cleanup removes sessions whose `last_heartbeat` has aged past
/// `heartbeat_timeout`; the sweep is driven by the owning `EventLoop`'s timer
/// facility so it shares the loop's shutdown path instead of running on a
/// dedicated sleeping thread.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    metrics: Arc<MetricsCollector>,
    heartbeat_timeout_seconds: u64,
}

impl SessionManager {
    /// Creates an empty session table.
    pub fn new(metrics: Arc<MetricsCollector>, heartbeat_timeout_seconds: u64) -> Arc<Self> {
        Arc::new(SessionManager {
            sessions: Mutex::new(HashMap::new()),
            metrics,
            heartbeat_timeout_seconds,
        })
    }

    /// Registers `cleanup` to run every `interval` on `event_loop`, scanning
    /// for and removing expired sessions.
    pub fn schedule_cleanup(self: &Arc<Self>, event_loop: &mut EventLoop, interval: std::time::Duration) {
        let manager = self.clone();
        event_loop.run_every(interval, move || manager.cleanup_expired());
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        let timeout = std::time::Duration::from_secs(self.heartbeat_timeout_seconds);
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, session| now.saturating_duration_since(session.last_heartbeat) <= timeout);
        self.metrics.update_active_sessions(sessions.len());
    }

    /// Attempts to log `username` in. Fails if the username is already live.
    pub fn login(&self, username: &str) -> LoginResult {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.values().any(|s| s.username == username) {
            return LoginResult {
                success: false,
                connection_id: String::new(),
            };
        }

        let connection_id = generate_connection_id();
        let now = Instant::now();
        sessions.insert(
            connection_id.clone(),
            Session {
                username: username.to_string(),
                connection_id: connection_id.clone(),
                client_version: String::new(),
                login_time: now,
                last_heartbeat: now,
            },
        );
        self.metrics.update_active_sessions(sessions.len());

        LoginResult {
            success: true,
            connection_id,
        }
    }

    /// Refreshes `last_heartbeat` and `client_version`. `false` if the
    /// connection id is unknown (treated as a no-op success by callers).
    pub fn update_heartbeat(&self, connection_id: &str, client_version: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(connection_id) {
            Some(session) => {
                session.client_version = client_version.to_string();
                session.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Username bound to `connection_id`, or `""` if unknown.
    pub fn lookup_username(&self, connection_id: &str) -> String {
        self.sessions
            .lock()
            .unwrap()
            .get(connection_id)
            .map(|s| s.username.clone())
            .unwrap_or_default()
    }

    /// A snapshot copy of every live session.
    pub fn snapshot_all(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(Arc::new(MetricsCollector::new()), 60)
    }

    #[test]
    fn first_login_succeeds_second_with_same_username_fails() {
        let mgr = manager();
        let first = mgr.login("alice");
        assert!(first.success);
        let second = mgr.login("alice");
        assert!(!second.success);
    }

    #[test]
    fn heartbeat_for_unknown_connection_returns_false() {
        let mgr = manager();
        assert!(!mgr.update_heartbeat("nope", "1.0"));
    }

    #[test]
    fn lookup_username_resolves_connection_id() {
        let mgr = manager();
        let login = mgr.login("bob");
        assert_eq!("bob", mgr.lookup_username(&login.connection_id));
    }

    #[test]
    fn snapshot_all_reflects_every_live_session() {
        let mgr = manager();
        mgr.login("alice");
        mgr.login("bob");
        let snapshot = mgr.snapshot_all();
        assert_eq!(2, snapshot.len());
    }

    #[test]
    fn cleanup_expired_removes_stale_sessions() {
        let mgr = manager();
        let login = mgr.login("alice");
        {
            let mut sessions = mgr.sessions.lock().unwrap();
            let session = sessions.get_mut(&login.connection_id).unwrap();
            session.last_heartbeat -= std::time::Duration::from_secs(120);
        }
        mgr.cleanup_expired();
        assert_eq!(0, mgr.snapshot_all().len());
    }
}
