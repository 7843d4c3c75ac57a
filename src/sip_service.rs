//! Minimal default SIP collaborator (§10.6): `REGISTER` binds a username to
//! its connection, `INVITE` (and anything else carrying a `To` header)
//! forwards the raw request to that username's connection if known,
//! otherwise answers `404`. Everything else that isn't `OPTIONS` is
//! dropped silently, matching the reference's placeholder-grade handling.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::sip;
use crate::codec::sip::SipRequest;
use crate::loop_pool::ConnectionHandle;

/// Extracts the user part of a SIP address header, e.g. `"Alice"
/// <sip:alice@example.com>;tag=1` → `alice`.
pub fn extract_sip_username(header_value: &str) -> String {
    let mut username = header_value.to_string();
    if let Some(pos) = username.find("sip:") {
        let rest = &username[pos + 4..];
        username = match rest.find('@') {
            Some(at) => rest[..at].to_string(),
            None => rest.to_string(),
        };
    }
    if let Some(semi) = username.find(';') {
        username.truncate(semi);
    }
    username.trim().to_string()
}

/// Maps registered SIP usernames to their live connection, independent of
/// the chat `SessionManager` (a SIP registration is not a chat login).
#[derive(Default)]
pub struct SipRegistry {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
}

impl SipRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        SipRegistry {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Binds `username` to `handle`, replacing any previous binding.
    pub fn register(&self, username: String, handle: ConnectionHandle) {
        self.connections.lock().unwrap().insert(username, handle);
    }

    /// The connection currently bound to `username`, if any.
    pub fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
        self.connections.lock().unwrap().get(username).cloned()
    }
}

/// Handles one SIP request on `conn`, given the raw bytes it was framed
/// from (needed to forward `INVITE` verbatim rather than rebuilding it).
pub fn handle_sip_request(registry: &SipRegistry, conn: &ConnectionHandle, request: &SipRequest, raw: &[u8]) {
    match request.method.as_str() {
        "REGISTER" => {
            if let Some(from) = request.header("from") {
                let username = extract_sip_username(from);
                registry.register(username.clone(), conn.clone());
                tracing::info!(username = %username, "SIP user registered");
                conn.send(&sip::build_response(200, request, b""));
            }
        }
        "INVITE" => {
            if let Some(to) = request.header("to") {
                forward_or_not_found(registry, conn, request, raw, to);
            }
        }
        "OPTIONS" => {
            conn.send(&sip::build_response(200, request, b""));
        }
        _ => {
            if let Some(to) = request.header("to") {
                let target = extract_sip_username(to);
                if let Some(target_conn) = registry.lookup(&target) {
                    target_conn.send(raw);
                }
            }
        }
    }
}

fn forward_or_not_found(registry: &SipRegistry, conn: &ConnectionHandle, request: &SipRequest, raw: &[u8], to_header: &str) {
    let target_user = extract_sip_username(to_header);
    match registry.lookup(&target_user) {
        Some(target_conn) => {
            tracing::info!(target = %target_user, "forwarding INVITE");
            target_conn.send(raw);
        }
        None => {
            tracing::warn!(target = %target_user, "SIP user not found");
            conn.send(&sip::build_response(404, request, b""));
        }
    }
}

/// Re-serializes `request` into the raw bytes a forwarding handler would
/// have received, for callers (tests, or a router variant that doesn't keep
/// the original bytes around) that only have the parsed form.
pub fn reconstruct_raw(request: &SipRequest) -> Vec<u8> {
    let mut out = format!("{} {} SIP/2.0\r\n", request.method, request.uri).into_bytes();
    for (name, value) in &request.headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extract_sip_username_handles_uri_with_display_name() {
        assert_eq!("alice", extract_sip_username("\"Alice\" <sip:alice@example.com>"));
    }

    #[test]
    fn extract_sip_username_strips_parameters() {
        assert_eq!("bob", extract_sip_username("sip:bob@example.com;tag=123"));
    }

    #[test]
    fn extract_sip_username_without_sip_prefix_returns_input() {
        assert_eq!("anonymous", extract_sip_username("anonymous"));
    }

    #[test]
    fn registry_lookup_misses_unregistered_username() {
        let registry = SipRegistry::new();
        assert!(registry.lookup("nobody").is_none());
    }
}
