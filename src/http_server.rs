//! Route table, upgrade handling and worker-dispatched handler invocation
//! (§4.6): the facade that turns framed [`Message`]s into application
//! behavior, wiring every other module together.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::codec::websocket::{build_frame, Opcode};
use crate::codec::{http, rtsp, Message};
use crate::config::Config;
use crate::connection::ConnectionContext;
use crate::error::{AppError, ErrorCode};
use crate::loop_pool::{ConnectionHandle, LoopCallbacks};
use crate::metrics::MetricsCollector;
use crate::rate_limit::RateLimiter;
use crate::session::SessionManager;
use crate::sip_service::{self, SipRegistry};
use crate::store::{ChatMessage, InMemoryMessageStore, InMemoryUserStore, MessageStore, UserStore};
use crate::worker_pool::WorkerPool;

fn error_response(code: ErrorCode) -> Vec<u8> {
    let error = AppError::from_code(code);
    http::build_response(error.http_status, "application/json", &[], error.to_json().to_string().as_bytes())
}

fn json_response(value: Value) -> Vec<u8> {
    http::build_response(200, "application/json", &[], value.to_string().as_bytes())
}

fn validate_username(username: &str, max_len: usize) -> bool {
    !username.is_empty()
        && username.chars().count() <= max_len
        && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_message(content: &str, max_len: usize) -> bool {
    !content.is_empty()
        && content.chars().count() <= max_len
        && content.chars().all(|c| !c.is_control() || c == '\n' || c == '\t')
}

fn query_param<'a>(path: &'a str, key: &str) -> Option<&'a str> {
    let query = path.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn format_timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Owns every collaborator and dispatches framed protocol messages into
/// application behavior. Cheaply clonable (everything inside is an `Arc`);
/// hand a clone's [`LoopCallbacks`] to as many [`TcpServer`](crate::tcp_server::TcpServer)s as needed.
pub struct HttpServer {
    config: Config,
    metrics: Arc<MetricsCollector>,
    sessions: Arc<SessionManager>,
    messages: Arc<dyn MessageStore>,
    users: Arc<dyn UserStore>,
    rate_limiter: Arc<RateLimiter>,
    workers: Arc<WorkerPool>,
    sip_registry: Arc<SipRegistry>,
}

impl HttpServer {
    /// Builds the default in-memory collaborator set from `config`.
    pub fn new(config: Config) -> Arc<Self> {
        let metrics = Arc::new(MetricsCollector::new());
        let sessions = SessionManager::new(metrics.clone(), config.heartbeat_timeout_seconds);
        let workers = Arc::new(WorkerPool::new(&config.thread_pool));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        Arc::new(HttpServer {
            config,
            metrics,
            sessions,
            messages: Arc::new(InMemoryMessageStore::new()),
            users: Arc::new(InMemoryUserStore::new()),
            rate_limiter,
            workers,
            sip_registry: Arc::new(SipRegistry::new()),
        })
    }

    /// The session manager, for wiring its cleanup timer onto a server's
    /// main loop (`sessions().schedule_cleanup(...)`).
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Builds the [`LoopCallbacks`] a [`TcpServer`](crate::tcp_server::TcpServer) dispatches into.
    pub fn callbacks(self: &Arc<Self>) -> LoopCallbacks {
        let on_message_self = self.clone();
        let on_close_self = self.clone();
        LoopCallbacks {
            on_connection: Arc::new(|_handle| {}),
            on_message: Arc::new(move |handle, message| on_message_self.dispatch(handle, message)),
            on_close: Arc::new(move |handle| on_close_self.sip_registry_cleanup(&handle)),
        }
    }

    fn sip_registry_cleanup(&self, _handle: &ConnectionHandle) {
        // SIP bindings are overwritten on the next REGISTER from that
        // username rather than actively swept on disconnect, matching the
        // reference's fd-keyed map (which also never pruned on close).
    }

    fn dispatch(self: &Arc<Self>, handle: ConnectionHandle, message: Message) {
        match message {
            Message::Http(req) => {
                let mut req = req;
                req.remote_ip = handle.remote_addr().ip().to_string();
                let server = self.clone();
                let reply_handle = handle.clone();
                let posted = self.workers.try_post(move || {
                    let response = server.route_http(&req);
                    reply_handle.send(&response);
                });
                if !posted {
                    warn!("thread pool saturated, rejecting request");
                    handle.send(&error_response(ErrorCode::ServerBusy));
                }
            }
            Message::WebSocket(frame) => self.handle_websocket(&handle, frame),
            Message::Rtsp(request) => self.handle_rtsp(&handle, request),
            Message::Sip(request) => {
                let raw = sip_service::reconstruct_raw(&request);
                sip_service::handle_sip_request(&self.sip_registry, &handle, &request, &raw);
            }
            Message::Ftp(line) => crate::ftp_service::handle_ftp_line(&handle, &line),
        }
    }

    fn route_http(&self, req: &crate::codec::http::HttpRequest) -> Vec<u8> {
        if !self.rate_limiter.check(&req.remote_ip) {
            return error_response(ErrorCode::RateLimited);
        }

        let path = req.path.split('?').next().unwrap_or(&req.path);
        match path {
            "/login" => self.handle_login(req),
            "/send" => self.handle_send_message(req),
            "/messages" => self.handle_get_messages(req),
            "/users" => self.handle_get_users(),
            "/heartbeat" => self.handle_heartbeat(req),
            "/metrics" => self.handle_metrics(),
            _ => http::build_response(404, "application/json", &[], b"{\"success\":false,\"error\":\"Not Found\"}"),
        }
    }

    fn handle_login(&self, req: &crate::codec::http::HttpRequest) -> Vec<u8> {
        self.metrics.record_request("POST", "/login");

        let parsed: Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(_) => {
                self.metrics.record_error("login_error");
                return error_response(ErrorCode::InvalidRequest);
            }
        };
        let username = parsed.get("username").and_then(Value::as_str).unwrap_or("");
        if !validate_username(username, self.config.max_username_length) {
            return error_response(ErrorCode::InvalidUsername);
        }

        let result = self.sessions.login(username);
        if !result.success {
            return error_response(ErrorCode::UsernameTaken);
        }
        self.users.register(username);

        info!(username, connection_id = %result.connection_id, "user logged in");
        json_response(json!({
            "success": true,
            "connection_id": result.connection_id,
            "username": username,
        }))
    }

    fn handle_get_users(&self) -> Vec<u8> {
        self.metrics.record_request("GET", "/users");

        let now = std::time::Instant::now();
        let users: Vec<Value> = self
            .sessions
            .snapshot_all()
            .into_iter()
            .map(|session| {
                json!({
                    "username": session.username,
                    "idle_seconds": now.saturating_duration_since(session.last_heartbeat).as_secs(),
                    "online_seconds": now.saturating_duration_since(session.login_time).as_secs(),
                })
            })
            .collect();

        json_response(json!({"success": true, "users": users}))
    }

    fn handle_send_message(&self, req: &crate::codec::http::HttpRequest) -> Vec<u8> {
        self.metrics.record_request("POST", "/send");

        let parsed: Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(_) => {
                self.metrics.record_error("send_message_error");
                return error_response(ErrorCode::InvalidRequest);
            }
        };
        let mut username = parsed.get("username").and_then(Value::as_str).unwrap_or("").to_string();
        let content = parsed.get("content").and_then(Value::as_str).unwrap_or("");
        let connection_id = parsed.get("connection_id").and_then(Value::as_str).unwrap_or("");
        let target_user = parsed.get("target_user").and_then(Value::as_str).unwrap_or("");
        let room_id = parsed.get("room_id").and_then(Value::as_str).unwrap_or("");

        if !connection_id.is_empty() {
            let session_user = self.sessions.lookup_username(connection_id);
            if !session_user.is_empty() {
                username = session_user;
            }
        }

        if !validate_username(&username, self.config.max_username_length) {
            return error_response(ErrorCode::InvalidUsername);
        }
        if !validate_message(content, self.config.max_message_length) {
            return error_response(ErrorCode::InvalidMessage);
        }

        self.messages.add_message(ChatMessage {
            id: 0,
            username: username.clone(),
            content: content.to_string(),
            timestamp: format_timestamp_now(),
            target_user: target_user.to_string(),
            room_id: room_id.to_string(),
        });
        self.metrics.update_message_count(self.messages.message_count());
        info!(username = %username, "message stored");

        json_response(json!({"success": true, "message": "消息发送成功"}))
    }

    fn handle_get_messages(&self, req: &crate::codec::http::HttpRequest) -> Vec<u8> {
        self.metrics.record_request("GET", "/messages");

        let since: u64 = query_param(&req.path, "since").and_then(|v| v.parse().ok()).unwrap_or(0);
        let username = query_param(&req.path, "username");

        let history = self.messages.messages_after(since, username);
        let mut max_id = since;
        let messages: Vec<Value> = history
            .iter()
            .map(|m| {
                if m.id > max_id {
                    max_id = m.id;
                }
                let mut obj = json!({
                    "username": m.username,
                    "content": m.content,
                    "timestamp": m.timestamp,
                });
                if !m.target_user.is_empty() {
                    obj["target_user"] = json!(m.target_user);
                }
                if !m.room_id.is_empty() {
                    obj["room_id"] = json!(m.room_id);
                }
                obj
            })
            .collect();

        json_response(json!({"success": true, "messages": messages, "next_since": max_id}))
    }

    fn handle_heartbeat(&self, req: &crate::codec::http::HttpRequest) -> Vec<u8> {
        self.metrics.record_request("POST", "/heartbeat");

        let parsed: Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(_) => {
                self.metrics.record_error("heartbeat_error");
                return error_response(ErrorCode::InvalidRequest);
            }
        };
        let client_version = parsed.get("client_version").and_then(Value::as_str).unwrap_or("");
        let connection_id = parsed.get("connection_id").and_then(Value::as_str).unwrap_or("");

        if !connection_id.is_empty() {
            self.sessions.update_heartbeat(connection_id, client_version);
        }

        json_response(json!({
            "success": true,
            "message": "heartbeat ok",
            "timestamp": format_timestamp_now(),
            "connection_id": connection_id,
            "client_version": client_version,
        }))
    }

    fn handle_metrics(&self) -> Vec<u8> {
        self.metrics.update_message_count(self.messages.message_count());

        let timeout = std::time::Duration::from_secs(self.config.heartbeat_timeout_seconds);
        let now = std::time::Instant::now();
        let sessions = self.sessions.snapshot_all();
        let active = sessions
            .iter()
            .filter(|s| now.saturating_duration_since(s.last_heartbeat) <= timeout)
            .count();
        self.metrics.update_active_sessions(active);

        let mut version_counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
        for session in &sessions {
            if !session.client_version.is_empty() {
                *version_counts.entry(session.client_version.clone()).or_insert(0) += 1;
            }
        }

        let mut body = self.metrics.render_prometheus();
        body.push_str("# HELP chatroom_thread_pool_queue_size Current tasks in queue\n");
        body.push_str("# TYPE chatroom_thread_pool_queue_size gauge\n");
        body.push_str(&format!("chatroom_thread_pool_queue_size {}\n", self.workers.queue_size()));

        body.push_str("# HELP chatroom_thread_pool_rejected_total Total rejected tasks\n");
        body.push_str("# TYPE chatroom_thread_pool_rejected_total counter\n");
        body.push_str(&format!("chatroom_thread_pool_rejected_total {}\n", self.workers.rejected_count()));

        body.push_str("# HELP chatroom_thread_pool_threads Total threads\n");
        body.push_str("# TYPE chatroom_thread_pool_threads gauge\n");
        body.push_str(&format!("chatroom_thread_pool_threads {}\n", self.workers.current_thread_count()));

        body.push_str("# HELP chatroom_thread_pool_active_threads Active threads\n");
        body.push_str("# TYPE chatroom_thread_pool_active_threads gauge\n");
        body.push_str(&format!("chatroom_thread_pool_active_threads {}\n", self.workers.active_thread_count()));

        body.push_str("# HELP chatroom_client_versions Active client versions\n");
        body.push_str("# TYPE chatroom_client_versions gauge\n");
        for (version, count) in &version_counts {
            body.push_str(&format!("chatroom_client_versions{{version=\"{}\"}} {}\n", version, count));
        }

        http::build_response(200, "text/plain; version=0.0.4", &[], body.as_bytes())
    }

    fn handle_websocket(&self, handle: &ConnectionHandle, frame: crate::codec::websocket::Frame) {
        match frame.opcode {
            Opcode::Text => {
                let parsed: Value = match serde_json::from_slice(&frame.payload) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!("WS JSON parse error");
                        return;
                    }
                };
                let kind = parsed.get("type").and_then(Value::as_str).unwrap_or("");
                match kind {
                    "login" => self.handle_ws_login(handle, &parsed),
                    "message" => self.handle_ws_message(handle, &parsed),
                    _ => {}
                }
            }
            Opcode::Close => {
                handle.with_context(|ctx| *ctx = ConnectionContext::None);
            }
            _ => {}
        }
    }

    fn handle_ws_login(&self, handle: &ConnectionHandle, parsed: &Value) {
        let username = parsed.get("username").and_then(Value::as_str).unwrap_or("");
        if !validate_username(username, self.config.max_username_length) {
            return;
        }

        handle.with_context(|ctx| {
            *ctx = ConnectionContext::WebSocket {
                session_connection_id: Some(username.to_string()),
            }
        });

        let response = json!({"type": "login_response", "success": true, "username": username});
        handle.send(&build_frame(true, Opcode::Text, response.to_string().as_bytes()));
        info!(username, "WS user login");
    }

    fn handle_ws_message(&self, handle: &ConnectionHandle, parsed: &Value) {
        let content = parsed.get("content").and_then(Value::as_str).unwrap_or("");
        let target = parsed.get("target_user").and_then(Value::as_str).unwrap_or("");
        let room = parsed.get("room_id").and_then(Value::as_str).unwrap_or("");

        let username = handle.with_context(|ctx| match ctx {
            ConnectionContext::WebSocket { session_connection_id: Some(u) } => Some(u.clone()),
            _ => None,
        });

        let username = match username {
            Some(u) if !u.is_empty() => u,
            _ => return,
        };
        if !validate_message(content, self.config.max_message_length) {
            return;
        }

        self.messages.add_message(ChatMessage {
            id: 0,
            username: username.clone(),
            content: content.to_string(),
            timestamp: format_timestamp_now(),
            target_user: target.to_string(),
            room_id: room.to_string(),
        });
        self.metrics.update_message_count(self.messages.message_count());

        let response = json!({"type": "message_response", "success": true});
        handle.send(&build_frame(true, Opcode::Text, response.to_string().as_bytes()));
        info!(username = %username, content, "WS message");
    }

    fn handle_rtsp(&self, handle: &ConnectionHandle, request: crate::codec::rtsp::RtspRequest) {
        let response = match request.method.as_str() {
            "OPTIONS" => rtsp::build_response(
                200,
                request.cseq,
                &[("Public", "OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE")],
                b"",
            ),
            "DESCRIBE" => {
                let sdp = "v=0\r\n\
                           o=- 0 0 IN IP4 127.0.0.1\r\n\
                           s=ChatRoom Audio Session\r\n\
                           c=IN IP4 127.0.0.1\r\n\
                           t=0 0\r\n\
                           m=audio 0 RTP/AVP 0\r\n\
                           a=control:track0\r\n";
                rtsp::build_response(200, request.cseq, &[("Content-Type", "application/sdp")], sdp.as_bytes())
            }
            _ => rtsp::build_response(501, request.cseq, &[], b""),
        };
        handle.send(&response);
    }
}
