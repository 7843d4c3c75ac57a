//! Per-connection buffered reader/writer with state machine and callbacks.
//!
//! A `TcpConnection` is not itself thread-safe; it is expected to live
//! behind an `Arc<Mutex<TcpConnection>>` owned by a single worker loop's
//! connection table, with every mutating call actually made on that loop's
//! thread. Cross-thread `send` goes through a `ConnectionHandle` (see
//! `loop_pool.rs`) that posts onto the owning loop instead of touching the
//! connection directly.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use mio::net::TcpStream;
use mio::Token;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::{CodecError, ConnectionError};
use crate::router::ProtocolRouter;

const CONNECTING: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTING: u8 = 2;
const DISCONNECTED: u8 = 3;

/// `{Connecting, Connected, Disconnecting, Disconnected}` lifecycle state.
/// Legal transitions: Connecting→Connected, Connected→Disconnecting,
/// Connected|Disconnecting→Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but not yet marked established.
    Connecting,
    /// Normal read/write traffic may flow.
    Connected,
    /// A graceful shutdown was requested; draining remaining output.
    Disconnecting,
    /// Fully closed; eligible for removal from the owning table.
    Disconnected,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            CONNECTING => ConnState::Connecting,
            CONNECTED => ConnState::Connected,
            DISCONNECTING => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

impl From<ConnState> for u8 {
    fn from(v: ConnState) -> Self {
        match v {
            ConnState::Connecting => CONNECTING,
            ConnState::Connected => CONNECTED,
            ConnState::Disconnecting => DISCONNECTING,
            ConnState::Disconnected => DISCONNECTED,
        }
    }
}

/// Outcome of draining a readable socket into the input buffer.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read; more may be available for the application.
    Progress(usize),
    /// Peer performed an orderly shutdown.
    Eof,
}

/// Outcome of draining the output buffer into a writable socket.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Some bytes remain queued; writable interest should stay enabled.
    Partial,
    /// The output buffer fully drained.
    Drained,
}

/// Result of queuing bytes for send; tells the caller whether the
/// high-water-mark callback should be fired (on the owning loop).
#[derive(Debug, PartialEq, Eq)]
pub struct SendOutcome {
    /// Whether the output buffer just crossed the high-water mark upward.
    pub crossed_high_water_mark: bool,
}

/// Protocol-specific state carried between reads on one connection, in place
/// of an any-typed/opaque context object.
#[derive(Debug, Default)]
pub enum ConnectionContext {
    /// No protocol-specific state yet (pre-classification, or HTTP, which is
    /// stateless between requests).
    #[default]
    None,
    /// A WebSocket connection, optionally bound to a logged-in session.
    WebSocket {
        /// `connection_id` of the session bound during the login control
        /// message, if any.
        session_connection_id: Option<String>,
    },
    /// An FTP control connection tracking login progress.
    Ftp {
        /// Username supplied by `USER`, pending a `PASS`.
        pending_user: Option<String>,
    },
}

/// A buffered, non-blocking TCP connection with lifecycle state and
/// backpressure.
pub struct TcpConnection {
    token: Token,
    stream: TcpStream,
    state: AtomicU8,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    channel: Channel,
    remote_addr: SocketAddr,
    name: String,
    router: ProtocolRouter,
    context: ConnectionContext,
    max_request_size: usize,
}

impl TcpConnection {
    /// Wraps a freshly accepted, non-blocking stream.
    pub fn new(
        token: Token,
        stream: TcpStream,
        name: String,
        max_request_size: usize,
    ) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        Ok(TcpConnection {
            token,
            stream,
            state: AtomicU8::new(CONNECTING),
            input: Buffer::new(),
            output: Buffer::new(),
            high_water_mark: 64 * 1024,
            channel: Channel::new(token),
            remote_addr,
            name,
            router: ProtocolRouter::new(),
            context: ConnectionContext::None,
            max_request_size,
        })
    }

    /// The mio token this connection is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Connection name, `serverName-ipPort#seq` as assigned by `TcpServer`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Peer address captured at accept time.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current lifecycle state. Safe to call from any thread.
    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::SeqCst))
    }

    /// Whether the connection can still carry traffic.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Whether the connection has fully closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state.into(), Ordering::SeqCst);
    }

    /// Transitions Connecting→Connected. A no-op if already connected.
    pub fn mark_established(&self) {
        let _ =
            self.state
                .compare_exchange(CONNECTING, CONNECTED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Sets a new high-water-mark threshold, in bytes.
    pub fn set_high_water_mark(&mut self, bytes: usize) {
        self.high_water_mark = bytes;
    }

    /// Registers this connection's stream with `registry` for readable
    /// events.
    pub fn register(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, self.channel.interest())?;
        self.channel.mark_registered();
        Ok(())
    }

    /// Reregisters with the channel's current interest set (called after
    /// toggling writable interest).
    pub fn reregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.reregister(&mut self.stream, self.token, self.channel.interest())
    }

    /// Deregisters the stream ahead of dropping this connection.
    pub fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)?;
        self.channel.mark_deregistered();
        Ok(())
    }

    /// Mutable access to the protocol router, for codec dispatch.
    pub fn router_mut(&mut self) -> &mut ProtocolRouter {
        &mut self.router
    }

    /// Mutable access to the protocol-specific context.
    pub fn context_mut(&mut self) -> &mut ConnectionContext {
        &mut self.context
    }

    /// Read-only access to the input buffer, for codecs to parse from.
    pub fn input(&self) -> &Buffer {
        &self.input
    }

    /// Mutable access to the input buffer, for codecs to consume from.
    pub fn input_mut(&mut self) -> &mut Buffer {
        &mut self.input
    }

    /// Feeds whatever is currently buffered in `input` through the
    /// protocol router, advancing classification/codec state as needed.
    pub fn feed_router(&mut self) -> Result<crate::router::RouterOutput, CodecError> {
        self.router.feed(&mut self.input)
    }

    /// Scatter-reads available bytes into the input buffer, looping until
    /// the kernel reports "would block" (edge-triggered draining).
    pub fn handle_readable(&mut self) -> Result<ReadOutcome, ConnectionError> {
        let fd = self.stream.as_raw_fd();
        let mut total = 0usize;

        loop {
            match self.input.read_from_fd(fd) {
                Ok(0) => {
                    self.force_close();
                    return Ok(ReadOutcome::Eof);
                }
                Ok(n) => {
                    total += n;
                    if self.input.readable() > self.max_request_size {
                        self.force_close();
                        return Err(ConnectionError::Protocol(CodecError::TooLarge));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Progress(total));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.force_close();
                    return Err(ConnectionError::Io(e));
                }
            }
        }
    }

    /// Thread-safe only when called on the owning loop's thread (see module
    /// docs). Writes directly when the output buffer is empty; otherwise
    /// queues and arms writable interest.
    pub fn send(&mut self, bytes: &[u8]) -> SendOutcome {
        if !self.is_connected() {
            return SendOutcome {
                crossed_high_water_mark: false,
            };
        }

        if self.output.readable() == 0 {
            match self.stream.write(bytes) {
                Ok(n) if n == bytes.len() => {
                    return SendOutcome {
                        crossed_high_water_mark: false,
                    };
                }
                Ok(n) => return self.queue_remainder(&bytes[n..]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.queue_remainder(bytes)
                }
                Err(_) => {
                    self.force_close();
                    return SendOutcome {
                        crossed_high_water_mark: false,
                    };
                }
            }
        }

        self.queue_remainder(bytes)
    }

    fn queue_remainder(&mut self, bytes: &[u8]) -> SendOutcome {
        let before = self.output.readable();
        self.output.append(bytes);
        self.channel.enable_writing();
        let after = self.output.readable();

        SendOutcome {
            crossed_high_water_mark: before <= self.high_water_mark
                && after > self.high_water_mark,
        }
    }

    /// Drains the output buffer into the socket. Disables writable interest
    /// and issues the half-close once the buffer empties while
    /// `Disconnecting`.
    pub fn handle_writable(&mut self) -> Result<WriteOutcome, ConnectionError> {
        loop {
            if self.output.readable() == 0 {
                self.channel.disable_writing();
                if self.state() == ConnState::Disconnecting {
                    let _ = self.stream.shutdown(Shutdown::Write);
                }
                return Ok(WriteOutcome::Drained);
            }

            match self.stream.write(self.output.peek()) {
                Ok(0) => return Ok(WriteOutcome::Partial),
                Ok(n) => self.output.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::Partial)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.force_close();
                    return Err(ConnectionError::Io(e));
                }
            }
        }
    }

    /// Whether writable interest is currently armed (used by the caller to
    /// decide whether to `reregister`).
    pub fn wants_write(&self) -> bool {
        self.channel.interest().is_writable()
    }

    /// Requests a graceful shutdown: once the output buffer drains, the
    /// write half is half-closed.
    pub fn shutdown(&mut self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            if self.output.readable() == 0 {
                let _ = self.stream.shutdown(Shutdown::Write);
            }
        }
    }

    /// Immediately closes the connection, discarding any buffered output.
    pub fn force_close(&mut self) {
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.set_state(ConnState::Disconnected);
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    fn connected_pair() -> (TcpConnection, std::net::TcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        let server = TcpStream::from_std(server_std);
        let conn =
            TcpConnection::new(Token(1), server, "test-1".into(), 10 * 1024 * 1024).unwrap();
        (conn, client)
    }

    #[test]
    fn fresh_connection_starts_connecting_then_marks_established() {
        let (conn, _client) = connected_pair();
        assert_eq!(ConnState::Connecting, conn.state());
        conn.mark_established();
        assert_eq!(ConnState::Connected, conn.state());
    }

    #[test]
    fn force_close_from_connected_transitions_to_disconnected() {
        let (mut conn, _client) = connected_pair();
        conn.mark_established();
        conn.force_close();
        assert!(conn.is_closed());
    }

    #[test]
    fn send_small_payload_while_connected_does_not_cross_high_water_mark() {
        let (mut conn, mut client) = connected_pair();
        conn.mark_established();
        conn.set_high_water_mark(1024);
        let outcome = conn.send(b"hello");
        assert!(!outcome.crossed_high_water_mark);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(b"hello", &buf);
    }

    #[test]
    fn shutdown_on_connected_with_empty_output_moves_to_disconnecting() {
        let (mut conn, _client) = connected_pair();
        conn.mark_established();
        conn.shutdown();
        assert_eq!(ConnState::Disconnecting, conn.state());
    }
}
