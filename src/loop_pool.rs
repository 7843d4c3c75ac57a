//! A fixed pool of single-threaded I/O loops, each owning a disjoint set of
//! connections (§4.5/§9). New connections are assigned round-robin; once
//! assigned, a connection's reads, writes and protocol dispatch all happen
//! on that one loop's thread for its whole lifetime.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::Token;
use slab::Slab;
use tracing::error;

use crate::codec::Message;
use crate::connection::{ReadOutcome, TcpConnection};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::poller::ReadyEvent;

/// A cheaply cloneable reference to one live connection, safe to hold and
/// call from any thread: writes and registration changes go through a
/// cloned `mio::Registry`, which is thread-safe by construction (the same
/// property that makes `mio::Waker` cross-thread safe).
#[derive(Clone)]
pub struct ConnectionHandle {
    conn: Arc<Mutex<TcpConnection>>,
    registry: Arc<mio::Registry>,
}

impl ConnectionHandle {
    /// Queues `bytes` for the connection, reregistering for writability if
    /// the send didn't complete synchronously.
    pub fn send(&self, bytes: &[u8]) {
        let mut conn = self.conn.lock().unwrap();
        let outcome = conn.send(bytes);
        if conn.wants_write() {
            let _ = conn.reregister(&self.registry);
        }
        if outcome.crossed_high_water_mark {
            tracing::warn!(name = conn.name(), "output buffer crossed high-water mark");
        }
    }

    /// The connection's assigned name (`serverName-ipPort#seq`).
    pub fn name(&self) -> String {
        self.conn.lock().unwrap().name().to_string()
    }

    /// The peer's address, captured at accept time.
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.lock().unwrap().remote_addr()
    }

    /// Requests a graceful half-close once queued output drains.
    pub fn shutdown(&self) {
        self.conn.lock().unwrap().shutdown();
    }

    /// Runs `f` against the connection's protocol-specific context under
    /// the connection's lock.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut crate::connection::ConnectionContext) -> R) -> R {
        f(self.conn.lock().unwrap().context_mut())
    }
}

/// Callbacks a `LoopPool` (or a single-reactor `IoContext`) dispatches into.
/// All three may be called concurrently from different loop threads and
/// must not block.
#[derive(Clone)]
pub struct LoopCallbacks {
    /// Fired once a connection has been registered and marked established.
    pub on_connection: Arc<dyn Fn(ConnectionHandle) + Send + Sync>,
    /// Fired once per message the protocol router frames.
    pub on_message: Arc<dyn Fn(ConnectionHandle, Message) + Send + Sync>,
    /// Fired once a connection has fully closed and been removed.
    pub on_close: Arc<dyn Fn(ConnectionHandle) + Send + Sync>,
}

/// The accept-readable/I/O-dispatch pipeline for one loop's worth of
/// connections. Shared code between dedicated `LoopPool` worker threads and
/// a single-reactor `TcpServer` that folds connection handling into its own
/// accept loop.
pub struct IoContext {
    connections: Slab<Arc<Mutex<TcpConnection>>>,
    registry: Arc<mio::Registry>,
    callbacks: LoopCallbacks,
    high_water_mark: usize,
    max_request_size: usize,
    server_name: String,
    ip_port: String,
    next_seq: u64,
}

impl IoContext {
    /// Creates an empty connection table bound to `registry`.
    pub fn new(
        registry: Arc<mio::Registry>,
        callbacks: LoopCallbacks,
        high_water_mark: usize,
        max_request_size: usize,
        server_name: String,
        ip_port: String,
    ) -> Self {
        IoContext {
            connections: Slab::new(),
            registry,
            callbacks,
            high_water_mark,
            max_request_size,
            server_name,
            ip_port,
            next_seq: 0,
        }
    }

    /// Number of connections currently owned by this loop.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Registers a freshly accepted stream and fires `on_connection`.
    pub fn accept(&mut self, stream: mio::net::TcpStream) {
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        self.next_seq += 1;
        let name = format!("{}-{}#{}", self.server_name, self.ip_port, self.next_seq);

        let mut conn = match TcpConnection::new(token, stream, name, self.max_request_size) {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to wrap accepted stream");
                return;
            }
        };
        conn.set_high_water_mark(self.high_water_mark);
        if let Err(err) = conn.register(&self.registry) {
            error!(error = %err, "failed to register accepted connection");
            return;
        }
        conn.mark_established();

        let arc = Arc::new(Mutex::new(conn));
        entry.insert(arc.clone());
        (self.callbacks.on_connection)(self.handle_for(arc));
    }

    fn handle_for(&self, conn: Arc<Mutex<TcpConnection>>) -> ConnectionHandle {
        ConnectionHandle {
            conn,
            registry: self.registry.clone(),
        }
    }

    /// Dispatches a batch of readiness events reported for this loop's
    /// tokens.
    pub fn dispatch(&mut self, events: Vec<ReadyEvent>) {
        for event in events {
            self.dispatch_one(event);
        }
    }

    fn dispatch_one(&mut self, event: ReadyEvent) {
        let idx = event.token.0;
        let Some(arc) = self.connections.get(idx).cloned() else {
            return;
        };
        let handle = self.handle_for(arc.clone());

        let mut messages = Vec::new();
        let mut handshake = None;
        let mut auto_replies = Vec::new();
        let mut should_close = false;
        {
            let mut conn = arc.lock().unwrap();
            if event.error_or_hangup {
                conn.force_close();
            }
            if event.readable && conn.is_connected() {
                match conn.handle_readable() {
                    Ok(ReadOutcome::Progress(_)) => match conn.feed_router() {
                        Ok(output) => {
                            handshake = output.handshake_response;
                            messages = output.messages;
                            auto_replies = output.auto_replies;
                            should_close = output.should_close;
                        }
                        Err(_) => conn.force_close(),
                    },
                    Ok(ReadOutcome::Eof) => {}
                    Err(_) => {}
                }
            }
            if let Some(resp) = &handshake {
                conn.send(resp);
            }
            for reply in &auto_replies {
                conn.send(reply);
            }
            if should_close {
                conn.shutdown();
            }
            if event.writable {
                let _ = conn.handle_writable();
            }
            if conn.wants_write() {
                let _ = conn.reregister(&self.registry);
            }
        }

        for message in messages {
            (self.callbacks.on_message)(handle.clone(), message);
        }

        let closed = arc.lock().unwrap().is_closed();
        if closed {
            self.connections.try_remove(idx);
            if let Ok(mut conn) = arc.lock() {
                let _ = conn.deregister(&self.registry);
            }
            (self.callbacks.on_close)(handle);
        }
    }
}

struct NewConnection {
    stream: mio::net::TcpStream,
}

struct Worker {
    handle: LoopHandle,
    new_conn_tx: crossbeam_channel::Sender<NewConnection>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    join: std::thread::JoinHandle<()>,
}

/// N background I/O loops, each running its own `EventLoop` and `IoContext`
/// on a dedicated thread. Connections are handed out round-robin.
pub struct LoopPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl LoopPool {
    /// Spawns `io_threads` worker loops (clamped to at least 1).
    pub fn spawn(
        io_threads: usize,
        callbacks: LoopCallbacks,
        high_water_mark: usize,
        max_request_size: usize,
        server_name: String,
        ip_port: String,
    ) -> io::Result<Self> {
        let count = io_threads.max(1);
        let mut workers = Vec::with_capacity(count);

        for i in 0..count {
            let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
            let (new_conn_tx, new_conn_rx) = crossbeam_channel::unbounded();
            let callbacks = callbacks.clone();
            let server_name = server_name.clone();
            let ip_port = format!("{}-io{}", ip_port, i);
            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let stop_for_thread = stop.clone();

            let join = std::thread::Builder::new()
                .name(format!("io-loop-{}", i))
                .spawn(move || {
                    run_worker_loop(
                        ready_tx,
                        new_conn_rx,
                        callbacks,
                        high_water_mark,
                        max_request_size,
                        server_name,
                        ip_port,
                        stop_for_thread,
                    );
                })
                .expect("failed to spawn io loop thread");

            let handle = ready_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("io loop failed to start");
            workers.push(Worker { handle, new_conn_tx, stop, join });
        }

        Ok(LoopPool {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Number of worker loops in the pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers (never true after `spawn`).
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Hands `stream` to the next worker loop in round-robin order.
    pub fn assign(&self, stream: mio::net::TcpStream) {
        let idx = self.next.fetch_add(1, Ordering::SeqCst) % self.workers.len();
        let worker = &self.workers[idx];
        let _ = worker.new_conn_tx.send(NewConnection { stream });
        worker.handle.post(|| {});
    }

    /// Signals every worker loop to stop after its current poll iteration
    /// and joins all of them. Connections left open at that point are
    /// dropped along with their thread's `IoContext`.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.stop.store(true, Ordering::SeqCst);
            worker.handle.post(|| {});
        }
        for worker in self.workers {
            let _ = worker.join.join();
        }
    }
}

fn run_worker_loop(
    ready_tx: crossbeam_channel::Sender<LoopHandle>,
    new_conn_rx: crossbeam_channel::Receiver<NewConnection>,
    callbacks: LoopCallbacks,
    high_water_mark: usize,
    max_request_size: usize,
    server_name: String,
    ip_port: String,
    stop: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut event_loop = EventLoop::new().expect("failed to create io loop");
    let registry = Arc::new(
        event_loop
            .registry()
            .try_clone()
            .expect("failed to clone registry"),
    );
    let _ = ready_tx.send(event_loop.handle());

    let mut ctx = IoContext::new(registry, callbacks, high_water_mark, max_request_size, server_name, ip_port);

    while !stop.load(Ordering::SeqCst) {
        while let Ok(new_conn) = new_conn_rx.try_recv() {
            ctx.accept(new_conn.stream);
        }

        match event_loop.poll_and_dispatch(Some(Duration::from_millis(250))) {
            Ok(events) => ctx.dispatch(events),
            Err(err) => {
                error!(error = %err, "io loop poll failed");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::Mutex as StdMutex;

    fn noop_callbacks() -> LoopCallbacks {
        LoopCallbacks {
            on_connection: Arc::new(|_| {}),
            on_message: Arc::new(|_, _| {}),
            on_close: Arc::new(|_| {}),
        }
    }

    #[test]
    fn pool_spawns_requested_worker_count() {
        let pool = LoopPool::spawn(2, noop_callbacks(), 64 * 1024, 1024 * 1024, "test".into(), "127.0.0.1:0".into())
            .unwrap();
        assert_eq!(2, pool.len());
        pool.shutdown();
    }

    #[test]
    fn zero_io_threads_is_clamped_to_one_worker() {
        let pool = LoopPool::spawn(0, noop_callbacks(), 64 * 1024, 1024 * 1024, "test".into(), "127.0.0.1:0".into())
            .unwrap();
        assert_eq!(1, pool.len());
        pool.shutdown();
    }

    #[test]
    fn assigned_connection_triggers_on_connection_and_on_message() {
        let established = Arc::new(StdMutex::new(false));
        let received = Arc::new(StdMutex::new(Vec::new()));
        let established2 = established.clone();
        let received2 = received.clone();

        let callbacks = LoopCallbacks {
            on_connection: Arc::new(move |_| {
                *established2.lock().unwrap() = true;
            }),
            on_message: Arc::new(move |handle: ConnectionHandle, message: Message| {
                if let Message::Http(req) = message {
                    received2.lock().unwrap().push(req.path);
                }
                handle.send(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
            }),
            on_close: Arc::new(|_| {}),
        };

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = LoopPool::spawn(1, callbacks, 64 * 1024, 1024 * 1024, "test".into(), addr.to_string()).unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        let stream = mio::net::TcpStream::from_std(server_std);
        pool.assign(stream);

        use std::io::Write;
        client.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        use std::io::Read;
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 128];
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0);
        assert!(*established.lock().unwrap());
        assert_eq!(vec!["/ping".to_string()], *received.lock().unwrap());

        pool.shutdown();
    }
}
