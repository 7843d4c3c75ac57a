//! Acceptor + worker loops + user callbacks, wired into one server object
//! (§4.5). `io_threads == 0` runs a single-reactor server where the main
//! loop that owns the Acceptor also owns every connection; `io_threads > 0`
//! hands accepted streams off to a dedicated [`LoopPool`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::Token;
use tracing::info;

use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::event_loop::EventLoop;
use crate::loop_pool::{IoContext, LoopCallbacks, LoopPool};

const ACCEPTOR_TOKEN: Token = Token(usize::MAX - 10);

enum Workers {
    Dedicated(LoopPool),
    SingleReactor(IoContext),
}

/// Owns the listening socket and every connection's eventual home loop.
pub struct TcpServer {
    acceptor: Acceptor,
    event_loop: EventLoop,
    workers: Workers,
    server_name: String,
}

impl TcpServer {
    /// Binds `addr` and wires up `callbacks`. `reuseport` enables
    /// `SO_REUSEPORT` on the listening socket (useful when multiple
    /// `TcpServer`s share a port across processes).
    pub fn bind(
        server_name: &str,
        addr: SocketAddr,
        reuseport: bool,
        config: &Config,
        callbacks: LoopCallbacks,
    ) -> io::Result<Self> {
        let mut event_loop = EventLoop::new()?;
        let mut acceptor = Acceptor::bind(addr, reuseport, ACCEPTOR_TOKEN)?;
        acceptor.register(event_loop.registry())?;

        let ip_port = acceptor.local_addr()?.to_string();
        let high_water_mark = config.high_water_mark;
        let max_request_size = config.max_request_size;

        let workers = if config.thread_pool.io_threads == 0 {
            let registry = Arc::new(event_loop.registry().try_clone()?);
            Workers::SingleReactor(IoContext::new(
                registry,
                callbacks,
                high_water_mark,
                max_request_size,
                server_name.to_string(),
                ip_port,
            ))
        } else {
            Workers::Dedicated(LoopPool::spawn(
                config.thread_pool.io_threads,
                callbacks,
                high_water_mark,
                max_request_size,
                server_name.to_string(),
                ip_port,
            )?)
        };

        Ok(TcpServer {
            acceptor,
            event_loop,
            workers,
            server_name: server_name.to_string(),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Runs one iteration: accept any pending connections, dispatch any
    /// I/O readiness for single-reactor mode, and run pending cross-thread
    /// jobs (including `SessionManager` cleanup ticks). Blocks up to
    /// `timeout` inside `poll`.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let events = self.event_loop.poll_and_dispatch(timeout)?;

        let mut accepted = Vec::new();
        let mut io_events = Vec::with_capacity(events.len());
        for event in events {
            if event.token == ACCEPTOR_TOKEN {
                self.acceptor.accept_all(|stream, addr| accepted.push((stream, addr)));
            } else {
                io_events.push(event);
            }
        }

        match &mut self.workers {
            Workers::Dedicated(pool) => {
                for (stream, _addr) in accepted {
                    pool.assign(stream);
                }
            }
            Workers::SingleReactor(ctx) => {
                for (stream, _addr) in accepted {
                    ctx.accept(stream);
                }
                ctx.dispatch(io_events);
            }
        }

        Ok(())
    }

    /// Runs `run_once` in a loop forever (or until it returns an error).
    pub fn run(&mut self) -> io::Result<()> {
        info!(server = %self.server_name, addr = %self.local_addr()?, "server listening");
        loop {
            self.run_once(Some(Duration::from_millis(250)))?;
        }
    }

    /// Exposes the loop's registry/handle, for wiring `SessionManager`
    /// cleanup or other timer-driven housekeeping onto the main loop.
    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::Message;
    use std::io::{Read, Write};
    use std::sync::Mutex;

    fn config_with_io_threads(io_threads: usize) -> Config {
        let mut config = Config::default();
        config.thread_pool.io_threads = io_threads;
        config.thread_pool.core_threads = 1;
        config.thread_pool.max_threads = 1;
        config
    }

    fn echo_callbacks() -> LoopCallbacks {
        LoopCallbacks {
            on_connection: Arc::new(|_| {}),
            on_message: Arc::new(|handle, message| {
                if let Message::Http(_) = message {
                    handle.send(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
                }
            }),
            on_close: Arc::new(|_| {}),
        }
    }

    #[test]
    fn single_reactor_server_accepts_and_responds() {
        let config = config_with_io_threads(0);
        let mut server =
            TcpServer::bind("test", "127.0.0.1:0".parse().unwrap(), false, &config, echo_callbacks()).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        // One run_once drives the accept; a couple more drive the read and
        // the write of the response.
        for _ in 0..5 {
            server.run_once(Some(Duration::from_millis(100))).unwrap();
        }

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn dedicated_loop_pool_server_accepts_and_responds() {
        let config = config_with_io_threads(1);
        let mut server =
            TcpServer::bind("test", "127.0.0.1:0".parse().unwrap(), false, &config, echo_callbacks()).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        for _ in 0..5 {
            server.run_once(Some(Duration::from_millis(100))).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn tracked_server_name_appears_in_connection_names() {
        let captured = Arc::new(Mutex::new(String::new()));
        let captured2 = captured.clone();
        let config = config_with_io_threads(0);
        let callbacks = LoopCallbacks {
            on_connection: Arc::new(move |handle| {
                *captured2.lock().unwrap() = handle.name();
            }),
            on_message: Arc::new(|_, _| {}),
            on_close: Arc::new(|_| {}),
        };
        let mut server =
            TcpServer::bind("chatroom", "127.0.0.1:0".parse().unwrap(), false, &config, callbacks).unwrap();
        let addr = server.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        server.run_once(Some(Duration::from_millis(100))).unwrap();

        assert!(captured.lock().unwrap().starts_with("chatroom-"));
    }
}
