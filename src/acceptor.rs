//! Listening socket owner (§4.5): `SO_REUSEADDR`/`SO_REUSEPORT`, and the
//! spare-fd-on-`/dev/null` trick for surviving `EMFILE` without spinning.
//!
//! The listening socket is built with raw `libc` calls rather than through
//! `mio::net::TcpListener::bind`, because `SO_REUSEPORT` has to be set
//! between `socket()` and `bind()` and the std/mio constructors don't expose
//! that window.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use mio::{Interest, Token};
use tracing::{error, warn};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn sockaddr_for(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, raw);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, raw);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn bind_listener(addr: SocketAddr, reuseport: bool) -> io::Result<RawFd> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe {
        cvt(libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?
    };

    let set_opt = |name: libc::c_int| -> io::Result<()> {
        let one: libc::c_int = 1;
        unsafe {
            cvt(libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                name,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ))?;
        }
        Ok(())
    };
    if let Err(err) = set_opt(libc::SO_REUSEADDR) {
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if reuseport {
        if let Err(err) = set_opt(libc::SO_REUSEPORT) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }

    let (storage, len) = sockaddr_for(addr);
    let bind_result = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if let Err(err) = cvt(bind_result) {
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if let Err(err) = cvt(unsafe { libc::listen(fd, libc::SOMAXCONN) }) {
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

fn open_idle_fd() -> io::Result<RawFd> {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    cvt(fd)
}

/// Owns the listening socket and a spare fd reserved for recovering from
/// `EMFILE`/`ENFILE` without busy-looping `accept`.
pub struct Acceptor {
    listener: mio::net::TcpListener,
    token: Token,
    idle_fd: RawFd,
    registered: bool,
}

impl Acceptor {
    /// Binds and starts listening on `addr`.
    pub fn bind(addr: SocketAddr, reuseport: bool, token: Token) -> io::Result<Self> {
        let fd = bind_listener(addr, reuseport)?;
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        let listener = mio::net::TcpListener::from_std(std_listener);
        let idle_fd = open_idle_fd()?;

        Ok(Acceptor {
            listener,
            token,
            idle_fd,
            registered: false,
        })
    }

    /// Registers the listening socket for readability with `registry`.
    pub fn register(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.register(&mut self.listener, self.token, Interest::READABLE)?;
        self.registered = true;
        Ok(())
    }

    /// The token the listening socket is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Drains every connection currently pending on the accept queue,
    /// invoking `on_accept` with the new stream and its peer address. Stops
    /// at `WouldBlock`. On `EMFILE`/`ENFILE`, frees the idle fd to let one
    /// more connection through, immediately closes it, and reopens the idle
    /// fd so the trick is available again.
    pub fn accept_all(&mut self, mut on_accept: impl FnMut(mio::net::TcpStream, SocketAddr)) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => on_accept(stream, addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    let raw = err.raw_os_error();
                    if raw == Some(libc::EMFILE) || raw == Some(libc::ENFILE) {
                        warn!(error = %err, "accept: out of file descriptors, dropping a pending connection");
                        unsafe { libc::close(self.idle_fd) };
                        let dropped = unsafe {
                            libc::accept(self.listener.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
                        };
                        if dropped >= 0 {
                            unsafe { libc::close(dropped) };
                        }
                        match open_idle_fd() {
                            Ok(fd) => self.idle_fd = fd,
                            Err(reopen_err) => error!(error = %reopen_err, "failed to reopen idle fd"),
                        }
                        return;
                    }
                    error!(error = %err, "accept failed");
                    return;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.idle_fd);
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("token", &self.token)
            .field("registered", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn bind_picks_an_ephemeral_port_and_accepts_a_connection() {
        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), false, Token(0)).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        // Give the kernel a moment to complete the handshake.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut accepted = 0;
        acceptor.accept_all(|_stream, _addr| accepted += 1);
        assert_eq!(1, accepted);
    }

    #[test]
    fn accept_all_returns_on_would_block_with_no_pending_connections() {
        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), false, Token(0)).unwrap();
        let mut accepted = 0;
        acceptor.accept_all(|_stream, _addr| accepted += 1);
        assert_eq!(0, accepted);
    }

    #[test]
    fn reuseport_allows_a_second_listener_on_the_same_port() {
        let first = Acceptor::bind("127.0.0.1:0".parse().unwrap(), true, Token(0)).unwrap();
        let addr = first.local_addr().unwrap();
        let second = Acceptor::bind(addr, true, Token(1));
        assert!(second.is_ok());
    }
}
