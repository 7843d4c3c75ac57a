//! OS readiness notifier. Wraps `mio::Poll` behind a small capability so the
//! rest of the crate only depends on "add/update/remove/poll", not on `mio`
//! types leaking everywhere.

use std::io;
use std::time::{Duration, Instant};

use mio::{event::Source, Events, Interest, Token};

/// A single reported readiness event.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    /// The token the interest was registered under.
    pub token: Token,
    /// Whether the fd became readable.
    pub readable: bool,
    /// Whether the fd became writable.
    pub writable: bool,
    /// Whether the peer hung up or the fd errored.
    pub error_or_hangup: bool,
}

/// Edge-triggered readiness notifier. The default implementation is backed by
/// `mio::Poll`, which is edge-triggered on Linux (epoll) by construction when
/// registered without `Interest::LEVEL` — callers MUST drain reads/writes
/// until they observe `WouldBlock`.
pub struct Poller {
    poll: mio::Poll,
    events: Events,
}

impl Poller {
    /// Creates a poller with room for `capacity` simultaneously-active events.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Poller {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(capacity.max(64)),
        })
    }

    /// Registers or updates interest for `source` under `token`.
    pub fn add_or_update<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
        already_registered: bool,
    ) -> io::Result<()> {
        if already_registered {
            self.poll.registry().reregister(source, token, interest)
        } else {
            self.poll.registry().register(source, token, interest)
        }
    }

    /// Deregisters `source`. No-op if it wasn't registered.
    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Polls for readiness, blocking up to `timeout` (or forever if `None`).
    /// If the preallocated event list filled up, it is doubled before the
    /// next call so bursts don't repeatedly truncate.
    ///
    /// Returns the events observed and the monotonic instant of the wake-up.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(Vec<ReadyEvent>, Instant)> {
        self.poll.poll(&mut self.events, timeout)?;
        let now = Instant::now();

        let filled = self.events.iter().count() == self.events.capacity();
        let out: Vec<ReadyEvent> = self
            .events
            .iter()
            .map(|e| ReadyEvent {
                token: e.token(),
                readable: e.is_readable(),
                writable: e.is_writable(),
                error_or_hangup: e.is_error() || e.is_read_closed() || e.is_write_closed(),
            })
            .collect();

        if filled {
            let new_cap = self.events.capacity() * 2;
            self.events = Events::with_capacity(new_cap);
        }

        Ok((out, now))
    }

    /// Exposes the underlying registry for components (the waker) that need
    /// to register directly.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("capacity", &self.events.capacity())
            .finish()
    }
}
