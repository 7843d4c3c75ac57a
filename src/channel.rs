//! Binding of one fd to a loop: interests and last-reported registration
//! state.

use mio::{Interest, Token};

/// Exclusively owned by one `EventLoop`. Does not own the underlying fd.
#[derive(Debug)]
pub struct Channel {
    token: Token,
    interest: Interest,
    registered: bool,
}

impl Channel {
    /// Creates a channel for `token`, initially interested in readability
    /// only (the common case for a freshly accepted connection).
    pub fn new(token: Token) -> Self {
        Channel {
            token,
            interest: Interest::READABLE,
            registered: false,
        }
    }

    /// The token this channel is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Current interest set.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Whether this channel has been registered with a poller yet.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Marks the channel as registered (called after a successful
    /// `Poller::add_or_update`).
    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    /// Marks the channel as deregistered.
    pub fn mark_deregistered(&mut self) {
        self.registered = false;
    }

    /// Enables the writable interest in addition to whatever is already set.
    pub fn enable_writing(&mut self) {
        self.interest = self.interest | Interest::WRITABLE;
    }

    /// Disables the writable interest, leaving readability untouched.
    pub fn disable_writing(&mut self) {
        self.interest = Interest::READABLE;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_channel_is_interested_in_read_only() {
        let ch = Channel::new(Token(1));
        assert_eq!(Interest::READABLE, ch.interest());
    }

    #[test]
    fn enable_then_disable_writing_round_trips() {
        let mut ch = Channel::new(Token(1));
        ch.enable_writing();
        assert!(ch.interest().is_writable());
        ch.disable_writing();
        assert!(!ch.interest().is_writable());
        assert!(ch.interest().is_readable());
    }

}
