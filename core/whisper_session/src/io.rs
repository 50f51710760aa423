//! Socket registration with the manager's event loop

use std::cell::Cell;
use std::io;

use mio::event::Source;
use mio::{Interest, Registry, Token};

/// Token reserved for the messaging transport
pub const TRANSPORT_TOKEN: Token = Token(0);

/// Shared handle on the `mio` registry of the owning [`SessionManager`](crate::SessionManager)
///
/// Every socket the engine opens (ICE sockets, forwarding listeners and
/// tunnels) is registered here so that a single `Poll` wakes for all of
/// them. Tokens only need to be unique: the loop drains every socket on
/// each iteration rather than dispatching by token.
#[derive(Debug)]
pub struct IoContext {
    registry: Registry,
    next_token: Cell<usize>,
}

impl IoContext {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            next_token: Cell::new(TRANSPORT_TOKEN.0 + 1),
        }
    }

    pub fn register<S>(&self, source: &mut S, interests: Interest) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.next_token.get());
        self.next_token.set(token.0.wrapping_add(1).max(TRANSPORT_TOKEN.0 + 1));
        self.registry.register(source, token, interests)?;
        Ok(token)
    }

    pub fn deregister<S>(&self, source: &mut S)
    where
        S: Source + ?Sized,
    {
        if let Err(e) = self.registry.deregister(source) {
            log::debug!("Deregister failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;
    use mio::Poll;

    #[test]
    fn test_tokens_are_unique() {
        let poll = Poll::new().unwrap();
        let io = IoContext::new(poll.registry().try_clone().unwrap());

        let mut a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let ta = io.register(&mut a, Interest::READABLE).unwrap();
        let tb = io.register(&mut b, Interest::READABLE).unwrap();

        assert_ne!(ta, tb);
        assert_ne!(ta, TRANSPORT_TOKEN);
        io.deregister(&mut a);
        io.deregister(&mut b);
    }
}
