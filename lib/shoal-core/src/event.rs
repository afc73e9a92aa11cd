//! A thin adapter over `mio::Poll`. Connections are slotted into a vector
//! keyed by `mio::Token`, with a free list for reuse, mirroring the
//! slab-plus-free-list pattern used to track live sockets elsewhere in this
//! codebase. Readiness is delivered edge-triggered by mio; every caller is
//! expected to drain an operation until it reports `Wait` before returning
//! to the loop, since mio will not re-signal a still-ready fd on the next
//! `wait` otherwise.

use mio::{Events, Poll, PollOpt, Ready, Token};
use shoal_support::error::ProxyResult;
use std::time::Duration;

pub const LISTENER_TOKEN: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    fn from_mio(ready: Ready) -> Readiness {
        Readiness {
            readable: ready.is_readable(),
            writable: ready.is_writable(),
            error: ready.is_hup() || ready.is_error(),
        }
    }
}

pub struct EventBase {
    poll: Poll,
    events: Events,
    free_tokens: Vec<usize>,
    next_token: usize,
}

impl EventBase {
    pub fn new() -> ProxyResult<EventBase> {
        Ok(EventBase {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            free_tokens: Vec::new(),
            // Token(0) is reserved for the listener.
            next_token: 1,
        })
    }

    pub fn register_listener<E: mio::Evented>(&mut self, source: &E) -> ProxyResult<()> {
        self.poll
            .register(source, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;
        Ok(())
    }

    /// Allocate a token for a new connection and subscribe it for read and
    /// write readiness, edge-triggered.
    pub fn register<E: mio::Evented>(&mut self, source: &E) -> ProxyResult<Token> {
        let id = self.free_tokens.pop().unwrap_or_else(|| {
            let id = self.next_token;
            self.next_token += 1;
            id
        });
        let token = Token(id);
        self.poll
            .register(source, token, Ready::readable() | Ready::writable(), PollOpt::edge())?;
        Ok(token)
    }

    /// Allocate a token for a read-only source such as a signal self-pipe.
    /// Unlike `register`, never subscribes for writable readiness.
    pub fn register_auxiliary<E: mio::Evented>(&mut self, source: &E) -> ProxyResult<Token> {
        let id = self.free_tokens.pop().unwrap_or_else(|| {
            let id = self.next_token;
            self.next_token += 1;
            id
        });
        let token = Token(id);
        self.poll.register(source, token, Ready::readable(), PollOpt::edge())?;
        Ok(token)
    }

    /// Switch a connection's write interest on or off without touching its
    /// read interest. Used once an output chain empties so a connection
    /// with nothing left to flush stops waking the loop on every writable
    /// edge.
    pub fn set_writable<E: mio::Evented>(&mut self, source: &E, token: Token, writable: bool) -> ProxyResult<()> {
        let mut interest = Ready::readable();
        if writable {
            interest |= Ready::writable();
        }
        self.poll.reregister(source, token, interest, PollOpt::edge())?;
        Ok(())
    }

    pub fn deregister<E: mio::Evented>(&mut self, source: &E, token: Token) -> ProxyResult<()> {
        self.poll.deregister(source)?;
        self.free_tokens.push(token.0);
        Ok(())
    }

    /// Block until at least one event is ready or `timeout` elapses,
    /// invoking `dispatch` once per ready token. The timeout is supplied by
    /// the caller, bounded by the timing wheel's next deadline so pending
    /// request and reconnect timers fire on schedule even with nothing else
    /// happening on the wire.
    pub fn wait<F: FnMut(Token, Readiness)>(&mut self, timeout: Option<Duration>, mut dispatch: F) -> ProxyResult<()> {
        self.poll.poll(&mut self.events, timeout)?;
        for event in self.events.iter() {
            dispatch(event.token(), Readiness::from_mio(event.readiness()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::{Read, Write};

    #[test]
    fn registers_and_reports_readiness_on_a_real_socket_pair() {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut base = EventBase::new().unwrap();
        base.register_listener(&listener).unwrap();

        let mut client = TcpStream::connect(&addr).unwrap();
        let client_token = base.register(&client).unwrap();

        let mut saw_listener_readable = false;
        let mut attempts = 0;
        while !saw_listener_readable && attempts < 50 {
            base.wait(Some(Duration::from_millis(50)), |token, ready| {
                if token == LISTENER_TOKEN && ready.readable {
                    saw_listener_readable = true;
                }
            })
            .unwrap();
            attempts += 1;
        }
        assert!(saw_listener_readable);

        let (mut accepted, _) = listener.accept().unwrap();
        accepted.write_all(b"hi").unwrap();

        let mut saw_client_readable = false;
        let mut attempts = 0;
        while !saw_client_readable && attempts < 50 {
            base.wait(Some(Duration::from_millis(50)), |token, ready| {
                if token == client_token && ready.readable {
                    saw_client_readable = true;
                }
            })
            .unwrap();
            attempts += 1;
        }
        assert!(saw_client_readable);

        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        base.deregister(&client, client_token).unwrap();
    }
}
