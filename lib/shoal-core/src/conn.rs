//! Per-socket connection state. Client and server connections share the
//! same byte-level plumbing (an input chain filled by `recv`, an output
//! chain drained by `send`); what differs between them is tracked in
//! `ConnKind` and interpreted by the router, not by the connection itself.
//! This is the tagged-variant-plus-shared-behavior shape used instead of a
//! trait object per connection kind: one struct, one small enum, one match
//! in the few places that actually need to branch.

use crate::chain::Chain;
use crate::mbuf::ChunkPool;
use crate::message::{ConnId, MessageId};
use mio::net::TcpStream;
use mio::Token;
use shoal_support::error::ProxyResult;
use std::collections::VecDeque;

#[derive(Debug)]
pub enum ConnKind {
    Client {
        /// Ids of requests accepted from this client whose responses have
        /// not all been returned yet, oldest first.
        in_flight: VecDeque<MessageId>,
    },
    Server {
        backend: usize,
        /// Fragment ids forwarded to this backend, oldest first; the
        /// memcached wire has no request id, so FIFO order is the only
        /// correlation available.
        forwarded: VecDeque<MessageId>,
        connected: bool,
    },
}

pub struct Connection {
    pub id: ConnId,
    pub token: Token,
    pub stream: TcpStream,
    pub kind: ConnKind,
    pub input: Chain,
    pub output: Chain,
    /// Set once the peer has sent EOF or a fatal I/O error occurred; the
    /// connection keeps flushing `output` (best effort) and is torn down
    /// once that chain empties.
    pub closing: bool,
}

impl Connection {
    pub fn new_client(id: ConnId, token: Token, stream: TcpStream, pool: &mut ChunkPool) -> Connection {
        Connection {
            id,
            token,
            stream,
            kind: ConnKind::Client { in_flight: VecDeque::new() },
            input: Chain::new(pool),
            output: Chain::new(pool),
            closing: false,
        }
    }

    pub fn new_server(
        id: ConnId,
        token: Token,
        stream: TcpStream,
        backend: usize,
        pool: &mut ChunkPool,
    ) -> Connection {
        Connection {
            id,
            token,
            stream,
            kind: ConnKind::Server {
                backend,
                forwarded: VecDeque::new(),
                connected: false,
            },
            input: Chain::new(pool),
            output: Chain::new(pool),
            closing: false,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.kind, ConnKind::Client { .. })
    }

    pub fn is_server(&self) -> bool {
        matches!(self.kind, ConnKind::Server { .. })
    }

    /// Fill `input` from the socket until it would block. A zero-byte read
    /// with no error means the peer sent EOF.
    pub fn recv(&mut self, pool: &mut ChunkPool) -> ProxyResult<usize> {
        let before = self.input.len();
        let n = self.input.ingress(&mut self.stream, pool)?;
        if n == 0 && before == self.input.len() {
            self.closing = true;
        }
        Ok(n)
    }

    /// Flush as much of `output` as the socket accepts.
    pub fn send(&mut self, pool: &mut ChunkPool) -> ProxyResult<usize> {
        self.output.egress(&mut self.stream, pool)
    }

    pub fn active(&self) -> bool {
        !self.closing || !self.output.is_empty()
    }

    pub fn close(&mut self, pool: &mut ChunkPool) {
        self.input.drain_to_pool(pool);
        self.output.drain_to_pool(pool);
    }
}

/// Wraps the read end of a signal self-pipe (or any similar wakeup fd) for
/// read-only readiness. Installing the `sigaction`/writer pairing that
/// actually feeds this fd is the out-of-scope signal trampoline; the core
/// only needs to drain whatever bytes show up so the fd's readiness is
/// cleared and the next `event_wait` doesn't immediately re-fire on it. The
/// wakeup itself, not the byte content, is what matters: it pulls the loop
/// out of a possibly long `wait` so it can re-check `Context::shutdown` and
/// any other state a caller set from a signal handler.
#[cfg(unix)]
pub struct AuxiliaryConnection {
    pub token: Token,
    file: std::fs::File,
}

#[cfg(unix)]
impl AuxiliaryConnection {
    /// # Safety
    /// `fd` must be a valid, open file descriptor that nothing else reads
    /// from; ownership of it transfers to this connection.
    pub unsafe fn from_raw_fd(token: Token, fd: std::os::unix::io::RawFd) -> AuxiliaryConnection {
        use std::os::unix::io::FromRawFd;
        AuxiliaryConnection { token, file: std::fs::File::from_raw_fd(fd) }
    }

    pub fn drain(&mut self) {
        use std::io::Read;
        let mut scratch = [0u8; 64];
        loop {
            match self.file.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    fn loopback_stream() -> TcpStream {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        TcpStream::connect(&addr).unwrap()
    }

    #[test]
    fn active_stays_true_while_output_has_unflushed_bytes() {
        let mut pool = ChunkPool::new(64);
        let mut conn = Connection::new_client(1, Token(1), loopback_stream(), &mut pool);
        conn.output.push(b"pending", &mut pool);
        conn.closing = true;

        assert!(conn.active());
    }

    #[test]
    fn active_is_false_once_closing_with_empty_output() {
        let mut pool = ChunkPool::new(64);
        let mut conn = Connection::new_client(2, Token(2), loopback_stream(), &mut pool);
        conn.closing = true;

        assert!(!conn.active());
    }

    #[test]
    fn new_server_starts_unconnected_with_no_forwarded_work() {
        let mut pool = ChunkPool::new(64);
        let conn = Connection::new_server(3, Token(3), loopback_stream(), 0, &mut pool);
        match conn.kind {
            ConnKind::Server { backend, forwarded, connected } => {
                assert_eq!(backend, 0);
                assert!(forwarded.is_empty());
                assert!(!connected);
            }
            _ => panic!("expected Server kind"),
        }
    }
}
