use std::fmt;
use std::io;
use std::net;

/// The result of a single non-blocking operation on a connection.
///
/// `Wait` means the operation made no progress because the underlying socket
/// would have blocked; the caller should retry once the event base reports
/// the fd ready again. Anything else is `Fatal` and the connection is torn
/// down by the caller.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug)]
pub enum ProxyError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug)]
pub enum ErrorKind {
    /// Parsed bytes did not match the memcached grammar.
    Parse(&'static str),
    /// A key violated the length or character-set constraint.
    InvalidKey(&'static str),
    /// The chunk pool could not satisfy an allocation.
    OutOfMemory,
    /// A pool has no server available to route to.
    NoServerAvailable,
    /// A forwarded request exceeded its deadline.
    Timeout,
    /// The configuration failed validation.
    Config(String),
    /// Any I/O failure other than `WouldBlock`.
    Io(io::ErrorKind),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Wait => write!(f, "operation would block"),
            ProxyError::Fatal(kind) => write!(f, "{:?}", kind),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> ProxyError {
        if err.kind() == io::ErrorKind::WouldBlock {
            ProxyError::Wait
        } else {
            ProxyError::Fatal(ErrorKind::Io(err.kind()))
        }
    }
}

impl From<net::AddrParseError> for ProxyError {
    fn from(_err: net::AddrParseError) -> ProxyError {
        ProxyError::Fatal(ErrorKind::Config("invalid socket address".to_owned()))
    }
}

/// Helper for call sites that only care whether a connection has died, not why.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for ProxyResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) | Err(ProxyError::Wait) => false,
            Err(ProxyError::Fatal(_)) => true,
        }
    }
}

/// A config-time validation error. Kept distinct from `ProxyError` because it
/// occurs before any socket exists and is always fatal to startup.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_maps_to_wait() {
        let io_err = io::Error::new(io::ErrorKind::WouldBlock, "x");
        let err: ProxyError = io_err.into();
        match err {
            ProxyError::Wait => {}
            _ => panic!("expected Wait"),
        }
    }

    #[test]
    fn other_io_errors_are_fatal() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "x");
        let err: ProxyError = io_err.into();
        match err {
            ProxyError::Fatal(ErrorKind::Io(io::ErrorKind::ConnectionReset)) => {}
            _ => panic!("expected Fatal(Io(ConnectionReset))"),
        }
    }

    #[test]
    fn has_failed_distinguishes_wait_from_fatal() {
        let waiting: ProxyResult<()> = Err(ProxyError::Wait);
        let fatal: ProxyResult<()> = Err(ProxyError::Fatal(ErrorKind::OutOfMemory));
        let ok: ProxyResult<()> = Ok(());

        assert!(!waiting.has_failed());
        assert!(fatal.has_failed());
        assert!(!ok.has_failed());
    }
}
