//! Error taxonomy shared by clients and servers.

use std::fmt::{self, Display, Formatter};
use std::io::ErrorKind;
use std::sync::Arc;

/// A result with the [`Error`] error.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The socket operation that produced a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Dialing the remote address.
    Dial,
    /// Binding or listening on the local address.
    Bind,
    /// Accepting an incoming stream connection.
    Accept,
    /// Receiving a datagram on a server socket.
    Receive,
    /// Reading from an established handle.
    Read,
    /// Writing to an established handle.
    Write,
    /// Tearing down an established handle.
    Close,
    /// Performing the TLS handshake.
    Handshake,
    /// Applying socket options or file permissions.
    Configure,
    /// Waiting for connection activity.
    Idle,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Dial => "dial",
            Operation::Bind => "bind",
            Operation::Accept => "accept",
            Operation::Receive => "receive",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Close => "close",
            Operation::Handshake => "tls handshake",
            Operation::Configure => "configure",
            Operation::Idle => "idle wait",
        };
        f.write_str(name)
    }
}

/// Errors reported by [`Client`](crate::Client) and [`Server`](crate::Server).
///
/// Every error is both returned to the caller of the failing operation and forwarded once to the
/// registered error callback, which is why this type is cheap to clone.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The instance is not usable in its current state (for example a server that is already
    /// serving).
    #[error("invalid instance: {0}")]
    InvalidInstance(&'static str),

    /// The network identifier is unknown or unsupported on this platform.
    #[error("invalid protocol `{0}`")]
    InvalidProtocol(String),

    /// The address does not fit the selected network.
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress {
        /// The rejected address as given by the caller.
        address: String,
        /// Why the address was rejected.
        reason: String,
    },

    /// The TLS configuration cannot be applied.
    #[error("invalid tls configuration: {0}")]
    InvalidTlsConfig(String),

    /// I/O was attempted while no handle is installed.
    #[error("not connected")]
    NotConnected,

    /// The operation was cancelled through its cancellation token.
    #[error("{0} cancelled")]
    Cancelled(Operation),

    /// The configured read or write timeout elapsed.
    #[error("{0} timed out")]
    TimedOut(Operation),

    /// The server is shutting down and refuses further I/O on this connection.
    #[error("server is shutting down")]
    ServerShutdown,

    /// A server handler panicked; the payload message is kept when it is a string.
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    /// Open connections did not drain before the shutdown deadline.
    #[error("timed out waiting for {0} open connection(s) to drain")]
    ShutdownTimeout(usize),

    /// Error reported by the operating system for the given operation.
    #[error("{operation} failed: {source}")]
    Transport {
        /// The failing operation.
        operation: Operation,
        /// The underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl Error {
    pub(crate) fn transport(operation: Operation, source: std::io::Error) -> Self {
        Error::Transport {
            operation,
            source: Arc::new(source),
        }
    }

    pub(crate) fn invalid_address(address: impl Into<String>, reason: impl Display) -> Self {
        Error::InvalidAddress {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the [`ErrorKind`] of the underlying I/O error, if any.
    pub fn io_kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Transport { source, .. } => Some(source.kind()),
            Error::NotConnected => Some(ErrorKind::NotConnected),
            Error::TimedOut(_) => Some(ErrorKind::TimedOut),
            _ => None,
        }
    }

    /// Whether this error only says the handle or listener was already closed.
    ///
    /// Such errors are expected while a server shuts down and are not forwarded to the error
    /// callback in that case.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::ServerShutdown | Error::NotConnected => true,
            Error::Transport { source, .. } => matches!(
                source.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionReset
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
