//! Error and connection-state notifications.
//!
//! Callbacks are best-effort observers: they run on their own unit of concurrency (a blocking-pool
//! task, or a fresh thread outside a runtime) and cannot influence the operation that fired them.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use socket2::SockRef;

use crate::address::MultiSocketAddress;
use crate::error::Error;
use crate::state::Slot;

/// Receives every error observed by a client, server or server connection.
pub type FuncError = Arc<dyn Fn(Error) + Send + Sync>;

/// Receives every connection-state transition with the local and remote address at that point.
pub type FuncInfo = Arc<dyn Fn(MultiSocketAddress, MultiSocketAddress, ConnState) + Send + Sync>;

/// Receives server lifecycle messages.
pub type FuncInfoServer = Arc<dyn Fn(String) + Send + Sync>;

/// Customizes a server socket before use: each accepted stream connection, or the bound datagram
/// socket once when serving starts.
pub type FuncUpdateConn = Arc<dyn Fn(SockRef<'_>) + Send + Sync>;

/// A connection-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// A client started dialing.
    DialStarted,
    /// A connection was established (dialed or accepted).
    Established,
    /// A read is about to be performed.
    ReadBegin,
    /// A write is about to be performed.
    WriteBegin,
    /// The read side of a server connection is being shut down.
    CloseRead,
    /// The write side of a server connection is being shut down.
    CloseWrite,
    /// A server dispatch handed the connection to the handler.
    HandlerStarted,
    /// The connection is being closed.
    Closed,
}

impl Display for ConnState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::DialStarted => "dial connection started",
            ConnState::Established => "connection established",
            ConnState::ReadBegin => "read from connection",
            ConnState::WriteBegin => "write to connection",
            ConnState::CloseRead => "close incoming stream",
            ConnState::CloseWrite => "close outgoing stream",
            ConnState::HandlerStarted => "handler started",
            ConnState::Closed => "connection closed",
        };
        f.write_str(name)
    }
}

/// The callbacks registered on one instance.
///
/// Each kind holds at most one function; registering replaces it and `None` unregisters.
#[derive(Default)]
pub(crate) struct Callbacks {
    error: Slot<FuncError>,
    info: Slot<FuncInfo>,
    server: Slot<FuncInfoServer>,
}

impl Debug for Callbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("error", &self.error.is_set())
            .field("info", &self.info.is_set())
            .field("server", &self.server.is_set())
            .finish()
    }
}

impl Callbacks {
    pub(crate) fn set_error(&self, function: Option<FuncError>) {
        self.error.store(function);
    }

    pub(crate) fn set_info(&self, function: Option<FuncInfo>) {
        self.info.store(function);
    }

    pub(crate) fn set_server(&self, function: Option<FuncInfoServer>) {
        self.server.store(function);
    }

    /// Forwards `error` to the error callback and hands it back for returning to the caller.
    pub(crate) fn error(&self, error: Error) -> Error {
        tracing::debug!(%error, "reporting error");
        if let Some(function) = self.error.load() {
            let reported = error.clone();
            dispatch(move || function(reported));
        }
        error
    }

    pub(crate) fn info(
        &self,
        local: MultiSocketAddress,
        remote: MultiSocketAddress,
        state: ConnState,
    ) {
        tracing::trace!(%local, %remote, %state, "connection state");
        if let Some(function) = self.info.load() {
            dispatch(move || function(local, remote, state));
        }
    }

    pub(crate) fn server(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%message, "server lifecycle");
        if let Some(function) = self.server.load() {
            dispatch(move || function(message));
        }
    }
}

/// Runs `job` detached from the caller.
fn dispatch(job: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            drop(runtime.spawn_blocking(job));
        }
        Err(_) => {
            if let Err(error) = std::thread::Builder::new()
                .name("veecle-socket-callback".into())
                .spawn(job)
            {
                tracing::warn!(?error, "failed to spawn callback thread");
            }
        }
    }
}
