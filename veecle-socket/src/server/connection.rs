//! The connection value handed to a server [`Handler`](super::Handler).

use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::Inner;
use super::datagram::DatagramSocket;
use crate::address::MultiSocketAddress;
use crate::callback::ConnState;
use crate::error::{Error, Operation, Result};
use crate::handle::{Handle, with_timeout};
use crate::state::{Activity, Slot, TimeoutSnapshot};

#[derive(Debug)]
enum Kind {
    /// An accepted stream connection, owned by this dispatch.
    Stream(Handle),

    /// One received datagram; writes reply to its sender.
    Datagram {
        socket: Arc<DatagramSocket>,
        pending: Slot<Vec<u8>>,
    },
}

/// One accepted stream connection, or one received datagram.
///
/// Reads and writes observe server shutdown and fail with [`Error::ServerShutdown`] once it has
/// been requested. Dropping a stream connection closes it.
#[derive(Debug)]
pub struct ServerConnection {
    server: Arc<Inner>,
    kind: Kind,
    local: MultiSocketAddress,
    remote: MultiSocketAddress,
    timeouts: TimeoutSnapshot,
    activity: Arc<Activity>,
    closed: AtomicBool,
}

impl ServerConnection {
    pub(super) fn stream(
        server: Arc<Inner>,
        handle: Handle,
        remote: MultiSocketAddress,
        timeouts: TimeoutSnapshot,
    ) -> Self {
        Self {
            server,
            local: handle.local_address(),
            remote,
            kind: Kind::Stream(handle),
            timeouts,
            activity: Arc::new(Activity::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(super) fn datagram(
        server: Arc<Inner>,
        socket: Arc<DatagramSocket>,
        data: Vec<u8>,
        local: MultiSocketAddress,
        remote: MultiSocketAddress,
    ) -> Self {
        let timeouts = TimeoutSnapshot {
            read: None,
            ..server.timeouts.snapshot()
        };
        Self {
            server,
            kind: Kind::Datagram {
                socket,
                pending: Slot::new(Some(data)),
            },
            local,
            remote,
            timeouts,
            activity: Arc::new(Activity::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(super) fn activity(&self) -> Arc<Activity> {
        self.activity.clone()
    }

    pub(super) fn idle_timeout(&self) -> Option<Duration> {
        self.timeouts.idle
    }

    /// The server-side address of this connection.
    pub fn local_address(&self) -> MultiSocketAddress {
        self.local.clone()
    }

    /// The peer address; unspecified for an unnamed Unix datagram sender.
    pub fn remote_address(&self) -> MultiSocketAddress {
        self.remote.clone()
    }

    /// Whether this is a single received datagram rather than a stream connection.
    pub fn is_datagram(&self) -> bool {
        matches!(self.kind, Kind::Datagram { .. })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::NotConnected)
        } else if self.server.shutdown.is_cancelled() {
            Err(Error::ServerShutdown)
        } else {
            Ok(())
        }
    }

    /// Reads into `buffer`.
    ///
    /// For a datagram, the first read returns the datagram (truncated to `buffer`) and every later
    /// read returns `0`.
    pub async fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        let result = async {
            self.check_open()?;
            self.server.callbacks.info(
                self.local.clone(),
                self.remote.clone(),
                ConnState::ReadBegin,
            );

            match &self.kind {
                Kind::Stream(handle) => {
                    tokio::select! {
                        biased;
                        () = self.server.shutdown.cancelled() => Err(Error::ServerShutdown),
                        result = with_timeout(
                            self.timeouts.read,
                            Operation::Read,
                            handle.read(buffer),
                        ) => result,
                    }
                }
                Kind::Datagram { pending, .. } => Ok(pending.take().map_or(0, |data| {
                    let length = data.len().min(buffer.len());
                    buffer[..length].copy_from_slice(&data[..length]);
                    length
                })),
            }
        };
        let result = result.await;
        self.activity.touch();
        result.map_err(|error| self.server.report(error))
    }

    /// Writes `buffer`; for a datagram this sends one reply datagram to the sender.
    pub async fn write(&self, buffer: &[u8]) -> Result<usize> {
        let result = async {
            self.check_open()?;
            self.server.callbacks.info(
                self.local.clone(),
                self.remote.clone(),
                ConnState::WriteBegin,
            );

            let write = async {
                match &self.kind {
                    Kind::Stream(handle) => {
                        with_timeout(self.timeouts.write, Operation::Write, handle.write(buffer))
                            .await
                    }
                    Kind::Datagram { socket, .. } => {
                        let send = socket.send_to(buffer, &self.remote);
                        with_timeout(self.timeouts.write, Operation::Write, send).await
                    }
                }
            };

            tokio::select! {
                biased;
                () = self.server.shutdown.cancelled() => Err(Error::ServerShutdown),
                result = write => result,
            }
        };
        let result = result.await;
        self.activity.touch();
        result.map_err(|error| self.server.report(error))
    }

    /// Writes all of `buffer`, looping over short writes on stream connections.
    pub async fn write_all(&self, buffer: &[u8]) -> Result<()> {
        if self.is_datagram() {
            return self.write(buffer).await.map(drop);
        }

        let mut remaining = buffer;
        while !remaining.is_empty() {
            match self.write(remaining).await? {
                0 => {
                    let error = std::io::Error::from(std::io::ErrorKind::WriteZero);
                    return Err(self
                        .server
                        .report(Error::transport(Operation::Write, error)));
                }
                written => remaining = &remaining[written..],
            }
        }
        Ok(())
    }

    /// Closes the connection; a second call returns [`Error::NotConnected`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(self.server.report(Error::NotConnected));
        }
        self.finish()
    }

    /// Shuts down the read side of a stream connection; later reads return `0`.
    ///
    /// For a datagram this discards the unread datagram.
    pub fn close_read(&self) -> Result<()> {
        self.close_direction(Shutdown::Read, ConnState::CloseRead)
    }

    /// Shuts down the write side of a stream connection, so the peer reads end of stream.
    ///
    /// Has no effect on a datagram.
    pub fn close_write(&self) -> Result<()> {
        self.close_direction(Shutdown::Write, ConnState::CloseWrite)
    }

    fn close_direction(&self, how: Shutdown, state: ConnState) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.server.report(Error::NotConnected));
        }

        match &self.kind {
            Kind::Stream(handle) => {
                tracing::debug!(remote = %self.remote, ?how, "half close");
                self.server
                    .callbacks
                    .info(self.local.clone(), self.remote.clone(), state);
                handle
                    .shutdown_direction(how)
                    .map_err(|error| self.server.report(Error::transport(Operation::Close, error)))
            }
            Kind::Datagram { pending, .. } => {
                if how == Shutdown::Read {
                    pending.store(None);
                }
                Ok(())
            }
        }
    }

    fn finish(&self) -> Result<()> {
        let Kind::Stream(handle) = &self.kind else {
            return Ok(());
        };

        tracing::debug!(remote = %self.remote, "closing");
        self.server.callbacks.info(
            self.local.clone(),
            self.remote.clone(),
            ConnState::Closed,
        );
        handle
            .shutdown()
            .map_err(|error| self.server.report(Error::transport(Operation::Close, error)))
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.finish();
        }
    }
}
