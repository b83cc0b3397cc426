//! The transport-native byte channel owned by a client or a server dispatch.
//!
//! All operations take `&self`, so a handle can be shared behind an [`Arc`](std::sync::Arc) while
//! the owner swaps it out. Reads and writes on plain sockets go through readiness plus `try_*`
//! calls; TLS streams are split into independently locked halves.

use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket, UnixDatagram, UnixStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsStream;

use crate::address::MultiSocketAddress;
use crate::error::{Error, Operation};

/// A TCP stream wrapped in TLS.
#[derive(Debug)]
pub(crate) struct TlsHandle {
    reader: Mutex<ReadHalf<TlsStream<TcpStream>>>,
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    // Duplicate of the underlying descriptor, for probing and shutdown.
    raw: socket2::Socket,
    local: SocketAddr,
    remote: SocketAddr,
}

impl TlsHandle {
    pub(crate) fn new(stream: TlsStream<TcpStream>) -> io::Result<Self> {
        let tcp = stream.get_ref().0;
        let raw = SockRef::from(tcp).try_clone()?;
        let local = tcp.local_addr()?;
        let remote = tcp.peer_addr()?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            raw,
            local,
            remote,
        })
    }
}

/// An established handle for one of the four transports.
#[derive(Debug)]
pub(crate) enum Handle {
    Tcp(TcpStream),
    Tls(TlsHandle),
    Unix(UnixStream),
    Udp(UdpSocket),
    UnixGram(UnixDatagram),
}

impl Handle {
    /// Reads into `buffer`; for datagram transports this receives one datagram.
    pub(crate) async fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        match self {
            Handle::Tcp(stream) => loop {
                stream.readable().await?;
                match stream.try_read(buffer) {
                    Err(error) if error.kind() == ErrorKind::WouldBlock => continue,
                    result => return result,
                }
            },
            Handle::Unix(stream) => loop {
                stream.readable().await?;
                match stream.try_read(buffer) {
                    Err(error) if error.kind() == ErrorKind::WouldBlock => continue,
                    result => return result,
                }
            },
            Handle::Tls(tls) => tls.reader.lock().await.read(buffer).await,
            Handle::Udp(socket) => socket.recv(buffer).await,
            Handle::UnixGram(socket) => socket.recv(buffer).await,
        }
    }

    /// Writes from `buffer`; for datagram transports this sends one datagram.
    pub(crate) async fn write(&self, buffer: &[u8]) -> io::Result<usize> {
        match self {
            Handle::Tcp(stream) => loop {
                stream.writable().await?;
                match stream.try_write(buffer) {
                    Err(error) if error.kind() == ErrorKind::WouldBlock => continue,
                    result => return result,
                }
            },
            Handle::Unix(stream) => loop {
                stream.writable().await?;
                match stream.try_write(buffer) {
                    Err(error) if error.kind() == ErrorKind::WouldBlock => continue,
                    result => return result,
                }
            },
            Handle::Tls(tls) => {
                let mut writer = tls.writer.lock().await;
                let written = writer.write(buffer).await?;
                writer.flush().await?;
                Ok(written)
            }
            Handle::Udp(socket) => socket.send(buffer).await,
            Handle::UnixGram(socket) => socket.send(buffer).await,
        }
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self, Handle::Tcp(_) | Handle::Tls(_) | Handle::Unix(_))
    }

    pub(crate) fn local_address(&self) -> MultiSocketAddress {
        let address: io::Result<MultiSocketAddress> = match self {
            Handle::Tcp(stream) => stream.local_addr().map(Into::into),
            Handle::Tls(tls) => Ok(tls.local.into()),
            Handle::Unix(stream) => stream.local_addr().map(Into::into),
            Handle::Udp(socket) => socket.local_addr().map(Into::into),
            Handle::UnixGram(socket) => socket.local_addr().map(Into::into),
        };
        address.unwrap_or_default()
    }

    pub(crate) fn remote_address(&self) -> MultiSocketAddress {
        let address: io::Result<MultiSocketAddress> = match self {
            Handle::Tcp(stream) => stream.peer_addr().map(Into::into),
            Handle::Tls(tls) => Ok(tls.remote.into()),
            Handle::Unix(stream) => stream.peer_addr().map(Into::into),
            Handle::Udp(socket) => socket.peer_addr().map(Into::into),
            Handle::UnixGram(socket) => socket.peer_addr().map(Into::into),
        };
        address.unwrap_or_default()
    }

    fn socket(&self) -> SockRef<'_> {
        match self {
            Handle::Tcp(stream) => SockRef::from(stream),
            Handle::Tls(tls) => SockRef::from(&tls.raw),
            Handle::Unix(stream) => SockRef::from(stream),
            Handle::Udp(socket) => SockRef::from(socket),
            Handle::UnixGram(socket) => SockRef::from(socket),
        }
    }

    /// Best-effort liveness check.
    ///
    /// Stream handles get a zero-length non-blocking send, which surfaces a reset peer, and a
    /// non-blocking peek, which surfaces a peer that shut down its write side. Datagram handles
    /// only report a pending socket error (for example an ICMP port unreachable recorded by an
    /// earlier send), since an empty datagram would reach the peer.
    pub(crate) fn is_alive(&self) -> bool {
        let socket = self.socket();
        match socket.take_error() {
            Ok(None) => {}
            Ok(Some(error)) | Err(error) => {
                tracing::debug!(?error, "handle reports pending error");
                return false;
            }
        }

        if !self.is_stream() {
            return true;
        }

        if let Err(error) = socket.send(&[])
            && error.kind() != ErrorKind::WouldBlock
        {
            tracing::debug!(?error, "zero-length send failed");
            return false;
        }

        let mut byte = [MaybeUninit::<u8>::uninit()];
        match socket.peek(&mut byte) {
            Ok(0) => {
                tracing::debug!("peer closed the connection");
                false
            }
            Ok(_) => true,
            Err(error) => error.kind() == ErrorKind::WouldBlock,
        }
    }

    /// Shuts down both directions, waking any task blocked on the handle.
    ///
    /// Peers that already went away are not an error.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        self.shutdown_direction(Shutdown::Both)
    }

    /// Shuts down one or both directions at the socket level.
    ///
    /// For TLS this bypasses the TLS session, so no `close_notify` is sent.
    pub(crate) fn shutdown_direction(&self, how: Shutdown) -> io::Result<()> {
        match self.socket().shutdown(how) {
            Err(error) if error.kind() != ErrorKind::NotConnected => Err(error),
            _ => Ok(()),
        }
    }
}

/// Runs one I/O call under an optional deadline, mapping failures to typed errors.
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    operation: Operation,
    call: impl Future<Output = io::Result<T>>,
) -> Result<T, Error> {
    let result = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Error::TimedOut(operation))?,
        None => call.await,
    };
    result.map_err(|error| Error::transport(operation, error))
}
