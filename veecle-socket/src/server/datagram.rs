//! Receive loop for UDP and Unix datagram servers.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::{UdpSocket, UnixDatagram};

use super::connection::ServerConnection;
use super::unix::SocketFile;
use super::{EXHAUSTED_BACKOFF, Inner, is_fatal, is_resource_exhausted, run_handler};
use crate::address::MultiSocketAddress;
use crate::callback::ConnState;
use crate::error::{Error, Operation, Result};

/// Largest datagram payload a server receives in full; UDP cannot carry more.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// A bound datagram socket, shared with the connections that reply through it.
#[derive(Debug)]
pub(crate) enum DatagramSocket {
    Udp(UdpSocket),
    // The socket file is removed once the last reply path is gone.
    UnixGram(UnixDatagram, SocketFile),
}

impl DatagramSocket {
    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, MultiSocketAddress)> {
        match self {
            DatagramSocket::Udp(socket) => {
                let (length, peer) = socket.recv_from(buffer).await?;
                Ok((length, peer.into()))
            }
            DatagramSocket::UnixGram(socket, _) => {
                let (length, peer) = socket.recv_from(buffer).await?;
                Ok((length, peer.into()))
            }
        }
    }

    /// Sends one datagram to `peer`, which must be addressable on this transport.
    pub(super) async fn send_to(
        &self,
        buffer: &[u8],
        peer: &MultiSocketAddress,
    ) -> io::Result<usize> {
        match (self, peer) {
            (DatagramSocket::Udp(socket), MultiSocketAddress::Inet(address)) => {
                socket.send_to(buffer, *address).await
            }
            (DatagramSocket::UnixGram(socket, _), MultiSocketAddress::Unix(Some(path))) => {
                socket.send_to(buffer, path).await
            }
            _ => Err(io::Error::new(
                ErrorKind::NotConnected,
                "datagram sender is not addressable",
            )),
        }
    }

    pub(super) fn local_address(&self) -> MultiSocketAddress {
        let address: io::Result<MultiSocketAddress> = match self {
            DatagramSocket::Udp(socket) => socket.local_addr().map(Into::into),
            DatagramSocket::UnixGram(socket, _) => socket.local_addr().map(Into::into),
        };
        address.unwrap_or_default()
    }

    fn socket(&self) -> SockRef<'_> {
        match self {
            DatagramSocket::Udp(socket) => SockRef::from(socket),
            DatagramSocket::UnixGram(socket, _) => SockRef::from(socket),
        }
    }
}

fn configure(inner: &Inner, socket: &DatagramSocket) {
    let socket = socket.socket();
    let result = inner
        .read_buffer
        .get()
        .map_or(Ok(()), |size| socket.set_recv_buffer_size(size))
        .and_then(|()| {
            inner
                .write_buffer
                .get()
                .map_or(Ok(()), |size| socket.set_send_buffer_size(size))
        });
    if let Err(error) = result {
        inner.report(Error::transport(Operation::Configure, error));
    }
    inner.update_conn(socket);
}

pub(super) async fn serve(inner: &Arc<Inner>, socket: &Arc<DatagramSocket>) -> Result<()> {
    configure(inner, socket);
    let local = socket.local_address();
    let mut buffer = vec![0; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buffer) => received,
        };

        match received {
            Ok((length, peer)) => {
                tracing::trace!(%peer, length, "received datagram");

                let Some(handler) = inner.handler.load() else {
                    tracing::warn!("no handler installed, dropping datagram");
                    continue;
                };

                inner
                    .callbacks
                    .info(local.clone(), peer.clone(), ConnState::HandlerStarted);
                let connection = ServerConnection::datagram(
                    inner.clone(),
                    socket.clone(),
                    buffer[..length].to_vec(),
                    local.clone(),
                    peer,
                );
                run_handler(inner, handler, connection).await;
            }
            Err(error) if inner.shutdown.is_cancelled() => {
                tracing::debug!(?error, "receive failed during shutdown");
                return Ok(());
            }
            Err(error) if !is_fatal(&error) => {
                let exhausted = is_resource_exhausted(&error);
                tracing::warn!(?error, "receive failed, continuing");
                inner.report(Error::transport(Operation::Receive, error));
                if exhausted {
                    tokio::select! {
                        () = inner.shutdown.cancelled() => return Ok(()),
                        () = tokio::time::sleep(EXHAUSTED_BACKOFF) => {}
                    }
                }
            }
            Err(error) => {
                tracing::error!(?error, "datagram socket failed");
                return Err(inner.report(Error::transport(Operation::Receive, error)));
            }
        }
    }
}
