//! Accept loop and per-connection dispatch for TCP and Unix stream servers.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::Instrument;

use super::connection::ServerConnection;
use super::unix::SocketFile;
use super::{EXHAUSTED_BACKOFF, Inner, is_fatal, is_resource_exhausted, run_handler};
use crate::address::MultiSocketAddress;
use crate::callback::ConnState;
use crate::error::{Error, Operation, Result};
use crate::handle::Handle;

/// A bound stream listener.
#[derive(Debug)]
pub(super) enum StreamListener {
    Tcp(TcpListener),
    // The socket file is removed after the listener is closed.
    Unix(UnixListener, SocketFile),
}

enum Accepted {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl StreamListener {
    async fn accept(&self) -> io::Result<(Accepted, MultiSocketAddress)> {
        match self {
            StreamListener::Tcp(listener) => {
                let (stream, address) = listener.accept().await?;
                Ok((Accepted::Tcp(stream), address.into()))
            }
            StreamListener::Unix(listener, _) => {
                let (stream, address) = listener.accept().await?;
                Ok((Accepted::Unix(stream), address.into()))
            }
        }
    }

    pub(super) fn local_address(&self) -> MultiSocketAddress {
        let address: io::Result<MultiSocketAddress> = match self {
            StreamListener::Tcp(listener) => listener.local_addr().map(Into::into),
            StreamListener::Unix(listener, _) => listener.local_addr().map(Into::into),
        };
        address.unwrap_or_default()
    }
}

/// Counts a running dispatch in [`Inner::open`] for as long as it is alive.
struct OpenConnection(Arc<Inner>);

impl OpenConnection {
    fn new(inner: &Arc<Inner>) -> Self {
        inner.open.fetch_add(1, Ordering::AcqRel);
        Self(inner.clone())
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(super) async fn serve(inner: &Arc<Inner>, listener: &StreamListener) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                let open = OpenConnection::new(inner);
                let span = tracing::info_span!(parent: None, "dispatch", %remote);
                tokio::spawn(
                    async move {
                        let inner = open.0.clone();
                        dispatch(inner, stream, remote).await;
                        drop(open);
                    }
                    .instrument(span),
                );
            }
            Err(error) if inner.shutdown.is_cancelled() => {
                tracing::debug!(?error, "accept failed during shutdown");
                return Ok(());
            }
            Err(error) if !is_fatal(&error) => {
                let exhausted = is_resource_exhausted(&error);
                tracing::warn!(?error, "accept failed, continuing");
                inner.report(Error::transport(Operation::Accept, error));
                if exhausted {
                    tokio::select! {
                        () = inner.shutdown.cancelled() => return Ok(()),
                        () = tokio::time::sleep(EXHAUSTED_BACKOFF) => {}
                    }
                }
            }
            Err(error) => {
                tracing::error!(?error, "listener failed");
                return Err(inner.report(Error::transport(Operation::Accept, error)));
            }
        }
    }
}

/// Applies the buffer sizes, then the customization hook.
fn configure(inner: &Inner, socket: SockRef<'_>) {
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

async fn dispatch(inner: Arc<Inner>, stream: Accepted, remote: MultiSocketAddress) {
    let timeouts = inner.timeouts.snapshot();

    let handle = match stream {
        Accepted::Tcp(stream) => {
            configure(&inner, SockRef::from(&stream));
            match inner.tls.load() {
                None => Handle::Tcp(stream),
                Some(tls) => {
                    let accept = async {
                        match timeouts.read {
                            Some(timeout) => tokio::time::timeout(timeout, tls.accept(stream))
                                .await
                                .unwrap_or(Err(Error::TimedOut(Operation::Handshake))),
                            None => tls.accept(stream).await,
                        }
                    };
                    let result = tokio::select! {
                        biased;
                        () = inner.shutdown.cancelled() => Err(Error::ServerShutdown),
                        result = accept => result,
                    };
                    match result {
                        Ok(handle) => handle,
                        Err(error) => {
                            tracing::debug!(%error, "tls handshake failed");
                            inner.report(error);
                            return;
                        }
                    }
                }
            }
        }
        Accepted::Unix(stream) => {
            configure(&inner, SockRef::from(&stream));
            Handle::Unix(stream)
        }
    };

    let Some(handler) = inner.handler.load() else {
        tracing::warn!("no handler installed, dropping connection");
        return;
    };

    let connection = ServerConnection::stream(inner.clone(), handle, remote, timeouts);
    let (local, remote) = (connection.local_address(), connection.remote_address());
    tracing::debug!(%local, "accepted");
    inner
        .callbacks
        .info(local.clone(), remote.clone(), ConnState::Established);
    inner
        .callbacks
        .info(local, remote, ConnState::HandlerStarted);

    run_handler(&inner, handler, connection).await;
}
