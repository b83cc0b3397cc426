//! TLS decoration of TCP handles through `tokio-rustls`.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::error::{Error, Operation};
use crate::handle::{Handle, TlsHandle};

/// Client-side TLS settings installed by [`Client::set_tls`](crate::Client::set_tls).
#[derive(Clone)]
pub(crate) struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl ClientTls {
    /// Validates `server_name`, falling back to `default_host` when it is empty.
    pub(crate) fn new(
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        default_host: &str,
    ) -> Result<Self, Error> {
        let name = if server_name.is_empty() {
            default_host
        } else {
            server_name
        };
        let server_name = ServerName::try_from(name.to_owned())
            .map_err(|error| Error::InvalidTlsConfig(format!("server name `{name}`: {error}")))?;
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    /// Performs the client handshake over an established TCP stream.
    pub(crate) async fn connect(&self, stream: TcpStream) -> Result<Handle, Error> {
        let stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|error| Error::transport(Operation::Handshake, error))?;
        wrap(TlsStream::from(stream))
    }
}

/// Server-side TLS settings installed by [`Server::set_tls`](crate::Server::set_tls).
#[derive(Clone)]
pub(crate) struct ServerTls {
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTls").finish_non_exhaustive()
    }
}

impl ServerTls {
    pub(crate) fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// Performs the server handshake over an accepted TCP stream.
    pub(crate) async fn accept(&self, stream: TcpStream) -> Result<Handle, Error> {
        let stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|error| Error::transport(Operation::Handshake, error))?;
        wrap(TlsStream::from(stream))
    }
}

fn wrap(stream: TlsStream<TcpStream>) -> Result<Handle, Error> {
    TlsHandle::new(stream)
        .map(Handle::Tls)
        .map_err(|error| Error::transport(Operation::Handshake, error))
}
