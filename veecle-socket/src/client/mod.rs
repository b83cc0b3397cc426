//! Outbound connections over any of the four transports.
//!
//! A [`Client`] owns at most one handle at a time. All of its state lives in lock-free cells, so
//! a `Client` can be cloned and used from several tasks; composite sequences such as "check
//! connected, then read" are not atomic and a racing [`Client::close`] surfaces as
//! [`Error::NotConnected`] or an end-of-stream read.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use crate::address::{Endpoint, InetAddress, MultiSocketAddress};
use crate::callback::{Callbacks, ConnState, FuncError, FuncInfo};
use crate::config::ClientConfig;
use crate::error::{Error, Operation, Result};
use crate::handle::{Handle, with_timeout};
use crate::network::Network;
use crate::state::{Slot, Timeouts};
use crate::tls::ClientTls;

mod once;
mod tcp;
mod udp;
mod unix;
mod unixgram;

pub use self::once::NoResponse;

/// Transport-specific dialing, chosen once at construction.
#[derive(Debug)]
enum Dialer {
    Tcp(InetAddress),
    Udp(InetAddress),
    Unix(Utf8PathBuf),
    UnixGram(Utf8PathBuf),
}

impl Dialer {
    fn new(network: Network, endpoint: Endpoint) -> Result<Self> {
        match (network, endpoint) {
            (Network::Tcp, Endpoint::Inet(address)) => Ok(Dialer::Tcp(address)),
            (Network::Udp, Endpoint::Inet(address)) => Ok(Dialer::Udp(address)),
            (Network::Unix, Endpoint::Path(path)) => Ok(Dialer::Unix(path)),
            (Network::UnixGram, Endpoint::Path(path)) => Ok(Dialer::UnixGram(path)),
            (network, endpoint) => Err(Error::invalid_address(
                endpoint.to_string(),
                format_args!("not a {network} address"),
            )),
        }
    }

    async fn dial(&self, tls: Option<&ClientTls>) -> Result<Handle> {
        match self {
            Dialer::Tcp(address) => tcp::dial(address, tls).await,
            Dialer::Udp(address) => udp::dial(address).await,
            Dialer::Unix(path) => unix::dial(path).await,
            Dialer::UnixGram(path) => unixgram::dial(path),
        }
    }

    fn host(&self) -> &str {
        match self {
            Dialer::Tcp(address) | Dialer::Udp(address) => address.host(),
            Dialer::Unix(_) | Dialer::UnixGram(_) => "",
        }
    }
}

/// An installed handle with the addresses it had when it was established.
#[derive(Debug)]
struct Connection {
    handle: Handle,
    local: MultiSocketAddress,
    remote: MultiSocketAddress,
}

impl Connection {
    fn new(handle: Handle) -> Self {
        Self {
            local: handle.local_address(),
            remote: handle.remote_address(),
            handle,
        }
    }
}

#[derive(Debug)]
struct Inner {
    network: Network,
    address: String,
    dialer: Dialer,
    tls: Slot<ClientTls>,
    callbacks: Callbacks,
    connection: Slot<Connection>,
    timeouts: Timeouts,
}

/// A client for one transport and one remote address.
///
/// Clones share the same state, including the installed handle.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Validates `config` and creates a disconnected client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = config.validate()?;
        let dialer = Dialer::new(config.network, endpoint)?;
        Ok(Self {
            inner: Arc::new(Inner {
                network: config.network,
                address: config.address,
                dialer,
                tls: Slot::empty(),
                callbacks: Callbacks::default(),
                connection: Slot::empty(),
                timeouts: Timeouts::default(),
            }),
        })
    }

    /// The configured transport.
    pub fn network(&self) -> Network {
        self.inner.network
    }

    /// The configured remote address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Dials the configured address, or fails with [`Error::Cancelled`] once `cancel` fires.
    ///
    /// On success the new handle replaces (and shuts down) any previous one. On failure the
    /// previous state is left untouched.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(network = %self.inner.network, address = %self.inner.address),
    )]
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &*self.inner;
        inner.callbacks.info(
            MultiSocketAddress::Unspecified,
            MultiSocketAddress::Unspecified,
            ConnState::DialStarted,
        );

        let tls = inner.tls.load();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled(Operation::Dial)),
            result = inner.dialer.dial(tls.as_deref()) => result,
        };
        let handle = result.map_err(|error| inner.callbacks.error(error))?;

        let connection = Connection::new(handle);
        let (local, remote) = (connection.local.clone(), connection.remote.clone());
        if let Some(previous) = inner.connection.swap(Some(connection)) {
            tracing::debug!(remote = %previous.remote, "replacing previous handle");
            if let Err(error) = previous.handle.shutdown() {
                tracing::debug!(?error, "failed to shut down previous handle");
            }
        }

        tracing::debug!(%local, %remote, "connected");
        inner.callbacks.info(local, remote, ConnState::Established);
        Ok(())
    }

    /// Whether a handle is installed and passes a best-effort liveness check.
    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .load()
            .is_some_and(|connection| connection.handle.is_alive())
    }

    /// The local address of the installed handle.
    pub fn local_address(&self) -> MultiSocketAddress {
        self.inner
            .connection
            .load()
            .map(|connection| connection.local.clone())
            .unwrap_or_default()
    }

    /// The remote address of the installed handle.
    pub fn remote_address(&self) -> MultiSocketAddress {
        self.inner
            .connection
            .load()
            .map(|connection| connection.remote.clone())
            .unwrap_or_default()
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.inner
            .connection
            .load()
            .ok_or_else(|| self.inner.callbacks.error(Error::NotConnected))
    }

    /// Reads into `buffer` from the installed handle.
    ///
    /// Stream transports may return fewer bytes than requested and `0` at end of stream; datagram
    /// transports return one datagram, truncated to `buffer`.
    pub async fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        let connection = self.connection()?;
        self.inner.callbacks.info(
            connection.local.clone(),
            connection.remote.clone(),
            ConnState::ReadBegin,
        );
        with_timeout(
            self.inner.timeouts.read.get(),
            Operation::Read,
            connection.handle.read(buffer),
        )
        .await
        .map_err(|error| self.inner.callbacks.error(error))
    }

    /// Writes `buffer` to the installed handle.
    ///
    /// Stream transports may write fewer bytes than given; datagram transports send one datagram.
    pub async fn write(&self, buffer: &[u8]) -> Result<usize> {
        let connection = self.connection()?;
        self.inner.callbacks.info(
            connection.local.clone(),
            connection.remote.clone(),
            ConnState::WriteBegin,
        );
        with_timeout(
            self.inner.timeouts.write.get(),
            Operation::Write,
            connection.handle.write(buffer),
        )
        .await
        .map_err(|error| self.inner.callbacks.error(error))
    }

    /// Writes all of `buffer`, looping over short writes on stream transports.
    pub async fn write_all(&self, buffer: &[u8]) -> Result<()> {
        if !self.inner.network.is_stream() {
            return self.write(buffer).await.map(drop);
        }

        let mut remaining = buffer;
        while !remaining.is_empty() {
            match self.write(remaining).await? {
                0 => {
                    let error = std::io::Error::from(std::io::ErrorKind::WriteZero);
                    return Err(self
                        .inner
                        .callbacks
                        .error(Error::transport(Operation::Write, error)));
                }
                written => remaining = &remaining[written..],
            }
        }
        Ok(())
    }

    /// Removes and shuts down the installed handle.
    ///
    /// Returns [`Error::NotConnected`] when nothing is installed, so a second call is harmless.
    pub fn close(&self) -> Result<()> {
        match self.close_installed() {
            Some(result) => result,
            None => Err(self.inner.callbacks.error(Error::NotConnected)),
        }
    }

    /// Closes the installed handle, returning `None` if there was none.
    fn close_installed(&self) -> Option<Result<()>> {
        let connection = self.inner.connection.take()?;
        tracing::debug!(remote = %connection.remote, "closing");
        self.inner.callbacks.info(
            connection.local.clone(),
            connection.remote.clone(),
            ConnState::Closed,
        );
        let result = connection.handle.shutdown().map_err(|error| {
            self.inner
                .callbacks
                .error(Error::transport(Operation::Close, error))
        });
        Some(result)
    }

    /// Replaces the error callback; `None` unregisters it.
    pub fn register_func_error(&self, function: Option<FuncError>) {
        self.inner.callbacks.set_error(function);
    }

    /// Replaces the connection-state callback; `None` unregisters it.
    pub fn register_func_info(&self, function: Option<FuncInfo>) {
        self.inner.callbacks.set_info(function);
    }

    /// Sets the deadline of each subsequent read; `None` waits indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeouts.read.store(timeout);
    }

    /// Sets the deadline of each subsequent write; `None` waits indefinitely.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeouts.write.store(timeout);
    }

    /// Enables or disables TLS for subsequent connects.
    ///
    /// Only TCP clients use TLS; the call is accepted and ignored on other transports. An empty
    /// `server_name` falls back to the host of the configured address.
    pub fn set_tls(
        &self,
        enabled: bool,
        config: Option<Arc<rustls::ClientConfig>>,
        server_name: &str,
    ) -> Result<()> {
        if self.inner.network != Network::Tcp {
            return Ok(());
        }

        if !enabled {
            self.inner.tls.store(None);
            return Ok(());
        }

        let tls = config
            .ok_or_else(|| {
                Error::InvalidTlsConfig("tls enabled without a client configuration".into())
            })
            .and_then(|config| ClientTls::new(config, server_name, self.inner.dialer.host()))
            .map_err(|error| self.inner.callbacks.error(error))?;
        self.inner.tls.store(Some(tls));
        Ok(())
    }

    /// Whether TLS is enabled for subsequent connects.
    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_set()
    }
}
