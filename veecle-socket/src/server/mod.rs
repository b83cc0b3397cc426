//! Inbound connections and datagrams over any of the four transports.
//!
//! Stream transports (TCP, Unix stream) accept connections and spawn one dispatch task per
//! connection. Datagram transports (UDP, Unix datagram) receive one datagram at a time and run
//! the handler inline before receiving the next.

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::address::{Endpoint, MultiSocketAddress};
use crate::callback::{Callbacks, FuncError, FuncInfo, FuncInfoServer, FuncUpdateConn};
use crate::config::ServerConfig;
use crate::error::{Error, Operation, Result};
use crate::network::Network;
use crate::state::{SizeCell, Slot, Timeouts};
use crate::tls::ServerTls;

mod connection;
mod datagram;
mod stream;
mod tcp;
mod udp;
mod unix;
mod unixgram;

pub use self::connection::ServerConnection;
pub use self::datagram::MAX_DATAGRAM_SIZE;
use self::datagram::DatagramSocket;
use self::stream::StreamListener;

/// Serves each connection (stream transports) or datagram (datagram transports).
///
/// Implemented for every `Fn(ServerConnection) -> impl Future<Output = ()>` closure that is
/// `Send + Sync + 'static`.
pub trait Handler: Send + Sync + 'static {
    /// Handles one connection or datagram until the returned future completes.
    fn handle(&self, connection: ServerConnection) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(ServerConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, connection: ServerConnection) -> BoxFuture<'static, ()> {
        Box::pin(self(connection))
    }
}

#[derive(Debug)]
enum Listener {
    Stream(StreamListener),
    Datagram(Arc<DatagramSocket>),
}

#[derive(Debug)]
pub(crate) struct Inner {
    network: Network,
    local: MultiSocketAddress,
    listener: Slot<Listener>,
    handler: Slot<Box<dyn Handler>>,
    pub(crate) callbacks: Callbacks,
    update_conn: Slot<FuncUpdateConn>,
    timeouts: Timeouts,
    read_buffer: SizeCell,
    write_buffer: SizeCell,
    tls: Slot<ServerTls>,
    pub(crate) shutdown: CancellationToken,
    running: AtomicBool,
    open: AtomicUsize,
}

impl Inner {
    /// Forwards `error` to the error callback unless it only reflects the shutdown in progress.
    pub(crate) fn report(&self, error: Error) -> Error {
        if matches!(error, Error::ServerShutdown)
            || (self.shutdown.is_cancelled() && error.is_closed())
        {
            tracing::debug!(%error, "suppressed during shutdown");
            return error;
        }
        self.callbacks.error(error)
    }

    /// Hands `socket` to the hook registered with [`Server::set_update_conn`].
    fn update_conn(&self, socket: socket2::SockRef<'_>) {
        if let Some(function) = self.update_conn.load() {
            function(socket);
        }
    }
}

/// Marks the loop as running for as long as it is alive, including while unwinding.
struct Running<'a>(&'a Inner);

impl<'a> Running<'a> {
    fn new(inner: &'a Inner) -> Self {
        inner.running.store(true, Ordering::Release);
        Self(inner)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// A server bound to one transport and one local address.
///
/// Clones share the same state; any clone can shut the server down.
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Validates `config` and binds the local address.
    pub async fn new(config: ServerConfig, handler: impl Handler) -> Result<Self> {
        let endpoint = config.validate()?;

        let listener = match (config.network, &endpoint) {
            (Network::Tcp, Endpoint::Inet(address)) => {
                Listener::Stream(StreamListener::Tcp(tcp::bind(address).await?))
            }
            (Network::Unix, Endpoint::Path(path)) => {
                let (listener, file) = unix::bind(path, config.file_mode, config.group)?;
                Listener::Stream(StreamListener::Unix(listener, file))
            }
            (Network::Udp, Endpoint::Inet(address)) => {
                Listener::Datagram(Arc::new(DatagramSocket::Udp(udp::bind(address).await?)))
            }
            (Network::UnixGram, Endpoint::Path(path)) => {
                let (socket, file) = unixgram::bind(path, config.file_mode, config.group)?;
                Listener::Datagram(Arc::new(DatagramSocket::UnixGram(socket, file)))
            }
            (network, endpoint) => {
                return Err(Error::invalid_address(
                    endpoint.to_string(),
                    format_args!("not a {network} address"),
                ));
            }
        };

        let local = match &listener {
            Listener::Stream(listener) => listener.local_address(),
            Listener::Datagram(socket) => socket.local_address(),
        };
        tracing::debug!(network = %config.network, %local, "bound");

        Ok(Self {
            inner: Arc::new(Inner {
                network: config.network,
                local,
                listener: Slot::new(Some(listener)),
                handler: Slot::new(Some(Box::new(handler) as Box<dyn Handler>)),
                callbacks: Callbacks::default(),
                update_conn: Slot::empty(),
                timeouts: Timeouts::new(
                    config.read_timeout,
                    config.write_timeout,
                    config.idle_timeout,
                ),
                read_buffer: SizeCell::new(Some(config.read_buffer_size)),
                write_buffer: SizeCell::new(Some(config.write_buffer_size)),
                tls: Slot::empty(),
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
                open: AtomicUsize::new(0),
            }),
        })
    }

    /// Runs the accept or receive loop until [`Server::shutdown`] or a fatal listener error.
    ///
    /// Can be called once per server; later calls fail with [`Error::InvalidInstance`]. Once
    /// shutdown has been requested it returns immediately.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(network = %self.inner.network, local = %self.inner.local),
    )]
    pub async fn serve(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(listener) = inner.listener.take() else {
            if inner.shutdown.is_cancelled() && !self.is_running() {
                return Ok(());
            }
            return Err(inner
                .callbacks
                .error(Error::InvalidInstance("server is already serving or has stopped")));
        };

        let running = Running::new(inner);
        inner
            .callbacks
            .server(format!("listening on {} {}", inner.network, inner.local));

        let result = match &*listener {
            Listener::Stream(listener) => stream::serve(inner, listener).await,
            Listener::Datagram(socket) => datagram::serve(inner, socket).await,
        };

        drop(listener);
        drop(running);
        inner.callbacks.server(match &result {
            Ok(()) => format!("stopped serving {} {}", inner.network, inner.local),
            Err(error) => format!("stopped serving {} {}: {error}", inner.network, inner.local),
        });
        result
    }

    /// Requests shutdown. Idempotent.
    ///
    /// The loop stops accepting or receiving; running dispatches observe the request at their
    /// next read or write, which fails with [`Error::ServerShutdown`]. A server that never
    /// started serving releases its address right away.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::debug!(local = %self.inner.local, "shutdown requested");
        self.inner.callbacks.server("shutdown requested");
        self.inner.shutdown.cancel();

        if !self.is_running() && self.inner.listener.take().is_some() {
            tracing::debug!(local = %self.inner.local, "released unused listener");
        }
    }

    /// Completes once shutdown has been requested.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.shutdown.clone().cancelled_owned()
    }

    /// Whether the accept or receive loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether shutdown has been requested.
    pub fn is_gone(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of stream connections whose dispatch is still running.
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::Acquire)
    }

    /// The bound local address; for `:0` this carries the port chosen by the system.
    pub fn local_address(&self) -> MultiSocketAddress {
        self.inner.local.clone()
    }

    /// The configured transport.
    pub fn network(&self) -> Network {
        self.inner.network
    }

    /// Requests shutdown, then waits until the loop stopped and all dispatches finished.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> Result<()> {
        self.shutdown();

        let deadline = Instant::now() + timeout;
        loop {
            let open = self.open_connections();
            if !self.is_running() && open == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.inner.callbacks.error(Error::ShutdownTimeout(open)));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Replaces the handler for connections and datagrams dispatched from now on.
    pub fn set_handler(&self, handler: impl Handler) {
        self.inner.handler.store(Some(Box::new(handler)));
    }

    /// Replaces the error callback; `None` unregisters it.
    pub fn register_func_error(&self, function: Option<FuncError>) {
        self.inner.callbacks.set_error(function);
    }

    /// Replaces the connection-state callback; `None` unregisters it.
    pub fn register_func_info(&self, function: Option<FuncInfo>) {
        self.inner.callbacks.set_info(function);
    }

    /// Replaces the lifecycle message callback; `None` unregisters it.
    pub fn register_func_info_server(&self, function: Option<FuncInfoServer>) {
        self.inner.callbacks.set_server(function);
    }

    /// Sets the read deadline of connections dispatched from now on; `None` waits indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeouts.read.store(timeout);
    }

    /// Sets the write deadline of connections dispatched from now on; `None` waits indefinitely.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeouts.write.store(timeout);
    }

    /// Ends connections dispatched from now on after `timeout` without a completed read or
    /// write; `None` disables the limit.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeouts.idle.store(timeout);
    }

    /// Replaces the socket customization hook; `None` unregisters it.
    ///
    /// Stream servers call it for each accepted connection after the buffer sizes are applied.
    /// Datagram servers call it once for the bound socket when serving starts.
    pub fn set_update_conn(&self, function: Option<FuncUpdateConn>) {
        self.inner.update_conn.store(function);
    }

    /// Sets the socket receive buffer size. `0` restores the system default.
    pub fn set_read_buffer_size(&self, size: usize) {
        self.inner.read_buffer.set(Some(size));
    }

    /// Sets the socket send buffer size. `0` restores the system default.
    pub fn set_write_buffer_size(&self, size: usize) {
        self.inner.write_buffer.set(Some(size));
    }

    /// Enables or disables TLS for connections accepted from now on.
    ///
    /// Only TCP servers use TLS; the call is accepted and ignored on other transports.
    pub fn set_tls(&self, enabled: bool, config: Option<Arc<rustls::ServerConfig>>) -> Result<()> {
        if self.inner.network != Network::Tcp {
            return Ok(());
        }

        match (enabled, config) {
            (false, _) => self.inner.tls.store(None),
            (true, Some(config)) => self.inner.tls.store(Some(ServerTls::new(config))),
            (true, None) => {
                return Err(self.inner.callbacks.error(Error::InvalidTlsConfig(
                    "tls enabled without a server configuration".into(),
                )));
            }
        }
        Ok(())
    }

    /// Whether TLS is enabled for accepted connections.
    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_set()
    }
}

/// Whether a failed accept or receive means the listener itself is unusable.
///
/// Everything else concerns a single connection or datagram (including the pending network
/// errors `accept(2)` passes through) and is reported before carrying on.
fn is_fatal(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EFAULT)
    )
}

/// Out of descriptors or memory; retrying immediately would spin.
fn is_resource_exhausted(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Pause after a resource exhaustion error, cut short by shutdown.
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(50);

/// Runs the handler on `connection`, ending it early once the idle limit passes.
///
/// A panicking handler is reported as [`Error::HandlerPanicked`] instead of unwinding into the
/// accept or receive loop.
async fn run_handler(inner: &Inner, handler: Arc<Box<dyn Handler>>, connection: ServerConnection) {
    let activity = connection.activity();
    let idle = connection.idle_timeout();
    let run = AssertUnwindSafe(async move { handler.handle(connection).await }).catch_unwind();
    let expired = async {
        match idle {
            Some(limit) => activity.expired(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = run => {
            if let Err(payload) = result {
                let message = panic_message(&*payload);
                tracing::error!(%message, "handler panicked");
                inner.report(Error::HandlerPanicked(message));
            }
        }
        () = expired => {
            tracing::debug!("connection idle, closing");
            inner.report(Error::TimedOut(Operation::Idle));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
