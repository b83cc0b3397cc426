#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use veecle_socket::{
    Client, ClientConfig, ConnState, FuncError, FuncInfo, Handler, MultiSocketAddress, Network,
    Server, ServerConfig, ServerConnection,
};

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// A running server plus the configuration a client needs to reach it.
pub struct Fixture {
    pub server: Server,
    pub serving: JoinHandle<veecle_socket::Result<()>>,
    pub client: ClientConfig,
    // Holds the socket directory of Unix transports alive.
    pub directory: Option<TempDir>,
}

impl Fixture {
    pub fn client(&self) -> Client {
        Client::new(self.client.clone()).unwrap()
    }

    pub async fn stop(self) {
        self.server.shutdown();
        tokio::time::timeout(PATIENCE, self.serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// Returns a bindable address for `network`, inside a fresh temporary directory for Unix
/// transports.
pub fn local_address(network: Network) -> (String, Option<TempDir>) {
    if network.is_unix() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("socket");
        (path.to_str().unwrap().to_owned(), Some(directory))
    } else {
        ("127.0.0.1:0".to_owned(), None)
    }
}

/// Binds and starts a server for `network` running `handler`.
pub async fn start(network: Network, handler: impl Handler) -> Fixture {
    let (address, directory) = local_address(network);
    start_with(ServerConfig::new(network, address), handler, directory).await
}

pub async fn start_with(
    config: ServerConfig,
    handler: impl Handler,
    directory: Option<TempDir>,
) -> Fixture {
    let network = config.network;
    let server = Server::new(config.clone(), handler).await.unwrap();

    let address = match server.local_address() {
        MultiSocketAddress::Inet(address) => address.to_string(),
        _ => config.address,
    };

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    Fixture {
        server,
        serving,
        client: ClientConfig::new(network, address),
        directory,
    }
}

/// Writes back everything it reads until end of stream or an error.
pub async fn echo(connection: ServerConnection) {
    let mut buffer = vec![0; 1024];
    loop {
        match connection.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(length) => {
                if connection.write_all(&buffer[..length]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// An info callback forwarding every state into a channel.
pub fn record_states() -> (FuncInfo, mpsc::UnboundedReceiver<ConnState>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let function: FuncInfo = std::sync::Arc::new(
        move |_: MultiSocketAddress, _: MultiSocketAddress, state: ConnState| {
            let _ = sender.send(state);
        },
    );
    (function, receiver)
}

/// An error callback forwarding every error message into a channel.
pub fn record_errors() -> (FuncError, mpsc::UnboundedReceiver<veecle_socket::Error>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let function: FuncError = std::sync::Arc::new(move |error: veecle_socket::Error| {
        let _ = sender.send(error);
    });
    (function, receiver)
}

/// Receives until every item of `expected` has been seen, in any order.
pub async fn wait_for_all<T: PartialEq + std::fmt::Debug>(
    receiver: &mut mpsc::UnboundedReceiver<T>,
    expected: &[T],
) -> Vec<T> {
    let mut seen = Vec::new();
    while !expected.iter().all(|item| seen.contains(item)) {
        let item = tokio::time::timeout(PATIENCE, receiver.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}, saw {seen:?}"))
            .unwrap();
        seen.push(item);
    }
    seen
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(PATIENCE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
