//! Transport-agnostic socket clients and servers.
//!
//! One [`Client`] and one [`Server`] contract cover TCP, UDP, Unix domain stream sockets and Unix
//! domain datagram sockets; the transport is picked by [`Network`] in the configuration rather
//! than by code.
//!
//! State transitions and errors are reported to optional callbacks
//! ([`Client::register_func_info`], [`Client::register_func_error`], ...), which run detached
//! from the I/O path that fired them.
//!
//! ```no_run
//! # async fn example() -> veecle_socket::Result<()> {
//! use tokio_util::sync::CancellationToken;
//! use veecle_socket::{Client, ClientConfig, Network};
//!
//! let client = Client::new(ClientConfig::new(Network::Tcp, "127.0.0.1:7000"))?;
//! client.connect(&CancellationToken::new()).await?;
//! client.write_all(b"ping").await?;
//! let mut buffer = [0; 4];
//! client.read(&mut buffer).await?;
//! client.close()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod address;
mod callback;
mod client;
mod config;
mod error;
mod handle;
mod network;
mod server;
mod state;
mod tls;

pub use address::{
    Endpoint, InetAddress, InetAddressParseError, MAX_UNIX_PATH_LENGTH, MultiSocketAddress,
    SocketPathError, validate_socket_path,
};
pub use callback::{ConnState, FuncError, FuncInfo, FuncInfoServer, FuncUpdateConn};
pub use client::{Client, NoResponse};
pub use config::{
    ClientConfig, DEFAULT_BUFFER_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT, MAX_GROUP_ID,
    ServerConfig,
};
pub use error::{Error, Operation, Result};
pub use network::Network;
pub use server::{Handler, MAX_DATAGRAM_SIZE, Server, ServerConnection};
/// Socket handle passed to [`FuncUpdateConn`] hooks.
pub use socket2::SockRef;
