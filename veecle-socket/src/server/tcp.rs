//! TCP listener binding.

use tokio::net::TcpListener;

use crate::address::InetAddress;
use crate::error::{Error, Operation};

pub(super) async fn bind(address: &InetAddress) -> Result<TcpListener, Error> {
    TcpListener::bind(address.as_to_socket_addrs())
        .await
        .map_err(|error| Error::transport(Operation::Bind, error))
}
