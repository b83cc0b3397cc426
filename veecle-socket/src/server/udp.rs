//! UDP socket binding.

use tokio::net::UdpSocket;

use crate::address::InetAddress;
use crate::error::{Error, Operation};

pub(super) async fn bind(address: &InetAddress) -> Result<UdpSocket, Error> {
    UdpSocket::bind(address.as_to_socket_addrs())
        .await
        .map_err(|error| Error::transport(Operation::Bind, error))
}
