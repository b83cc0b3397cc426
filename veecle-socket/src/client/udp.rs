//! UDP "dialing": binds an ephemeral local port and fixes the peer.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::address::InetAddress;
use crate::error::{Error, Operation};
use crate::handle::Handle;

pub(super) async fn dial(address: &InetAddress) -> Result<Handle, Error> {
    let dial_error = |error| Error::transport(Operation::Dial, error);

    let remote = address.resolve().await.map_err(dial_error)?;
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(local).await.map_err(dial_error)?;
    socket.connect(remote).await.map_err(dial_error)?;
    Ok(Handle::Udp(socket))
}
