//! TCP dialing, optionally followed by a TLS handshake.

use tokio::net::TcpStream;

use crate::address::InetAddress;
use crate::error::{Error, Operation};
use crate::handle::Handle;
use crate::tls::ClientTls;

pub(super) async fn dial(address: &InetAddress, tls: Option<&ClientTls>) -> Result<Handle, Error> {
    let stream = TcpStream::connect(address.as_to_socket_addrs())
        .await
        .map_err(|error| Error::transport(Operation::Dial, error))?;

    if let Err(error) = stream.set_nodelay(true) {
        tracing::debug!(?error, "failed to disable nagle");
    }

    match tls {
        Some(tls) => tls.connect(stream).await,
        None => Ok(Handle::Tcp(stream)),
    }
}
