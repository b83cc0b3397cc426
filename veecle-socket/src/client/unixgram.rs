//! Unix domain datagram dialing.
//!
//! The local socket stays unbound, so the peer sees an unnamed sender and cannot reply.

use camino::Utf8Path;
use tokio::net::UnixDatagram;

use crate::error::{Error, Operation};
use crate::handle::Handle;

pub(super) fn dial(path: &Utf8Path) -> Result<Handle, Error> {
    let dial_error = |error| Error::transport(Operation::Dial, error);

    let socket = UnixDatagram::unbound().map_err(dial_error)?;
    socket.connect(path).map_err(dial_error)?;
    Ok(Handle::UnixGram(socket))
}
