//! Unix datagram socket binding.

use camino::Utf8Path;
use tokio::net::UnixDatagram;

use super::unix::SocketFile;
use crate::error::{Error, Operation};

pub(super) fn bind(
    path: &Utf8Path,
    mode: Option<u32>,
    group: Option<u32>,
) -> Result<(UnixDatagram, SocketFile), Error> {
    SocketFile::clear_stale(path)?;
    let socket =
        UnixDatagram::bind(path).map_err(|error| Error::transport(Operation::Bind, error))?;
    let file = SocketFile::adopt(path, mode, group)?;
    Ok((socket, file))
}
