//! Unix domain stream dialing.

use camino::Utf8Path;
use tokio::net::UnixStream;

use crate::error::{Error, Operation};
use crate::handle::Handle;

pub(super) async fn dial(path: &Utf8Path) -> Result<Handle, Error> {
    UnixStream::connect(path)
        .await
        .map(Handle::Unix)
        .map_err(|error| Error::transport(Operation::Dial, error))
}
