//! Unix stream listener binding and socket file management.

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::net::UnixListener;

use crate::error::{Error, Operation};

/// Owns the filesystem entry of a bound Unix socket and removes it on drop.
#[derive(Debug)]
pub(crate) struct SocketFile {
    path: Utf8PathBuf,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != io::ErrorKind::NotFound
        {
            tracing::error!(?error, ?self.path, "error removing unix socket");
        }
    }
}

impl SocketFile {
    /// Removes a stale socket left behind at `path` by an earlier process.
    ///
    /// Anything other than a socket is left alone, so binding fails with "address in use".
    pub(super) fn clear_stale(path: &Utf8Path) -> Result<(), Error> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                tracing::debug!(%path, "removing stale unix socket");
                std::fs::remove_file(path)
                    .map_err(|error| Error::transport(Operation::Bind, error))
            }
            Ok(_) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(Error::transport(Operation::Bind, error)),
        }
    }

    /// Takes ownership of the socket file at `path` and applies the optional mode and group.
    pub(super) fn adopt(
        path: &Utf8Path,
        mode: Option<u32>,
        group: Option<u32>,
    ) -> Result<Self, Error> {
        let file = Self {
            path: path.to_owned(),
        };
        let configure = |error| Error::transport(Operation::Configure, error);

        if let Some(mode) = mode {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .map_err(configure)?;
        }
        if let Some(group) = group {
            std::os::unix::fs::chown(path, None, Some(group)).map_err(configure)?;
        }
        Ok(file)
    }
}

pub(super) fn bind(
    path: &Utf8Path,
    mode: Option<u32>,
    group: Option<u32>,
) -> Result<(UnixListener, SocketFile), Error> {
    SocketFile::clear_stale(path)?;
    let listener =
        UnixListener::bind(path).map_err(|error| Error::transport(Operation::Bind, error))?;
    let file = SocketFile::adopt(path, mode, group)?;
    Ok((listener, file))
}
