//! One-shot request/response on top of [`Client`].

use std::future::{Future, Ready};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::Client;
use crate::config::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Operation, Result};

/// Response callback type for [`Client::once`] calls that pass `None`.
pub type NoResponse = fn(Client) -> Ready<()>;

/// Closes the client on every exit path of [`Client::once`], including cancellation of the
/// `once` future itself.
struct CloseOnDrop<'a>(&'a Client);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(Err(error)) = self.0.close_installed() {
            tracing::debug!(%error, "failed to close after one-shot request");
        }
    }
}

impl Client {
    /// Connects if needed, sends all of `request`, hands the client to `response`, then closes.
    ///
    /// The handle is closed whatever the outcome, so no descriptor outlives this call. Request
    /// bytes are copied in chunks of [`DEFAULT_BUFFER_SIZE`]; on datagram transports each chunk
    /// becomes one datagram.
    ///
    /// ```no_run
    /// # async fn example(client: veecle_socket::Client) -> veecle_socket::Result<()> {
    /// use tokio_util::sync::CancellationToken;
    /// use veecle_socket::NoResponse;
    ///
    /// client
    ///     .once(&CancellationToken::new(), Some(&b"status\n"[..]), None::<NoResponse>)
    ///     .await
    /// # }
    /// ```
    pub async fn once<R, F, Fut>(
        &self,
        cancel: &CancellationToken,
        request: Option<R>,
        response: Option<F>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _close = CloseOnDrop(self);

        if !self.is_connected() {
            self.connect(cancel).await?;
        }

        if let Some(mut request) = request {
            let mut buffer = vec![0; DEFAULT_BUFFER_SIZE];
            loop {
                let read = request.read(&mut buffer).await.map_err(|error| {
                    self.inner
                        .callbacks
                        .error(Error::transport(Operation::Read, error))
                })?;
                if read == 0 {
                    break;
                }
                self.write_all(&buffer[..read]).await?;
            }
        }

        if let Some(response) = response {
            response(self.clone()).await;
        }

        Ok(())
    }
}
