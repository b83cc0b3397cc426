//! Plain configuration structs consumed by [`Client::new`](crate::Client::new) and
//! [`Server::new`](crate::Server::new).
//!
//! Both derive `serde` traits so any loader (TOML, JSON, ...) can produce them. All defaults are
//! per-instance values; there is no process-wide mutable default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::Endpoint;
use crate::error::Error;
use crate::network::Network;

/// Default server read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default server write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of the copy buffer used by `Client::once`.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Highest group id accepted for Unix socket files.
pub const MAX_GROUP_ID: u32 = 32767;

/// Parameters of a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Transport to dial.
    pub network: Network,

    /// `host:port` for TCP/UDP, socket path for Unix transports.
    pub address: String,
}

impl ClientConfig {
    /// Creates a configuration for `network` and `address`.
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }

    /// Checks the address against the transport's addressing scheme.
    pub fn validate(&self) -> Result<Endpoint, Error> {
        self.network.parse_endpoint(&self.address)
    }
}

/// Parameters of a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Transport to bind.
    pub network: Network,

    /// `host:port` for TCP/UDP, socket path for Unix transports.
    pub address: String,

    /// Read timeout applied to every connection operation.
    #[serde(with = "optional_duration")]
    pub read_timeout: Option<Duration>,

    /// Write timeout applied to every connection operation.
    #[serde(with = "optional_duration")]
    pub write_timeout: Option<Duration>,

    /// Ends a connection after this long without a completed read or write.
    #[serde(with = "optional_duration")]
    pub idle_timeout: Option<Duration>,

    /// Socket receive buffer size (`SO_RCVBUF`). `0` keeps the system default.
    pub read_buffer_size: usize,

    /// Socket send buffer size. `0` keeps the system default.
    pub write_buffer_size: usize,

    /// Permission bits applied to a Unix socket file after binding.
    pub file_mode: Option<u32>,

    /// Group owner applied to a Unix socket file after binding.
    pub group: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: String::new(),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            idle_timeout: None,
            read_buffer_size: 0,
            write_buffer_size: 0,
            file_mode: None,
            group: None,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration for `network` and `address` with default timeouts.
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            ..Self::default()
        }
    }

    /// Checks the address and the Unix file options.
    pub fn validate(&self) -> Result<Endpoint, Error> {
        let endpoint = self.network.parse_endpoint(&self.address)?;

        if let Some(mode) = self.file_mode
            && mode > 0o7777
        {
            return Err(Error::invalid_address(
                &self.address,
                format_args!("file mode {mode:#o} has bits outside 0o7777"),
            ));
        }

        if let Some(group) = self.group
            && group > MAX_GROUP_ID
        {
            return Err(Error::invalid_address(
                &self.address,
                format_args!("group id {group} is above {MAX_GROUP_ID}"),
            ));
        }

        Ok(endpoint)
    }
}

/// (De)serializes an optional [`Duration`] as fractional seconds, `0` meaning "none".
mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.map_or(0.0, |duration| duration.as_secs_f64()))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if seconds == 0.0 {
            return Ok(None);
        }
        Duration::try_from_secs_f64(seconds)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
