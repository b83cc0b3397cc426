//! Transport selection.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::{Endpoint, InetAddress, validate_socket_path};
use crate::error::Error;

/// The transport a client dials or a server binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Connection-oriented TCP, optionally wrapped in TLS.
    Tcp,

    /// Connectionless UDP.
    Udp,

    /// Connection-oriented Unix domain stream socket.
    Unix,

    /// Connectionless Unix domain datagram socket.
    #[serde(rename = "unixgram")]
    UnixGram,
}

impl Network {
    /// All supported transports.
    pub const ALL: [Network; 4] = [
        Network::Tcp,
        Network::Udp,
        Network::Unix,
        Network::UnixGram,
    ];

    /// The lowercase protocol name.
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
            Network::UnixGram => "unixgram",
        }
    }

    /// Whether the transport is connection-oriented.
    pub fn is_stream(self) -> bool {
        matches!(self, Network::Tcp | Network::Unix)
    }

    /// Whether the transport addresses peers by filesystem path.
    pub fn is_unix(self) -> bool {
        matches!(self, Network::Unix | Network::UnixGram)
    }

    /// Parses `address` according to this transport's addressing scheme.
    pub fn parse_endpoint(self, address: &str) -> Result<Endpoint, Error> {
        if self.is_unix() {
            validate_socket_path(address)
                .map(|path| Endpoint::Path(path.to_owned()))
                .map_err(|error| Error::invalid_address(address, error))
        } else {
            address
                .parse::<InetAddress>()
                .map(Endpoint::Inet)
                .map_err(|error| Error::invalid_address(address, error))
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        Network::ALL
            .into_iter()
            .find(|network| network.as_str() == string)
            .ok_or_else(|| Error::InvalidProtocol(string.to_owned()))
    }
}
