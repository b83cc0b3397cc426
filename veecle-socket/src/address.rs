//! Address parsing and the transport-native addresses reported to callbacks.
//!
//! Network transports take a `host:port` address with hostname resolution deferred to dial/bind
//! time. Unix transports take a filesystem path.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::os::unix::net::SocketAddr as UnixSocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Maximum length of a Unix socket path, excluding the trailing NUL (`sun_path` is 108 bytes on
/// Linux).
pub const MAX_UNIX_PATH_LENGTH: usize = 107;

/// A parsed-but-not-resolved `host:port` address.
///
/// An empty host (`":8080"`) stands for the unspecified IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InetAddress {
    /// Either a hostname or an IP address (v4 or v6, without brackets).
    host: String,

    // IPv6 literals need `[]` around the IP when printed to keep the port separable.
    is_v6: bool,

    port: u16,
}

impl InetAddress {
    /// The host part, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns this as something that can be used with Tokio's `ToSocketAddrs`.
    pub(crate) fn as_to_socket_addrs(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    /// Resolves the host, preferring the first returned address.
    pub(crate) async fn resolve(&self) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host(self.as_to_socket_addrs())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("{self} did not resolve to any address"),
                )
            })
    }
}

impl Display for InetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let InetAddress { host, is_v6, port } = self;
        if *is_v6 {
            write!(f, "[{host}]:{port}")
        } else {
            write!(f, "{host}:{port}")
        }
    }
}

/// Errors that can occur when parsing a `host:port` address.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InetAddressParseError {
    /// Missing ':' separator between host and port.
    #[error("missing ':' separator")]
    MissingSeparator,

    /// Invalid port number format.
    #[error("invalid port number")]
    InvalidPortNumber(#[source] std::num::ParseIntError),

    /// Invalid hostname format.
    #[error("invalid hostname: {0}")]
    InvalidHostname(&'static str),
}

impl FromStr for InetAddress {
    type Err = InetAddressParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let (host, port) = string
            .rsplit_once(':')
            .ok_or(InetAddressParseError::MissingSeparator)?;

        let port = port
            .parse()
            .map_err(InetAddressParseError::InvalidPortNumber)?;

        if host.is_empty() {
            return Ok(Self {
                host: "0.0.0.0".to_owned(),
                is_v6: false,
                port,
            });
        }

        if let Some(v6) = host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .filter(|host| std::net::Ipv6Addr::from_str(host).is_ok())
        {
            return Ok(Self {
                host: v6.to_owned(),
                is_v6: true,
                port,
            });
        }

        if std::net::Ipv4Addr::from_str(host).is_err() {
            validate_hostname(host)?;
        }

        Ok(Self {
            host: host.to_owned(),
            is_v6: false,
            port,
        })
    }
}

/// Checks [RFC 1123 §2.1] hostname syntax: at most 253 bytes, dot-separated labels of 1 to 63
/// ASCII alphanumerics or dashes that neither start nor end with a dash. A single trailing dot
/// (fully qualified name) is accepted.
///
/// [RFC 1123 §2.1]: https://datatracker.ietf.org/doc/html/rfc1123#section-2
fn validate_hostname(host: &str) -> Result<(), InetAddressParseError> {
    if host.len() > 253 {
        return Err(InetAddressParseError::InvalidHostname("is too long"));
    }

    if host.starts_with('.') {
        return Err(InetAddressParseError::InvalidHostname("starts with period"));
    }

    for label in host.strip_suffix('.').unwrap_or(host).split('.') {
        let reason = if label.is_empty() {
            "contains empty label"
        } else if label.len() > 63 {
            "label too long"
        } else if label.starts_with('-') {
            "label starts with dash"
        } else if label.ends_with('-') {
            "label ends with dash"
        } else if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            "label contains disallowed character"
        } else {
            continue;
        };
        return Err(InetAddressParseError::InvalidHostname(reason));
    }

    Ok(())
}

/// Errors that can occur when validating a Unix socket path.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketPathError {
    /// The path is empty.
    #[error("path is empty")]
    Empty,

    /// The path contains a NUL byte.
    #[error("path contains a NUL byte")]
    ContainsNul,

    /// The path does not fit into `sun_path`.
    #[error("path is longer than {MAX_UNIX_PATH_LENGTH} bytes")]
    TooLong,

    /// The path names a directory.
    #[error("path ends with a separator")]
    Directory,
}

/// Checks that `path` can be used as a Unix socket address.
///
/// The path does not need to exist.
pub fn validate_socket_path(path: &str) -> Result<&Utf8Path, SocketPathError> {
    if path.is_empty() {
        Err(SocketPathError::Empty)
    } else if path.contains('\0') {
        Err(SocketPathError::ContainsNul)
    } else if path.len() > MAX_UNIX_PATH_LENGTH {
        Err(SocketPathError::TooLong)
    } else if path.ends_with('/') {
        Err(SocketPathError::Directory)
    } else {
        Ok(Utf8Path::new(path))
    }
}

/// A parsed endpoint, either a network address or a Unix socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port` for TCP and UDP.
    Inet(InetAddress),

    /// Filesystem path for Unix stream and datagram sockets.
    Path(Utf8PathBuf),
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(address) => address.fmt(f),
            Endpoint::Path(path) => path.fmt(f),
        }
    }
}

/// A transport-native address as reported to info callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MultiSocketAddress {
    /// No address: not yet dialed, or a connectionless peer that is unknown.
    #[default]
    Unspecified,

    /// Unix domain socket address; `None` for an unnamed (unbound) socket.
    Unix(Option<PathBuf>),

    /// IP address and port.
    Inet(SocketAddr),
}

impl MultiSocketAddress {
    /// Whether this carries no address.
    pub fn is_unspecified(&self) -> bool {
        match self {
            MultiSocketAddress::Unspecified => true,
            MultiSocketAddress::Unix(path) => path.is_none(),
            MultiSocketAddress::Inet(_) => false,
        }
    }

    /// Returns the IP socket address, if this is one.
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            MultiSocketAddress::Inet(address) => Some(*address),
            _ => None,
        }
    }

    /// Returns the filesystem path of a named Unix socket address.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            MultiSocketAddress::Unix(path) => path.as_deref(),
            _ => None,
        }
    }
}

impl Display for MultiSocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MultiSocketAddress::Unspecified => f.write_str("-"),
            MultiSocketAddress::Unix(path) => match path {
                Some(path) => write!(f, "{}", path.display()),
                None => f.write_str("(unnamed)"),
            },
            MultiSocketAddress::Inet(address) => address.fmt(f),
        }
    }
}

impl From<SocketAddr> for MultiSocketAddress {
    fn from(address: SocketAddr) -> Self {
        MultiSocketAddress::Inet(address)
    }
}

impl From<tokio::net::unix::SocketAddr> for MultiSocketAddress {
    fn from(address: tokio::net::unix::SocketAddr) -> Self {
        MultiSocketAddress::Unix(address.as_pathname().map(Path::to_path_buf))
    }
}

impl From<UnixSocketAddr> for MultiSocketAddress {
    fn from(address: UnixSocketAddr) -> Self {
        MultiSocketAddress::Unix(address.as_pathname().map(Path::to_path_buf))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::str::FromStr;

    use super::{
        InetAddress, InetAddressParseError, MultiSocketAddress, SocketPathError,
        validate_socket_path,
    };

    #[test]
    fn inet_address_parsing() {
        let address = InetAddress::from_str("127.0.0.1:8080").unwrap();
        assert_eq!(address.host(), "127.0.0.1");
        assert_eq!(address.port(), 8080);
        assert_eq!(address.to_string(), "127.0.0.1:8080");

        let address = InetAddress::from_str("[::1]:53").unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.to_string(), "[::1]:53");

        let address = InetAddress::from_str("localhost:0").unwrap();
        assert_eq!(address.host(), "localhost");

        let address = InetAddress::from_str(":9000").unwrap();
        assert_eq!(address.to_string(), "0.0.0.0:9000");

        assert!(matches!(
            InetAddress::from_str(""),
            Err(InetAddressParseError::MissingSeparator),
        ));
        assert!(matches!(
            InetAddress::from_str("example.com"),
            Err(InetAddressParseError::MissingSeparator),
        ));
        assert!(matches!(
            InetAddress::from_str("example.com:http"),
            Err(InetAddressParseError::InvalidPortNumber(_)),
        ));
        assert!(matches!(
            InetAddress::from_str("example.com:70000"),
            Err(InetAddressParseError::InvalidPortNumber(_)),
        ));
        assert!(matches!(
            InetAddress::from_str("-example.com:80"),
            Err(InetAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            InetAddress::from_str("2001:db8::cafe:80"),
            Err(InetAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            InetAddress::from_str("foo..example.com:80"),
            Err(InetAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            InetAddress::from_str("/tmp/socket"),
            Err(InetAddressParseError::MissingSeparator),
        ));
    }

    #[test]
    fn socket_path_validation() {
        assert!(validate_socket_path("/tmp/test.sock").is_ok());
        assert!(validate_socket_path("relative.sock").is_ok());
        assert_eq!(validate_socket_path(""), Err(SocketPathError::Empty));
        assert_eq!(
            validate_socket_path("/tmp/a\0b"),
            Err(SocketPathError::ContainsNul)
        );
        assert_eq!(
            validate_socket_path(&format!("/tmp/{}", "x".repeat(120))),
            Err(SocketPathError::TooLong)
        );
        assert_eq!(
            validate_socket_path("/tmp/"),
            Err(SocketPathError::Directory)
        );
    }

    #[test]
    fn unspecified_address_display() {
        let address = MultiSocketAddress::default();
        assert!(address.is_unspecified());
        assert_eq!(address.to_string(), "-");
        assert_eq!(address.as_inet(), None);

        let inet = MultiSocketAddress::from("127.0.0.1:80".parse::<std::net::SocketAddr>().unwrap());
        assert!(!inet.is_unspecified());
        assert_eq!(inet.to_string(), "127.0.0.1:80");
    }
}
