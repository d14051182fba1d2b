//! Transport addresses.
//!
//! An [`Address`] is written `scheme://location`: `tcp://host:port` for TCP
//! and `ipc:///path/to/socket` for Unix stream sockets. Addresses travel over
//! the control channel in their string form.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address `{0}` has no scheme (expected tcp:// or ipc://)")]
    MissingScheme(String),
    #[error("unsupported scheme `{scheme}` in `{address}`")]
    UnsupportedScheme { scheme: String, address: String },
    #[error("cannot resolve `{0}` to a socket address")]
    Unresolvable(String),
    #[error("empty socket path in `{0}`")]
    EmptyPath(String),
}

/// A dialable / listenable transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// TCP endpoint (IP address + port).
    Tcp(SocketAddr),
    /// Unix domain stream socket at a filesystem path.
    Ipc(PathBuf),
}

impl Address {
    /// Creates a TCP address.
    #[must_use]
    pub const fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }

    /// Creates a TCP address on localhost (127.0.0.1).
    ///
    /// Port 0 asks the OS for an ephemeral port when listening.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Creates a Unix socket address.
    #[must_use]
    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc(path.into())
    }

    /// Returns the TCP port, if this is a TCP address.
    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp(addr) => Some(addr.port()),
            Self::Ipc(_) => None,
        }
    }

    /// Returns the URL scheme (`tcp` or `ipc`).
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Ipc(_) => "ipc",
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = s.split_once("://") else {
            return Err(AddressError::MissingScheme(s.to_owned()));
        };
        match scheme {
            "tcp" => {
                if let Ok(addr) = rest.parse::<SocketAddr>() {
                    return Ok(Self::Tcp(addr));
                }
                // `*` binds every interface, as in `tcp://*:5555`.
                let rest = match rest.strip_prefix("*:") {
                    Some(port) => format!("0.0.0.0:{port}"),
                    None => rest.to_owned(),
                };
                rest.to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .map(Self::Tcp)
                    .ok_or_else(|| AddressError::Unresolvable(s.to_owned()))
            }
            "ipc" => {
                if rest.is_empty() {
                    return Err(AddressError::EmptyPath(s.to_owned()));
                }
                Ok(Self::Ipc(PathBuf::from(rest)))
            }
            other => Err(AddressError::UnsupportedScheme {
                scheme: other.to_owned(),
                address: s.to_owned(),
            }),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp() {
        let addr: Address = "tcp://127.0.0.1:5555".parse().unwrap();
        assert_eq!(addr, Address::localhost(5555));
        assert_eq!(addr.port(), Some(5555));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn parses_wildcard_host() {
        let addr: Address = "tcp://*:7000".parse().unwrap();
        assert_eq!(
            addr,
            Address::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7000))
        );
    }

    #[test]
    fn parses_ipc() {
        let addr: Address = "ipc:///tmp/scene.sock".parse().unwrap();
        assert_eq!(addr, Address::ipc("/tmp/scene.sock"));
        assert_eq!(addr.port(), None);
        assert_eq!(addr.to_string(), "ipc:///tmp/scene.sock");
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "127.0.0.1:80".parse::<Address>(),
            Err(AddressError::MissingScheme(_))
        ));
        assert!(matches!(
            "udp://127.0.0.1:80".parse::<Address>(),
            Err(AddressError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            "ipc://".parse::<Address>(),
            Err(AddressError::EmptyPath(_))
        ));
        assert!(matches!(
            "tcp://no-port".parse::<Address>(),
            Err(AddressError::Unresolvable(_))
        ));
    }

    #[test]
    fn serializes_as_string() {
        let addr = Address::localhost(4000);
        let bytes = postcard::to_allocvec(&addr).unwrap();
        let back: Address = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, addr);
    }
}
