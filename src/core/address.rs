//! Node addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("address `{0}` is missing a port")]
    MissingPort(String),
    #[error("address `{raw}` has an invalid port: {reason}")]
    InvalidPort { raw: String, reason: String },
    #[error("address `{0}` has an empty host")]
    EmptyHost(String),
}

/// Host and port of a remote queue node.
///
/// The string form (`host:port`) is the directory key for proxies, so two
/// addresses are equal iff their host strings and ports are equal. Lookups
/// go through [`NodeAddress::canonical`] so a host name and the IP a peer
/// advertises land on the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AddressParseError> {
        let raw = raw.trim();
        let Some((host, port)) = raw.rsplit_once(':') else {
            return Err(AddressParseError::MissingPort(raw.to_string()));
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(raw.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|err| AddressParseError::InvalidPort {
                raw: raw.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Directory key for this address.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// The IP form of this address, preferring IPv4 when a host name
    /// resolves to several. IP literals are normalized; names that do not
    /// resolve are returned unchanged.
    pub fn canonical(&self) -> NodeAddress {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Self::new(ip.to_string(), self.port);
        }
        let Ok(resolved) = self.to_socket_addrs() else {
            return self.clone();
        };
        resolved
            .iter()
            .find(|addr| addr.is_ipv4())
            .or(resolved.first())
            .map(|addr| Self::new(addr.ip().to_string(), self.port))
            .unwrap_or_else(|| self.clone())
    }

    pub fn to_socket_addrs(&self) -> std::io::Result<Vec<SocketAddr>> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect())
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.to_string()
    }
}
