use std::{fmt, str::FromStr};

use crate::error_chain_fmt;

/// Port used when an address string does not carry one.
pub const DEFAULT_PORT: u16 = 27017;

/// The `host:port` pair identifying one server in the cluster.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_lowercase(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[ipv6]` or `[ipv6]:port`. A bare IPv6 literal is taken
    /// whole as the host. Hosts are compared case-insensitively so they are stored
    /// lower-cased.
    pub fn parse(address: &str) -> Result<Self, ServerAddressError> {
        let address = address.trim();
        let (host, port) = if let Some(bracketed) = address.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| ServerAddressError::InvalidHost(address.to_string()))?;
            let port = match rest {
                "" => DEFAULT_PORT,
                _ => match rest.strip_prefix(':') {
                    Some(port) => parse_port(port, address)?,
                    None => return Err(ServerAddressError::InvalidPort(address.to_string())),
                },
            };
            (host, port)
        } else if address.matches(':').count() > 1 {
            (address, DEFAULT_PORT)
        } else {
            match address.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port, address)?),
                None => (address, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(ServerAddressError::EmptyHost(address.to_string()));
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16, ServerAddressError> {
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ServerAddressError::InvalidPort(address.to_string())),
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ServerAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(thiserror::Error, Clone, PartialEq, Eq)]
pub enum ServerAddressError {
    #[error("Address `{0}` has no host")]
    EmptyHost(String),
    #[error("Address `{0}` has an invalid port")]
    InvalidPort(String),
    #[error("Address `{0}` has an unterminated IPv6 host")]
    InvalidHost(String),
}
impl std::fmt::Debug for ServerAddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
