//! Address type for dial and bind targets

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Resolve to the first socket address.
    ///
    /// Lookup failures and empty answers are both resolution errors.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Socket(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let mut addrs = tokio::net::lookup_host((domain.as_str(), *port))
                    .await
                    .map_err(|e| Error::InvalidAddress(format!("{}: {}", self, e)))?;
                addrs
                    .next()
                    .ok_or_else(|| Error::InvalidAddress(format!("{}: no addresses", self)))
            }
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse `host:port`; IPv6 hosts must be bracketed (`[::1]:80`)
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in {}", s)));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let a: Address = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(a.as_socket(), Some("127.0.0.1:8080".parse().unwrap()));

        let a: Address = "example.com:443".parse().unwrap();
        assert_eq!(a, Address::domain("example.com", 443));
        assert_eq!(a.to_string(), "example.com:443");

        let a: Address = "[::1]:53".parse().unwrap();
        assert_eq!(a.port(), 53);
        assert_eq!(a.host(), "::1");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("example.com".parse::<Address>(), Err(Error::InvalidAddress(_))));
        assert!(matches!("example.com:http".parse::<Address>(), Err(Error::InvalidAddress(_))));
        assert!(matches!(":80".parse::<Address>(), Err(Error::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = Address::domain("localhost", 80).resolve().await.unwrap();
        assert_eq!(addr.port(), 80);
        assert!(addr.ip().is_loopback());
    }
}
