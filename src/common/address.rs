//! Address type for line routing metadata
//!
//! Lines carry a source and a destination endpoint so that stages which
//! rewrite or resolve targets (connectors, header-injecting stages) agree
//! on one representation. The destination may still be an unresolved
//! domain; resolution belongs to whichever adapter performs the connect.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
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

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::unspecified()
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
    fn test_display() {
        let a = Address::domain("example.com", 443);
        assert_eq!(a.to_string(), "example.com:443");
        assert_eq!(a.port(), 443);
        assert!(a.is_domain());
    }

    #[test]
    fn test_socket_roundtrip() {
        let sa: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let a = Address::from(sa);
        assert_eq!(a.as_socket(), Some(sa));
        assert_eq!(a.host(), "127.0.0.1");
    }
}
