//! Genlock peer addressing

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use super::packet::DEFAULT_SYNC_PORT;
use crate::{FrameLockError, Result};

/// Destination of reference packets, and listening port of followers.
///
/// Accepts `ip:port`, `[v6]:port` or a bare IP (port defaults to 5960).
/// Host names are not resolved: genlock groups are configured by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Limited or subnet-directed IPv4 broadcast (last octet 255).
    pub fn is_broadcast(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(v4) => v4.is_broadcast() || v4.octets()[3] == 255,
            IpAddr::V6(_) => false,
        }
    }

    pub fn is_multicast(&self) -> bool {
        self.0.ip().is_multicast()
    }
}

impl Default for PeerAddress {
    fn default() -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SYNC_PORT))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerAddress {
    type Err = FrameLockError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(FrameLockError::invalid_address(s, "address is empty"));
        }

        if let Ok(addr) = trimmed.parse::<SocketAddr>() {
            if addr.port() == 0 {
                return Err(FrameLockError::invalid_address(s, "port must be non-zero"));
            }
            return Ok(Self(addr));
        }

        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self(SocketAddr::new(ip, DEFAULT_SYNC_PORT)));
        }

        match trimmed.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_err() => {
                Err(FrameLockError::invalid_address(s, format!("invalid port '{}'", port)))
            }
            _ => Err(FrameLockError::invalid_address(s, "expected a numeric IP address")),
        }
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ip_gets_default_port() {
        let addr: PeerAddress = "10.0.0.5".parse().unwrap();
        assert_eq!(addr.port(), DEFAULT_SYNC_PORT);
    }

    #[test]
    fn explicit_port_is_kept() {
        let addr: PeerAddress = "127.0.0.1:6000".parse().unwrap();
        assert_eq!(addr.port(), 6000);
        let v6: PeerAddress = "[::1]:6001".parse().unwrap();
        assert_eq!(v6.port(), 6001);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<PeerAddress>().is_err());
        assert!("127.0.0.1:abc".parse::<PeerAddress>().is_err());
        assert!("127.0.0.1:0".parse::<PeerAddress>().is_err());
        assert!("genlock.local:5960".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn classifies_destinations() {
        assert!("192.168.1.255:5960".parse::<PeerAddress>().unwrap().is_broadcast());
        assert!("239.1.2.3".parse::<PeerAddress>().unwrap().is_multicast());
        assert!(!PeerAddress::default().is_broadcast());
    }
}
