use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport protocol of a candidate. Only UDP candidates are paired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
}

impl Transport {
    /// IANA protocol number, used when deriving foundations.
    pub(crate) fn protocol_number(self) -> u8 {
        match self {
            Transport::Udp => 17,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// A transport address: IP, port and transport protocol.
///
/// Equality is bytewise; ordering is lexicographic over the IP, then the
/// numeric port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Addr {
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Proto")]
    pub proto: Transport,
}

impl Addr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Addr {
            ip,
            port,
            proto: Transport::Udp,
        }
    }

    /// Interprets a socket address as a UDP transport address.
    pub fn from_udp(addr: SocketAddr) -> Self {
        Addr::new(addr.ip(), addr.port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }
}

impl Default for Addr {
    fn default() -> Self {
        Addr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Addr::from_udp(addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_ip_then_port() {
        let a = Addr::new("10.0.0.1".parse().unwrap(), 9000);
        let b = Addr::new("10.0.0.1".parse().unwrap(), 9001);
        let c = Addr::new("10.0.0.2".parse().unwrap(), 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, Addr::from_udp("10.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn socket_addr_round_trip() {
        let sa: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let addr = Addr::from_udp(sa);
        assert!(!addr.is_ipv4());
        assert_eq!(addr.socket_addr(), sa);
        assert_eq!(addr.to_string(), "2001:db8::1:443/udp");
    }
}
