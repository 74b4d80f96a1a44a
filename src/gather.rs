//! Seam to the host-address gatherer.
//!
//! Interface enumeration is platform work that lives outside the engine; the
//! agent only needs the resulting addresses and their preference ordering.

use std::net::IpAddr;

use crate::Error;

/// A gathered interface address with the preference the gatherer assigned
/// it. Higher preference means the interface is favoured when priorities are
/// computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAddr {
    pub ip: IpAddr,
    pub local_preference: u16,
}

/// Produces the local interface addresses to build host candidates from.
pub trait Gatherer {
    fn gather(&self) -> Result<Vec<IpAddr>, Error>;
}

/// Assigns local preferences to gathered addresses: unusable addresses are
/// dropped, loopback sinks to the bottom, everything else is ranked in
/// gathering order from the top.
pub fn host_addresses(ips: impl IntoIterator<Item = IpAddr>) -> Vec<HostAddr> {
    let mut next = u16::MAX;
    let mut addrs = Vec::new();
    for ip in ips {
        if ip.is_unspecified() || ip.is_multicast() {
            continue;
        }
        let local_preference = if ip.is_loopback() {
            0
        } else {
            let preference = next;
            next = next.saturating_sub(1);
            preference
        };
        addrs.push(HostAddr {
            ip,
            local_preference,
        });
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ranks_and_filters_addresses() {
        let addrs = host_addresses([
            ip("0.0.0.0"),
            ip("192.168.1.7"),
            ip("127.0.0.1"),
            ip("224.0.0.1"),
            ip("10.1.2.3"),
        ]);
        assert_eq!(
            addrs,
            vec![
                HostAddr {
                    ip: ip("192.168.1.7"),
                    local_preference: 65535
                },
                HostAddr {
                    ip: ip("127.0.0.1"),
                    local_preference: 0
                },
                HostAddr {
                    ip: ip("10.1.2.3"),
                    local_preference: 65534
                },
            ]
        );
    }
}
