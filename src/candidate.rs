use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::addr::Addr;

/// Candidate type per RFC 8445 §5.1.1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateType {
    #[default]
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relayed,
}

impl CandidateType {
    /// Type preference per RFC 8445 §5.1.2.2: 126 for host, 110 for peer
    /// reflexive, 100 for server reflexive and 0 for relayed candidates.
    pub fn preference(self) -> u16 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    fn tag(self) -> u8 {
        match self {
            CandidateType::Host => 0,
            CandidateType::ServerReflexive => 1,
            CandidateType::PeerReflexive => 2,
            CandidateType::Relayed => 3,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        };
        f.write_str(s)
    }
}

/// Candidate priority per RFC 8445 §5.1.2.1:
///
/// `(2^24)·type_pref + (2^8)·local_pref + (256 − component_id)`
pub fn priority(type_preference: u16, local_preference: u16, component_id: u16) -> u32 {
    debug_assert!((1..=256).contains(&component_id));
    (u32::from(type_preference) << 24)
        + (u32::from(local_preference) << 8)
        + (256 - u32::from(component_id))
}

/// Foundation digest over the inputs that group candidates for freezing:
/// candidate type, base IP, transport protocol and the STUN server (when the
/// candidate was learned through one). Truncated SHA-1, 8 bytes.
pub fn foundation(
    kind: CandidateType,
    base: &Addr,
    stun_server: Option<IpAddr>,
) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update([kind.tag()]);
    match base.ip {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update([base.proto.protocol_number()]);
    if let Some(server) = stun_server {
        match server {
            IpAddr::V4(ip) => hasher.update(ip.octets()),
            IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
    }
    hasher.finalize()[..8].to_vec()
}

/// A local or remote transport-address candidate. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "Type")]
    pub kind: CandidateType,
    /// Advertised address.
    #[serde(rename = "Addr")]
    pub addr: Addr,
    /// Local binding the candidate sends from. Equals `addr` for host
    /// candidates.
    #[serde(rename = "Base")]
    pub base: Addr,
    #[serde(rename = "Priority")]
    pub priority: u32,
    #[serde(rename = "Foundation", with = "hex::serde")]
    pub foundation: Vec<u8>,
    #[serde(rename = "ComponentID")]
    pub component_id: u16,
    #[serde(rename = "LocalPreference")]
    pub local_preference: u16,
}

impl Candidate {
    /// Host candidate bound directly to a local interface.
    pub fn host(addr: Addr, component_id: u16, local_preference: u16) -> Self {
        Candidate {
            kind: CandidateType::Host,
            addr,
            base: addr,
            priority: priority(CandidateType::Host.preference(), local_preference, component_id),
            foundation: foundation(CandidateType::Host, &addr, None),
            component_id,
            local_preference,
        }
    }

    /// Server-reflexive candidate observed by a STUN server.
    pub fn server_reflexive(
        addr: Addr,
        base: Addr,
        component_id: u16,
        local_preference: u16,
        stun_server: IpAddr,
    ) -> Self {
        Candidate {
            kind: CandidateType::ServerReflexive,
            addr,
            base,
            priority: priority(
                CandidateType::ServerReflexive.preference(),
                local_preference,
                component_id,
            ),
            foundation: foundation(CandidateType::ServerReflexive, &base, Some(stun_server)),
            component_id,
            local_preference,
        }
    }

    /// Peer-reflexive candidate learned from the mapped address of a binding
    /// response (RFC 8445 §7.2.5.3.1).
    pub fn peer_reflexive(
        addr: Addr,
        base: Addr,
        component_id: u16,
        local_preference: u16,
    ) -> Self {
        Candidate {
            kind: CandidateType::PeerReflexive,
            addr,
            base,
            priority: priority(
                CandidateType::PeerReflexive.preference(),
                local_preference,
                component_id,
            ),
            foundation: foundation(CandidateType::PeerReflexive, &base, None),
            component_id,
            local_preference,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (base {})", self.kind, self.addr, self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Addr {
        Addr::from_udp(s.parse().unwrap())
    }

    #[test]
    fn priority_formula() {
        // Highest possible host priority: component 1, max local preference.
        assert_eq!(priority(126, 65535, 1), 2_130_706_431);
        // Prospective peer-reflexive priority used in check requests.
        assert_eq!(priority(110, 10, 1), 1_845_496_575);
        // Second component ranks just below the first.
        assert!(priority(126, 65535, 2) < priority(126, 65535, 1));
    }

    #[test]
    fn type_preferences() {
        assert_eq!(CandidateType::Host.preference(), 126);
        assert_eq!(CandidateType::PeerReflexive.preference(), 110);
        assert_eq!(CandidateType::ServerReflexive.preference(), 100);
        assert_eq!(CandidateType::Relayed.preference(), 0);
    }

    #[test]
    fn host_candidate_base_equals_addr() {
        let c = Candidate::host(addr("192.168.1.10:3478"), 1, 65535);
        assert_eq!(c.addr, c.base);
        assert_eq!(c.priority, 2_130_706_431);
        assert_eq!(c.foundation.len(), 8);
    }

    #[test]
    fn foundation_groups_by_type_base_and_server() {
        let base = addr("192.168.1.10:51000");
        let host = foundation(CandidateType::Host, &base, None);
        let host_other_port = foundation(CandidateType::Host, &addr("192.168.1.10:52000"), None);
        // Ports do not participate: same interface, same group.
        assert_eq!(host, host_other_port);

        let srflx = foundation(CandidateType::ServerReflexive, &base, Some("198.51.100.1".parse().unwrap()));
        assert_ne!(host, srflx);

        let other_server =
            foundation(CandidateType::ServerReflexive, &base, Some("198.51.100.2".parse().unwrap()));
        assert_ne!(srflx, other_server);
    }
}
