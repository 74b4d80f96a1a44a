use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::addr::Transport;
use crate::candidate::Candidate;
use crate::Role;

/// Connectivity-check state of a candidate pair (RFC 8445 §6.1.2.6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairState {
    /// Not yet eligible for checks; waits for a foundation-mate to complete.
    #[default]
    Frozen,
    /// Eligible; the picker will schedule it.
    Waiting,
    /// A Binding transaction is in flight.
    InProgress,
    /// A check succeeded with a matching mapped address.
    Succeeded,
    /// The check terminally failed.
    Failed,
}

impl PairState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PairState::Succeeded | PairState::Failed)
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairState::Frozen => "frozen",
            PairState::Waiting => "waiting",
            PairState::InProgress => "in-progress",
            PairState::Succeeded => "succeeded",
            PairState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pair priority per RFC 8445 §6.1.2.3, where `g` is the candidate priority
/// of the controlling side and `d` of the controlled side:
///
/// `2^32·min(G,D) + 2·max(G,D) + (G>D ? 1 : 0)`
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (g, d) = (u64::from(g), u64::from(d));
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// An ordered (local, remote) candidate tuple for one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    #[serde(rename = "Local")]
    pub local: Candidate,
    #[serde(rename = "Remote")]
    pub remote: Candidate,
    #[serde(rename = "Priority")]
    pub priority: u64,
    /// Concatenation of the local and remote candidate foundations.
    #[serde(rename = "Foundation", with = "hex::serde")]
    pub foundation: Vec<u8>,
    #[serde(rename = "State")]
    pub state: PairState,
    #[serde(rename = "Nominated")]
    pub nominated: bool,
    #[serde(rename = "ComponentID")]
    pub component_id: u16,
}

impl Pair {
    /// Pairs two candidates of the same component. Priority and foundation
    /// are filled in by [`Checklist::compute_priorities`] and
    /// [`Checklist::set_foundations`].
    ///
    /// [`Checklist::compute_priorities`]: crate::Checklist::compute_priorities
    /// [`Checklist::set_foundations`]: crate::Checklist::set_foundations
    pub fn new(local: Candidate, remote: Candidate) -> Self {
        debug_assert_eq!(local.component_id, remote.component_id);
        let component_id = local.component_id;
        Pair {
            local,
            remote,
            priority: 0,
            foundation: Vec::new(),
            state: PairState::Frozen,
            nominated: false,
            component_id,
        }
    }

    /// Recomputes the pair priority for the declared role.
    pub fn compute_priority(&mut self, role: Role) {
        let (g, d) = match role {
            Role::Controlling => (self.local.priority, self.remote.priority),
            Role::Controlled => (self.remote.priority, self.local.priority),
        };
        self.priority = pair_priority(g, d);
    }

    /// Refreshes the pair foundation from its candidates.
    pub fn set_foundation(&mut self) {
        let mut foundation =
            Vec::with_capacity(self.local.foundation.len() + self.remote.foundation.len());
        foundation.extend_from_slice(&self.local.foundation);
        foundation.extend_from_slice(&self.remote.foundation);
        self.foundation = foundation;
    }

    /// Whether `other` names the same transport-level pair, regardless of
    /// state or priority. Used for valid-list deduplication.
    pub fn same_addrs(&self, other: &Pair) -> bool {
        self.local.addr == other.local.addr
            && self.remote.addr == other.remote.addr
            && self.component_id == other.component_id
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} [{}]",
            self.local.addr, self.remote.addr, self.state
        )
    }
}

/// Fixed-size key identifying a pair by its transport 5-tuple and component.
///
/// Built without allocation so per-packet dispatch and context lookup stay
/// off the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub proto: Transport,
    pub component_id: u16,
}

impl PairKey {
    pub fn from_pair(pair: &Pair) -> Self {
        PairKey {
            local_ip: pair.local.addr.ip,
            local_port: pair.local.addr.port,
            remote_ip: pair.remote.addr.ip,
            remote_port: pair.remote.addr.port,
            proto: pair.local.addr.proto,
            component_id: pair.component_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;

    fn host(addr: &str, pref: u16) -> Candidate {
        Candidate::host(Addr::from_udp(addr.parse().unwrap()), 1, pref)
    }

    #[test]
    fn pair_priority_formula() {
        // Equal priorities: no tiebreak bit.
        assert_eq!(pair_priority(2_130_706_431, 2_130_706_431), 9_151_314_442_783_293_438);
        // The controlling side winning the comparison sets the low bit.
        assert_eq!(pair_priority(2, 1), (1u64 << 32) + 4 + 1);
        assert_eq!(pair_priority(1, 2), (1u64 << 32) + 4);
    }

    #[test]
    fn compute_priority_depends_on_role() {
        let mut pair = Pair::new(host("10.0.0.2:1000", 65535), host("10.0.0.1:2000", 65534));
        pair.compute_priority(Role::Controlling);
        let controlling = pair.priority;
        pair.compute_priority(Role::Controlled);
        let controlled = pair.priority;
        // Same min/max, different tiebreak bit.
        assert_eq!(controlling, controlled + 1);
    }

    #[test]
    fn foundation_concatenates_candidates() {
        let mut pair = Pair::new(host("10.0.0.2:1000", 65535), host("10.0.0.1:2000", 65535));
        pair.set_foundation();
        assert_eq!(pair.foundation.len(), 16);
        assert_eq!(pair.foundation[..8], pair.local.foundation[..]);
        assert_eq!(pair.foundation[8..], pair.remote.foundation[..]);
    }

    #[test]
    fn pair_key_identifies_transport_tuple() {
        let pair = Pair::new(host("10.0.0.2:1000", 65535), host("10.0.0.1:2000", 65535));
        let same = Pair::new(host("10.0.0.2:1000", 1), host("10.0.0.1:2000", 2));
        let other = Pair::new(host("10.0.0.2:1001", 65535), host("10.0.0.1:2000", 65535));
        assert_eq!(PairKey::from_pair(&pair), PairKey::from_pair(&same));
        assert_ne!(PairKey::from_pair(&pair), PairKey::from_pair(&other));
    }
}
