//! Sans-IO ICE connectivity-check engine (RFC 8445, regular nomination).
//!
//! Two endpoints behind unknown NAT topologies exchange gathered candidates;
//! this crate pairs them into checklists, schedules STUN Binding checks
//! across the pairs, validates the responses and nominates one working pair
//! per component. The engine owns no sockets and spawns no threads: a host
//! event loop feeds inbound datagrams to [`Agent::process_udp`], drives
//! scheduling with [`Agent::tick`], and sends outbound requests through the
//! [`StunTransactor`] it registers per pair — the transactor also owns
//! retransmission.
//!
//! ```no_run
//! use ice_agent::{Agent, AgentConfig, Candidate, Checklist, Role};
//!
//! let local = vec![Candidate::host("192.168.1.7:50000".parse::<std::net::SocketAddr>().unwrap().into(), 1, 65535)];
//! let remote = vec![Candidate::host("203.0.113.9:40000".parse::<std::net::SocketAddr>().unwrap().into(), 1, 65535)];
//!
//! let mut list = Checklist::from_pairs(Checklist::form_pairs(&local, &remote));
//! list.compute_priorities(Role::Controlling);
//! list.sort();
//! list.prune();
//! list.set_foundations();
//!
//! let mut agent = Agent::new(AgentConfig::default());
//! agent.add_checklist(list);
//! agent.init().unwrap();
//! // Register per-pair credentials, then drive agent.tick() from a timer
//! // and agent.process_udp(..) from the socket loop.
//! ```

mod addr;
mod agent;
mod candidate;
mod checklist;
mod error;
mod foundation;
mod gather;
mod pair;
pub mod stun;

pub use addr::{Addr, Transport};
pub use agent::{Agent, AgentConfig, AgentState, PairContext, StunTransactor};
pub use candidate::{foundation, priority, Candidate, CandidateType};
pub use checklist::{Checklist, ChecklistState};
pub use error::Error;
pub use foundation::{FoundationSet, MAX_FOUNDATION_LEN};
pub use gather::{host_addresses, Gatherer, HostAddr};
pub use pair::{pair_priority, Pair, PairKey, PairState};

/// Which side drives nomination. The offerer of the session starts out
/// controlling; a role conflict may flip it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Role {
    #[default]
    Controlling,
    Controlled,
}

impl std::ops::Not for Role {
    type Output = Role;
    fn not(self) -> Role {
        match self {
            Role::Controlling => Role::Controlled,
            Role::Controlled => Role::Controlling,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Controlling => "controlling",
            Role::Controlled => "controlled",
        };
        f.write_str(s)
    }
}
