use std::collections::VecDeque;
use std::fmt;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::candidate::Candidate;
use crate::pair::{Pair, PairState};
use crate::Role;

/// State of a checklist (RFC 8445 §6.1.2.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecklistState {
    #[default]
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ChecklistState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChecklistState::Running => "running",
            ChecklistState::Completed => "completed",
            ChecklistState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Ordered candidate-pair list for one media stream, with its valid list and
/// triggered-check queue.
///
/// The pair list is sorted once, on construction, and never re-sorted: the
/// agent refers to pairs by index for the lifetime of the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checklist {
    pub pairs: Vec<Pair>,
    /// Pairs whose checks succeeded with a matching mapped address.
    pub valid: Vec<Pair>,
    /// FIFO of pair indices scheduled ahead of the ordinary Waiting scan
    /// (RFC 8445 §6.1.4.1).
    pub triggered: VecDeque<usize>,
    pub state: ChecklistState,
}

impl Checklist {
    pub fn from_pairs(pairs: Vec<Pair>) -> Self {
        Checklist {
            pairs,
            ..Checklist::default()
        }
    }

    /// Cross-product of local and remote candidates, restricted to matching
    /// component and IP family. Result order is unspecified.
    pub fn form_pairs(local: &[Candidate], remote: &[Candidate]) -> Vec<Pair> {
        let mut pairs = Vec::new();
        for l in local {
            for r in remote {
                if l.component_id != r.component_id {
                    continue;
                }
                if l.addr.is_ipv4() != r.addr.is_ipv4() {
                    continue;
                }
                pairs.push(Pair::new(l.clone(), r.clone()));
            }
        }
        pairs
    }

    /// Recomputes every pair priority for the declared role.
    pub fn compute_priorities(&mut self, role: Role) {
        for pair in &mut self.pairs {
            pair.compute_priority(role);
        }
    }

    /// Stable sort by descending pair priority.
    pub fn sort(&mut self) {
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Drops redundant pairs: of any two sharing (local base, remote address,
    /// component), only the highest-priority one is kept. Run after
    /// [`sort`](Checklist::sort), so the survivor is the first occurrence —
    /// with the standard type preferences that is the host-based pair rather
    /// than a server-reflexive one with the same base.
    pub fn prune(&mut self) {
        let mut kept: Vec<Pair> = Vec::with_capacity(self.pairs.len());
        for pair in self.pairs.drain(..) {
            let redundant = kept.iter().any(|k| {
                k.local.base == pair.local.base
                    && k.remote.addr == pair.remote.addr
                    && k.component_id == pair.component_id
            });
            if !redundant {
                kept.push(pair);
            }
        }
        self.pairs = kept;
    }

    /// Refreshes every pair foundation from its candidates.
    pub fn set_foundations(&mut self) {
        for pair in &mut self.pairs {
            pair.set_foundation();
        }
    }

    /// Enqueues a triggered check for the pair at `index`.
    pub fn push_triggered(&mut self, index: usize) {
        if index < self.pairs.len() {
            self.triggered.push_back(index);
        }
    }

    /// Component IDs present in the pair list, ascending and deduplicated.
    pub fn components(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.pairs.iter().map(|p| p.component_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub(crate) fn has_runnable_pair(&self) -> bool {
        self.pairs.iter().any(|p| p.state != PairState::Failed)
    }
}

/// Golden-file representation: `Valid` holds indices into `Pairs`, pair and
/// candidate byte fields are lowercase hex, addresses are canonical strings.
#[derive(Serialize, Deserialize)]
struct ChecklistRepr {
    #[serde(rename = "Pairs")]
    pairs: Vec<Pair>,
    #[serde(rename = "Valid")]
    valid: Vec<usize>,
    #[serde(rename = "State")]
    state: ChecklistState,
}

impl Serialize for Checklist {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut valid = Vec::with_capacity(self.valid.len());
        for v in &self.valid {
            let index = self
                .pairs
                .iter()
                .position(|p| p.same_addrs(v))
                .ok_or_else(|| S::Error::custom("valid pair missing from pair list"))?;
            valid.push(index);
        }
        ChecklistRepr {
            pairs: self.pairs.clone(),
            valid,
            state: self.state,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Checklist {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = ChecklistRepr::deserialize(deserializer)?;
        let mut valid = Vec::with_capacity(repr.valid.len());
        for index in repr.valid {
            let pair = repr
                .pairs
                .get(index)
                .ok_or_else(|| D::Error::custom(format!("valid index {index} out of range")))?;
            valid.push(pair.clone());
        }
        Ok(Checklist {
            pairs: repr.pairs,
            valid,
            triggered: VecDeque::new(),
            state: repr.state,
        })
    }
}
