use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, trace, warn};

use crate::addr::Addr;
use crate::candidate::{self, Candidate, CandidateType};
use crate::checklist::{Checklist, ChecklistState};
use crate::error::Error;
use crate::foundation::FoundationSet;
use crate::pair::{Pair, PairKey, PairState};
use crate::stun::{self, Message, MessageBuilder, MessageClass, TransactionId};
use crate::Role;

/// Aggregate connectivity state of the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgentState {
    #[default]
    Running,
    Completed,
    Failed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Running => "running",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Hands a built Binding request to the entity owning the socket and the
/// retransmission timers. Terminal outcomes come back either as bytes through
/// [`Agent::process_udp`] or as a synchronous error from `start`.
pub trait StunTransactor: Send + Sync {
    fn start(&self, message: &Message) -> Result<(), Error>;
}

/// Credentials and transport bound to one candidate pair.
///
/// Usernames and passwords are the ICE fragments exchanged over signalling;
/// requests we send authenticate with the remote password and carry
/// `remote_username:local_username`.
#[derive(Clone)]
pub struct PairContext {
    pub local_username: String,
    pub remote_username: String,
    pub local_password: String,
    pub remote_password: String,
    pub local_preference: u16,
    pub stun: Arc<dyn StunTransactor>,
}

impl fmt::Debug for PairContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Passwords stay out of logs.
        f.debug_struct("PairContext")
            .field("local_username", &self.local_username)
            .field("remote_username", &self.remote_username)
            .field("local_preference", &self.local_preference)
            .finish_non_exhaustive()
    }
}

/// An in-flight Binding transaction, addressed by (checklist, pair) index.
#[derive(Debug, Clone, Copy)]
struct AgentTransaction {
    id: TransactionId,
    checklist: usize,
    pair: usize,
    /// Set on USE-CANDIDATE re-checks; their success completes nomination.
    nominating: bool,
}

/// Agent configuration.
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// Initial role. The offerer of the session is controlling.
    pub role: Role,
    /// Cap on pairs kept per checklist after pruning.
    pub max_pairs: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            role: Role::Controlling,
            max_pairs: 100,
        }
    }
}

/// The connectivity-check engine.
///
/// Single-threaded and sans-IO: a host event loop feeds inbound datagrams to
/// [`process_udp`](Agent::process_udp) and drives scheduling with
/// [`tick`](Agent::tick); outbound requests leave through the per-pair
/// [`StunTransactor`].
pub struct Agent {
    role: Role,
    tiebreaker: u64,
    set: Vec<Checklist>,
    /// Index of the checklist currently holding the scheduling slot.
    checklist: Option<usize>,
    ctx: HashMap<PairKey, PairContext>,
    transactions: HashMap<TransactionId, AgentTransaction>,
    state: AgentState,
    max_pairs: usize,
    rng: Box<dyn RngCore + Send>,
    initialized: bool,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("checklists", &self.set.len())
            .field("checklist", &self.checklist)
            .field("transactions", &self.transactions.len())
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self::with_rng(config, Box::new(StdRng::from_entropy()))
    }

    /// Builds an agent with an injected randomness source. Determinism for
    /// tests; entropy for everyone else.
    pub fn with_rng(config: AgentConfig, rng: Box<dyn RngCore + Send>) -> Self {
        Agent {
            role: config.role,
            tiebreaker: 0,
            set: Vec::new(),
            checklist: None,
            ctx: HashMap::new(),
            transactions: HashMap::new(),
            state: AgentState::Running,
            max_pairs: config.max_pairs,
            rng,
            initialized: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn tiebreaker(&self) -> u64 {
        self.tiebreaker
    }

    pub fn checklists(&self) -> &[Checklist] {
        &self.set
    }

    pub fn current_checklist(&self) -> Option<usize> {
        self.checklist
    }

    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Appends a formed checklist, trimming it to the configured pair cap.
    pub fn add_checklist(&mut self, mut list: Checklist) {
        if list.pairs.len() > self.max_pairs {
            debug!(
                dropped = list.pairs.len() - self.max_pairs,
                "truncating checklist to pair cap"
            );
            list.pairs.truncate(self.max_pairs);
        }
        self.set.push(list);
    }

    /// Registers credentials and a transactor for a pair.
    pub fn set_pair_context(&mut self, key: PairKey, ctx: PairContext) {
        self.ctx.insert(key, ctx);
    }

    /// Draws the tie-breaker and seeds pair and checklist states: the first
    /// pair of each foundation class across the whole set becomes Waiting,
    /// everything else stays Frozen; checklists with no live pair fail
    /// immediately. Calling `init` again is a no-op.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }
        self.tiebreaker = self.rng.next_u64();
        debug!(role = %self.role, tiebreaker = self.tiebreaker, "agent initialized");

        let mut seen = FoundationSet::default();
        for cl in 0..self.set.len() {
            for p in 0..self.set[cl].pairs.len() {
                let foundation = self.set[cl].pairs[p].foundation.clone();
                if seen.contains(&foundation)? {
                    continue;
                }
                seen.add(&foundation)?;
                if self.set[cl].pairs[p].state == PairState::Frozen {
                    self.set_pair_state(cl, p, PairState::Waiting);
                }
            }
        }
        for list in &mut self.set {
            list.state = if list.has_runnable_pair() {
                ChecklistState::Running
            } else {
                ChecklistState::Failed
            };
        }
        self.initialized = true;
        self.update_state();
        Ok(())
    }

    /// The next Running checklist after the current one, wrapping around;
    /// `None` when nothing is running. Pure: the selection is applied with
    /// [`select_checklist`](Agent::select_checklist).
    pub fn next_checklist(&self) -> Option<usize> {
        if self.set.is_empty() {
            return None;
        }
        let start = match self.checklist {
            Some(current) => current + 1,
            None => 0,
        };
        let n = self.set.len();
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&index| self.set[index].state == ChecklistState::Running)
    }

    /// Hands the scheduling slot to the given checklist.
    pub fn select_checklist(&mut self, index: Option<usize>) {
        self.checklist = index;
    }

    /// Picks the pair to check next from the current checklist: triggered
    /// checks first, then the highest-priority Waiting pair, then the first
    /// Frozen pair whose foundation has no check underway in any checklist.
    /// The picked pair is moved to In-Progress.
    pub fn pick_pair(&mut self) -> Result<usize, Error> {
        let cl = self.checklist.ok_or(Error::NoChecklist)?;

        while let Some(index) = self.set[cl].triggered.pop_front() {
            if index >= self.set[cl].pairs.len() {
                continue;
            }
            if matches!(
                self.set[cl].pairs[index].state,
                PairState::Waiting | PairState::Frozen
            ) {
                trace!(checklist = cl, pair = index, "picked triggered pair");
                self.set_pair_state(cl, index, PairState::InProgress);
                return Ok(index);
            }
        }

        for index in 0..self.set[cl].pairs.len() {
            if self.set[cl].pairs[index].state == PairState::Waiting {
                self.set_pair_state(cl, index, PairState::InProgress);
                return Ok(index);
            }
        }

        // Unfreeze at most one pair, and only if no pair anywhere shares its
        // foundation while Waiting or In-Progress.
        let mut in_flight = FoundationSet::default();
        for list in &self.set {
            for pair in &list.pairs {
                if matches!(pair.state, PairState::Waiting | PairState::InProgress) {
                    in_flight.add(&pair.foundation)?;
                }
            }
        }
        for index in 0..self.set[cl].pairs.len() {
            if self.set[cl].pairs[index].state != PairState::Frozen {
                continue;
            }
            if in_flight.contains(&self.set[cl].pairs[index].foundation)? {
                continue;
            }
            self.set_pair_state(cl, index, PairState::Waiting);
            self.set_pair_state(cl, index, PairState::InProgress);
            return Ok(index);
        }
        Err(Error::NoPair)
    }

    /// Runs one scheduling round: advances the checklist rotor, picks a pair
    /// and starts its check. Drive this from the host loop's Ta timer.
    pub fn tick(&mut self) -> Result<(), Error> {
        self.checklist = self.next_checklist();
        let cl = self.checklist.ok_or(Error::NoChecklist)?;
        let pair = self.pick_pair()?;
        self.start_check(cl, pair)
    }

    /// Builds and starts a Binding request for the pair.
    pub fn start_check(&mut self, checklist: usize, pair: usize) -> Result<(), Error> {
        self.start_check_inner(checklist, pair, false)
    }

    fn start_check_inner(
        &mut self,
        cl: usize,
        p: usize,
        nominating: bool,
    ) -> Result<(), Error> {
        let (key, component_id) = {
            let pair = self
                .set
                .get(cl)
                .and_then(|list| list.pairs.get(p))
                .ok_or(Error::NoPair)?;
            (PairKey::from_pair(pair), pair.component_id)
        };
        let (username, password, local_preference, transactor) = {
            let ctx = self.ctx.get(&key).ok_or(Error::MissingContext)?;
            (
                format!("{}:{}", ctx.remote_username, ctx.local_username),
                ctx.remote_password.clone(),
                ctx.local_preference,
                Arc::clone(&ctx.stun),
            )
        };

        // The priority a peer-reflexive candidate discovered by this check
        // would get.
        let prospective = candidate::priority(
            CandidateType::PeerReflexive.preference(),
            local_preference,
            component_id,
        );

        let id = TransactionId::random(self.rng.as_mut());
        let mut builder = MessageBuilder::request(id)
            .username(&username)
            .priority(prospective);
        if nominating {
            builder = builder.use_candidate();
        }
        builder = match self.role {
            Role::Controlling => builder.ice_controlling(self.tiebreaker),
            Role::Controlled => builder.ice_controlled(self.tiebreaker),
        };
        let message = builder
            .integrity(password.as_bytes())
            .fingerprint()
            .build()
            .map_err(Error::MalformedStun)?;

        self.transactions.insert(
            id,
            AgentTransaction {
                id,
                checklist: cl,
                pair: p,
                nominating,
            },
        );
        if !nominating && self.set[cl].pairs[p].state != PairState::InProgress {
            self.set_pair_state(cl, p, PairState::InProgress);
        }
        trace!(checklist = cl, pair = p, transaction = %id, nominating, "starting check");

        if let Err(err) = transactor.start(&message) {
            self.transactions.remove(&id);
            if !nominating {
                self.set_pair_state(cl, p, PairState::Waiting);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Entry point for datagrams arriving on the component socket.
    ///
    /// Non-STUN data is rejected with [`Error::NotStunMessage`] so the caller
    /// can route it to the application. Messages without a pending
    /// transaction — retransmits, unsolicited indications, responses after
    /// [`close`](Agent::close) — are silently ignored.
    pub fn process_udp(&mut self, buf: &[u8], from: SocketAddr) -> Result<(), Error> {
        if !stun::is_message(buf) {
            return Err(Error::NotStunMessage);
        }
        let id = stun::peek_transaction_id(buf).ok_or(Error::NotStunMessage)?;
        let Some(transaction) = self.transactions.get(&id).copied() else {
            trace!(transaction = %id, %from, "no transaction for message, ignoring");
            return Ok(());
        };
        let message = Message::decode(buf).map_err(Error::MalformedStun)?;
        self.handle_binding_response(transaction, &message, from)
    }

    /// Reports that a transaction's retransmissions ran out. The checked
    /// pair fails; a nominating re-check is simply forgotten.
    pub fn handle_timeout(&mut self, id: TransactionId) {
        let Some(transaction) = self.transactions.remove(&id) else {
            return;
        };
        debug!(
            checklist = transaction.checklist,
            pair = transaction.pair,
            nominating = transaction.nominating,
            "transaction timed out"
        );
        if !transaction.nominating {
            self.set_pair_state(transaction.checklist, transaction.pair, PairState::Failed);
            self.sync_checklist_state(transaction.checklist);
            self.update_state();
        }
    }

    fn handle_binding_response(
        &mut self,
        transaction: AgentTransaction,
        message: &Message,
        from: SocketAddr,
    ) -> Result<(), Error> {
        let result = self.process_binding_response(
            transaction.checklist,
            transaction.pair,
            message,
            from,
            transaction.nominating,
        );
        match result {
            // Dropped messages leave the transaction pending; the transactor
            // keeps retransmitting until a valid response or a timeout.
            Err(Error::FingerprintNotFound)
            | Err(Error::FingerprintMismatch)
            | Err(Error::IntegrityMismatch)
            | Err(Error::UnexpectedResponseType(_)) => {}
            _ => {
                self.transactions.remove(&transaction.id);
            }
        }
        result
    }

    /// Validates a Binding response for the pair and applies its outcome.
    ///
    /// Validation is strictly ordered: message class, fingerprint presence,
    /// fingerprint, integrity, then attribute extraction. A failing step
    /// aborts the rest.
    fn process_binding_response(
        &mut self,
        cl: usize,
        p: usize,
        message: &Message,
        from: SocketAddr,
        nominating: bool,
    ) -> Result<(), Error> {
        if self.set.get(cl).and_then(|list| list.pairs.get(p)).is_none() {
            return Err(Error::NoPair);
        }
        match message.class() {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {}
            other => return Err(Error::UnexpectedResponseType(other)),
        }
        message.verify_fingerprint().map_err(|err| match err {
            stun::Error::AttributeNotFound(_) => Error::FingerprintNotFound,
            _ => Error::FingerprintMismatch,
        })?;

        let key = PairKey::from_pair(&self.set[cl].pairs[p]);
        let (remote_password, local_preference) = {
            let ctx = self.ctx.get(&key).ok_or(Error::MissingContext)?;
            (ctx.remote_password.clone(), ctx.local_preference)
        };
        message
            .verify_integrity(remote_password.as_bytes())
            .map_err(|_| Error::IntegrityMismatch)?;

        if message.class() == MessageClass::ErrorResponse {
            let code = message.error_code().ok_or(Error::MissingErrorCode)?;
            return match code {
                stun::CODE_ROLE_CONFLICT => Err(Error::RoleConflict),
                stun::CODE_UNKNOWN_ATTRIBUTE | stun::CODE_STALE_NONCE => {
                    // Recoverable: requeue the pair for another attempt.
                    debug!(checklist = cl, pair = p, code, "recoverable error code");
                    self.set_pair_state(cl, p, PairState::Waiting);
                    Ok(())
                }
                code => {
                    debug!(checklist = cl, pair = p, code, "check failed");
                    self.set_pair_state(cl, p, PairState::Failed);
                    self.sync_checklist_state(cl);
                    self.update_state();
                    Err(Error::UnrecoverableErrorCode(code))
                }
            };
        }

        let mapped = message
            .xor_mapped_address()
            .ok_or(Error::MappedAddressNotFound)?;
        let mapped = Addr::from_udp(mapped);
        let pair = self.set[cl].pairs[p].clone();

        if mapped == pair.local.addr {
            let mut valid = pair.clone();
            valid.state = PairState::Succeeded;
            self.promote_valid(cl, valid);
        } else {
            // The peer saw us through a different mapping: a peer-reflexive
            // candidate (RFC 8445 §7.2.5.3.1). It shares the checked pair's
            // base and component but advertises the mapped address.
            trace!(checklist = cl, pair = p, %mapped, %from, "peer-reflexive mapping");
            let prflx = Candidate::peer_reflexive(
                mapped,
                pair.local.base,
                pair.local.component_id,
                local_preference,
            );
            let mut discovered = Pair::new(prflx, pair.remote.clone());
            discovered.compute_priority(self.role);
            discovered.set_foundation();
            discovered.state = PairState::Succeeded;
            self.promote_valid(cl, discovered);
        }

        if self.set[cl].pairs[p].state != PairState::Succeeded {
            self.set_pair_state(cl, p, PairState::Succeeded);
        }
        let foundation = self.set[cl].pairs[p].foundation.clone();
        self.unfreeze_foundation(&foundation);

        if self.role == Role::Controlling {
            if nominating {
                self.complete_nomination(cl, p);
            } else {
                self.try_nominate(cl)?;
            }
        }
        self.update_state();
        Ok(())
    }

    /// Adds a pair to the checklist's valid list unless an entry for the
    /// same addresses is already there.
    fn promote_valid(&mut self, cl: usize, pair: Pair) {
        let list = &mut self.set[cl];
        if list.valid.iter().any(|v| v.same_addrs(&pair)) {
            return;
        }
        debug!(checklist = cl, pair = %pair, "pair validated");
        list.valid.push(pair);
    }

    /// Regular nomination: once every component of the checklist has a valid
    /// pair and no nomination is underway, re-check the best valid pair per
    /// component with USE-CANDIDATE.
    fn try_nominate(&mut self, cl: usize) -> Result<(), Error> {
        if self
            .transactions
            .values()
            .any(|t| t.nominating && t.checklist == cl)
        {
            return Ok(());
        }
        let mut targets = Vec::new();
        {
            let list = &self.set[cl];
            let components = list.components();
            if components
                .iter()
                .any(|c| !list.valid.iter().any(|v| v.component_id == *c))
            {
                return Ok(());
            }
            for component in components {
                if list
                    .valid
                    .iter()
                    .any(|v| v.component_id == component && v.nominated)
                {
                    continue;
                }
                let Some(best) = list
                    .valid
                    .iter()
                    .filter(|v| v.component_id == component)
                    .max_by_key(|v| v.priority)
                else {
                    continue;
                };
                // The nominating check travels through the pair that
                // produced the valid mapping: same base, same remote.
                let parent = list.pairs.iter().position(|q| {
                    q.component_id == component
                        && q.local.base == best.local.base
                        && q.remote.addr == best.remote.addr
                });
                if let Some(parent) = parent {
                    targets.push(parent);
                }
            }
        }
        for parent in targets {
            debug!(checklist = cl, pair = parent, "nominating");
            self.start_check_inner(cl, parent, true)?;
        }
        Ok(())
    }

    /// A USE-CANDIDATE re-check succeeded: mark the component's best valid
    /// pair nominated and complete the checklist once every component is.
    fn complete_nomination(&mut self, cl: usize, p: usize) {
        let component = self.set[cl].pairs[p].component_id;
        self.set[cl].pairs[p].nominated = true;
        let list = &mut self.set[cl];
        if let Some(best) = list
            .valid
            .iter_mut()
            .filter(|v| v.component_id == component)
            .max_by_key(|v| v.priority)
        {
            debug!(checklist = cl, pair = %best, "pair nominated");
            best.nominated = true;
        }
        let all_nominated = list.components().iter().all(|c| {
            list.valid
                .iter()
                .any(|v| v.component_id == *c && v.nominated)
        });
        if all_nominated {
            list.state = ChecklistState::Completed;
            debug!(checklist = cl, "checklist completed");
        }
    }

    /// Moves every Frozen pair sharing the foundation, in any checklist, to
    /// Waiting.
    fn unfreeze_foundation(&mut self, foundation: &[u8]) {
        for cl in 0..self.set.len() {
            for p in 0..self.set[cl].pairs.len() {
                if self.set[cl].pairs[p].state == PairState::Frozen
                    && self.set[cl].pairs[p].foundation == foundation
                {
                    self.set_pair_state(cl, p, PairState::Waiting);
                }
            }
        }
    }

    /// Resolves a role conflict reported by the peer: the side with the
    /// lower tie-breaker switches role, and the current checklist's pending
    /// pairs return to Waiting for re-checking under the new role. Returns
    /// whether the role changed.
    pub fn resolve_role_conflict(&mut self, peer_tiebreaker: u64) -> bool {
        if self.tiebreaker >= peer_tiebreaker {
            return false;
        }
        self.role = !self.role;
        debug!(role = %self.role, "switched role after conflict");
        if let Some(cl) = self.checklist {
            for p in 0..self.set[cl].pairs.len() {
                if matches!(
                    self.set[cl].pairs[p].state,
                    PairState::Frozen | PairState::InProgress
                ) {
                    self.set_pair_state(cl, p, PairState::Waiting);
                }
            }
        }
        true
    }

    /// Recomputes the aggregate state: Running while any checklist runs,
    /// Completed once one completed and none runs, Failed otherwise.
    pub fn update_state(&mut self) {
        let mut any_running = false;
        let mut any_completed = false;
        for list in &self.set {
            match list.state {
                ChecklistState::Running => any_running = true,
                ChecklistState::Completed => any_completed = true,
                ChecklistState::Failed => {}
            }
        }
        let next = if any_running {
            AgentState::Running
        } else if any_completed {
            AgentState::Completed
        } else {
            AgentState::Failed
        };
        if next != self.state {
            debug!(from = %self.state, to = %next, "agent state changed");
            self.state = next;
        }
    }

    /// Sole mutator of pair state. Transitions outside the lifecycle table
    /// keep the current state; debug builds log them.
    pub fn set_pair_state(&mut self, checklist: usize, pair: usize, state: PairState) {
        let Some(current) = self
            .set
            .get(checklist)
            .and_then(|list| list.pairs.get(pair))
            .map(|p| p.state)
        else {
            return;
        };
        if !valid_transition(current, state) {
            if cfg!(debug_assertions) && current != state {
                warn!(checklist, pair, from = %current, to = %state, "invalid pair transition");
            }
            return;
        }
        trace!(checklist, pair, from = %current, to = %state, "pair transition");
        self.set[checklist].pairs[pair].state = state;
    }

    /// A checklist whose pairs all failed without producing a valid pair has
    /// failed as a whole.
    fn sync_checklist_state(&mut self, cl: usize) {
        let list = &mut self.set[cl];
        if list.state == ChecklistState::Running
            && list.valid.is_empty()
            && list.pairs.iter().all(|p| p.state == PairState::Failed)
        {
            debug!(checklist = cl, "checklist failed");
            list.state = ChecklistState::Failed;
        }
    }

    /// Tears the agent down: pending transactions are dropped, so late
    /// responses hit the ignore path, and the state goes terminal.
    pub fn close(&mut self) {
        self.transactions.clear();
        self.checklist = None;
        self.state = AgentState::Failed;
        debug!("agent closed");
    }
}

fn valid_transition(from: PairState, to: PairState) -> bool {
    use PairState::*;
    matches!(
        (from, to),
        (Frozen, Waiting)
            | (Frozen, InProgress)
            | (Frozen, Failed)
            | (Waiting, InProgress)
            | (Waiting, Failed)
            | (InProgress, Waiting)
            | (InProgress, Succeeded)
            | (InProgress, Failed)
    )
}
