//! End-to-end agent flow against the golden checklist fixture: seeded init,
//! the controlling check request on the wire, response processing and
//! regular nomination, all through the public API.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::rngs::mock::StepRng;

use ice_agent::stun::{Message, MessageBuilder};
use ice_agent::{
    Agent, AgentConfig, AgentState, Checklist, ChecklistState, Error, PairContext, PairKey,
    PairState, Role, StunTransactor,
};

/// First 64-bit draw of the seeded test generator.
const TIEBREAKER: u64 = 5_721_121_980_023_635_282;

fn load_checklist(name: &str) -> Checklist {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name);
    let data = fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()));
    serde_json::from_str(&data).expect("golden checklist parses")
}

#[derive(Default)]
struct Capture {
    sent: Mutex<Vec<Message>>,
}

impl Capture {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn last(&self) -> Message {
        self.sent
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no request captured")
    }
}

impl StunTransactor for Capture {
    fn start(&self, message: &Message) -> Result<(), Error> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn seeded_agent() -> Agent {
    let mut agent = Agent::with_rng(
        AgentConfig::default(),
        Box::new(StepRng::new(TIEBREAKER, 1)),
    );
    agent.add_checklist(load_checklist("checklist.json"));
    agent
}

fn peer_addr() -> SocketAddr {
    "10.0.0.1:31230".parse().unwrap()
}

#[test]
fn init_matches_golden_state() {
    let mut agent = seeded_agent();
    agent.init().unwrap();

    assert_eq!(agent.tiebreaker(), TIEBREAKER);
    assert_eq!(agent.role(), Role::Controlling);
    assert_eq!(agent.state(), AgentState::Running);

    // Distinct foundations: both pairs unfreeze at init.
    let expected = load_checklist("checklist_updated.json");
    assert_eq!(agent.checklists()[0], expected);
}

#[test]
fn golden_checklist_serializes_back() {
    let list = load_checklist("checklist.json");
    let encoded = serde_json::to_value(&list).unwrap();
    let original: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/checklist.json"),
        ).unwrap())
        .unwrap();
    assert_eq!(encoded, original);
}

#[test]
fn checking_flow_to_nomination() {
    let mut agent = seeded_agent();
    agent.init().unwrap();
    agent.select_checklist(Some(0));

    let transactor = Arc::new(Capture::default());
    let key = PairKey::from_pair(&agent.checklists()[0].pairs[0]);
    agent.set_pair_context(
        key,
        PairContext {
            local_username: "LFRAG".into(),
            remote_username: "RFRAG".into(),
            local_password: "LPASS".into(),
            remote_password: "RPASS".into(),
            local_preference: 10,
            stun: transactor.clone(),
        },
    );

    // The controlling check request carries the agreed username, the
    // prospective peer-reflexive priority, our tie-breaker, and verifies
    // under the remote password with a fingerprint.
    agent.start_check(0, 0).unwrap();
    let request = transactor.last();
    assert_eq!(request.username(), Some("RFRAG:LFRAG"));
    assert_eq!(request.priority(), Some(1_845_496_575));
    assert_eq!(request.ice_controlling(), Some(TIEBREAKER));
    assert_eq!(request.ice_controlled(), None);
    request.verify_integrity(b"RPASS").unwrap();
    request.verify_fingerprint().unwrap();
    assert_eq!(agent.checklists()[0].pairs[0].state, PairState::InProgress);

    // A success response whose mapped address equals the pair's local
    // address validates the pair directly.
    let response = MessageBuilder::success_response(request.transaction_id())
        .xor_mapped_address("10.0.0.2:10230".parse().unwrap())
        .integrity(b"RPASS")
        .fingerprint()
        .build()
        .unwrap();
    agent.process_udp(response.as_bytes(), peer_addr()).unwrap();

    assert_eq!(agent.checklists()[0].pairs[0].state, PairState::Succeeded);
    assert_eq!(agent.checklists()[0].valid.len(), 1);

    // Every component has a valid pair now, so the controlling agent
    // re-checks the best one with USE-CANDIDATE.
    assert_eq!(transactor.count(), 2);
    let nominate = transactor.last();
    assert!(nominate.use_candidate());

    let response = MessageBuilder::success_response(nominate.transaction_id())
        .xor_mapped_address("10.0.0.2:10230".parse().unwrap())
        .integrity(b"RPASS")
        .fingerprint()
        .build()
        .unwrap();
    agent.process_udp(response.as_bytes(), peer_addr()).unwrap();

    assert!(agent.checklists()[0].valid[0].nominated);
    assert_eq!(agent.checklists()[0].state, ChecklistState::Completed);
    assert_eq!(agent.state(), AgentState::Completed);
}
