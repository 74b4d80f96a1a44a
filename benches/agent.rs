//! Benchmarks for the scheduling hot paths: pair picking across checklists
//! and per-packet pair key construction.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::mock::StepRng;

use ice_agent::{Agent, AgentConfig, Candidate, Checklist, Pair, PairKey, PairState};

fn pair(state: PairState, foundation: &[u8]) -> Pair {
    Pair {
        state,
        foundation: foundation.to_vec(),
        ..Pair::default()
    }
}

fn list(pairs: Vec<Pair>) -> Checklist {
    Checklist {
        pairs,
        ..Checklist::default()
    }
}

fn agent_with(set: Vec<Checklist>, current: usize) -> Agent {
    let mut agent = Agent::with_rng(AgentConfig::default(), Box::new(StepRng::new(1, 1)));
    for checklist in set {
        agent.add_checklist(checklist);
    }
    agent.select_checklist(Some(current));
    agent
}

fn bench_pick_pair(c: &mut Criterion) {
    c.bench_function("pick_pair/waiting", |b| {
        b.iter_batched(
            || {
                agent_with(
                    vec![list(vec![pair(PairState::Waiting, &[1, 2, 3, 100, 31, 22])])],
                    0,
                )
            },
            |mut agent| black_box(agent.pick_pair().unwrap()),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("pick_pair/frozen_scan", |b| {
        b.iter_batched(
            || {
                agent_with(
                    vec![
                        list(vec![
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 22]),
                            pair(PairState::Failed, &[1, 2, 3, 100, 31, 22]),
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 22]),
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 24]),
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 23]),
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 22]),
                        ]),
                        list(vec![
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 21]),
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 22]),
                            pair(PairState::Waiting, &[1, 2, 3, 100, 31, 21]),
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 22]),
                            pair(PairState::Waiting, &[1, 2, 3, 100, 31, 23]),
                            pair(PairState::Frozen, &[1, 2, 3, 100, 31, 20]),
                        ]),
                        list(vec![pair(PairState::Frozen, &[1, 2, 3, 100, 31, 22])]),
                        list(vec![pair(PairState::Frozen, &[1, 2, 3, 100, 31, 22])]),
                    ],
                    0,
                )
            },
            |mut agent| black_box(agent.pick_pair().unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_pair_key(c: &mut Criterion) {
    let local = Candidate::host("127.0.0.1:31223".parse::<std::net::SocketAddr>().unwrap().into(), 1, 65535);
    let remote = Candidate::host("127.0.0.1:31224".parse::<std::net::SocketAddr>().unwrap().into(), 1, 65535);
    let pair = Pair::new(local, remote);
    c.bench_function("pair_key", |b| {
        b.iter(|| {
            let key = PairKey::from_pair(black_box(&pair));
            assert_ne!(key.local_port, 0);
            key
        })
    });
}

criterion_group!(benches, bench_pick_pair, bench_pair_key);
criterion_main!(benches);
