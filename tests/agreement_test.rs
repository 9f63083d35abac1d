//! Normal-case agreement between correct replicas.

mod common;

use log::LevelFilter;
use sbft_rs::{
    events::Event,
    networking::messages::{Message, Preprepare},
    types::{
        batch::{Batch, Request},
        certificates::Checkpoint,
        crypto_primitives::{Ed25519Crypto, VerifyingKey},
        data_types::{CryptoHash, ReplicaId, SeqNo, ViewNumber},
        subject::{SeqView, Subject},
    },
};

use common::{
    logging::setup_logger,
    sim::{signing_key, test_config, Sim},
};

const MAX_STEPS: usize = 200_000;

fn payload(i: usize) -> Vec<u8> {
    format!("request {}", i).into_bytes()
}

#[test]
fn requests_are_executed_in_the_same_order_everywhere() {
    setup_logger(LevelFilter::Warn);
    for seed in 1..=3 {
        let mut sim = Sim::new(test_config(4, 1), seed);
        for i in 0..12 {
            sim.request((i % 4) as u64, &payload(i));
        }

        let done = sim.run_until(MAX_STEPS, |sim| {
            (0..4).all(|id| sim.ledger(id).payloads().len() == 12)
        });
        assert!(done, "seed {}: not every request was executed", seed);
        sim.assert_consistent();

        let mut executed = sim.ledger(0).payloads();
        executed.sort();
        let mut submitted: Vec<Vec<u8>> = (0..12).map(payload).collect();
        submitted.sort();
        assert_eq!(executed, submitted);

        for id in 0..4 {
            assert_eq!(sim.engine(id).view().int(), 0);
            assert_eq!(sim.engine(id).pending_requests(), 0);
        }
    }
}

#[test]
fn single_replica_drains_a_large_pool() {
    let mut config = test_config(1, 0);
    config.batch_size_limit_bytes = 1;
    let mut sim = Sim::new(config, 23);

    // Hold execution back so that the pool fills up behind the first batch.
    sim.ledger(0).fail_next(1);
    sim.request(0, &payload(0));
    assert_eq!(sim.errors().len(), 1);
    for i in 1..2000 {
        sim.request(0, &payload(i));
    }
    assert_eq!(sim.engine(0).pending_requests(), 2000);

    sim.call(ReplicaId::new(0), |engine| engine.retry_execution());
    assert_eq!(sim.errors().len(), 1);
    assert_eq!(sim.ledger(0).last_seq(), 2000);
    assert_eq!(sim.ledger(0).payloads(), (0..2000).map(payload).collect::<Vec<_>>());
    assert_eq!(sim.engine(0).pending_requests(), 0);
    assert_eq!(sim.engine(0).last_stable().seq().int(), 2000);
}

#[test]
fn request_larger_than_the_batch_limit_is_executed() {
    let mut config = test_config(4, 1);
    config.batch_size_limit_bytes = 4;
    let mut sim = Sim::new(config, 29);
    sim.request(2, b"longer than the limit");
    sim.request(2, b"xy");

    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.ledger(id).payloads().len() == 2)
    }));
    sim.assert_consistent();
    let mut executed = sim.ledger(1).payloads();
    executed.sort();
    assert_eq!(executed, vec![b"longer than the limit".to_vec(), b"xy".to_vec()]);
}

#[test]
fn requests_at_a_backup_form_the_next_batch() {
    let mut sim = Sim::new(test_config(4, 1), 19);
    sim.request(0, &[1, 2, 3]);
    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.ledger(id).last_seq() == 1)
    }));
    for id in 0..4 {
        assert_eq!(sim.ledger(id).payloads(), vec![vec![1, 2, 3]]);
    }

    sim.request(1, b"r2");
    sim.request(1, b"r3");
    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.ledger(id).last_seq() == 2)
    }));
    sim.assert_consistent();
    let second = &sim.ledger(2).executed()[1];
    let mut payloads: Vec<&[u8]> = second.requests.iter().map(Request::payload).collect();
    payloads.sort();
    assert_eq!(payloads, vec![&b"r2"[..], &b"r3"[..]]);
}

#[test]
fn duplicate_messages_change_nothing() {
    let mut sim = Sim::new(test_config(4, 1), 23);
    sim.request(0, b"once");
    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.engine(id).last_stable().seq().int() == 1)
    }));
    sim.settle();
    assert_eq!(sim.in_flight(), 0);

    let batch = sim.ledger(1).executed()[0].clone();
    let subject = Subject::new(SeqView::new(SeqNo::new(1), ViewNumber::init()), batch.hash());
    let replicas: Vec<VerifyingKey> = (0..4).map(|id| signing_key(id).verifying_key()).collect();
    let checkpoint = Checkpoint::create(
        &Ed25519Crypto::new(signing_key(2), replicas),
        SeqNo::new(1),
        batch.hash(),
    );
    for message in [
        Message::Prepare(subject),
        Message::Commit(subject),
        Message::Checkpoint(checkpoint),
    ] {
        sim.call(ReplicaId::new(1), |engine| {
            engine.receive(message, ReplicaId::new(2))
        });
    }

    assert_eq!(sim.in_flight(), 0);
    assert_eq!(sim.ledger(1).executed(), vec![batch]);
    assert_eq!(sim.engine(1).last_stable().seq().int(), 1);
    assert!(sim.errors().is_empty());
}

#[test]
fn checkpoints_for_another_batch_are_reported() {
    let mut sim = Sim::new(test_config(4, 1), 37);
    sim.set_filter(|_, to, message| {
        !(to == ReplicaId::new(1) && matches!(message, Message::Checkpoint(_)))
    });
    sim.request(0, b"agreed");
    assert!(sim.run_until(MAX_STEPS, |sim| sim.ledger(1).last_seq() == 1));
    sim.take_events(1);

    let local = sim.ledger(1).executed()[0].hash();
    let other = CryptoHash::new([7; 32]);
    let replicas: Vec<VerifyingKey> = (0..4).map(|id| signing_key(id).verifying_key()).collect();
    for signer in [2, 3] {
        let checkpoint = Checkpoint::create(
            &Ed25519Crypto::new(signing_key(signer), replicas.clone()),
            SeqNo::new(1),
            other,
        );
        sim.call(ReplicaId::new(1), |engine| {
            engine.receive(Message::Checkpoint(checkpoint), ReplicaId::new(signer))
        });
    }

    let divergences: Vec<(SeqNo, _, _)> = sim
        .take_events(1)
        .into_iter()
        .filter_map(|event| match event {
            Event::CheckpointDivergence(divergence) => Some((
                divergence.seq,
                divergence.local_digest,
                divergence.quorum_digest,
            )),
            _ => None,
        })
        .collect();
    assert_eq!(divergences, vec![(SeqNo::new(1), local, other)]);
    assert_eq!(sim.engine(1).last_stable().seq(), SeqNo::genesis());
}

#[test]
fn every_executed_batch_becomes_stable() {
    let mut sim = Sim::new(test_config(4, 1), 7);
    sim.request(2, b"a");
    sim.request(3, b"b");

    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| {
            let last = sim.ledger(id).last_seq();
            last > 0 && sim.engine(id).last_stable().seq().int() == last
        }) && sim.ledger(0).payloads().len() == 2
    }));
    for id in 0..4 {
        assert_eq!(
            sim.engine(id).last_stable().digest(),
            sim.engine(id).last_executed().hash()
        );
    }
}

#[test]
fn full_pool_is_proposed_without_waiting() {
    let mut sim = Sim::new(test_config(4, 1), 3);
    for i in 0..5u8 {
        sim.request(0, &[i; 400]);
    }

    assert!(sim.run_until(MAX_STEPS, |sim| sim.ledger(0).last_seq() >= 1));
    assert_eq!(sim.now(), 0);

    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.ledger(id).payloads().len() == 5)
    }));
    let batches = sim.ledger(1).executed();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].requests.len(), 3);
    assert_eq!(batches[1].requests.len(), 2);
}

#[test]
fn small_batches_wait_for_the_batch_timer() {
    let mut sim = Sim::new(test_config(4, 1), 5);
    sim.request(1, b"small");
    sim.settle();
    assert_eq!(sim.ledger(0).last_seq(), 0);

    assert!(sim.run_until(MAX_STEPS, |sim| sim.ledger(0).last_seq() == 1));
    assert!(sim.now() >= 10);
}

#[test]
fn identical_requests_are_both_executed() {
    let mut sim = Sim::new(test_config(4, 1), 11);
    sim.request(1, b"same");
    sim.request(1, b"same");

    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.ledger(id).payloads().len() == 2)
    }));
    for id in 0..4 {
        assert_eq!(sim.ledger(id).payloads(), vec![b"same".to_vec(); 2]);
        assert_eq!(sim.engine(id).pending_requests(), 0);
    }
}

#[test]
fn backup_that_misses_commits_executes_from_checkpoints() {
    let mut sim = Sim::new(test_config(4, 1), 13);
    sim.set_filter(|_, to, message| {
        !(to == ReplicaId::new(3) && matches!(message, Message::Commit(_)))
    });
    sim.request(0, b"x");

    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.engine(id).last_stable().seq().int() == 1)
    }));
    assert_eq!(sim.ledger(3).payloads(), vec![b"x".to_vec()]);
    sim.assert_consistent();
}

#[test]
fn single_replica_executes_alone() {
    let mut sim = Sim::new(test_config(1, 0), 1);
    sim.request(0, b"alone");

    assert!(sim.run_until(MAX_STEPS, |sim| sim.ledger(0).last_seq() == 1));
    assert_eq!(sim.engine(0).last_stable().seq().int(), 1);
    assert!(sim.errors().is_empty());
}

#[test]
fn preprepare_from_a_backup_is_ignored() {
    let mut sim = Sim::new(test_config(4, 1), 17);
    // Replica 1 pretends to be the primary of view 0.
    let forged = Preprepare {
        seq: SeqView::new(SeqNo::new(1), ViewNumber::init()),
        batch: Batch::new(
            SeqNo::new(1),
            Batch::genesis().hash(),
            vec![Request::new(b"forged".to_vec())],
        ),
    };
    sim.call(ReplicaId::new(2), |engine| {
        engine.receive(Message::Preprepare(forged), ReplicaId::new(1))
    });
    sim.settle();

    for id in 0..4 {
        assert_eq!(sim.ledger(id).last_seq(), 0);
    }
    assert!(sim.errors().is_empty());
}
