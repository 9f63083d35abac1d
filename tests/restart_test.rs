//! Crashes, restarts, and failures of the replica's own storage and ledger.

mod common;

use std::{cell::Cell, rc::Rc};

use log::LevelFilter;
use sbft_rs::{
    engine::{EngineError, MAX_STATE_TRANSFER_BATCHES},
    networking::messages::Message,
    types::data_types::{ReplicaId, ViewNumber},
};

use common::{
    logging::setup_logger,
    sim::{test_config, Sim},
};

const MAX_STEPS: usize = 200_000;

/// Submit `payload` at replica `at` and run until every replica in `ids` has executed `count`
/// requests.
fn execute(sim: &mut Sim, at: u64, payload: &[u8], ids: &[u64], count: usize) {
    sim.request(at, payload);
    let ids = ids.to_vec();
    assert!(sim.run_until(MAX_STEPS, move |sim| {
        ids.iter().all(|id| sim.ledger(*id).payloads().len() == count)
    }));
}

#[test]
fn restarted_replica_catches_up_through_state_transfer() {
    setup_logger(LevelFilter::Warn);
    let mut sim = Sim::new(test_config(4, 1), 31);
    execute(&mut sim, 0, b"one", &[0, 1, 2, 3], 1);

    sim.crash(2);
    execute(&mut sim, 0, b"two", &[0, 1, 3], 2);
    execute(&mut sim, 1, b"three", &[0, 1, 3], 3);
    execute(&mut sim, 3, b"four", &[0, 1, 3], 4);
    assert_eq!(sim.ledger(2).last_seq(), 1);

    sim.restart(2);
    assert!(sim.run_until(MAX_STEPS, |sim| sim.ledger(2).last_seq() == 4));
    assert_eq!(sim.engine(2).last_stable().seq().int(), 4);
    sim.assert_consistent();

    // The restarted replica takes part in agreement again.
    execute(&mut sim, 2, b"five", &[0, 1, 2, 3], 5);
    sim.assert_consistent();
}

#[test]
fn long_gap_is_fetched_in_several_state_responses() {
    let mut sim = Sim::new(test_config(4, 1), 33);
    sim.crash(3);
    let behind = 2 * MAX_STATE_TRANSFER_BATCHES as usize + 5;
    for i in 0..behind {
        execute(&mut sim, (i % 3) as u64, &(i as u32).to_be_bytes(), &[0, 1, 2], i + 1);
    }

    let responses = Rc::new(Cell::new(0));
    let largest = Rc::new(Cell::new(0));
    let (counted, measured) = (responses.clone(), largest.clone());
    sim.set_filter(move |_, to, message| {
        if let (Message::StateResponse(response), 3) = (message, to.int()) {
            counted.set(counted.get() + 1);
            measured.set(measured.get().max(response.batches.len()));
        }
        true
    });

    sim.restart(3);
    assert!(sim.run_until(MAX_STEPS, |sim| sim.ledger(3).last_seq() == behind as u64));
    assert_eq!(sim.engine(3).last_stable().seq().int(), behind as u64);
    sim.assert_consistent();
    assert!(responses.get() >= 3);
    assert!(largest.get() as u64 <= MAX_STATE_TRANSFER_BATCHES);

    sim.clear_filter();
    execute(&mut sim, 3, b"rejoined", &[0, 1, 2, 3], behind + 1);
    sim.assert_consistent();
}

#[test]
fn replica_that_missed_a_view_change_joins_the_new_view() {
    let mut sim = Sim::new(test_config(4, 1), 32);
    execute(&mut sim, 0, b"before", &[0, 1, 2, 3], 1);

    sim.crash(3);
    for id in 0..3 {
        sim.call(ReplicaId::new(id), |engine| engine.request_view_change());
    }
    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..3).all(|id| sim.engine(id).view() == ViewNumber::new(1) && sim.engine(id).is_active())
    }));
    execute(&mut sim, 1, b"after 1", &[0, 1, 2], 2);
    execute(&mut sim, 2, b"after 2", &[0, 1, 2], 3);

    sim.restart(3);
    assert_eq!(sim.engine(3).view(), ViewNumber::init());
    assert!(sim.run_until(MAX_STEPS, |sim| {
        sim.engine(3).view() == ViewNumber::new(1)
            && sim.engine(3).is_active()
            && sim.ledger(3).last_seq() == sim.ledger(0).last_seq()
    }));
    sim.assert_consistent();

    execute(&mut sim, 3, b"together", &[0, 1, 2, 3], 4);
    sim.assert_consistent();
}

#[test]
fn restart_keeps_the_view_and_the_batch_in_flight() {
    let mut sim = Sim::new(test_config(4, 1), 33);
    // Nobody gets past the prepare phase.
    sim.set_filter(|_, _, message| !matches!(message, Message::Commit(_)));
    sim.request(0, b"in flight");
    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.store(id).len() > 0)
    }));
    sim.settle();
    assert!(sim.now() < 500);

    sim.restart(1);
    assert_eq!(sim.engine(1).view(), ViewNumber::init());
    assert_eq!(sim.ledger(1).last_seq(), 0);

    // Prepares and commits re-sent on reconnection complete the sequence.
    sim.clear_filter();
    sim.restart(2);
    assert!(sim.run_until(MAX_STEPS, |sim| {
        (0..4).all(|id| sim.ledger(id).payloads() == vec![b"in flight".to_vec()])
    }));
    sim.assert_consistent();
}

#[test]
fn persistence_failure_halts_the_replica() {
    let mut sim = Sim::new(test_config(4, 1), 34);
    sim.store(2).set_failing(true);
    execute(&mut sim, 0, b"x", &[0, 1, 3], 1);

    assert!(sim.engine(2).is_halted());
    assert_eq!(sim.ledger(2).last_seq(), 0);
    assert!(sim
        .errors()
        .iter()
        .any(|(id, err)| *id == ReplicaId::new(2) && matches!(err, EngineError::Persist(_))));

    sim.call(ReplicaId::new(2), |engine| engine.request(b"ignored".to_vec()));
    assert_eq!(
        sim.errors().last().map(|(id, err)| (*id, err.clone())),
        Some((ReplicaId::new(2), EngineError::Halted))
    );

    // Once the storage works again, a restart brings the replica back.
    sim.store(2).set_failing(false);
    sim.restart(2);
    assert!(!sim.engine(2).is_halted());
    assert!(sim.run_until(MAX_STEPS, |sim| sim.ledger(2).last_seq() == 1));
    sim.assert_consistent();
}

#[test]
fn failed_execution_is_retried() {
    let mut sim = Sim::new(test_config(4, 1), 35);
    sim.ledger(1).fail_next(1);
    execute(&mut sim, 0, b"retry me", &[0, 2, 3], 1);
    sim.settle();

    assert_eq!(sim.ledger(1).last_seq(), 0);
    assert!(sim.engine(1).has_pending_execution());
    assert!(sim.errors().iter().any(|(id, err)| {
        *id == ReplicaId::new(1) && matches!(err, EngineError::Execute { seq, .. } if seq.int() == 1)
    }));

    sim.call(ReplicaId::new(1), |engine| engine.retry_execution());
    assert!(!sim.engine(1).has_pending_execution());
    assert_eq!(sim.ledger(1).payloads(), vec![b"retry me".to_vec()]);
    assert!(sim.run_until(MAX_STEPS, |sim| sim.engine(1).last_stable().seq().int() == 1));
    sim.assert_consistent();
}
