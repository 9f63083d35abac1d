/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The algorithm thread, which drives one replica's [engine](crate::engine::Engine) in real time.
//!
//! The thread owns the engine and is the only one that touches it. It waits on a single input queue
//! that carries messages and connection notices from the [poller](crate::networking::receiving) and
//! client requests from the [replica handle](crate::replica::Replica), and fires expired timers
//! in between. Every input is handed to the engine to completion before the next one is taken.
//!
//! If the engine halts after a persistence failure, the thread logs the failure and exits. A batch
//! that the ledger failed to execute is retried every [`EXECUTE_RETRY_INTERVAL`].

use std::{
    collections::{BTreeSet, HashMap},
    sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    engine::{Engine, EngineError},
    networking::{messages::Message, network::Network, sending::SenderHandle},
    persistent_log::pluggables::KVStore,
    system::{Ledger, System, TimerId},
    types::{crypto_primitives::Ed25519Crypto, data_types::ReplicaId},
};

/// Longest time the thread blocks on its input queue before checking for shutdown.
const MAX_WAIT: Duration = Duration::from_millis(10);

/// How often a batch that the ledger failed to execute is retried.
pub(crate) const EXECUTE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Everything that can change a replica's state.
pub(crate) enum Input {
    Message { origin: ReplicaId, message: Message },
    Request(Vec<u8>),
    Connection { peer: ReplicaId },
}

/// Timers set by the engine, ordered by deadline.
#[derive(Default)]
pub(crate) struct TimerQueue {
    next_id: u64,
    deadlines: BTreeSet<(Instant, TimerId)>,
    by_id: HashMap<TimerId, Instant>,
}

impl TimerQueue {
    pub(crate) fn set(&mut self, duration: Duration) -> TimerId {
        let timer = TimerId::new(self.next_id);
        self.next_id += 1;
        let deadline = Instant::now() + duration;
        self.deadlines.insert((deadline, timer));
        self.by_id.insert(timer, deadline);
        timer
    }

    pub(crate) fn cancel(&mut self, timer: TimerId) {
        if let Some(deadline) = self.by_id.remove(&timer) {
            self.deadlines.remove(&(deadline, timer));
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest timer whose deadline is not after `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerId> {
        let (deadline, timer) = *self.deadlines.iter().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&(deadline, timer));
        self.by_id.remove(&timer);
        Some(timer)
    }
}

/// The [`System`] the algorithm thread gives its engine: messages go to the [`Network`], and timers
/// go into a [`TimerQueue`] that the thread polls.
pub(crate) struct ReplicaSystem<N: Network> {
    sender: SenderHandle<N>,
    timers: TimerQueue,
}

impl<N: Network> ReplicaSystem<N> {
    pub(crate) fn new(me: ReplicaId, n: u64, network: N) -> Self {
        Self {
            sender: SenderHandle::new(me, n, network),
            timers: TimerQueue::default(),
        }
    }
}

impl<N: Network> System for ReplicaSystem<N> {
    fn send(&mut self, peer: ReplicaId, message: Message) {
        self.sender.send(peer, message)
    }

    fn broadcast(&mut self, message: Message) {
        self.sender.broadcast(message)
    }

    fn set_timer(&mut self, duration: Duration) -> TimerId {
        self.timers.set(duration)
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.timers.cancel(timer)
    }
}

pub(crate) type ReplicaEngine<N, L, K> = Engine<ReplicaSystem<N>, L, K, Ed25519Crypto>;

pub(crate) struct Algorithm<N: Network, L: Ledger, K: KVStore> {
    engine: ReplicaEngine<N, L, K>,
    inputs: Receiver<Input>,
    shutdown_signal: Receiver<()>,
    last_execute_retry: Instant,
}

impl<N: Network + 'static, L: Ledger + Send + 'static, K: KVStore> Algorithm<N, L, K> {
    pub(crate) fn new(
        engine: ReplicaEngine<N, L, K>,
        inputs: Receiver<Input>,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        Self {
            engine,
            inputs,
            shutdown_signal,
            last_execute_retry: Instant::now(),
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Algorithm thread disconnected from main thread")
                }
            }

            if !self.fire_expired_timers() {
                return;
            }

            let wait = match self.engine.system().timers.next_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(MAX_WAIT),
                None => MAX_WAIT,
            };
            let result = match self.inputs.recv_timeout(wait) {
                Ok(Input::Message { origin, message }) => self.engine.receive(message, origin),
                Ok(Input::Request(payload)) => self.engine.request(payload),
                Ok(Input::Connection { peer }) => self.engine.connection(peer),
                Err(RecvTimeoutError::Timeout) => Ok(()),
                Err(RecvTimeoutError::Disconnected) => return,
            };
            if !self.carry_on(result) {
                return;
            }

            if self.engine.has_pending_execution()
                && self.last_execute_retry.elapsed() >= EXECUTE_RETRY_INTERVAL
            {
                self.last_execute_retry = Instant::now();
                let result = self.engine.retry_execution();
                if !self.carry_on(result) {
                    return;
                }
            }
        })
    }

    fn fire_expired_timers(&mut self) -> bool {
        let now = Instant::now();
        while let Some(timer) = self.engine.system_mut().timers.pop_expired(now) {
            let result = self.engine.on_timer(timer);
            if !self.carry_on(result) {
                return false;
            }
        }
        true
    }

    /// Log the outcome of an engine call. Returns `false` if the engine halted.
    fn carry_on(&mut self, result: Result<(), EngineError>) -> bool {
        match result {
            Ok(()) => true,
            Err(EngineError::Execute { seq, error }) => {
                log::warn!(
                    "replica {}: execution of seq {} failed, will retry: {}",
                    self.engine.id(),
                    seq,
                    error
                );
                self.last_execute_retry = Instant::now();
                true
            }
            Err(err) => {
                log::error!("replica {}: stopping: {}", self.engine.id(), err);
                false
            }
        }
    }
}

/// Queue a client request for the algorithm thread.
pub(crate) fn submit(to_algorithm: &Sender<Input>, payload: Vec<u8>) -> bool {
    to_algorithm.send(Input::Request(payload)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order_and_can_be_cancelled() {
        let mut timers = TimerQueue::default();
        let late = timers.set(Duration::from_millis(20));
        let early = timers.set(Duration::ZERO);
        let cancelled = timers.set(Duration::ZERO);
        timers.cancel(cancelled);

        let now = Instant::now() + Duration::from_millis(5);
        assert_eq!(timers.pop_expired(now), Some(early));
        assert_eq!(timers.pop_expired(now), None);

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(timers.pop_expired(later), Some(late));
        assert_eq!(timers.next_deadline(), None);
    }
}
