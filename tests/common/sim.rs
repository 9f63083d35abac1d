//! A deterministic, single-threaded simulation of a group of engines.
//!
//! Messages are delivered one at a time in a seeded random order, and virtual time advances to the
//! next timer deadline only when no message is in flight. A filter decides which messages are
//! delivered, which is how tests cut links, crash replicas, or make a primary go quiet.

use std::{
    collections::BTreeMap,
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use ed25519_dalek::SigningKey;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sbft_rs::{
    config::ProtocolConfig,
    engine::{Engine, EngineError},
    events::Event,
    networking::messages::Message,
    system::{System, TimerId},
    types::{crypto_primitives::Ed25519Crypto, data_types::ReplicaId},
};

use super::{mem_db::MemDB, mem_ledger::MemLedger};

pub(crate) type SimEngine = Engine<SimSystem, MemLedger, MemDB, Ed25519Crypto>;

type Filter = Box<dyn FnMut(ReplicaId, ReplicaId, &Message) -> bool>;

enum Outgoing {
    To(ReplicaId, Message),
    Broadcast(Message),
}

/// A [`System`] whose timers run on virtual time, in milliseconds.
pub(crate) struct SimSystem {
    now: u64,
    next_timer: u64,
    timers: BTreeMap<TimerId, u64>,
    outbox: Vec<Outgoing>,
}

impl SimSystem {
    fn new(now: u64) -> Self {
        Self {
            now,
            next_timer: 0,
            timers: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    fn next_deadline(&self) -> Option<(u64, TimerId)> {
        self.timers
            .iter()
            .map(|(timer, deadline)| (*deadline, *timer))
            .min()
    }
}

impl System for SimSystem {
    fn send(&mut self, peer: ReplicaId, message: Message) {
        self.outbox.push(Outgoing::To(peer, message));
    }

    fn broadcast(&mut self, message: Message) {
        self.outbox.push(Outgoing::Broadcast(message));
    }

    fn set_timer(&mut self, duration: Duration) -> TimerId {
        let timer = TimerId::new(self.next_timer);
        self.next_timer += 1;
        self.timers.insert(timer, self.now + duration.as_millis() as u64);
        timer
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.timers.remove(&timer);
    }
}

/// Protocol parameters used by most tests: batches close after 10ms or 1000 bytes, and a sequence
/// that is not decided within 500ms triggers a view change.
pub(crate) fn test_config(n: u64, f: u64) -> ProtocolConfig {
    ProtocolConfig::builder()
        .n(n)
        .f(f)
        .batch_duration_limit(Duration::from_millis(10))
        .batch_size_limit_bytes(1000)
        .request_timeout(Duration::from_millis(500))
        .build()
}

pub(crate) fn signing_key(id: u64) -> SigningKey {
    SigningKey::from_bytes(&[id as u8 + 1; 32])
}

pub(crate) struct Sim {
    config: ProtocolConfig,
    nodes: Vec<Option<SimEngine>>,
    events: Vec<Option<Receiver<Event>>>,
    stores: Vec<MemDB>,
    ledgers: Vec<MemLedger>,
    in_flight: Vec<(ReplicaId, ReplicaId, Message)>,
    now: u64,
    rng: StdRng,
    filter: Option<Filter>,
    errors: Vec<(ReplicaId, EngineError)>,
}

impl Sim {
    pub(crate) fn new(config: ProtocolConfig, seed: u64) -> Self {
        let n = config.n;
        let stores: Vec<MemDB> = (0..n).map(|_| MemDB::new()).collect();
        let ledgers: Vec<MemLedger> = (0..n).map(|_| MemLedger::new()).collect();
        let mut sim = Self {
            config,
            nodes: (0..n).map(|_| None).collect(),
            events: (0..n).map(|_| None).collect(),
            stores,
            ledgers,
            in_flight: Vec::new(),
            now: 0,
            rng: StdRng::seed_from_u64(seed),
            filter: None,
            errors: Vec::new(),
        };
        for id in 0..n {
            sim.start(ReplicaId::new(id));
        }
        sim
    }

    fn ids(&self) -> impl Iterator<Item = ReplicaId> {
        (0..self.config.n).map(ReplicaId::new)
    }

    fn start(&mut self, id: ReplicaId) {
        let verifying_keys = self
            .ids()
            .map(|id| signing_key(id.int()).verifying_key())
            .collect();
        let (event_publisher, events) = mpsc::channel();
        let engine = Engine::new(
            id,
            self.config.clone(),
            SimSystem::new(self.now),
            self.ledgers[id.index()].clone(),
            self.stores[id.index()].clone(),
            Ed25519Crypto::new(signing_key(id.int()), verifying_keys),
            Some(event_publisher),
        )
        .unwrap();
        self.nodes[id.index()] = Some(engine);
        self.events[id.index()] = Some(events);
        self.flush(id);
    }

    pub(crate) fn engine(&self, id: u64) -> &SimEngine {
        self.nodes[id as usize].as_ref().unwrap()
    }

    pub(crate) fn ledger(&self, id: u64) -> &MemLedger {
        &self.ledgers[id as usize]
    }

    pub(crate) fn store(&self, id: u64) -> &MemDB {
        &self.stores[id as usize]
    }

    pub(crate) fn now(&self) -> u64 {
        self.now
    }

    /// Number of messages sent but not yet delivered or dropped.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Events published by replica `id` since the last call, in order.
    pub(crate) fn take_events(&self, id: u64) -> Vec<Event> {
        self.events[id as usize]
            .as_ref()
            .map(|events| events.try_iter().collect())
            .unwrap_or_default()
    }

    /// Errors returned by engine calls so far, in order.
    pub(crate) fn errors(&self) -> &[(ReplicaId, EngineError)] {
        &self.errors
    }

    /// Only deliver messages for which `filter(from, to, message)` returns true.
    pub(crate) fn set_filter(
        &mut self,
        filter: impl FnMut(ReplicaId, ReplicaId, &Message) -> bool + 'static,
    ) {
        self.filter = Some(Box::new(filter));
    }

    pub(crate) fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Submit a client request at replica `id`.
    pub(crate) fn request(&mut self, id: u64, payload: &[u8]) {
        self.call(ReplicaId::new(id), |engine| engine.request(payload.to_vec()));
    }

    /// Run `f` on the engine of replica `id`, recording its error and sending its messages.
    pub(crate) fn call(
        &mut self,
        id: ReplicaId,
        f: impl FnOnce(&mut SimEngine) -> Result<(), EngineError>,
    ) {
        let result = match self.nodes[id.index()].as_mut() {
            Some(engine) => f(engine),
            None => return,
        };
        if let Err(err) = result {
            self.errors.push((id, err));
        }
        self.flush(id);
    }

    fn flush(&mut self, from: ReplicaId) {
        let outbox = match self.nodes[from.index()].as_mut() {
            Some(engine) => std::mem::take(&mut engine.system_mut().outbox),
            None => return,
        };
        for outgoing in outbox {
            match outgoing {
                Outgoing::To(to, message) => self.in_flight.push((from, to, message)),
                Outgoing::Broadcast(message) => {
                    for to in (0..self.config.n).map(ReplicaId::new) {
                        if to != from {
                            self.in_flight.push((from, to, message.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Stop replica `id`. Messages in flight to it are lost.
    pub(crate) fn crash(&mut self, id: u64) {
        let id = ReplicaId::new(id);
        self.nodes[id.index()] = None;
        self.in_flight.retain(|(_, to, _)| *to != id);
    }

    /// Restart replica `id` from its persistent log and ledger, and reconnect it to every live peer.
    pub(crate) fn restart(&mut self, id: u64) {
        let id = ReplicaId::new(id);
        self.crash(id.int());
        self.start(id);
        self.reconnect(id);
    }

    /// Deliver connection notices between replica `id` and every live peer, in both directions.
    pub(crate) fn reconnect(&mut self, id: ReplicaId) {
        let peers: Vec<ReplicaId> = self.ids().filter(|peer| *peer != id).collect();
        for peer in peers {
            self.call(id, |engine| engine.connection(peer));
            self.call(peer, |engine| engine.connection(id));
        }
    }

    /// Deliver one message, or if none is in flight, fire the earliest timer. Returns false if
    /// there is nothing left to do.
    pub(crate) fn step(&mut self) -> bool {
        if !self.in_flight.is_empty() {
            let index = self.rng.gen_range(0, self.in_flight.len());
            let (from, to, message) = self.in_flight.swap_remove(index);
            let deliver = match self.filter.as_mut() {
                Some(filter) => filter(from, to, &message),
                None => true,
            };
            if deliver {
                self.call(to, |engine| engine.receive(message, from));
            }
            return true;
        }

        let next = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| {
                node.as_ref()
                    .and_then(|engine| engine.system().next_deadline())
                    .map(|(deadline, timer)| (deadline, index, timer))
            })
            .min();
        let (deadline, index, timer) = match next {
            Some(next) => next,
            None => return false,
        };

        self.now = self.now.max(deadline);
        for engine in self.nodes.iter_mut().flatten() {
            engine.system_mut().now = self.now;
        }
        let id = ReplicaId::new(index as u64);
        if let Some(engine) = self.nodes[index].as_mut() {
            engine.system_mut().timers.remove(&timer);
        }
        self.call(id, |engine| engine.on_timer(timer));
        true
    }

    /// Step until `done` holds. Returns false if it did not within `max_steps` steps.
    pub(crate) fn run_until(
        &mut self,
        max_steps: usize,
        mut done: impl FnMut(&Sim) -> bool,
    ) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            if !self.step() {
                return done(self);
            }
        }
        done(self)
    }

    /// Deliver every message in flight without advancing time.
    pub(crate) fn settle(&mut self) {
        while !self.in_flight.is_empty() {
            self.step();
        }
    }

    /// Check that every pair of ledgers agrees on the batches both executed.
    pub(crate) fn assert_consistent(&self) {
        for a in &self.ledgers {
            for b in &self.ledgers {
                let (a, b) = (a.executed(), b.executed());
                let common = a.len().min(b.len());
                assert_eq!(a[..common], b[..common]);
            }
        }
    }
}
