/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded, per-sender buffer of messages that arrived before the replica could process them.
//!
//! A message is buffered if it belongs to a later view, a later sequence number, or arrives while a
//! view change is in progress. After every input, the engine re-examines the buffer in arrival order
//! and processes whatever has become processable, repeating until a pass makes no progress. When a
//! sender's buffer is full, its oldest message is dropped.

use std::{collections::VecDeque, time::SystemTime};

use crate::{
    events::{BacklogOverflowEvent, Event},
    networking::messages::Message,
    persistent_log::pluggables::KVStore,
    system::{Ledger, System},
    types::{
        certificates::Checkpoint,
        crypto_primitives::Crypto,
        data_types::{CryptoHash, ReplicaId, SeqNo},
    },
};

use super::{Engine, EngineError};

pub(super) struct Backlog {
    queues: Vec<VecDeque<Message>>,
    capacity: usize,
}

impl Backlog {
    pub(super) fn new(n: u64, capacity: usize) -> Self {
        Self {
            queues: (0..n).map(|_| VecDeque::new()).collect(),
            capacity,
        }
    }

    /// Buffer `message` from `origin`, returning the message evicted to make room for it, if any.
    pub(super) fn push(&mut self, origin: ReplicaId, message: Message) -> Option<Message> {
        let queue = self.queues.get_mut(origin.index())?;
        queue.push_back(message);
        if queue.len() > self.capacity {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Remove and return every message buffered from `origin`.
    pub(super) fn take(&mut self, origin: ReplicaId) -> VecDeque<Message> {
        self.queues
            .get_mut(origin.index())
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Put `kept` back in front of whatever was buffered from `origin` since it was taken.
    pub(super) fn put_back(&mut self, origin: ReplicaId, mut kept: VecDeque<Message>) {
        if let Some(queue) = self.queues.get_mut(origin.index()) {
            kept.append(queue);
            while kept.len() > self.capacity {
                kept.pop_front();
            }
            *queue = kept;
        }
    }

    /// Drop buffered messages about sequence numbers below `seq`.
    pub(super) fn prune_below(&mut self, seq: SeqNo) {
        for queue in &mut self.queues {
            queue.retain(|message| message.seq().map_or(true, |msg_seq| msg_seq >= seq));
        }
    }

    /// Buffered checkpoints for `seq` and `digest`, with their senders.
    pub(super) fn checkpoints(
        &self,
        seq: SeqNo,
        digest: CryptoHash,
    ) -> impl Iterator<Item = (ReplicaId, &Checkpoint)> + '_ {
        self.queues.iter().enumerate().flat_map(move |(index, queue)| {
            queue.iter().filter_map(move |message| match message {
                Message::Checkpoint(checkpoint)
                    if checkpoint.seq == seq && checkpoint.digest == digest =>
                {
                    Some((ReplicaId::new(index as u64), checkpoint))
                }
                _ => None,
            })
        })
    }

    pub(super) fn len(&self, origin: ReplicaId) -> usize {
        self.queues.get(origin.index()).map_or(0, VecDeque::len)
    }
}

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    /// Whether `message` has to wait until the replica catches up with it.
    pub(super) fn should_backlog(&self, message: &Message) -> bool {
        match message {
            Message::Preprepare(preprepare) => {
                let next = self.cur.seq().next();
                !self.active_view
                    || preprepare.seq.view > self.view
                    || preprepare.seq.seq > next
                    || (preprepare.seq.seq == next && !self.cur.checkpoint_done)
            }
            Message::Prepare(subject) | Message::Commit(subject) => {
                !self.active_view
                    || subject.view() > self.view
                    || subject.seq_no() > self.cur.seq()
            }
            Message::Checkpoint(checkpoint) => checkpoint.seq > self.cur.seq(),
            _ => false,
        }
    }

    pub(super) fn record_backlog(&mut self, origin: ReplicaId, message: Message) {
        log::debug!(
            "replica {}: backlogging {} from {}",
            self.id,
            message.kind(),
            origin
        );
        if let Some(evicted) = self.backlog.push(origin, message) {
            log::warn!(
                "replica {}: backlog for {} is full, dropped {}",
                self.id,
                origin,
                evicted.kind()
            );
            self.publish(Event::BacklogOverflow(BacklogOverflowEvent {
                timestamp: SystemTime::now(),
                origin,
                evicted: evicted.kind(),
            }));
        }
    }

    /// Process buffered messages that have become processable, until a pass over every sender makes
    /// no progress.
    pub(super) fn process_backlog(&mut self) -> Result<(), EngineError> {
        loop {
            let mut progress = false;
            for origin in self.config.replicas() {
                if origin == self.id || self.backlog.len(origin) == 0 {
                    continue;
                }

                let mut queued = self.backlog.take(origin).into_iter();
                let mut kept = VecDeque::new();
                while let Some(message) = queued.next() {
                    if self.should_backlog(&message) {
                        kept.push_back(message);
                        continue;
                    }
                    progress = true;
                    if let Err(err) = self.handle_message(message, origin) {
                        kept.extend(queued.by_ref());
                        self.backlog.put_back(origin, kept);
                        return Err(err);
                    }
                }
                self.backlog.put_back(origin, kept);
            }
            if !progress {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        data_types::{CryptoHash, ViewNumber},
        subject::{SeqView, Subject},
    };

    fn prepare(seq: u64) -> Message {
        Message::Prepare(Subject::new(
            SeqView::new(SeqNo::new(seq), ViewNumber::init()),
            CryptoHash::zero(),
        ))
    }

    #[test]
    fn oldest_message_is_evicted_when_full() {
        let origin = ReplicaId::new(1);
        let mut backlog = Backlog::new(4, 2);
        assert_eq!(backlog.push(origin, prepare(1)), None);
        assert_eq!(backlog.push(origin, prepare(2)), None);
        assert_eq!(backlog.push(origin, prepare(3)), Some(prepare(1)));
        assert_eq!(backlog.len(origin), 2);
        assert_eq!(backlog.len(ReplicaId::new(2)), 0);
    }

    #[test]
    fn kept_messages_stay_ahead_of_newer_ones() {
        let origin = ReplicaId::new(0);
        let mut backlog = Backlog::new(4, 12);
        backlog.push(origin, prepare(1));
        let kept = backlog.take(origin);
        backlog.push(origin, prepare(2));
        backlog.put_back(origin, kept);

        let order: Vec<Message> = backlog.take(origin).into_iter().collect();
        assert_eq!(order, vec![prepare(1), prepare(2)]);
    }

    #[test]
    fn pruning_drops_old_sequence_numbers() {
        let origin = ReplicaId::new(3);
        let mut backlog = Backlog::new(4, 12);
        backlog.push(origin, prepare(1));
        backlog.push(origin, prepare(5));
        backlog.prune_below(SeqNo::new(2));
        assert_eq!(backlog.take(origin).into_iter().collect::<Vec<_>>(), vec![prepare(5)]);
    }
}
