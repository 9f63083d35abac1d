/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Normal-case operation: batching requests, and the preprepare, prepare, and commit phases that
//! decide one batch per sequence number.

use std::time::SystemTime;

use crate::{
    batcher::Admission,
    events::{
        CommitEvent, Event, PrepareEvent, ProposeEvent, ReceivePreprepareEvent, RequestTimeoutEvent,
    },
    networking::messages::{Message, Preprepare},
    persistent_log::{entries::LogEntry, pluggables::KVStore},
    system::{Ledger, System},
    types::{
        batch::{Batch, Request},
        crypto_primitives::Crypto,
        data_types::ReplicaId,
        subject::{SeqView, Subject},
    },
};

use super::{req_info::ReqInfo, Engine, EngineError, PendingExecution};

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    pub(super) fn handle_request(&mut self, request: Request) -> Result<(), EngineError> {
        match self.batcher.push(request) {
            Admission::Pooled => (),
            Admission::LateCopy => {
                log::debug!("replica {}: dropping late copy of an executed request", self.id);
                return Ok(());
            }
            Admission::PoolFull => {
                log::warn!(
                    "replica {}: request pool holds {} requests, dropping a new one",
                    self.id,
                    self.batcher.len()
                );
                return Ok(());
            }
        }
        self.maybe_send_next_batch()?;
        self.maybe_arm_idle_timer();
        Ok(())
    }

    /// As the active primary with nothing in flight, propose the next batch if the pool is full or
    /// the batch timer expired, and start the batch timer otherwise.
    ///
    /// With a single replica a proposal becomes stable before the broadcast returns, and stability
    /// asks for the next proposal. Nested calls only flag that another attempt is due, so draining
    /// a large pool loops here instead of growing the stack.
    pub(super) fn maybe_send_next_batch(&mut self) -> Result<(), EngineError> {
        if self.proposing {
            self.propose_again = true;
            return Ok(());
        }

        self.proposing = true;
        let result = loop {
            self.propose_again = false;
            if let Err(err) = self.send_next_batch_if_ready() {
                break Err(err);
            }
            if !self.propose_again {
                break Ok(());
            }
        };
        self.proposing = false;
        result
    }

    fn send_next_batch_if_ready(&mut self) -> Result<(), EngineError> {
        if !self.is_primary()
            || !self.active_view
            || !self.cur.checkpoint_done
            || self.pending_execution.is_some()
        {
            return Ok(());
        }

        if self.batcher.is_empty() {
            self.cancel_batch_timer();
            return Ok(());
        }

        if !self.batcher.is_full() && !self.batch_due {
            if self.batch_timer.is_none() {
                self.batch_timer = Some(self.system.set_timer(self.config.batch_duration_limit));
            }
            return Ok(());
        }

        self.cancel_batch_timer();
        let last = self.ledger.last_batch().header;
        let batch = Batch::new(last.seq.next(), last.hash(), self.batcher.next_batch());
        let preprepare = Preprepare {
            seq: SeqView::new(batch.seq(), self.view),
            batch,
        };

        log::info!(
            "replica {}: proposing seq {} in view {} with {} requests",
            self.id,
            preprepare.seq.seq,
            self.view,
            preprepare.batch.requests.len()
        );
        self.publish(Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            subject: preprepare.subject(),
            requests: preprepare.batch.requests.len(),
        }));

        self.persist(preprepare.seq.seq, LogEntry::Preprepare(preprepare.clone()))?;
        self.broadcast(Message::Preprepare(preprepare))
    }

    pub(super) fn handle_preprepare(
        &mut self,
        preprepare: Preprepare,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        let seq = preprepare.seq;
        if seq.view != self.view {
            log::debug!(
                "replica {}: preprepare from {} for old view {}",
                self.id,
                origin,
                seq.view
            );
            return Ok(());
        }
        if origin != self.config.primary(self.view) {
            log::warn!(
                "replica {}: preprepare from {}, who is not the primary of view {}",
                self.id,
                origin,
                self.view
            );
            return Ok(());
        }
        if seq.seq != self.cur.seq().next() {
            log::debug!(
                "replica {}: preprepare for seq {} while expecting {}",
                self.id,
                seq.seq,
                self.cur.seq().next()
            );
            return Ok(());
        }
        if preprepare.batch.seq() != seq.seq || !preprepare.batch.is_well_formed() {
            log::warn!(
                "replica {}: malformed batch in preprepare from {} for seq {}",
                self.id,
                origin,
                seq.seq
            );
            return Ok(());
        }
        let last = self.ledger.last_batch().header;
        if !preprepare.batch.header.extends(&last) {
            log::warn!(
                "replica {}: preprepare from {} for seq {} does not extend the last executed batch",
                self.id,
                origin,
                seq.seq
            );
            return Ok(());
        }

        self.accept_preprepare(preprepare, origin, false)
    }

    /// Make `preprepare` the current sequence and take part in agreeing on it. `already_executed`
    /// is set when a view change re-proposes a batch that the ledger has already executed.
    pub(super) fn accept_preprepare(
        &mut self,
        preprepare: Preprepare,
        origin: ReplicaId,
        already_executed: bool,
    ) -> Result<(), EngineError> {
        let seq = preprepare.seq.seq;
        self.persist(seq, LogEntry::Preprepare(preprepare.clone()))?;

        self.cancel_request_timer();
        self.cancel_idle_timer();
        self.cancel_view_change_timer();
        let timeout = if already_executed {
            None
        } else {
            Some(self.system.set_timer(self.config.request_timeout))
        };

        let mut info = ReqInfo::new(preprepare, timeout);
        if self.cur.seq() == seq {
            // Checkpoints do not depend on the view the batch was agreed in.
            info.checkpoints = std::mem::take(&mut self.cur.checkpoints);
        }
        info.executed = already_executed;
        info.checkpoint_done = already_executed && self.last_stable.seq() >= seq;
        self.cur = info;

        log::debug!(
            "replica {}: accepted preprepare for seq {} in view {} from {}",
            self.id,
            seq,
            self.cur.subject.view(),
            origin
        );
        self.publish(Event::ReceivePreprepare(ReceivePreprepareEvent {
            timestamp: SystemTime::now(),
            origin,
            subject: self.cur.subject,
        }));

        if !self.is_primary() {
            self.send_prepare()?;
        }
        if already_executed {
            self.send_checkpoint()?;
        }
        self.maybe_send_commit()
    }

    fn send_prepare(&mut self) -> Result<(), EngineError> {
        let subject = self.cur.subject;
        self.persist(subject.seq_no(), LogEntry::Prepare(subject))?;
        self.publish(Event::Prepare(PrepareEvent {
            timestamp: SystemTime::now(),
            subject,
        }));
        self.broadcast(Message::Prepare(subject))
    }

    pub(super) fn handle_prepare(
        &mut self,
        subject: Subject,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        if subject.seq_no() < self.cur.seq() {
            log::debug!(
                "replica {}: stale prepare for seq {} from {}",
                self.id,
                subject.seq_no(),
                origin
            );
            return Ok(());
        }
        if subject != self.cur.subject {
            log::warn!(
                "replica {}: prepare from {} does not match the current subject at seq {}",
                self.id,
                origin,
                subject.seq_no()
            );
            return Ok(());
        }
        if origin == self.config.primary(subject.view()) {
            log::warn!(
                "replica {}: prepare from {}, the primary of view {}",
                self.id,
                origin,
                subject.view()
            );
            return Ok(());
        }
        if self.cur.prepares.contains_key(&origin) {
            log::info!(
                "replica {}: duplicate prepare for seq {} from {}",
                self.id,
                subject.seq_no(),
                origin
            );
            return Ok(());
        }

        self.cur.prepares.insert(origin, subject);
        self.maybe_send_commit()
    }

    /// Send a commit once `2f` prepares match the current subject. Together with the preprepare, they
    /// make the subject prepared at this replica.
    pub(super) fn maybe_send_commit(&mut self) -> Result<(), EngineError> {
        if self.cur.sent_commit || self.cur.checkpoint_done || self.cur.preprepare.is_none() {
            return Ok(());
        }
        if self.cur.matching_prepares() < 2 * self.config.f as usize {
            return Ok(());
        }

        self.cur.sent_commit = true;
        let subject = self.cur.subject;
        self.persist(subject.seq_no(), LogEntry::Commit(subject))?;
        self.publish(Event::Commit(CommitEvent {
            timestamp: SystemTime::now(),
            subject,
        }));
        self.broadcast(Message::Commit(subject))
    }

    pub(super) fn handle_commit(
        &mut self,
        subject: Subject,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        if subject.seq_no() < self.cur.seq() {
            log::debug!(
                "replica {}: stale commit for seq {} from {}",
                self.id,
                subject.seq_no(),
                origin
            );
            return Ok(());
        }
        if self.cur.commits.get(&origin) == Some(&subject) {
            log::info!(
                "replica {}: duplicate commit for seq {} from {}",
                self.id,
                subject.seq_no(),
                origin
            );
            return Ok(());
        }
        if subject != self.cur.subject {
            log::warn!(
                "replica {}: commit from {} does not match the current subject at seq {}",
                self.id,
                origin,
                subject.seq_no()
            );
            return Ok(());
        }

        self.cur.commits.insert(origin, subject);
        self.maybe_execute()
    }

    /// Execute the current batch once `2f + 1` commits match its subject.
    fn maybe_execute(&mut self) -> Result<(), EngineError> {
        if self.cur.executed
            || self.pending_execution.is_some()
            || self.cur.matching_commits() < self.config.no_faulty_quorum()
        {
            return Ok(());
        }
        let batch = match self.cur.batch() {
            Some(batch) => batch.clone(),
            None => return Ok(()),
        };
        if !batch.header.extends(&self.ledger.last_batch().header) {
            log::error!(
                "replica {}: committed seq {} does not extend the last executed batch",
                self.id,
                batch.seq()
            );
            return Ok(());
        }

        self.cancel_request_timer();
        if let Err(error) = self.execute_batch(&batch) {
            let seq = batch.seq();
            self.pending_execution = Some(PendingExecution::Agreed(batch));
            return Err(EngineError::Execute { seq, error });
        }
        self.cur.executed = true;
        self.send_checkpoint()
    }

    /// The current sequence was not decided in time, or pending requests were not proposed in time.
    pub(super) fn request_timeout(&mut self) -> Result<(), EngineError> {
        log::warn!(
            "replica {}: request timeout in view {} at seq {}",
            self.id,
            self.view,
            self.cur.seq()
        );
        self.publish(Event::RequestTimeout(RequestTimeoutEvent {
            timestamp: SystemTime::now(),
            view: self.view,
            seq: self.cur.seq(),
        }));
        self.send_view_change()
    }

    /// As a backup in an active view with nothing in flight, watch the primary: if pending requests
    /// are not proposed within the request timeout, ask for a view change.
    pub(super) fn maybe_arm_idle_timer(&mut self) {
        if self.is_primary()
            || !self.active_view
            || !self.cur.checkpoint_done
            || self.batcher.is_empty()
            || self.idle_timer.is_some()
        {
            return;
        }
        self.idle_timer = Some(self.system.set_timer(self.config.request_timeout));
    }
}
