/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Entering a view: the new primary's new view message, and its validation and adoption by every
//! replica.

use std::{collections::BTreeMap, time::SystemTime};

use crate::{
    events::{EnterViewEvent, Event, SendNewViewEvent},
    networking::messages::{Message, NewView, Preprepare, SignedViewChange, ViewChange, XSet},
    persistent_log::{entries::LogEntry, pluggables::KVStore},
    system::{Ledger, System},
    types::{
        batch::Batch,
        crypto_primitives::Crypto,
        data_types::{CryptoHash, ReplicaId, SeqNo},
    },
};

use super::{xset::make_xset, Engine, EngineError};

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    /// As the primary of a view that is being changed into, broadcast a new view once the view
    /// changes collected so far determine an X-set.
    ///
    /// If the X-set re-proposes a batch that this replica does not hold, the primary stays silent
    /// and the view change times out into the next view.
    pub(super) fn maybe_send_new_view(&mut self) -> Result<(), EngineError> {
        if !self.is_primary() || self.active_view {
            return Ok(());
        }
        if self
            .new_view
            .as_ref()
            .map_or(false, |new_view| new_view.view == self.view)
        {
            return Ok(());
        }

        let vset: BTreeMap<ReplicaId, SignedViewChange> = self
            .view_changes
            .iter()
            .filter(|(_, svc)| svc.view_change.view == self.view)
            .map(|(replica, svc)| (*replica, svc.clone()))
            .collect();
        let view_changes: Vec<&ViewChange> = vset.values().map(|svc| &svc.view_change).collect();
        let xset = match make_xset(self.view, &view_changes, self.config.f) {
            Some((xset, _)) => xset,
            None => {
                log::debug!(
                    "replica {}: {} view changes for view {} do not determine an X-set yet",
                    self.id,
                    view_changes.len(),
                    self.view
                );
                return Ok(());
            }
        };

        let batch = match xset {
            XSet::Null(_) => None,
            XSet::Reproposal(subject) => match self.known_batch(subject.seq_no(), subject.digest) {
                Some(batch) => Some(batch),
                None => {
                    log::warn!(
                        "replica {}: cannot re-propose unknown batch {} at seq {} in view {}",
                        self.id,
                        subject.digest,
                        subject.seq_no(),
                        self.view
                    );
                    return Ok(());
                }
            },
        };

        let new_view = NewView {
            view: self.view,
            vset,
            xset,
            batch,
        };
        log::info!(
            "replica {}: sending new view for view {} with X-set at seq {}",
            self.id,
            self.view,
            xset.seq().seq
        );
        self.publish(Event::SendNewView(SendNewViewEvent {
            timestamp: SystemTime::now(),
            view: self.view,
            xset,
        }));
        self.persist(self.cur.seq(), LogEntry::NewView(new_view.clone()))?;
        self.new_view = Some(new_view.clone());
        self.broadcast(Message::NewView(new_view))
    }

    pub(super) fn handle_new_view(
        &mut self,
        new_view: NewView,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        if new_view.view < self.view || (new_view.view == self.view && self.active_view) {
            log::debug!(
                "replica {}: stale new view for view {} from {}",
                self.id,
                new_view.view,
                origin
            );
            return Ok(());
        }
        if origin != self.config.primary(new_view.view) {
            log::warn!(
                "replica {}: new view for view {} from {}, who is not its primary",
                self.id,
                new_view.view,
                origin
            );
            return Ok(());
        }

        for (replica, svc) in &new_view.vset {
            let valid = svc.view_change.view == new_view.view
                && replica.int() < self.config.n
                && svc.is_correct(&self.crypto, *replica)
                && svc.view_change.checkpoint.is_correct(
                    &self.crypto,
                    self.config.n,
                    self.config.one_correct_quorum(),
                );
            if !valid {
                log::warn!(
                    "replica {}: new view for view {} carries an invalid view change from {}",
                    self.id,
                    new_view.view,
                    replica
                );
                return Ok(());
            }
        }

        let view_changes: Vec<&ViewChange> = new_view
            .vset
            .values()
            .map(|svc| &svc.view_change)
            .collect();
        let (xset, best) = match make_xset(new_view.view, &view_changes, self.config.f) {
            Some((xset, best)) => (xset, best.clone()),
            None => {
                log::warn!(
                    "replica {}: view changes in new view for view {} do not determine an X-set",
                    self.id,
                    new_view.view
                );
                return Ok(());
            }
        };
        if xset != new_view.xset {
            log::warn!(
                "replica {}: new view for view {} carries an X-set that does not match its view changes",
                self.id,
                new_view.view
            );
            return Ok(());
        }

        let batch = match (&xset, &new_view.batch) {
            (XSet::Reproposal(subject), Some(batch))
                if batch.hash() == subject.digest
                    && batch.seq() == subject.seq_no()
                    && batch.is_well_formed() =>
            {
                batch.clone()
            }
            (XSet::Null(seq), None) => Batch::null(seq.seq, best.digest()),
            _ => {
                log::warn!(
                    "replica {}: new view for view {} carries a batch that does not match its X-set",
                    self.id,
                    new_view.view
                );
                return Ok(());
            }
        };

        self.enter_view(new_view)?;

        let last = self.ledger.last_batch().header;
        if best.seq() > last.seq {
            if best.seq() == last.seq.next() && best.batch.header.prev_hash == last.hash() {
                self.deliver_certified(best)?;
            } else {
                self.start_catch_up(best, origin);
                self.deferred_xset = Some((
                    Preprepare {
                        seq: xset.seq(),
                        batch,
                    },
                    origin,
                ));
                return Ok(());
            }
        } else if best.seq() > self.last_stable.seq() {
            if self.ledger.batch(best.seq()).map(|batch| batch.hash()) == Some(best.digest()) {
                self.mark_stable(best)?;
            }
        }

        self.replay_xset(
            Preprepare {
                seq: xset.seq(),
                batch,
            },
            origin,
        )
    }

    /// Adopt `new_view` and resume normal operation in its view.
    fn enter_view(&mut self, new_view: NewView) -> Result<(), EngineError> {
        let view = new_view.view;
        self.persist(self.cur.seq(), LogEntry::NewView(new_view.clone()))?;
        self.view = view;
        self.active_view = true;
        self.cancel_view_change_timer();
        self.new_view = Some(new_view);
        self.view_changes.retain(|_, svc| svc.view_change.view > view);

        log::info!(
            "replica {}: entered view {} with primary {}",
            self.id,
            view,
            self.config.primary(view)
        );
        self.publish(Event::EnterView(EnterViewEvent {
            timestamp: SystemTime::now(),
            view,
            primary: self.config.primary(view),
        }));
        Ok(())
    }

    /// Take part in agreeing on the X-set's batch, as if the primary had just proposed it.
    pub(super) fn replay_xset(
        &mut self,
        preprepare: Preprepare,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        let last = self.ledger.last_batch().header;
        if preprepare.batch.header.extends(&last) {
            return self.accept_preprepare(preprepare, origin, false);
        }
        if preprepare.seq.seq == last.seq && preprepare.batch.hash() == last.hash() {
            return self.accept_preprepare(preprepare, origin, true);
        }
        log::error!(
            "replica {}: X-set batch at seq {} does not extend the ledger at seq {}",
            self.id,
            preprepare.seq.seq,
            last.seq
        );
        Ok(())
    }

    /// Find the batch with `digest` at `seq`, either in flight or already executed.
    fn known_batch(&self, seq: SeqNo, digest: CryptoHash) -> Option<Batch> {
        if let Some(batch) = self.cur.batch() {
            if batch.seq() == seq && batch.hash() == digest {
                return Some(batch.clone());
            }
        }
        self.ledger
            .batch(seq)
            .filter(|batch| batch.hash() == digest)
    }
}
