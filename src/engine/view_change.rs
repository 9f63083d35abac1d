/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Leaving a view: sending view changes, collecting them, and timing out view changes that do not
//! complete.
//!
//! A replica sends a view change for `view + 1` when its request timer expires, when `f + 1` other
//! replicas have already asked for a higher view, or when the view change it is waiting on times
//! out. Sending a view change starts the view change timer. Once `2f + 1` view changes for its view
//! have arrived, the replica restarts the timer; if no valid new view arrives before it expires, the
//! timeout doubles and the replica moves on to the next view.
//!
//! A replica whose view change gathers no quorum before the timer expires broadcasts it again with
//! a doubled timeout and stays in its view, where the others find it once they leave theirs. In the
//! meantime `f + 1` matching checkpoints from the others keep its ledger current.

use std::time::SystemTime;

use crate::{
    events::{Event, ReceiveViewChangeEvent, SendViewChangeEvent, ViewChangeTimeoutEvent},
    networking::messages::{Message, SignedViewChange, ViewChange},
    persistent_log::{entries::LogEntry, pluggables::KVStore},
    system::{Ledger, System},
    types::{
        crypto_primitives::Crypto,
        data_types::{ReplicaId, ViewNumber},
    },
};

use super::{Engine, EngineError};

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    /// Abandon the current view and broadcast a view change for the next one.
    pub(super) fn send_view_change(&mut self) -> Result<(), EngineError> {
        self.cancel_request_timer();
        self.cancel_idle_timer();
        self.cancel_batch_timer();
        let timer = self.view_change_timer.take();
        self.cancel_timer(timer);

        self.view += 1;
        self.active_view = false;
        self.view_change_quorum = false;
        let view = self.view;
        self.view_changes.retain(|_, svc| svc.view_change.view >= view);

        let mut pset = Vec::new();
        let mut qset = Vec::new();
        if self.cur.seq() > self.last_stable.seq() && self.cur.preprepare.is_some() {
            qset.push(self.cur.subject);
            if self.cur.sent_commit || self.cur.executed {
                pset.push(self.cur.subject);
            }
        }

        let view_change = ViewChange {
            view,
            checkpoint: self.last_stable.clone(),
            pset,
            qset,
        }
        .sign(&self.crypto);
        self.persist(self.cur.seq(), LogEntry::ViewChange(view_change.clone()))?;
        self.arm_view_change_timer();

        log::info!(
            "replica {}: sending view change to view {} (last stable seq {})",
            self.id,
            view,
            self.last_stable.seq()
        );
        self.publish(Event::SendViewChange(SendViewChangeEvent {
            timestamp: SystemTime::now(),
            view,
        }));
        self.broadcast(Message::ViewChange(view_change))
    }

    pub(super) fn handle_view_change(
        &mut self,
        svc: SignedViewChange,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        let view = svc.view_change.view;
        if view < self.view || (view == self.view && self.active_view) {
            log::debug!(
                "replica {}: stale view change to view {} from {}",
                self.id,
                view,
                origin
            );
            return Ok(());
        }
        if !svc.is_correct(&self.crypto, origin) {
            log::warn!(
                "replica {}: invalid view change signature from {}",
                self.id,
                origin
            );
            return Ok(());
        }
        if !svc.view_change.checkpoint.is_correct(
            &self.crypto,
            self.config.n,
            self.config.one_correct_quorum(),
        ) {
            log::warn!(
                "replica {}: view change from {} carries an invalid checkpoint certificate",
                self.id,
                origin
            );
            return Ok(());
        }
        if let Some(existing) = self.view_changes.get(&origin) {
            if existing.view_change.view >= view {
                log::debug!(
                    "replica {}: already have a view change to view {} from {}",
                    self.id,
                    existing.view_change.view,
                    origin
                );
                return Ok(());
            }
        }

        log::debug!(
            "replica {}: received view change to view {} from {}",
            self.id,
            view,
            origin
        );
        self.view_changes.insert(origin, svc);
        self.publish(Event::ReceiveViewChange(ReceiveViewChangeEvent {
            timestamp: SystemTime::now(),
            origin,
            view,
        }));

        // Join the smallest higher view once f + 1 replicas have moved past ours.
        let mut higher: Vec<ViewNumber> = self
            .view_changes
            .values()
            .map(|svc| svc.view_change.view)
            .filter(|view| *view > self.view)
            .collect();
        if higher.len() >= self.config.one_correct_quorum() {
            higher.sort();
            let target = higher[0];
            log::info!(
                "replica {}: {} replicas asked for views above {}, moving to view {}",
                self.id,
                higher.len(),
                self.view,
                target
            );
            self.view = ViewNumber::new(target.int() - 1);
            return self.send_view_change();
        }

        if self.active_view {
            return Ok(());
        }
        let quorum = self
            .view_changes
            .values()
            .filter(|svc| svc.view_change.view == self.view)
            .count();
        if quorum < self.config.no_faulty_quorum() {
            return Ok(());
        }
        if !self.view_change_quorum {
            self.view_change_quorum = true;
            self.arm_view_change_timer();
        }
        self.maybe_send_new_view()
    }

    /// No valid new view arrived in time. Double the timeout and try the next view, or if the view
    /// change never gathered a quorum, broadcast it again.
    pub(super) fn view_change_timed_out(&mut self) -> Result<(), EngineError> {
        let next_timeout = self.view_change_timeout * 2;
        if !self.view_change_quorum {
            if let Some(svc) = self.view_changes.get(&self.id).cloned() {
                log::info!(
                    "replica {}: no quorum for view {} yet, sending the view change again",
                    self.id,
                    self.view
                );
                self.view_change_timeout = next_timeout;
                self.system.broadcast(Message::ViewChange(svc));
                self.arm_view_change_timer();
                return Ok(());
            }
        }

        log::warn!(
            "replica {}: view change to view {} timed out, next timeout {:?}",
            self.id,
            self.view,
            next_timeout
        );
        self.publish(Event::ViewChangeTimeout(ViewChangeTimeoutEvent {
            timestamp: SystemTime::now(),
            view: self.view,
            next_timeout,
        }));
        self.view_change_timeout = next_timeout;
        self.send_view_change()
    }
}
