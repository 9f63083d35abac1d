/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Rebuilding the engine's state after a restart, from the newest entry of every kind in the
//! persistent log and the last batch executed by the ledger.
//!
//! The ledger decides what has been executed. The log supplies the last stable checkpoint, the view
//! the replica was in, and what it had already said about the batch in flight, so that it does not
//! contradict itself after the restart.

use crate::{
    persistent_log::pluggables::KVStore,
    system::{Ledger, System},
    types::{certificates::Checkpoint, crypto_primitives::Crypto},
};

use super::{req_info::ReqInfo, Engine, EngineError};

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    pub(super) fn restore(&mut self) -> Result<(), EngineError> {
        let restored = self.log.restore()?;
        let last = self.ledger.last_batch();

        if let Some(certificate) = restored.checkpoint {
            if certificate.seq() <= last.seq() {
                self.last_stable = certificate;
            } else {
                log::warn!(
                    "replica {}: logged stable checkpoint at seq {} is ahead of the ledger at seq {}",
                    self.id,
                    certificate.seq(),
                    last.seq()
                );
            }
        }

        if let Some(preprepare) = restored.preprepare {
            if preprepare.batch.header.extends(&last.header) {
                self.view = preprepare.seq.view;
                self.cur = ReqInfo::new(preprepare, None);
            } else if preprepare.seq.seq == last.seq() && preprepare.batch.hash() == last.hash() {
                self.view = preprepare.seq.view;
                self.cur = ReqInfo::new(preprepare, None);
                self.cur.executed = true;
            }
        }
        self.cur.checkpoint_done = self.last_stable.seq() >= self.cur.seq();

        if !self.cur.checkpoint_done {
            if let Some(subject) = restored.prepare {
                if subject == self.cur.subject {
                    self.cur.prepares.insert(self.id, subject);
                }
            }
            if let Some(subject) = restored.commit {
                if subject == self.cur.subject {
                    self.cur.sent_commit = true;
                    self.cur.commits.insert(self.id, subject);
                }
            }
            if self.cur.executed {
                // Re-sent to peers on reconnection.
                let checkpoint =
                    Checkpoint::create(&self.crypto, self.cur.seq(), self.cur.subject.digest);
                self.cur.checkpoints.insert(self.id, checkpoint);
                self.cur.sent_checkpoint = true;
            }
        }

        if let Some(new_view) = restored.new_view {
            if new_view.view >= self.view {
                self.view = new_view.view;
                self.active_view = true;
                self.new_view = Some(new_view);
            }
        }
        if let Some(svc) = restored.view_change {
            if svc.view_change.view > self.view {
                self.view = svc.view_change.view;
                self.active_view = false;
                self.view_changes.insert(self.id, svc);
            }
        }

        if self.active_view && !self.cur.executed {
            self.cur.timeout = Some(self.system.set_timer(self.config.request_timeout));
        }
        if !self.active_view {
            self.arm_view_change_timer();
        }

        log::info!(
            "replica {}: restored view {} (active: {}), seq {}, last stable seq {}",
            self.id,
            self.view,
            self.active_view,
            self.cur.seq(),
            self.last_stable.seq()
        );
        Ok(())
    }
}
