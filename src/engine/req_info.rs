/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-sequence agreement state of the batch currently in flight.

use std::collections::BTreeMap;

use crate::{
    networking::messages::Preprepare,
    system::TimerId,
    types::{
        batch::Batch,
        certificates::Checkpoint,
        data_types::{ReplicaId, SeqNo, ViewNumber},
        subject::{SeqView, Subject},
    },
};

/// Everything the replica knows about the one sequence number it is working on.
pub(super) struct ReqInfo {
    pub(super) subject: Subject,
    pub(super) preprepare: Option<Preprepare>,

    /// Request timer, armed while the batch is accepted but not executed.
    pub(super) timeout: Option<TimerId>,

    pub(super) prepares: BTreeMap<ReplicaId, Subject>,
    pub(super) commits: BTreeMap<ReplicaId, Subject>,
    pub(super) checkpoints: BTreeMap<ReplicaId, Checkpoint>,

    pub(super) sent_commit: bool,
    pub(super) executed: bool,
    pub(super) sent_checkpoint: bool,
    pub(super) checkpoint_done: bool,
}

impl ReqInfo {
    /// State for a freshly accepted `preprepare`.
    pub(super) fn new(preprepare: Preprepare, timeout: Option<TimerId>) -> Self {
        Self {
            subject: preprepare.subject(),
            preprepare: Some(preprepare),
            timeout,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            sent_commit: false,
            executed: false,
            sent_checkpoint: false,
            checkpoint_done: false,
        }
    }

    /// State for a batch that the ledger has already executed, as on start-up.
    pub(super) fn executed(batch: Batch, view: ViewNumber) -> Self {
        let preprepare = Preprepare {
            seq: SeqView::new(batch.seq(), view),
            batch,
        };
        let mut info = Self::new(preprepare, None);
        info.executed = true;
        info
    }

    pub(super) fn seq(&self) -> SeqNo {
        self.subject.seq_no()
    }

    /// Number of prepares that match the subject.
    pub(super) fn matching_prepares(&self) -> usize {
        self.prepares
            .values()
            .filter(|subject| **subject == self.subject)
            .count()
    }

    /// Number of commits that match the subject.
    pub(super) fn matching_commits(&self) -> usize {
        self.commits
            .values()
            .filter(|subject| **subject == self.subject)
            .count()
    }

    pub(super) fn batch(&self) -> Option<&Batch> {
        self.preprepare.as_ref().map(|preprepare| &preprepare.batch)
    }
}
