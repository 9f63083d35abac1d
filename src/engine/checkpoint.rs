/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Checkpoints: after executing a batch, every replica broadcasts a signed checkpoint for it. `f + 1`
//! matching checkpoints make the sequence number stable, which lets the primary propose the next
//! batch and lets replicas that missed the commits execute the batch anyway.

use std::{collections::BTreeMap, time::SystemTime};

use crate::{
    events::{CheckpointDivergenceEvent, Event, StableCheckpointEvent},
    networking::messages::Message,
    persistent_log::{entries::LogEntry, pluggables::KVStore},
    system::{Ledger, System},
    types::{
        certificates::{Checkpoint, CheckpointCertificate},
        crypto_primitives::Crypto,
        data_types::{CryptoHash, ReplicaId, SeqNo, SignatureBytes},
    },
};

use super::{Engine, EngineError, PendingExecution};

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    /// Broadcast a signed checkpoint for the current batch, once it has been executed.
    pub(super) fn send_checkpoint(&mut self) -> Result<(), EngineError> {
        if !self.cur.executed || self.cur.sent_checkpoint {
            return Ok(());
        }
        self.cur.sent_checkpoint = true;
        let checkpoint = Checkpoint::create(&self.crypto, self.cur.seq(), self.cur.subject.digest);
        self.broadcast(Message::Checkpoint(checkpoint))
    }

    pub(super) fn handle_checkpoint(
        &mut self,
        checkpoint: Checkpoint,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        if checkpoint.seq != self.cur.seq() || self.cur.checkpoint_done {
            log::debug!(
                "replica {}: ignoring checkpoint for seq {} from {}",
                self.id,
                checkpoint.seq,
                origin
            );
            return Ok(());
        }
        if !checkpoint.is_correct(&self.crypto, origin) {
            log::warn!(
                "replica {}: invalid checkpoint signature from {} for seq {}",
                self.id,
                origin,
                checkpoint.seq
            );
            return Ok(());
        }
        if self.cur.checkpoints.contains_key(&origin) {
            log::info!(
                "replica {}: duplicate checkpoint for seq {} from {}",
                self.id,
                checkpoint.seq,
                origin
            );
            return Ok(());
        }

        let digest = checkpoint.digest;
        self.cur.checkpoints.insert(origin, checkpoint);
        let signatures: BTreeMap<ReplicaId, SignatureBytes> = self
            .cur
            .checkpoints
            .iter()
            .filter(|(_, checkpoint)| checkpoint.digest == digest)
            .map(|(signer, checkpoint)| (*signer, checkpoint.signature))
            .collect();
        if signatures.len() < self.config.one_correct_quorum() {
            return Ok(());
        }

        if digest != self.cur.subject.digest {
            log::error!(
                "replica {}: {} replicas checkpointed {} at seq {}, but the local batch is {}",
                self.id,
                signatures.len(),
                digest,
                self.cur.seq(),
                self.cur.subject.digest
            );
            self.publish(Event::CheckpointDivergence(CheckpointDivergenceEvent {
                timestamp: SystemTime::now(),
                seq: self.cur.seq(),
                local_digest: self.cur.subject.digest,
                quorum_digest: digest,
            }));
            return Ok(());
        }

        let batch = match self.cur.batch() {
            Some(batch) => batch.clone(),
            None => return Ok(()),
        };

        if !self.cur.executed {
            // At least one correct replica executed the batch, so it was decided.
            if self.pending_execution.is_some() {
                return Ok(());
            }
            if !batch.header.extends(&self.ledger.last_batch().header) {
                log::error!(
                    "replica {}: checkpointed seq {} does not extend the last executed batch",
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
            // Handling the local checkpoint completes the certificate.
            return self.send_checkpoint();
        }

        self.mark_stable(CheckpointCertificate { batch, signatures })
    }

    /// A checkpoint for `seq` above the current sequence was just buffered. If `f + 1` replicas
    /// checkpointed the same `digest` there while this replica is out of the view, or more than one
    /// batch behind, the group moved on without it: fetch the batches up to `seq`.
    pub(super) fn maybe_catch_up_to_checkpoint(&mut self, seq: SeqNo, digest: CryptoHash) {
        if self.active_view && seq <= self.cur.seq().next() {
            return;
        }
        if self.pending_execution.is_some() || self.catching_up_to(seq) {
            return;
        }

        let signatures: BTreeMap<ReplicaId, SignatureBytes> = self
            .backlog
            .checkpoints(seq, digest)
            .filter(|(origin, checkpoint)| checkpoint.is_correct(&self.crypto, *origin))
            .map(|(origin, checkpoint)| (origin, checkpoint.signature))
            .collect();
        if signatures.len() < self.config.one_correct_quorum() {
            return;
        }

        log::info!(
            "replica {}: {} replicas checkpointed seq {} while this replica is at seq {}",
            self.id,
            signatures.len(),
            seq,
            self.cur.seq()
        );
        self.start_state_transfer(seq, digest, signatures, Vec::new(), self.id);
    }

    /// Record `certificate` as the last stable checkpoint, and move on to the next sequence.
    pub(super) fn mark_stable(
        &mut self,
        certificate: CheckpointCertificate,
    ) -> Result<(), EngineError> {
        let seq = certificate.seq();
        self.persist(seq, LogEntry::Checkpoint(certificate.clone()))?;
        if self.cur.seq() == seq {
            self.cur.checkpoint_done = true;
            self.cancel_request_timer();
        }

        log::info!(
            "replica {}: seq {} is stable with digest {}",
            self.id,
            seq,
            certificate.digest()
        );
        self.publish(Event::StableCheckpoint(StableCheckpointEvent {
            timestamp: SystemTime::now(),
            seq,
            digest: certificate.digest(),
        }));
        self.last_stable = certificate;

        if let Err(err) = self.log.prune_below(seq) {
            log::error!(
                "replica {}: failed to prune the log below seq {}, halting: {}",
                self.id,
                seq,
                err
            );
            self.halted = true;
            return Err(EngineError::Persist(err));
        }
        self.backlog.prune_below(seq);

        self.maybe_send_next_batch()?;
        self.maybe_arm_idle_timer();
        Ok(())
    }
}
