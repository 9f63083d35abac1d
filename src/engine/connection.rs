/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reconnection and catching up.
//!
//! When a connection to a peer is (re-)established, the replica sends it a [`Hello`] with its last
//! stable checkpoint and, if it is the active primary, the new view message of its view. It then
//! re-sends whatever it contributed to the batch in flight, and its pending view change, so that a
//! peer that restarted or lost messages can rejoin the current sequence.
//!
//! A replica that learns of a stable checkpoint one batch ahead of its ledger executes the batch in
//! the checkpoint certificate directly. If the checkpoint is further ahead, it asks the peer for the
//! missing batches with a [`StateRequest`], and authenticates the [`StateResponse`] by walking the
//! hash chain back from the certified batch to its own last executed batch. Responses are capped at
//! [`MAX_STATE_TRANSFER_BATCHES`], so a long gap is fetched in rounds, highest batches first, and
//! executed once it is closed.

use std::collections::BTreeMap;

use crate::{
    networking::messages::{Hello, Message, StateRequest, StateResponse},
    persistent_log::pluggables::KVStore,
    system::{Ledger, System},
    types::{
        batch::Batch,
        certificates::CheckpointCertificate,
        crypto_primitives::Crypto,
        data_types::{CryptoHash, ReplicaId, SeqNo, SignatureBytes},
    },
};

use super::{req_info::ReqInfo, Engine, EngineError, PendingExecution};

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    pub(super) fn send_hello(&mut self, peer: ReplicaId) {
        let new_view = if self.is_primary() && self.active_view {
            self.new_view
                .clone()
                .filter(|new_view| new_view.view == self.view)
        } else {
            None
        };
        self.system.send(
            peer,
            Message::Hello(Hello {
                checkpoint: self.last_stable.clone(),
                new_view,
            }),
        );

        if let Some(svc) = self.view_changes.get(&self.id) {
            self.system.send(peer, Message::ViewChange(svc.clone()));
        }

        if !self.active_view || self.cur.seq() <= self.last_stable.seq() {
            return;
        }
        let subject = self.cur.subject;
        if let Some(preprepare) = &self.cur.preprepare {
            if self.config.primary(subject.view()) == self.id && subject.view() == self.view {
                self.system.send(peer, Message::Preprepare(preprepare.clone()));
            }
        }
        if self.cur.prepares.contains_key(&self.id) {
            self.system.send(peer, Message::Prepare(subject));
        }
        if self.cur.sent_commit {
            self.system.send(peer, Message::Commit(subject));
        }
        if let Some(checkpoint) = self.cur.checkpoints.get(&self.id) {
            self.system.send(peer, Message::Checkpoint(checkpoint.clone()));
        }
    }

    pub(super) fn handle_hello(
        &mut self,
        hello: Hello,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        if !hello.checkpoint.is_correct(
            &self.crypto,
            self.config.n,
            self.config.one_correct_quorum(),
        ) {
            log::warn!(
                "replica {}: hello from {} carries an invalid checkpoint certificate",
                self.id,
                origin
            );
            return Ok(());
        }
        self.catch_up_to(hello.checkpoint, origin)?;

        if let Some(new_view) = hello.new_view {
            self.handle_new_view(new_view, origin)?;
        }
        Ok(())
    }

    /// Bring the ledger and the last stable checkpoint up to `certificate`, learned from `origin`.
    fn catch_up_to(
        &mut self,
        certificate: CheckpointCertificate,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        let last = self.ledger.last_batch().header;
        if certificate.seq() <= last.seq {
            let executed_here = self
                .ledger
                .batch(certificate.seq())
                .map(|batch| batch.hash())
                == Some(certificate.digest());
            if certificate.seq() > self.last_stable.seq() && executed_here {
                self.mark_stable(certificate)?;
            }
            return Ok(());
        }
        if self.pending_execution.is_some() {
            return Ok(());
        }

        if certificate.seq() == last.seq.next() {
            if certificate.batch.header.prev_hash != last.hash() {
                log::error!(
                    "replica {}: stable checkpoint at seq {} from {} does not extend the ledger",
                    self.id,
                    certificate.seq(),
                    origin
                );
                return Ok(());
            }
            return self.deliver_certified(certificate);
        }

        self.start_catch_up(certificate, origin);
        Ok(())
    }

    /// Ask for the batches between the ledger and `certificate`. `hint` is the peer to ask, unless it
    /// is the local replica.
    pub(super) fn start_catch_up(&mut self, certificate: CheckpointCertificate, hint: ReplicaId) {
        let CheckpointCertificate { batch, signatures } = certificate;
        let (seq, digest) = (batch.seq(), batch.hash());
        self.start_state_transfer(seq, digest, signatures, vec![batch], hint);
    }

    /// Fetch the batches up to and including the one with `digest` at `seq`, which the replicas in
    /// `signatures` checkpointed. `fetched` holds the highest of them, if already known.
    pub(super) fn start_state_transfer(
        &mut self,
        seq: SeqNo,
        digest: CryptoHash,
        signatures: BTreeMap<ReplicaId, SignatureBytes>,
        fetched: Vec<Batch>,
        hint: ReplicaId,
    ) {
        let peer = if hint != self.id {
            Some(hint)
        } else {
            signatures.keys().copied().find(|signer| *signer != self.id)
        };
        let peer = match peer {
            Some(peer) => peer,
            None => return,
        };

        match self.catch_up.as_mut() {
            // Keep the batches already fetched for the same or a later checkpoint.
            Some(catch_up) if catch_up.seq >= seq => catch_up.peer = peer,
            _ => {
                self.catch_up = Some(CatchUp {
                    seq,
                    digest,
                    signatures,
                    fetched,
                    peer,
                })
            }
        }
        self.request_state();
    }

    /// Whether a state transfer to `seq` or beyond is under way.
    pub(super) fn catching_up_to(&self, seq: SeqNo) -> bool {
        self.catch_up
            .as_ref()
            .map_or(false, |catch_up| catch_up.seq >= seq)
    }

    /// Ask the catch-up peer for the batches between the ledger and the lowest batch known so far.
    fn request_state(&mut self) {
        let catch_up = match &self.catch_up {
            Some(catch_up) => catch_up,
            None => return,
        };
        let request = StateRequest {
            from: self.ledger.last_batch().seq().next(),
            to: catch_up.anchor().0,
        };
        log::info!(
            "replica {}: {} is stable, asking {} for seqs {} to {}",
            self.id,
            catch_up.seq,
            catch_up.peer,
            request.from,
            request.to
        );
        self.system.send(catch_up.peer, Message::StateRequest(request));
    }

    /// Serve at most [`MAX_STATE_TRANSFER_BATCHES`] batches, the highest of the range asked for.
    pub(super) fn handle_state_request(&mut self, request: StateRequest, origin: ReplicaId) {
        let last = self.ledger.last_batch().seq();
        if request.from > request.to || request.to > last.next() {
            log::debug!(
                "replica {}: cannot serve seqs {} to {} to {}",
                self.id,
                request.from,
                request.to,
                origin
            );
            return;
        }

        let lowest = request
            .to
            .int()
            .saturating_sub(MAX_STATE_TRANSFER_BATCHES)
            .max(request.from.int());
        let mut batches = Vec::new();
        let mut seq = SeqNo::new(lowest);
        while seq < request.to {
            match self.ledger.batch(seq) {
                Some(batch) => batches.push(batch),
                None => {
                    log::debug!(
                        "replica {}: ledger no longer holds seq {} asked for by {}",
                        self.id,
                        seq,
                        origin
                    );
                    return;
                }
            }
            seq = seq.next();
        }
        self.system.send(origin, Message::StateResponse(StateResponse { batches }));
    }

    pub(super) fn handle_state_response(
        &mut self,
        response: StateResponse,
        origin: ReplicaId,
    ) -> Result<(), EngineError> {
        let mut catch_up = match self.catch_up.take() {
            Some(catch_up) => catch_up,
            None => {
                log::debug!(
                    "replica {}: unsolicited state response from {}",
                    self.id,
                    origin
                );
                return Ok(());
            }
        };
        let last = self.ledger.last_batch().header;
        if catch_up.seq <= last.seq || self.pending_execution.is_some() {
            return Ok(());
        }
        catch_up.fetched.retain(|batch| batch.seq() > last.seq);

        let (anchor_seq, anchor_hash) = catch_up.anchor();
        if anchor_seq > last.seq.next() {
            let mut batches: Vec<Batch> = response
                .batches
                .into_iter()
                .filter(|batch| batch.seq() > last.seq && batch.seq() < anchor_seq)
                .collect();
            if batches.is_empty() {
                log::debug!(
                    "replica {}: state response from {} holds no batch still missing",
                    self.id,
                    origin
                );
                self.catch_up = Some(catch_up);
                return Ok(());
            }
            if !Self::links(&batches, anchor_seq, &anchor_hash) {
                log::warn!(
                    "replica {}: state response from {} does not lead to stable seq {}",
                    self.id,
                    origin,
                    catch_up.seq
                );
                self.catch_up = Some(catch_up);
                return Ok(());
            }
            batches.append(&mut catch_up.fetched);
            catch_up.fetched = batches;
        }

        let (anchor_seq, anchor_hash) = catch_up.anchor();
        if anchor_seq > last.seq.next() {
            self.catch_up = Some(catch_up);
            self.request_state();
            return Ok(());
        }
        if anchor_hash != last.hash() {
            log::error!(
                "replica {}: the batches below stable seq {} do not extend the ledger",
                self.id,
                catch_up.seq
            );
            return Ok(());
        }

        let CatchUp {
            signatures,
            mut fetched,
            ..
        } = catch_up;
        let certified = match fetched.pop() {
            Some(batch) => batch,
            None => return Ok(()),
        };
        for batch in &fetched {
            if let Err(error) = self.execute_batch(batch) {
                return Err(EngineError::Execute {
                    seq: batch.seq(),
                    error,
                });
            }
        }
        self.deliver_certified(CheckpointCertificate {
            batch: certified,
            signatures,
        })
    }

    /// Check that `batches` are the batches right below `anchor_seq`, the highest of which must
    /// have hash `anchor_hash`.
    fn links(batches: &[Batch], anchor_seq: SeqNo, anchor_hash: &CryptoHash) -> bool {
        let mut expected_hash = *anchor_hash;
        let mut expected_seq = anchor_seq;
        for batch in batches.iter().rev() {
            expected_seq = match expected_seq.int().checked_sub(1) {
                Some(seq) => SeqNo::new(seq),
                None => return false,
            };
            if batch.seq() != expected_seq
                || !batch.is_well_formed()
                || batch.hash() != expected_hash
            {
                return false;
            }
            expected_hash = batch.header.prev_hash;
        }
        true
    }

    /// Execute the batch in `certificate`, which directly extends the ledger, and make it stable.
    pub(super) fn deliver_certified(
        &mut self,
        certificate: CheckpointCertificate,
    ) -> Result<(), EngineError> {
        if let Err(error) = self.execute_batch(&certificate.batch) {
            let seq = certificate.seq();
            self.pending_execution = Some(PendingExecution::Certified(certificate));
            return Err(EngineError::Execute { seq, error });
        }
        self.finish_certified(certificate)
    }

    pub(super) fn finish_certified(
        &mut self,
        certificate: CheckpointCertificate,
    ) -> Result<(), EngineError> {
        if self.cur.seq() == certificate.seq() && self.cur.subject.digest == certificate.digest() {
            self.cur.executed = true;
        } else {
            self.cancel_request_timer();
            self.cur = ReqInfo::executed(certificate.batch.clone(), self.view);
        }
        self.mark_stable(certificate)?;

        if let Some((preprepare, origin)) = self.deferred_xset.take() {
            if preprepare.seq.view == self.view && self.active_view {
                return self.replay_xset(preprepare, origin);
            }
        }
        Ok(())
    }
}

/// Most batches sent in one [`StateResponse`]. A replica further behind fetches its missing batches
/// in several rounds, from the stable checkpoint downwards.
pub const MAX_STATE_TRANSFER_BATCHES: u64 = 64;

/// An ongoing state transfer.
pub(super) struct CatchUp {
    /// The stable checkpoint being caught up to.
    seq: SeqNo,
    digest: CryptoHash,
    signatures: BTreeMap<ReplicaId, SignatureBytes>,
    /// Batches up to `seq`, in sequence order, already linked to `digest` through the hash chain.
    fetched: Vec<Batch>,
    peer: ReplicaId,
}

impl CatchUp {
    /// Sequence number of the lowest batch that is linked to the checkpoint, and the hash that the
    /// batch right below it must have.
    fn anchor(&self) -> (SeqNo, CryptoHash) {
        match self.fetched.first() {
            Some(batch) => (batch.seq(), batch.header.prev_hash),
            None => (self.seq.next(), self.digest),
        }
    }
}
