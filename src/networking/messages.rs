/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message variant exchanged between replicas, and the structs that
//! the variants carry.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    batch::{Batch, Request},
    certificates::{Checkpoint, CheckpointCertificate},
    crypto_primitives::Crypto,
    data_types::{ReplicaId, SeqNo, SignatureBytes, ViewNumber},
    subject::{SeqView, Subject},
};

/// All message variants used by the replication engine.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// A client request, broadcast by the replica that received it.
    Request(Request),

    /// See [`Preprepare`].
    Preprepare(Preprepare),

    /// A backup's agreement with the primary's proposal.
    Prepare(Subject),

    /// Sent once a replica has seen `2f` prepares that match its own subject.
    Commit(Subject),

    /// See [`Checkpoint`].
    Checkpoint(Checkpoint),

    /// See [`ViewChange`].
    ViewChange(SignedViewChange),

    /// See [`NewView`].
    NewView(NewView),

    /// See [`Hello`].
    Hello(Hello),

    /// See [`StateRequest`].
    StateRequest(StateRequest),

    /// See [`StateResponse`].
    StateResponse(StateResponse),
}

impl Message {
    /// Get the name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "Request",
            Message::Preprepare(_) => "Preprepare",
            Message::Prepare(_) => "Prepare",
            Message::Commit(_) => "Commit",
            Message::Checkpoint(_) => "Checkpoint",
            Message::ViewChange(_) => "ViewChange",
            Message::NewView(_) => "NewView",
            Message::Hello(_) => "Hello",
            Message::StateRequest(_) => "StateRequest",
            Message::StateResponse(_) => "StateResponse",
        }
    }

    /// Get the sequence number the message refers to, if any.
    pub fn seq(&self) -> Option<SeqNo> {
        match self {
            Message::Preprepare(preprepare) => Some(preprepare.seq.seq),
            Message::Prepare(subject) | Message::Commit(subject) => Some(subject.seq_no()),
            Message::Checkpoint(checkpoint) => Some(checkpoint.seq),
            _ => None,
        }
    }
}

/// The primary's proposal of `batch` for sequence number `seq.seq` in view `seq.view`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Preprepare {
    pub seq: SeqView,
    pub batch: Batch,
}

impl Preprepare {
    /// The subject that replicas agree on when they accept this proposal.
    pub fn subject(&self) -> Subject {
        Subject::new(self.seq, self.batch.hash())
    }
}

/// Domain separation prefix for view change signatures.
const VIEW_CHANGE_DOMAIN: &[u8] = b"sbft/view-change";

/// A replica's request to move to `view`, with the evidence the new primary needs to carry in-flight
/// work across the view boundary.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    pub view: ViewNumber,

    /// The replica's last stable checkpoint.
    pub checkpoint: CheckpointCertificate,

    /// Subjects the replica sent a commit for, i.e., subjects that were prepared at the replica.
    pub pset: Vec<Subject>,

    /// Subjects the replica accepted a preprepare for.
    pub qset: Vec<Subject>,
}

impl ViewChange {
    /// Sign this view change with `crypto`.
    pub fn sign(self, crypto: &impl Crypto) -> SignedViewChange {
        let signature = crypto.sign(&self.signing_bytes());
        SignedViewChange {
            view_change: self,
            signature,
        }
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = VIEW_CHANGE_DOMAIN.to_vec();
        // Serializing a struct made only of fixed-size fields and vectors into a Vec cannot fail.
        bytes.extend(self.try_to_vec().unwrap_or_default());
        bytes
    }
}

/// A [`ViewChange`] together with its sender's signature.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedViewChange {
    pub view_change: ViewChange,
    pub signature: SignatureBytes,
}

impl SignedViewChange {
    /// Check that `signer` signed this view change.
    pub fn is_correct(&self, crypto: &impl Crypto, signer: ReplicaId) -> bool {
        crypto.verify(signer, &self.view_change.signing_bytes(), &self.signature)
    }
}

/// The decision a new primary carries across a view change for the first sequence number after the
/// best stable checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum XSet {
    /// Re-propose the batch identified by the subject's digest, in the new view.
    Reproposal(Subject),

    /// Agree on an empty batch at this sequence number, in the new view.
    Null(SeqView),
}

impl XSet {
    pub fn seq(&self) -> SeqView {
        match self {
            XSet::Reproposal(subject) => subject.seq,
            XSet::Null(seq) => *seq,
        }
    }
}

/// Broadcast by the primary of `view` once it has collected `2f + 1` view changes for `view`.
///
/// `vset` holds the signed view changes the primary based its decision on, so that every backup can
/// recompute `xset` and check it. `batch` is the re-proposed batch if `xset` is a
/// [reproposal](XSet::Reproposal), and `None` if it is a [null request](XSet::Null).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewView {
    pub view: ViewNumber,
    pub vset: BTreeMap<ReplicaId, SignedViewChange>,
    pub xset: XSet,
    pub batch: Option<Batch>,
}

/// Sent to a peer when a connection to it is (re-)established, so that it can catch up.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Hello {
    /// The sender's last stable checkpoint.
    pub checkpoint: CheckpointCertificate,

    /// The new view message the sender broadcast, if it is the active primary of its view.
    pub new_view: Option<NewView>,
}

/// Asks a peer for the executed batches with sequence numbers in `from..to`.
///
/// Sent by a replica that learned of a stable checkpoint more than one batch ahead of its ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateRequest {
    pub from: SeqNo,
    pub to: SeqNo,
}

/// The batches asked for by a [`StateRequest`], in sequence order.
///
/// The receiver authenticates them by walking the hash chain back from the stable checkpoint that
/// made it ask, so the responder needs no signatures.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateResponse {
    pub batches: Vec<Batch>,
}
