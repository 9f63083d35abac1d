/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Subject`] of agreement: which batch is being agreed upon at which sequence number in which
//! view.
//!
//! Prepares and commits from different replicas are only compatible if their subjects are equal.
//! Equality is written out field by field, so that adding a field to these types forces a decision
//! on whether it takes part in agreement.

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{CryptoHash, SeqNo, ViewNumber};

/// A sequence number together with the view in which it was assigned.
#[derive(Clone, Copy, Debug, Eq, BorshSerialize, BorshDeserialize)]
pub struct SeqView {
    pub seq: SeqNo,
    pub view: ViewNumber,
}

impl SeqView {
    pub const fn new(seq: SeqNo, view: ViewNumber) -> Self {
        Self { seq, view }
    }
}

impl PartialEq for SeqView {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.view == other.view
    }
}

/// Identifies the batch under agreement at a given sequence number in a given view.
///
/// `digest` is the hash of the batch's [header](super::batch::BatchHeader).
#[derive(Clone, Copy, Debug, Eq, BorshSerialize, BorshDeserialize)]
pub struct Subject {
    pub seq: SeqView,
    pub digest: CryptoHash,
}

impl Subject {
    pub const fn new(seq: SeqView, digest: CryptoHash) -> Self {
        Self { seq, digest }
    }

    pub const fn seq_no(&self) -> SeqNo {
        self.seq.seq
    }

    pub const fn view(&self) -> ViewNumber {
        self.seq.view
    }
}

impl PartialEq for Subject {
    fn eq(&self, other: &Self) -> bool {
        self.seq.seq == other.seq.seq
            && self.seq.view == other.seq.view
            && self.digest == other.digest
    }
}
