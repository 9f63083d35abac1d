/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Batch`] type and its header.
//!
//! Batches form a hash chain: the header of the batch at sequence `n` carries the hash of the header
//! of the batch at sequence `n - 1`. The chain starts at the [genesis batch](Batch::genesis), which has
//! sequence number 0, the all-zeroes previous hash, and no requests.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::hash,
    data_types::{CryptoHash, SeqNo},
};

/// Opaque client payload.
///
/// Requests have no identity beyond their content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Request(Vec<u8>);

impl Request {
    pub fn new(payload: Vec<u8>) -> Self {
        Self(payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hash of the request's payload, used to recognize the same request arriving twice.
    pub fn digest(&self) -> CryptoHash {
        hash(&self.0)
    }
}

/// Header of a [`Batch`]. The hash of the header identifies the batch.
#[derive(Clone, Copy, Debug, Eq, BorshSerialize, BorshDeserialize)]
pub struct BatchHeader {
    pub seq: SeqNo,
    pub prev_hash: CryptoHash,
    pub data_hash: CryptoHash,
}

impl BatchHeader {
    /// Compute the hash of this header.
    pub fn hash(&self) -> CryptoHash {
        let mut bytes = Vec::with_capacity(8 + 32 + 32);
        bytes.extend_from_slice(&self.seq.to_be_bytes());
        bytes.extend_from_slice(&self.prev_hash.bytes());
        bytes.extend_from_slice(&self.data_hash.bytes());
        hash(&bytes)
    }

    /// Check whether this header directly extends `prev`.
    pub fn extends(&self, prev: &BatchHeader) -> bool {
        self.seq == prev.seq.next() && self.prev_hash == prev.hash()
    }
}

impl PartialEq for BatchHeader {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
            && self.prev_hash == other.prev_hash
            && self.data_hash == other.data_hash
    }
}

/// An ordered list of requests, together with the header that places it in the hash chain.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Batch {
    pub header: BatchHeader,
    pub requests: Vec<Request>,
}

impl Batch {
    /// Create a batch at `seq` that follows the batch whose header hash is `prev_hash`.
    pub fn new(seq: SeqNo, prev_hash: CryptoHash, requests: Vec<Request>) -> Self {
        let data_hash = Self::data_hash(&requests);
        Self {
            header: BatchHeader {
                seq,
                prev_hash,
                data_hash,
            },
            requests,
        }
    }

    /// The first batch of every replica's hash chain.
    pub fn genesis() -> Self {
        Self::new(SeqNo::genesis(), CryptoHash::zero(), Vec::new())
    }

    /// A batch without requests at `seq`, chained onto `prev_hash`. Used for null requests carried
    /// across a view change.
    pub fn null(seq: SeqNo, prev_hash: CryptoHash) -> Self {
        Self::new(seq, prev_hash, Vec::new())
    }

    pub fn seq(&self) -> SeqNo {
        self.header.seq
    }

    /// Hash of this batch's header.
    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    /// Check that the header's data hash matches the requests actually carried.
    pub fn is_well_formed(&self) -> bool {
        self.header.data_hash == Self::data_hash(&self.requests)
    }

    /// Compute the hash that commits to `requests`, in order.
    ///
    /// Every request is length-prefixed, so that the same bytes split differently between requests
    /// produce a different data hash.
    pub fn data_hash(requests: &[Request]) -> CryptoHash {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(requests.len() as u64).to_be_bytes());
        for request in requests {
            bytes.extend_from_slice(&(request.len() as u64).to_be_bytes());
            bytes.extend_from_slice(request.payload());
        }
        hash(&bytes)
    }
}
