/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed checkpoints and the certificates that are formed by collecting them.
//!
//! After executing the batch at sequence `n`, every replica signs and broadcasts a [`Checkpoint`] for
//! `n`. Once `f + 1` replicas have signed matching checkpoints, at least one correct replica has
//! executed the batch, and sequence `n` becomes *stable*. The batch together with the signatures forms
//! a [`CheckpointCertificate`], which replicas carry in view changes and hello messages to prove how
//! far the hash chain has progressed.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    batch::Batch,
    crypto_primitives::Crypto,
    data_types::{CryptoHash, ReplicaId, SeqNo, SignatureBytes},
};

/// Domain separation prefix for checkpoint signatures.
const CHECKPOINT_DOMAIN: &[u8] = b"sbft/checkpoint";

/// A replica's signed claim that it executed the batch with header hash `digest` at `seq`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub seq: SeqNo,
    pub digest: CryptoHash,
    pub signature: SignatureBytes,
}

impl Checkpoint {
    /// Create a checkpoint for (`seq`, `digest`) signed with `crypto`.
    pub fn create(crypto: &impl Crypto, seq: SeqNo, digest: CryptoHash) -> Self {
        let signature = crypto.sign(&Self::signing_bytes(seq, digest));
        Self {
            seq,
            digest,
            signature,
        }
    }

    /// Check that `signer` produced this checkpoint's signature.
    pub fn is_correct(&self, crypto: &impl Crypto, signer: ReplicaId) -> bool {
        crypto.verify(
            signer,
            &Self::signing_bytes(self.seq, self.digest),
            &self.signature,
        )
    }

    fn signing_bytes(seq: SeqNo, digest: CryptoHash) -> Vec<u8> {
        let mut bytes = CHECKPOINT_DOMAIN.to_vec();
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(&digest.bytes());
        bytes
    }
}

/// A batch together with the checkpoint signatures that made its sequence number stable.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CheckpointCertificate {
    pub batch: Batch,
    pub signatures: BTreeMap<ReplicaId, SignatureBytes>,
}

impl CheckpointCertificate {
    /// The certificate for the genesis batch. It needs no signatures.
    pub fn genesis() -> Self {
        Self {
            batch: Batch::genesis(),
            signatures: BTreeMap::new(),
        }
    }

    pub fn seq(&self) -> SeqNo {
        self.batch.seq()
    }

    pub fn digest(&self) -> CryptoHash {
        self.batch.hash()
    }

    /// Check whether the certificate is the genesis certificate or carries at least `quorum` valid
    /// checkpoint signatures over its batch, from replicas with ids below `n`.
    pub fn is_correct(&self, crypto: &impl Crypto, n: u64, quorum: usize) -> bool {
        if !self.batch.is_well_formed() {
            return false;
        }

        if self.seq() == SeqNo::genesis() {
            return self.batch == Batch::genesis();
        }

        let signing_bytes = Checkpoint::signing_bytes(self.seq(), self.digest());
        let valid_signatures = self
            .signatures
            .iter()
            .filter(|(signer, signature)| {
                signer.int() < n && crypto.verify(**signer, &signing_bytes, signature)
            })
            .count();

        valid_signatures >= quorum
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{SigningKey, VerifyingKey};
    use rand_core::OsRng;

    use super::*;
    use crate::types::{batch::Request, crypto_primitives::Ed25519Crypto};

    fn cryptos(n: usize) -> Vec<Ed25519Crypto> {
        let mut csprg = OsRng {};
        let keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut csprg)).collect();
        let replicas: Vec<VerifyingKey> = keys.iter().map(|k| k.verifying_key()).collect();
        keys.into_iter()
            .map(|key| Ed25519Crypto::new(key, replicas.clone()))
            .collect()
    }

    #[test]
    fn certificate_needs_a_quorum_of_valid_signatures() {
        let cryptos = cryptos(4);
        let batch = Batch::new(
            SeqNo::new(1),
            Batch::genesis().hash(),
            vec![Request::new(vec![1, 2, 3])],
        );

        let mut certificate = CheckpointCertificate {
            batch: batch.clone(),
            signatures: BTreeMap::new(),
        };
        let checkpoint_0 = Checkpoint::create(&cryptos[0], batch.seq(), batch.hash());
        assert!(checkpoint_0.is_correct(&cryptos[3], ReplicaId::new(0)));
        assert!(!checkpoint_0.is_correct(&cryptos[3], ReplicaId::new(1)));

        certificate
            .signatures
            .insert(ReplicaId::new(0), checkpoint_0.signature);
        assert!(!certificate.is_correct(&cryptos[2], 4, 2));

        // A signature filed under the wrong replica does not count.
        let checkpoint_1 = Checkpoint::create(&cryptos[1], batch.seq(), batch.hash());
        certificate
            .signatures
            .insert(ReplicaId::new(2), checkpoint_1.signature);
        assert!(!certificate.is_correct(&cryptos[2], 4, 2));

        certificate
            .signatures
            .insert(ReplicaId::new(1), checkpoint_1.signature);
        assert!(certificate.is_correct(&cryptos[2], 4, 2));
    }

    #[test]
    fn genesis_certificate_is_correct_without_signatures() {
        let cryptos = cryptos(1);
        assert!(CheckpointCertificate::genesis().is_correct(&cryptos[0], 4, 2));

        let mut fake_genesis = CheckpointCertificate::genesis();
        fake_genesis.batch = Batch::new(SeqNo::genesis(), CryptoHash::new([1; 32]), Vec::new());
        assert!(!fake_genesis.is_correct(&cryptos[0], 4, 2));
    }
}
