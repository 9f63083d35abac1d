/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.
//!
//! The [engine](crate::engine) never touches signing keys directly. It signs and verifies through
//! the [`Crypto`] trait, so that identity and membership checks stay an injected capability.

use ed25519_dalek::{Signature, Signer, Verifier};

use super::data_types::{CryptoHash, ReplicaId, SignatureBytes};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Hash `bytes` with [`CryptoHasher`].
pub fn hash(bytes: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}

/// Signing and signature verification on behalf of a single replica.
pub trait Crypto {
    /// Sign `message` as the local replica.
    fn sign(&self, message: &[u8]) -> SignatureBytes;

    /// Check that `signature` is a valid signature over `message` by `signer`.
    ///
    /// Returns `false` for unknown signers.
    fn verify(&self, signer: ReplicaId, message: &[u8], signature: &SignatureBytes) -> bool;
}

/// A facade around [`SigningKey`] that implements method for [`sign`](Self::sign)-ing messages as well
/// as a getter for the [`public`](Self::public) key associated with the signing key.
#[derive(Clone)]
pub(crate) struct Keypair(pub(crate) SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub(crate) fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign an arbitrary `message` with the `Keypair`.
    pub(crate) fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub(crate) fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// [`Crypto`] implementation backed by Ed25519 keys.
///
/// `replicas[i]` is the verifying key of the replica with id `i`.
#[derive(Clone)]
pub struct Ed25519Crypto {
    keypair: Keypair,
    replicas: Vec<VerifyingKey>,
}

impl Ed25519Crypto {
    pub fn new(me: SigningKey, replicas: Vec<VerifyingKey>) -> Self {
        Self {
            keypair: Keypair::new(me),
            replicas,
        }
    }

    /// Get the id of the local replica, i.e., the position of its verifying key in the replica list.
    pub fn my_id(&self) -> Option<ReplicaId> {
        let me = self.keypair.public();
        self.replicas
            .iter()
            .position(|replica| replica == &me)
            .map(|pos| ReplicaId::new(pos as u64))
    }
}

impl Crypto for Ed25519Crypto {
    fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.keypair.sign(message)
    }

    fn verify(&self, signer: ReplicaId, message: &[u8], signature: &SignatureBytes) -> bool {
        match self.replicas.get(signer.index()) {
            Some(verifying_key) => {
                let signature = Signature::from_bytes(&signature.bytes());
                verifying_key.verify(message, &signature).is_ok()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;

    #[test]
    fn signatures_verify_only_for_their_signer() {
        let mut csprg = OsRng {};
        let keys: Vec<SigningKey> = (0..3).map(|_| SigningKey::generate(&mut csprg)).collect();
        let replicas: Vec<VerifyingKey> = keys.iter().map(|k| k.verifying_key()).collect();

        let crypto_1 = Ed25519Crypto::new(keys[1].clone(), replicas.clone());
        assert_eq!(crypto_1.my_id(), Some(ReplicaId::new(1)));

        let signature = crypto_1.sign(b"checkpoint");
        assert!(crypto_1.verify(ReplicaId::new(1), b"checkpoint", &signature));
        assert!(!crypto_1.verify(ReplicaId::new(0), b"checkpoint", &signature));
        assert!(!crypto_1.verify(ReplicaId::new(1), b"something else", &signature));
        assert!(!crypto_1.verify(ReplicaId::new(7), b"checkpoint", &signature));
    }
}
