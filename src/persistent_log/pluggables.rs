/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable persistence of the [persistent log](super::entries::PersistentLog).
//!
//! The library user provides a key-value store. The log only needs point reads and atomic batched
//! writes from it.

use std::fmt::{self, Display, Formatter};

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Atomically apply every insertion and deletion in `wb`, durably.
    ///
    /// An `Err` means that none of the batch can be assumed to be durable.
    fn write(&mut self, wb: Self::WriteBatch) -> Result<(), KVWriteError>;

    fn clear(&mut self);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// Error returned by a [`KVStore`] that failed to write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KVWriteError {
    pub reason: String,
}

impl KVWriteError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Display for KVWriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "key-value store write failed: {}", self.reason)
    }
}
