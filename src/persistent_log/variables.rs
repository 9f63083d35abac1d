/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where each persistent log variable is stored in the user-provided
//! key-value store.
//!
//! # List of variables
//!
//! |Variable|Key|Value|
//! |---|---|---|
//! |Entries|`ENTRIES ++ tag ++ seq`|The [`LogEntry`](super::entries::LogEntry) persisted under `tag` while the replica was working on sequence number `seq`. `seq` is stored big-endian, so entries of one tag sort by sequence number.|
//! |Latest|`LATEST ++ tag`|The [`SeqNo`](crate::types::data_types::SeqNo) of the most recently written entry of `tag`.|
//! |Sequence numbers|`SEQS ++ tag`|The `Vec<SeqNo>` of every entry of `tag` still present. Used for pruning.|
//!
//! Every value is **Borsh-serialized**. `tag` is the single byte returned by
//! [`LogTag::byte`](super::entries::LogTag::byte).

pub const ENTRIES: [u8; 1] = [0];
pub const LATEST: [u8; 1] = [1];
pub const SEQS: [u8; 1] = [2];

/// Concatenate two byteslices into one vector.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}
