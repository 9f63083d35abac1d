/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica's durable record of the protocol decisions it has made.
//!
//! Every state-changing action of the [engine](crate::engine) (accepting a preprepare, sending a
//! prepare or commit, making a checkpoint stable, changing view) is written here *before* any message
//! that depends on it leaves the replica. On restart the engine rebuilds its in-memory state from
//! the newest entry of each [tag](entries::LogTag), so that it never decides differently from what it
//! already told its peers.
//!
//! The log is stored in a key-value store provided by the library user through the
//! [pluggable traits](pluggables). How the log's variables map onto keys is documented in
//! [variables].

pub mod entries;

pub mod pluggables;

pub mod variables;
