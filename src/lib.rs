/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Byzantine fault tolerant state machine replication engine.
//!
//! `n >= 3f + 1` replicas agree on a single total order of client requests, grouped into hash-chained
//! [batches](types::batch::Batch), despite up to `f` of them behaving arbitrarily. Every correct
//! replica applies the same batches to its [`Ledger`](system::Ledger) in the same order.
//!
//! The protocol logic lives in the [engine](engine), which performs no I/O and can be driven
//! deterministically by any caller. The [replica](replica) module wraps it in threads that talk to a
//! user-provided [network](networking::network::Network) and persist to a user-provided
//! [key-value store](persistent_log::pluggables::KVStore).

pub mod batcher;

pub mod config;

pub mod engine;

pub mod events;

pub mod logging;

pub mod networking;

pub mod persistent_log;

pub mod replica;

pub mod system;

pub mod types;

pub(crate) mod algorithm;

pub(crate) mod event_bus;
