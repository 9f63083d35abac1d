/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the replication engine.
//!
//! Message types specific to the wire protocol can be found in
//! [`networking::messages`](crate::networking::messages).

pub mod batch;

pub mod certificates;

pub mod crypto_primitives;

pub mod data_types;

pub mod subject;
