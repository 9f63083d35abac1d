/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! The library user provides an implementation of [`Network`](network::Network). The
//! [poller thread](receiving::start_polling) pulls messages and connection notices out of it and
//! feeds them into the replica's single input queue, and the [algorithm thread](crate::algorithm)
//! sends through a [`SenderHandle`](sending::SenderHandle).

pub mod messages;

pub mod network;

pub(crate) mod receiving;

pub(crate) mod sending;
