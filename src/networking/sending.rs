/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the P2P network.

use crate::types::data_types::ReplicaId;

use super::{messages::Message, network::Network};

/// Handle through which the algorithm thread sends to the [`Network`].
///
/// Point-to-point sends addressed to the local replica or to an id outside the replica set never
/// reach the network.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    me: ReplicaId,
    n: u64,
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(me: ReplicaId, n: u64, network: N) -> Self {
        Self { me, n, network }
    }

    pub(crate) fn send(&mut self, peer: ReplicaId, message: Message) {
        if peer == self.me || peer.int() >= self.n {
            log::warn!(
                "replica {}: not sending {} to replica {}",
                self.me,
                message.kind(),
                peer
            );
            return;
        }
        log::trace!("replica {}: sending {} to {}", self.me, message.kind(), peer);
        self.network.send(peer, message)
    }

    pub(crate) fn broadcast(&mut self, message: Message) {
        log::trace!("replica {}: broadcasting {}", self.me, message.kind());
        self.network.broadcast(message)
    }
}
