/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::types::data_types::ReplicaId;

use super::messages::Message;

/// Peer-to-peer transport provided by the library user.
///
/// Delivery may be unordered, lossy, and duplicated. The engine tolerates all three.
pub trait Network: Clone + Send {
    /// Send a message to all other replicas without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: ReplicaId, message: Message);

    /// Receive a message or a connection notice. Returns immediately with a None if nothing is
    /// available now.
    fn recv(&mut self) -> Option<NetworkEvent>;
}

/// Something that happened on the network.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// `message` arrived from `origin`.
    Received { origin: ReplicaId, message: Message },

    /// A connection to `peer` was (re-)established.
    Connected { peer: ReplicaId },
}
