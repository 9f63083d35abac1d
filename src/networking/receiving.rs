/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving messages from the P2P network.

use std::{
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};

use crate::algorithm::Input;

use super::network::{Network, NetworkEvent};

/// Spawn the poller thread, which polls the [`Network`] for messages and connection notices and
/// forwards them onto the algorithm thread's input queue.
///
/// The same queue also carries client requests, so that every event that can change the replica's
/// state passes through one dispatch point.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    to_algorithm: Sender<Input>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        match network.recv() {
            Some(NetworkEvent::Received { origin, message }) => {
                let _ = to_algorithm.send(Input::Message { origin, message });
            }
            Some(NetworkEvent::Connected { peer }) => {
                let _ = to_algorithm.send(Input::Connection { peer });
            }
            None => thread::yield_now(),
        }
    })
}
