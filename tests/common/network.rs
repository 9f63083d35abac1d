use std::sync::{
    mpsc::{self, Receiver, Sender, TryRecvError},
    Arc, Mutex,
};

use sbft_rs::{
    networking::{
        messages::Message,
        network::{Network, NetworkEvent},
    },
    types::data_types::ReplicaId,
};

/// A mock network stub which passes messages from and to threads using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: ReplicaId,
    all_peers: Vec<Sender<NetworkEvent>>,
    inbox: Arc<Mutex<Receiver<NetworkEvent>>>,
}

impl Network for NetworkStub {
    fn send(&mut self, peer: ReplicaId, message: Message) {
        if let Some(peer) = self.all_peers.get(peer.index()) {
            let _ = peer.send(NetworkEvent::Received {
                origin: self.me,
                message,
            });
        }
    }

    fn broadcast(&mut self, message: Message) {
        for (index, peer) in self.all_peers.iter().enumerate() {
            if index != self.me.index() {
                let _ = peer.send(NetworkEvent::Received {
                    origin: self.me,
                    message: message.clone(),
                });
            }
        }
    }

    fn recv(&mut self) -> Option<NetworkEvent> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

/// Create the network stubs of `n` fully connected replicas. Every stub starts with a connection
/// notice for each of its peers.
pub(crate) fn mock_network(n: u64) -> Vec<NetworkStub> {
    let (senders, inboxes): (Vec<_>, Vec<_>) = (0..n).map(|_| mpsc::channel()).unzip();

    inboxes
        .into_iter()
        .enumerate()
        .map(|(index, inbox)| {
            let me = ReplicaId::new(index as u64);
            for peer in (0..n).map(ReplicaId::new).filter(|peer| *peer != me) {
                let _ = senders[index].send(NetworkEvent::Connected { peer });
            }
            NetworkStub {
                me,
                all_peers: senders.clone(),
                inbox: Arc::new(Mutex::new(inbox)),
            }
        })
        .collect()
}
