/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local replica.
//!
//! An event for a given action indicates that the action has been completed. The
//! [engine](crate::engine) publishes events on a channel, and the [event bus](crate::event_bus)
//! thread passes them to the handlers registered through [`ReplicaSpec`](crate::replica::ReplicaSpec)
//! and, if enabled, to the default [loggers](crate::logging).

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    networking::messages::XSet,
    types::{
        batch::BatchHeader,
        data_types::{CryptoHash, ReplicaId, SeqNo, ViewNumber},
        subject::Subject,
    },
};

pub enum Event {
    // Events that change the replicated state.
    ExecuteBatch(ExecuteBatchEvent),
    StableCheckpoint(StableCheckpointEvent),
    CheckpointDivergence(CheckpointDivergenceEvent),
    // Events that involve broadcasting an agreement message.
    Propose(ProposeEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    // Events that involve receiving a message.
    ReceivePreprepare(ReceivePreprepareEvent),
    ReceiveViewChange(ReceiveViewChangeEvent),
    BacklogOverflow(BacklogOverflowEvent),
    // View change events.
    RequestTimeout(RequestTimeoutEvent),
    SendViewChange(SendViewChangeEvent),
    ViewChangeTimeout(ViewChangeTimeoutEvent),
    SendNewView(SendNewViewEvent),
    EnterView(EnterViewEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus may already have shut down while the replica is being dropped.
            let _ = event_publisher.send(event);
        }
    }
}

/// The ledger executed the batch with `header`.
pub struct ExecuteBatchEvent {
    pub timestamp: SystemTime,
    pub header: BatchHeader,
    pub requests: usize,
}

/// `f + 1` matching checkpoints were collected for `seq`.
pub struct StableCheckpointEvent {
    pub timestamp: SystemTime,
    pub seq: SeqNo,
    pub digest: CryptoHash,
}

/// `f + 1` replicas signed checkpoints for a batch different from the one executed locally.
pub struct CheckpointDivergenceEvent {
    pub timestamp: SystemTime,
    pub seq: SeqNo,
    pub local_digest: CryptoHash,
    pub quorum_digest: CryptoHash,
}

/// The primary broadcast a preprepare.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub subject: Subject,
    pub requests: usize,
}

pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub subject: Subject,
}

pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub subject: Subject,
}

/// A preprepare from `origin` was accepted.
pub struct ReceivePreprepareEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub subject: Subject,
}

/// A validly signed view change from `origin` was recorded.
pub struct ReceiveViewChangeEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub view: ViewNumber,
}

/// A buffered future message from `origin` was evicted to make room for a newer one.
pub struct BacklogOverflowEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaId,
    pub evicted: &'static str,
}

/// No decision was reached for `seq` in time, or pending requests were not served in time.
pub struct RequestTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seq: SeqNo,
}

pub struct SendViewChangeEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
}

/// The view change to `view` did not complete in time. The next attempt gets `next_timeout`.
pub struct ViewChangeTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub next_timeout: Duration,
}

pub struct SendNewViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub xset: XSet,
}

/// The replica adopted a new view and resumed normal operation in it.
pub struct EnterViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub primary: ReplicaId,
}
