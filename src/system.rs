/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The collaborators that the [engine](crate::engine) drives but does not implement.
//!
//! The engine itself performs no I/O. It reaches the outside world only through:
//! 1. A [`System`], which sends messages and schedules timers, and
//! 2. A [`Ledger`], which executes agreed batches and remembers the ones it executed.
//!
//! Timers do not run callbacks. When a timer set through [`System::set_timer`] expires, whoever
//! drives the engine passes its [`TimerId`] to [`Engine::on_timer`](crate::engine::Engine::on_timer),
//! through the same dispatch point as messages.

use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use crate::{
    networking::messages::Message,
    types::{
        batch::Batch,
        data_types::{ReplicaId, SeqNo},
    },
};

/// Handle of a timer scheduled through [`System::set_timer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Message delivery and timers.
pub trait System {
    /// Send `message` to `peer` without blocking.
    fn send(&mut self, peer: ReplicaId, message: Message);

    /// Send `message` to every replica except the local one, without blocking.
    fn broadcast(&mut self, message: Message);

    /// Schedule a timer that expires after `duration`.
    fn set_timer(&mut self, duration: Duration) -> TimerId;

    /// Cancel a timer. Cancelling an expired or unknown timer has no effect.
    fn cancel_timer(&mut self, timer: TimerId);
}

/// The state machine that agreed batches are applied to.
pub trait Ledger {
    /// Apply `batch`. The engine calls this exactly once per sequence number, in sequence order.
    fn execute(&mut self, batch: &Batch) -> Result<(), ExecuteError>;

    /// The last batch applied, or the [genesis batch](Batch::genesis) if none has been.
    fn last_batch(&self) -> Batch;

    /// The batch applied at `seq`, if the ledger still holds it. Used to serve peers that fell
    /// behind.
    fn batch(&self, seq: SeqNo) -> Option<Batch>;
}

/// Error returned by a [`Ledger`] that could not apply a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteError {
    pub reason: String,
}

impl ExecuteError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Display for ExecuteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ledger failed to execute batch: {}", self.reason)
    }
}

impl std::error::Error for ExecuteError {}
