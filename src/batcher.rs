/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pool of client requests that have not been executed yet, and the rules for cutting batches out
//! of it.
//!
//! Every replica keeps a pool, not only the primary: requests are broadcast to all replicas, and a
//! backup that becomes primary after a view change proposes the requests it already holds. A request
//! leaves the pool only when a batch containing it is executed.
//!
//! Requests are opaque: two submissions of the same bytes are two requests, and both are executed.
//! Because the broadcast copy of a request may reach a backup only after the batch containing it
//! was executed there, the pool remembers a bounded number of executed requests that it never held,
//! and drops the copies that arrive late.
//!
//! The primary proposes a batch as soon as the pool holds at least `batch_size_limit_bytes` of
//! payload, or when the batch timer (`batch_duration_limit`) started by the first pending request
//! expires. The timer itself is owned by the [engine](crate::engine).

use std::collections::{HashMap, VecDeque};

use crate::types::{batch::Request, data_types::CryptoHash};

/// Maximum number of executed-but-never-pooled requests remembered.
pub(crate) const EXECUTED_WINDOW: usize = 1024;

/// Maximum number of pending requests. Requests that arrive while the pool is full are dropped.
pub(crate) const POOL_CAPACITY: usize = 64 * 1024;

/// What [`Batcher::push`] did with a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Pooled,
    LateCopy,
    PoolFull,
}

pub(crate) struct Batcher {
    pending: Vec<Request>,
    pending_bytes: u64,
    size_limit_bytes: u64,
    executed_early: HashMap<CryptoHash, usize>,
    executed_early_order: VecDeque<CryptoHash>,
}

impl Batcher {
    pub(crate) fn new(size_limit_bytes: u64) -> Self {
        Self {
            pending: Vec::new(),
            pending_bytes: 0,
            size_limit_bytes,
            executed_early: HashMap::new(),
            executed_early_order: VecDeque::new(),
        }
    }

    /// Add `request` to the pool, unless it is a late copy of an executed request or the pool is
    /// full.
    pub(crate) fn push(&mut self, request: Request) -> Admission {
        let digest = request.digest();
        if let Some(count) = self.executed_early.get_mut(&digest) {
            *count -= 1;
            if *count == 0 {
                self.executed_early.remove(&digest);
            }
            // One queue entry per remembered copy.
            if let Some(position) = self.executed_early_order.iter().position(|d| *d == digest) {
                self.executed_early_order.remove(position);
            }
            return Admission::LateCopy;
        }

        if self.pending.len() >= POOL_CAPACITY {
            return Admission::PoolFull;
        }
        self.pending_bytes += request.len() as u64;
        self.pending.push(request);
        Admission::Pooled
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether enough payload is pending to propose a batch without waiting for the batch timer.
    pub(crate) fn is_full(&self) -> bool {
        !self.pending.is_empty() && self.pending_bytes >= self.size_limit_bytes
    }

    /// The requests of the next batch, in arrival order: pending requests are taken until their
    /// total size reaches the size limit. A non-empty pool always yields at least one request, even
    /// one larger than the limit. The requests stay in the pool until they are
    /// [executed](Self::remove_executed).
    pub(crate) fn next_batch(&self) -> Vec<Request> {
        let mut size = 0;
        let mut batch = Vec::new();
        for request in &self.pending {
            if !batch.is_empty() && size >= self.size_limit_bytes {
                break;
            }
            size += request.len() as u64;
            batch.push(request.clone());
        }
        batch
    }

    /// Remove one pending copy of every request in `executed`.
    pub(crate) fn remove_executed(&mut self, executed: &[Request]) {
        for request in executed {
            let digest = request.digest();
            match self.pending.iter().position(|pending| pending.digest() == digest) {
                Some(position) => {
                    let removed = self.pending.remove(position);
                    self.pending_bytes -= removed.len() as u64;
                }
                None => self.remember_executed(digest),
            }
        }
    }

    fn remember_executed(&mut self, digest: CryptoHash) {
        *self.executed_early.entry(digest).or_insert(0) += 1;
        self.executed_early_order.push_back(digest);
        while self.executed_early_order.len() > EXECUTED_WINDOW {
            if let Some(oldest) = self.executed_early_order.pop_front() {
                if let Some(count) = self.executed_early.get_mut(&oldest) {
                    *count -= 1;
                    if *count == 0 {
                        self.executed_early.remove(&oldest);
                    }
                }
            }
        }
    }
}
