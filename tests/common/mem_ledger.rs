//! An in-memory [`Ledger`] that records the batches it executed.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use sbft_rs::{
    system::{ExecuteError, Ledger},
    types::{batch::Batch, data_types::SeqNo},
};

/// Clones share the same executed batches, so tests can inspect a ledger owned by an engine or a
/// replica thread, and a restarted replica resumes from what it executed before.
#[derive(Clone)]
pub(crate) struct MemLedger {
    batches: Arc<Mutex<Vec<Batch>>>,
    failures: Arc<AtomicUsize>,
}

impl MemLedger {
    pub(crate) fn new() -> Self {
        Self {
            batches: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` executions fail.
    pub(crate) fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every batch executed so far, in order, without the genesis batch.
    pub(crate) fn executed(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }

    /// Payloads of every request executed so far, in order.
    pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
        self.executed()
            .iter()
            .flat_map(|batch| batch.requests.iter().map(|request| request.payload().to_vec()))
            .collect()
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.last_batch().seq().int()
    }
}

impl Ledger for MemLedger {
    fn execute(&mut self, batch: &Batch) -> Result<(), ExecuteError> {
        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures.store(failures - 1, Ordering::SeqCst);
            return Err(ExecuteError::new("application unavailable"));
        }

        let mut batches = self.batches.lock().unwrap();
        let last = batches.last().cloned().unwrap_or_else(Batch::genesis);
        assert!(
            batch.header.extends(&last.header),
            "batch {} does not extend the ledger at {}",
            batch.seq(),
            last.seq()
        );
        batches.push(batch.clone());
        Ok(())
    }

    fn last_batch(&self) -> Batch {
        self.batches
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_else(Batch::genesis)
    }

    fn batch(&self, seq: SeqNo) -> Option<Batch> {
        if seq == SeqNo::genesis() {
            return Some(Batch::genesis());
        }
        self.batches
            .lock()
            .unwrap()
            .iter()
            .find(|batch| batch.seq() == seq)
            .cloned()
    }
}
