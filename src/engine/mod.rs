/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replication engine: a deterministic, single-threaded state machine that runs the agreement,
//! checkpoint, and view change protocols for one replica.
//!
//! ## Inputs and outputs
//!
//! The engine reacts to four kinds of input, each delivered by calling a method:
//! 1. [`request`](Engine::request): a client submitted a request to this replica.
//! 2. [`receive`](Engine::receive): a message arrived from a peer.
//! 3. [`on_timer`](Engine::on_timer): a timer set through the [`System`] expired.
//! 4. [`connection`](Engine::connection): a connection to a peer was (re-)established.
//!
//! It produces output only through its collaborators: messages and timers go through the
//! [`System`], agreed batches are applied through the [`Ledger`], and decisions are recorded in the
//! [`PersistentLog`] before any message that depends on them is sent.
//!
//! ## Agreement
//!
//! The primary of a view (`view % n`) proposes one batch at a time. A backup that accepts the
//! proposal broadcasts a prepare; a replica that has seen `2f` matching prepares broadcasts a commit;
//! a replica that has seen `2f + 1` matching commits executes the batch and broadcasts a signed
//! checkpoint. `f + 1` matching checkpoints make the sequence number stable, and only then may the
//! primary propose the next batch.
//!
//! ## View change
//!
//! A replica that waits too long for a decision broadcasts a signed [view change](view_change). The
//! primary of the next view collects `2f + 1` of them, decides from their contents what must be
//! carried into the new view (the [X-set](xset)), and broadcasts a [new view](new_view) that every
//! backup can check independently.
//!
//! ## Buffering
//!
//! Messages that arrive too early are kept in a bounded per-sender [backlog](backlog) and re-examined
//! after every input, until no more of them can be processed.

mod agreement;
mod backlog;
mod checkpoint;
mod connection;
mod new_view;
mod req_info;
mod restore;
mod view_change;
pub(crate) mod xset;

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    batcher::Batcher,
    config::{ConfigError, ProtocolConfig},
    events::{Event, ExecuteBatchEvent},
    networking::messages::{Message, NewView, Preprepare, SignedViewChange},
    persistent_log::{
        entries::{LogEntry, PersistError, PersistentLog},
        pluggables::KVStore,
    },
    system::{ExecuteError, Ledger, System, TimerId},
    types::{
        batch::{Batch, BatchHeader, Request},
        certificates::CheckpointCertificate,
        crypto_primitives::Crypto,
        data_types::{ReplicaId, SeqNo, ViewNumber},
    },
};

use self::{backlog::Backlog, connection::CatchUp, req_info::ReqInfo};

pub use self::connection::MAX_STATE_TRANSFER_BATCHES;

/// A batch that was decided but that the [`Ledger`] failed to execute.
enum PendingExecution {
    /// Decided through `2f + 1` commits or `f + 1` checkpoints in the current sequence.
    Agreed(Batch),
    /// Learned from a peer's stable checkpoint.
    Certified(CheckpointCertificate),
}

/// One replica's view of the replicated state machine. See the [module-level docs](self).
pub struct Engine<S: System, L: Ledger, K: KVStore, C: Crypto> {
    id: ReplicaId,
    config: ProtocolConfig,
    system: S,
    ledger: L,
    log: PersistentLog<K>,
    crypto: C,
    event_publisher: Option<Sender<Event>>,

    view: ViewNumber,
    active_view: bool,
    cur: ReqInfo,
    last_stable: CheckpointCertificate,

    batcher: Batcher,
    batch_timer: Option<TimerId>,
    batch_due: bool,
    proposing: bool,
    propose_again: bool,
    idle_timer: Option<TimerId>,

    view_changes: BTreeMap<ReplicaId, SignedViewChange>,
    view_change_timer: Option<TimerId>,
    view_change_timeout: Duration,
    view_change_quorum: bool,
    new_view: Option<NewView>,

    backlog: Backlog,
    catch_up: Option<CatchUp>,
    deferred_xset: Option<(Preprepare, ReplicaId)>,
    pending_execution: Option<PendingExecution>,
    halted: bool,
}

impl<S: System, L: Ledger, K: KVStore, C: Crypto> Engine<S, L, K, C> {
    /// Create the engine of replica `id`, restoring its state from the persistent log in `kv_store`
    /// and the last batch executed by `ledger`.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] if `config` cannot tolerate `f` faults or does not contain
    /// `id`, and [`EngineError::Persist`] if the log cannot be read.
    pub fn new(
        id: ReplicaId,
        config: ProtocolConfig,
        system: S,
        ledger: L,
        kv_store: K,
        crypto: C,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        config.validate_id(id)?;

        let last_executed = ledger.last_batch();
        let mut engine = Self {
            id,
            system,
            ledger,
            log: PersistentLog::new(kv_store),
            crypto,
            event_publisher,
            view: ViewNumber::init(),
            active_view: true,
            cur: ReqInfo::executed(last_executed, ViewNumber::init()),
            last_stable: CheckpointCertificate::genesis(),
            batcher: Batcher::new(config.batch_size_limit_bytes),
            batch_timer: None,
            batch_due: false,
            proposing: false,
            propose_again: false,
            idle_timer: None,
            view_changes: BTreeMap::new(),
            view_change_timer: None,
            view_change_timeout: config.view_change_timeout(),
            view_change_quorum: false,
            new_view: None,
            backlog: Backlog::new(config.n, config.backlog_capacity),
            catch_up: None,
            deferred_xset: None,
            pending_execution: None,
            halted: false,
            config,
        };
        engine.cur.checkpoint_done = true;
        engine.restore()?;
        Ok(engine)
    }

    /// Submit a client request to this replica. The request is broadcast to every replica and
    /// eventually executed as part of a batch.
    pub fn request(&mut self, payload: Vec<u8>) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.broadcast(Message::Request(Request::new(payload)))?;
        self.process_backlog()
    }

    /// Handle `message` from `origin`.
    pub fn receive(&mut self, message: Message, origin: ReplicaId) -> Result<(), EngineError> {
        self.ensure_running()?;
        if origin.int() >= self.config.n {
            log::warn!("replica {}: message from unknown replica {}", self.id, origin);
            return Ok(());
        }
        if origin == self.id {
            log::warn!("replica {}: network delivered a message from self", self.id);
            return Ok(());
        }
        self.handle_message(message, origin)?;
        self.process_backlog()
    }

    /// Handle the expiry of `timer`. Timers that were cancelled or superseded are ignored.
    pub fn on_timer(&mut self, timer: TimerId) -> Result<(), EngineError> {
        self.ensure_running()?;
        if self.cur.timeout == Some(timer) {
            self.cur.timeout = None;
            self.request_timeout()?;
        } else if self.idle_timer == Some(timer) {
            self.idle_timer = None;
            self.request_timeout()?;
        } else if self.view_change_timer == Some(timer) {
            self.view_change_timer = None;
            self.view_change_timed_out()?;
        } else if self.batch_timer == Some(timer) {
            self.batch_timer = None;
            self.batch_due = true;
            self.maybe_send_next_batch()?;
        } else {
            log::trace!("replica {}: ignoring stale timer {}", self.id, timer.int());
        }
        self.process_backlog()
    }

    /// Tell the engine that a connection to `peer` was (re-)established.
    pub fn connection(&mut self, peer: ReplicaId) -> Result<(), EngineError> {
        self.ensure_running()?;
        if peer == self.id || peer.int() >= self.config.n {
            return Ok(());
        }
        self.send_hello(peer);
        Ok(())
    }

    /// Give up on the current view and ask for the next one.
    pub fn request_view_change(&mut self) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.send_view_change()?;
        self.process_backlog()
    }

    /// Try again to execute the batch that the [`Ledger`] failed to execute.
    pub fn retry_execution(&mut self) -> Result<(), EngineError> {
        self.ensure_running()?;
        match self.pending_execution.take() {
            None => return Ok(()),
            Some(PendingExecution::Agreed(batch)) => {
                if let Err(error) = self.execute_batch(&batch) {
                    let seq = batch.seq();
                    self.pending_execution = Some(PendingExecution::Agreed(batch));
                    return Err(EngineError::Execute { seq, error });
                }
                if self.cur.seq() == batch.seq() && self.cur.subject.digest == batch.hash() {
                    self.cur.executed = true;
                    self.send_checkpoint()?;
                }
            }
            Some(PendingExecution::Certified(certificate)) => {
                if let Err(error) = self.execute_batch(&certificate.batch) {
                    let seq = certificate.seq();
                    self.pending_execution = Some(PendingExecution::Certified(certificate));
                    return Err(EngineError::Execute { seq, error });
                }
                self.finish_certified(certificate)?;
            }
        }
        self.process_backlog()
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    /// Whether the replica has completed the view change into its current view.
    pub fn is_active(&self) -> bool {
        self.active_view
    }

    /// Whether the replica is the primary of its current view.
    pub fn is_primary(&self) -> bool {
        self.config.primary(self.view) == self.id
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Header of the last batch the ledger executed.
    pub fn last_executed(&self) -> BatchHeader {
        self.ledger.last_batch().header
    }

    pub fn last_stable(&self) -> &CheckpointCertificate {
        &self.last_stable
    }

    /// Number of requests in the local pool.
    pub fn pending_requests(&self) -> usize {
        self.batcher.len()
    }

    /// Number of messages from `origin` waiting in the backlog.
    pub fn backlog_len(&self, origin: ReplicaId) -> usize {
        self.backlog.len(origin)
    }

    /// Whether a decided batch is waiting for [`retry_execution`](Self::retry_execution).
    pub fn has_pending_execution(&self) -> bool {
        self.pending_execution.is_some()
    }

    /// Whether a persistence failure stopped the engine.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.halted {
            Err(EngineError::Halted)
        } else {
            Ok(())
        }
    }

    /// Route `message` to its handler, or into the backlog if it cannot be handled yet.
    fn handle_message(&mut self, message: Message, origin: ReplicaId) -> Result<(), EngineError> {
        if origin != self.id && self.should_backlog(&message) {
            let checkpoint = match &message {
                Message::Checkpoint(checkpoint) => Some((checkpoint.seq, checkpoint.digest)),
                _ => None,
            };
            self.record_backlog(origin, message);
            if let Some((seq, digest)) = checkpoint {
                self.maybe_catch_up_to_checkpoint(seq, digest);
            }
            return Ok(());
        }

        match message {
            Message::Request(request) => self.handle_request(request),
            Message::Preprepare(preprepare) => self.handle_preprepare(preprepare, origin),
            Message::Prepare(subject) => self.handle_prepare(subject, origin),
            Message::Commit(subject) => self.handle_commit(subject, origin),
            Message::Checkpoint(checkpoint) => self.handle_checkpoint(checkpoint, origin),
            Message::ViewChange(svc) => self.handle_view_change(svc, origin),
            Message::NewView(new_view) => self.handle_new_view(new_view, origin),
            Message::Hello(hello) => self.handle_hello(hello, origin),
            Message::StateRequest(request) => {
                self.handle_state_request(request, origin);
                Ok(())
            }
            Message::StateResponse(response) => self.handle_state_response(response, origin),
        }
    }

    /// Send `message` to every other replica, then handle it locally.
    fn broadcast(&mut self, message: Message) -> Result<(), EngineError> {
        self.system.broadcast(message.clone());
        self.handle_message(message, self.id)
    }

    /// Durably record `entry`. A failure halts the engine.
    fn persist(&mut self, seq: SeqNo, entry: LogEntry) -> Result<(), EngineError> {
        if let Err(err) = self.log.persist(seq, &entry) {
            log::error!(
                "replica {}: failed to persist {:?} entry for seq {}, halting: {}",
                self.id,
                entry.tag(),
                seq,
                err
            );
            self.halted = true;
            return Err(EngineError::Persist(err));
        }
        Ok(())
    }

    /// Apply `batch` to the ledger and drop its requests from the pool.
    fn execute_batch(&mut self, batch: &Batch) -> Result<(), ExecuteError> {
        if let Err(err) = self.ledger.execute(batch) {
            log::error!(
                "replica {}: ledger failed to execute seq {}: {}",
                self.id,
                batch.seq(),
                err
            );
            return Err(err);
        }
        log::info!(
            "replica {}: executed seq {} with {} requests",
            self.id,
            batch.seq(),
            batch.requests.len()
        );
        self.batcher.remove_executed(&batch.requests);
        self.publish(Event::ExecuteBatch(ExecuteBatchEvent {
            timestamp: SystemTime::now(),
            header: batch.header,
            requests: batch.requests.len(),
        }));
        Ok(())
    }

    fn publish(&self, event: Event) {
        Event::publish(&self.event_publisher, event)
    }

    fn cancel_timer(&mut self, timer: Option<TimerId>) {
        if let Some(timer) = timer {
            self.system.cancel_timer(timer);
        }
    }

    fn cancel_request_timer(&mut self) {
        let timer = self.cur.timeout.take();
        self.cancel_timer(timer);
    }

    fn cancel_idle_timer(&mut self) {
        let timer = self.idle_timer.take();
        self.cancel_timer(timer);
    }

    fn cancel_batch_timer(&mut self) {
        let timer = self.batch_timer.take();
        self.cancel_timer(timer);
        self.batch_due = false;
    }

    /// (Re)start the view change timer with the current view change timeout.
    fn arm_view_change_timer(&mut self) {
        let timer = self.view_change_timer.take();
        self.cancel_timer(timer);
        self.view_change_timer = Some(self.system.set_timer(self.view_change_timeout));
    }

    /// Cancel the view change timer and reset the view change timeout to its initial value.
    fn cancel_view_change_timer(&mut self) {
        let timer = self.view_change_timer.take();
        self.cancel_timer(timer);
        self.view_change_timeout = self.config.view_change_timeout();
    }
}

/// Error returned by the engine's input methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// The protocol parameters are unusable. The engine was not created.
    Config(ConfigError),

    /// A decision could not be durably recorded. The engine halted.
    Persist(PersistError),

    /// The ledger failed to execute the batch decided for `seq`. The engine keeps running and
    /// executes the batch on [`retry_execution`](Engine::retry_execution).
    Execute { seq: SeqNo, error: ExecuteError },

    /// The engine halted after an earlier persistence failure and accepts no more input.
    Halted,
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        EngineError::Config(value)
    }
}

impl From<PersistError> for EngineError {
    fn from(value: PersistError) -> Self {
        EngineError::Persist(value)
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(err) => write!(f, "invalid configuration: {}", err),
            EngineError::Persist(err) => write!(f, "persistence failure: {}", err),
            EngineError::Execute { seq, error } => write!(f, "seq {}: {}", seq, error),
            EngineError::Halted => write!(f, "engine halted after a persistence failure"),
        }
    }
}

impl std::error::Error for EngineError {}
