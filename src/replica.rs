/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica in its own threads.
//!
//! sbft-rs replicates a [`Ledger`] across `n` processes, called replicas, of which up to `f` may be
//! Byzantine. Each replica is identified by the position of its
//! [Ed25519 verifying key](ed25519_dalek::VerifyingKey) in the replica list that every replica is
//! configured with.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [`ReplicaSpec`],
//! - The function to [start](ReplicaSpec::start) a [`Replica`] given its specification,
//! - [The type](Replica) which keeps the replica alive and accepts client requests.
//!
//! A replica runs three threads: the poller, which takes messages off the [`Network`]; the
//! algorithm thread, which owns the [engine](crate::engine); and, if any event handler is
//! registered or event logging is enabled, the event bus.
//!
//! ## Starting a replica
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .configuration(configuration)
//!     .ledger(ledger)
//!     .kv_store(kv_store)
//!     .network(network)
//!     .on_execute_batch(execute_handler)
//!     .build()
//!     .start()?;
//!
//! replica.submit(b"transfer 10 from alice to bob".to_vec());
//! ```
//!
//! The replica's [configuration](Configuration) is also defined using the builder pattern:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(signing_key)
//!     .replicas(verifying_keys)
//!     .protocol(
//!         ProtocolConfig::builder()
//!         .n(4)
//!         .f(1)
//!         .batch_duration_limit(Duration::from_millis(100))
//!         .batch_size_limit_bytes(64 * 1024)
//!         .request_timeout(Duration::from_secs(5))
//!         .build()
//!     )
//!     .log_events(true)
//!     .build()
//! ```

use std::{
    sync::mpsc::{self, Sender},
    thread::JoinHandle,
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use typed_builder::TypedBuilder;

use crate::{
    algorithm::{self, Algorithm, Input, ReplicaSystem},
    config::{ConfigError, ProtocolConfig},
    engine::{Engine, EngineError},
    event_bus::*,
    events::*,
    networking::{network::Network, receiving::start_polling},
    persistent_log::pluggables::KVStore,
    system::Ledger,
    types::crypto_primitives::Ed25519Crypto,
};

/// Stores the user-defined parameters required to start the replica, that is:
/// 1. The replica's [signing key](ed25519_dalek::SigningKey).
/// 2. The verifying keys of every replica, in replica id order. The local replica's id is the
///    position of its own verifying key in this list.
/// 3. The [protocol parameters](ProtocolConfig), which must be the same at every replica.
/// 4. The "Log Events" flag. If set to "true", every [event](crate::events) is printed in the
///    [format](crate::logging) of the default loggers.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.replicas(...)`
    - `.protocol(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's signing key, used to sign checkpoints and view changes. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the verifying keys of all replicas, in replica id order. Required."))]
    pub replicas: Vec<VerifyingKey>,
    #[builder(setter(doc = "Set the [protocol parameters](ProtocolConfig). Required."))]
    pub protocol: ProtocolConfig,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run the [`Replica`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.configuration(...)`
    - `.ledger(...)`
    - `.kv_store(...)`
    - `.network(...)`

    Optional:
    - `.on_execute_batch(...)`
    - `.on_stable_checkpoint(...)`
    - `.on_checkpoint_divergence(...)`
    - `.on_propose(...)`
    - `.on_prepare(...)`
    - `.on_commit(...)`
    - `.on_receive_preprepare(...)`
    - `.on_receive_view_change(...)`
    - `.on_backlog_overflow(...)`
    - `.on_request_timeout(...)`
    - `.on_send_view_change(...)`
    - `.on_view_change_timeout(...)`
    - `.on_send_new_view(...)`
    - `.on_enter_view(...)`
"))]
pub struct ReplicaSpec<K: KVStore, L: Ledger + Send + 'static, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    #[builder(setter(doc = "Set the state machine that agreed batches are applied to. The argument must implement the [Ledger] trait. Required."))]
    ledger: L,
    #[builder(setter(doc = "Set the key-value store that holds the replica's persistent log. The argument must implement the [KVStore] trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network] trait. Required."))]
    network: N,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&ExecuteBatchEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecuteBatchEvent>),
    doc = "Register a handler closure to be invoked after the ledger executes a batch. Optional."))]
    on_execute_batch: Option<HandlerPtr<ExecuteBatchEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StableCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StableCheckpointEvent>),
    doc = "Register a handler closure to be invoked after a sequence number becomes stable. Optional."))]
    on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CheckpointDivergenceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CheckpointDivergenceEvent>),
    doc = "Register a handler closure to be invoked if a quorum checkpoints a batch other than the one executed locally. Optional."))]
    on_checkpoint_divergence: Option<HandlerPtr<CheckpointDivergenceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica, as primary, proposes a batch. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a prepare. Optional."))]
    on_prepare: Option<HandlerPtr<PrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePreprepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePreprepareEvent>),
    doc = "Register a handler closure to be invoked after the replica accepts a preprepare. Optional."))]
    on_receive_preprepare: Option<HandlerPtr<ReceivePreprepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica records a peer's view change. Optional."))]
    on_receive_view_change: Option<HandlerPtr<ReceiveViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BacklogOverflowEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BacklogOverflowEvent>),
    doc = "Register a handler closure to be invoked after a buffered message is dropped from a full backlog. Optional."))]
    on_backlog_overflow: Option<HandlerPtr<BacklogOverflowEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestTimeoutEvent>),
    doc = "Register a handler closure to be invoked after the replica gives up waiting for a decision. Optional."))]
    on_request_timeout: Option<HandlerPtr<RequestTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a view change. Optional."))]
    on_send_view_change: Option<HandlerPtr<SendViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewChangeTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewChangeTimeoutEvent>),
    doc = "Register a handler closure to be invoked after a view change fails to complete in time. Optional."))]
    on_view_change_timeout: Option<HandlerPtr<ViewChangeTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendNewViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendNewViewEvent>),
    doc = "Register a handler closure to be invoked after the replica, as the next primary, broadcasts a new view. Optional."))]
    on_send_new_view: Option<HandlerPtr<SendNewViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EnterViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EnterViewEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new view. Optional."))]
    on_enter_view: Option<HandlerPtr<EnterViewEvent>>,
}

impl<K: KVStore, L: Ledger + Send + 'static, N: Network + 'static> ReplicaSpec<K, L, N> {
    /// Restore the replica's state and start all threads and channels associated with running it,
    /// returning the handles to them in a [`Replica`] struct.
    ///
    /// # Errors
    /// Fails without starting any thread if the configuration is invalid or the persistent log
    /// cannot be read.
    pub fn start(self) -> Result<Replica, EngineError> {
        let Configuration {
            me,
            replicas,
            protocol,
            log_events,
        } = self.configuration;
        if replicas.len() as u64 != protocol.n {
            return Err(ConfigError::ReplicaListMismatch {
                listed: replicas.len(),
                n: protocol.n,
            }
            .into());
        }
        let crypto = Ed25519Crypto::new(me, replicas);
        let id = crypto.my_id().ok_or(ConfigError::NotAReplica)?;

        let event_handlers = EventHandlers::new(
            log_events,
            UserHandlers {
                on_execute_batch: self.on_execute_batch,
                on_stable_checkpoint: self.on_stable_checkpoint,
                on_checkpoint_divergence: self.on_checkpoint_divergence,
                on_propose: self.on_propose,
                on_prepare: self.on_prepare,
                on_commit: self.on_commit,
                on_receive_preprepare: self.on_receive_preprepare,
                on_receive_view_change: self.on_receive_view_change,
                on_backlog_overflow: self.on_backlog_overflow,
                on_request_timeout: self.on_request_timeout,
                on_send_view_change: self.on_send_view_change,
                on_view_change_timeout: self.on_view_change_timeout,
                on_send_new_view: self.on_send_new_view,
                on_enter_view: self.on_enter_view,
            },
        );
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let system = ReplicaSystem::new(id, protocol.n, self.network.clone());
        let engine = Engine::new(
            id,
            protocol,
            system,
            self.ledger,
            self.kv_store,
            crypto,
            event_publisher,
        )?;

        let (to_algorithm, inputs) = mpsc::channel();
        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network, to_algorithm.clone(), poller_shutdown_receiver);

        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = Algorithm::new(engine, inputs, algorithm_shutdown_receiver).start();

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let handle = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
                (Some(handle), Some(shutdown))
            }
            None => (None, None),
        };

        log::info!("replica {}: started", id);
        Ok(Replica {
            to_algorithm,
            poller: Some(poller),
            poller_shutdown,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a replica. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Replica {
    to_algorithm: Sender<Input>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Replica {
    /// Submit a client request. The request is broadcast to every replica and eventually executed as
    /// part of a batch. Returns `false` if the replica has stopped.
    pub fn submit(&self, payload: Vec<u8>) -> bool {
        algorithm::submit(&self.to_algorithm, payload)
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The algorithm thread publishes events and the poller feeds the algorithm thread, so each is
        // stopped before the thread it depends on. A thread that already exited has dropped its
        // shutdown receiver, so send errors are expected.
        if let Some(shutdown) = &self.event_bus_shutdown {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.algorithm_shutdown.send(());
        if let Some(algorithm) = self.algorithm.take() {
            let _ = algorithm.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}
