/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) from the algorithm thread and passes
//! each of them to the handlers registered for its type.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Handlers for every type of event. The default logger for an event type, if logging is enabled,
/// comes before the user's handler.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) execute_batch_handlers: Vec<HandlerPtr<ExecuteBatchEvent>>,
    pub(crate) stable_checkpoint_handlers: Vec<HandlerPtr<StableCheckpointEvent>>,
    pub(crate) checkpoint_divergence_handlers: Vec<HandlerPtr<CheckpointDivergenceEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) prepare_handlers: Vec<HandlerPtr<PrepareEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) receive_preprepare_handlers: Vec<HandlerPtr<ReceivePreprepareEvent>>,
    pub(crate) receive_view_change_handlers: Vec<HandlerPtr<ReceiveViewChangeEvent>>,
    pub(crate) backlog_overflow_handlers: Vec<HandlerPtr<BacklogOverflowEvent>>,
    pub(crate) request_timeout_handlers: Vec<HandlerPtr<RequestTimeoutEvent>>,
    pub(crate) send_view_change_handlers: Vec<HandlerPtr<SendViewChangeEvent>>,
    pub(crate) view_change_timeout_handlers: Vec<HandlerPtr<ViewChangeTimeoutEvent>>,
    pub(crate) send_new_view_handlers: Vec<HandlerPtr<SendNewViewEvent>>,
    pub(crate) enter_view_handlers: Vec<HandlerPtr<EnterViewEvent>>,
}

/// Put the default logger (if `log_events`) and then the user's handler (if any) into `handlers`.
fn register<T: Logger>(
    handlers: &mut Vec<HandlerPtr<T>>,
    log_events: bool,
    user_handler: Option<HandlerPtr<T>>,
) {
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
}

/// The handlers a user can register through [`ReplicaSpec`](crate::replica::ReplicaSpec), one
/// optional handler per event type.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_execute_batch: Option<HandlerPtr<ExecuteBatchEvent>>,
    pub(crate) on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
    pub(crate) on_checkpoint_divergence: Option<HandlerPtr<CheckpointDivergenceEvent>>,
    pub(crate) on_propose: Option<HandlerPtr<ProposeEvent>>,
    pub(crate) on_prepare: Option<HandlerPtr<PrepareEvent>>,
    pub(crate) on_commit: Option<HandlerPtr<CommitEvent>>,
    pub(crate) on_receive_preprepare: Option<HandlerPtr<ReceivePreprepareEvent>>,
    pub(crate) on_receive_view_change: Option<HandlerPtr<ReceiveViewChangeEvent>>,
    pub(crate) on_backlog_overflow: Option<HandlerPtr<BacklogOverflowEvent>>,
    pub(crate) on_request_timeout: Option<HandlerPtr<RequestTimeoutEvent>>,
    pub(crate) on_send_view_change: Option<HandlerPtr<SendViewChangeEvent>>,
    pub(crate) on_view_change_timeout: Option<HandlerPtr<ViewChangeTimeoutEvent>>,
    pub(crate) on_send_new_view: Option<HandlerPtr<SendNewViewEvent>>,
    pub(crate) on_enter_view: Option<HandlerPtr<EnterViewEvent>>,
}

impl EventHandlers {
    pub(crate) fn new(log_events: bool, user: UserHandlers) -> Self {
        let mut handlers = Self::default();
        register(&mut handlers.execute_batch_handlers, log_events, user.on_execute_batch);
        register(
            &mut handlers.stable_checkpoint_handlers,
            log_events,
            user.on_stable_checkpoint,
        );
        register(
            &mut handlers.checkpoint_divergence_handlers,
            log_events,
            user.on_checkpoint_divergence,
        );
        register(&mut handlers.propose_handlers, log_events, user.on_propose);
        register(&mut handlers.prepare_handlers, log_events, user.on_prepare);
        register(&mut handlers.commit_handlers, log_events, user.on_commit);
        register(
            &mut handlers.receive_preprepare_handlers,
            log_events,
            user.on_receive_preprepare,
        );
        register(
            &mut handlers.receive_view_change_handlers,
            log_events,
            user.on_receive_view_change,
        );
        register(
            &mut handlers.backlog_overflow_handlers,
            log_events,
            user.on_backlog_overflow,
        );
        register(
            &mut handlers.request_timeout_handlers,
            log_events,
            user.on_request_timeout,
        );
        register(
            &mut handlers.send_view_change_handlers,
            log_events,
            user.on_send_view_change,
        );
        register(
            &mut handlers.view_change_timeout_handlers,
            log_events,
            user.on_view_change_timeout,
        );
        register(&mut handlers.send_new_view_handlers, log_events, user.on_send_new_view);
        register(&mut handlers.enter_view_handlers, log_events, user.on_enter_view);
        handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.execute_batch_handlers.is_empty()
            && self.stable_checkpoint_handlers.is_empty()
            && self.checkpoint_divergence_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.receive_preprepare_handlers.is_empty()
            && self.receive_view_change_handlers.is_empty()
            && self.backlog_overflow_handlers.is_empty()
            && self.request_timeout_handlers.is_empty()
            && self.send_view_change_handlers.is_empty()
            && self.view_change_timeout_handlers.is_empty()
            && self.send_new_view_handlers.is_empty()
            && self.enter_view_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ExecuteBatch(execute_batch_event) => self
                .execute_batch_handlers
                .iter()
                .for_each(|handler| handler(&execute_batch_event)),

            Event::StableCheckpoint(stable_checkpoint_event) => self
                .stable_checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&stable_checkpoint_event)),

            Event::CheckpointDivergence(checkpoint_divergence_event) => self
                .checkpoint_divergence_handlers
                .iter()
                .for_each(|handler| handler(&checkpoint_divergence_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::Prepare(prepare_event) => self
                .prepare_handlers
                .iter()
                .for_each(|handler| handler(&prepare_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::ReceivePreprepare(receive_preprepare_event) => self
                .receive_preprepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_preprepare_event)),

            Event::ReceiveViewChange(receive_view_change_event) => self
                .receive_view_change_handlers
                .iter()
                .for_each(|handler| handler(&receive_view_change_event)),

            Event::BacklogOverflow(backlog_overflow_event) => self
                .backlog_overflow_handlers
                .iter()
                .for_each(|handler| handler(&backlog_overflow_event)),

            Event::RequestTimeout(request_timeout_event) => self
                .request_timeout_handlers
                .iter()
                .for_each(|handler| handler(&request_timeout_event)),

            Event::SendViewChange(send_view_change_event) => self
                .send_view_change_handlers
                .iter()
                .for_each(|handler| handler(&send_view_change_event)),

            Event::ViewChangeTimeout(view_change_timeout_event) => self
                .view_change_timeout_handlers
                .iter()
                .for_each(|handler| handler(&view_change_timeout_event)),

            Event::SendNewView(send_new_view_event) => self
                .send_new_view_handlers
                .iter()
                .for_each(|handler| handler(&send_new_view_event)),

            Event::EnterView(enter_view_event) => self
                .enter_view_handlers
                .iter()
                .for_each(|handler| handler(&enter_view_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // The algorithm thread exits on its own only if the engine halted. Wait for shutdown.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(10)),
        }
    })
}
