/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [configuration](crate::replica::Configuration).
//!
//! sbft-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceivePreprepare](crate::events::ReceivePreprepareEvent) is printed:
//!
//! ```text
//! ReceivePreprepare, 1701329264, 2, 7, 1, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the id of the primary that sent the preprepare.
//! - The fourth value is the sequence number of the proposed batch.
//! - The fifth value is the view the batch was proposed in.
//! - The sixth value is the first seven characters of the Base64 encoding of the batch's digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::{
    events::*,
    networking::messages::XSet,
    types::{data_types::CryptoHash, subject::Subject},
};

// Names of each event in PascalCase for printing:
pub const EXECUTE_BATCH: &str = "ExecuteBatch";
pub const STABLE_CHECKPOINT: &str = "StableCheckpoint";
pub const CHECKPOINT_DIVERGENCE: &str = "CheckpointDivergence";

pub const PROPOSE: &str = "Propose";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";

pub const RECEIVE_PREPREPARE: &str = "ReceivePreprepare";
pub const RECEIVE_VIEW_CHANGE: &str = "ReceiveViewChange";
pub const BACKLOG_OVERFLOW: &str = "BacklogOverflow";

pub const REQUEST_TIMEOUT: &str = "RequestTimeout";
pub const SEND_VIEW_CHANGE: &str = "SendViewChange";
pub const VIEW_CHANGE_TIMEOUT: &str = "ViewChangeTimeout";
pub const SEND_NEW_VIEW: &str = "SendNewView";
pub const ENTER_VIEW: &str = "EnterView";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ExecuteBatchEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execute_batch_event: &ExecuteBatchEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                EXECUTE_BATCH,
                secs_since_unix_epoch(execute_batch_event.timestamp),
                execute_batch_event.header.seq,
                first_seven_base64_chars(&execute_batch_event.header.hash()),
                execute_batch_event.requests
            )
        };
        Box::new(logger)
    }
}

impl Logger for StableCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stable_checkpoint_event: &StableCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                STABLE_CHECKPOINT,
                secs_since_unix_epoch(stable_checkpoint_event.timestamp),
                stable_checkpoint_event.seq,
                first_seven_base64_chars(&stable_checkpoint_event.digest)
            )
        };
        Box::new(logger)
    }
}

impl Logger for CheckpointDivergenceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |divergence_event: &CheckpointDivergenceEvent| {
            log::error!(
                "{}, {}, {}, {}, {}",
                CHECKPOINT_DIVERGENCE,
                secs_since_unix_epoch(divergence_event.timestamp),
                divergence_event.seq,
                first_seven_base64_chars(&divergence_event.local_digest),
                first_seven_base64_chars(&divergence_event.quorum_digest)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                subject_info(&propose_event.subject),
                propose_event.requests
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepare_event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(prepare_event.timestamp),
                subject_info(&prepare_event.subject)
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                subject_info(&commit_event.subject)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePreprepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_preprepare_event: &ReceivePreprepareEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_PREPREPARE,
                secs_since_unix_epoch(receive_preprepare_event.timestamp),
                receive_preprepare_event.origin,
                subject_info(&receive_preprepare_event.subject)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_view_change_event: &ReceiveViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_VIEW_CHANGE,
                secs_since_unix_epoch(receive_view_change_event.timestamp),
                receive_view_change_event.origin,
                receive_view_change_event.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for BacklogOverflowEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |backlog_overflow_event: &BacklogOverflowEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                BACKLOG_OVERFLOW,
                secs_since_unix_epoch(backlog_overflow_event.timestamp),
                backlog_overflow_event.origin,
                backlog_overflow_event.evicted
            )
        };
        Box::new(logger)
    }
}

impl Logger for RequestTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |request_timeout_event: &RequestTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                REQUEST_TIMEOUT,
                secs_since_unix_epoch(request_timeout_event.timestamp),
                request_timeout_event.view,
                request_timeout_event.seq
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_view_change_event: &SendViewChangeEvent| {
            log::info!(
                "{}, {}, {}",
                SEND_VIEW_CHANGE,
                secs_since_unix_epoch(send_view_change_event.timestamp),
                send_view_change_event.view
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewChangeTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_change_timeout_event: &ViewChangeTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VIEW_CHANGE_TIMEOUT,
                secs_since_unix_epoch(view_change_timeout_event.timestamp),
                view_change_timeout_event.view,
                view_change_timeout_event.next_timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendNewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_new_view_event: &SendNewViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SEND_NEW_VIEW,
                secs_since_unix_epoch(send_new_view_event.timestamp),
                send_new_view_event.view,
                xset_info(&send_new_view_event.xset)
            )
        };
        Box::new(logger)
    }
}

impl Logger for EnterViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |enter_view_event: &EnterViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ENTER_VIEW,
                secs_since_unix_epoch(enter_view_event.timestamp),
                enter_view_event.view,
                enter_view_event.primary
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a hash by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(hash: &CryptoHash) -> String {
    let encoded = STANDARD_NO_PAD.encode(hash.bytes());
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

// Events carry wall-clock timestamps. A clock set before the epoch prints as 0.
fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|since| since.as_secs())
        .unwrap_or_default()
}

fn subject_info(subject: &Subject) -> String {
    format!(
        "{}, {}, {}",
        subject.seq_no(),
        subject.view(),
        first_seven_base64_chars(&subject.digest)
    )
}

fn xset_info(xset: &XSet) -> String {
    match xset {
        XSet::Reproposal(subject) => format!("Reproposal, {}", subject_info(subject)),
        XSet::Null(seq) => format!("Null, {}, {}", seq.seq, seq.view),
    }
}
