/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`PersistentLog`] and the entries it stores.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::messages::{NewView, Preprepare, SignedViewChange},
    types::{certificates::CheckpointCertificate, data_types::SeqNo, subject::Subject},
};

use super::{
    pluggables::{KVStore, KVWriteError, WriteBatch},
    variables::{self, concat},
};

/// The kind of decision a log entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogTag {
    Preprepare,
    Prepare,
    Commit,
    Checkpoint,
    ViewChange,
    NewView,
}

impl LogTag {
    pub const ALL: [LogTag; 6] = [
        LogTag::Preprepare,
        LogTag::Prepare,
        LogTag::Commit,
        LogTag::Checkpoint,
        LogTag::ViewChange,
        LogTag::NewView,
    ];

    /// The byte that identifies this tag in storage keys.
    pub const fn byte(&self) -> u8 {
        match self {
            LogTag::Preprepare => 0,
            LogTag::Prepare => 1,
            LogTag::Commit => 2,
            LogTag::Checkpoint => 3,
            LogTag::ViewChange => 4,
            LogTag::NewView => 5,
        }
    }
}

/// A decision recorded in the persistent log.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum LogEntry {
    /// A preprepare the replica accepted (or, as primary, sent).
    Preprepare(Preprepare),

    /// A subject the replica sent a prepare for.
    Prepare(Subject),

    /// A subject the replica sent a commit for.
    Commit(Subject),

    /// A checkpoint that became stable.
    Checkpoint(CheckpointCertificate),

    /// A view change the replica sent.
    ViewChange(SignedViewChange),

    /// A new view the replica adopted.
    NewView(NewView),
}

impl LogEntry {
    pub fn tag(&self) -> LogTag {
        match self {
            LogEntry::Preprepare(_) => LogTag::Preprepare,
            LogEntry::Prepare(_) => LogTag::Prepare,
            LogEntry::Commit(_) => LogTag::Commit,
            LogEntry::Checkpoint(_) => LogTag::Checkpoint,
            LogEntry::ViewChange(_) => LogTag::ViewChange,
            LogEntry::NewView(_) => LogTag::NewView,
        }
    }
}

/// The newest entry of every tag, as read back on restart.
#[derive(Clone, Debug, Default)]
pub struct RestoredLog {
    pub preprepare: Option<Preprepare>,
    pub prepare: Option<Subject>,
    pub commit: Option<Subject>,
    pub checkpoint: Option<CheckpointCertificate>,
    pub view_change: Option<SignedViewChange>,
    pub new_view: Option<NewView>,
}

/// Append-only, per-sequence record of a replica's decisions, stored in a [`KVStore`].
///
/// Entries are keyed by (tag, sequence number). Writing an entry for a (tag, sequence number) pair
/// that already has one replaces it. The newest entry of each tag survives
/// [pruning](Self::prune_below).
pub struct PersistentLog<K: KVStore> {
    kv_store: K,
}

impl<K: KVStore> PersistentLog<K> {
    pub fn new(kv_store: K) -> Self {
        Self { kv_store }
    }

    /// Durably record `entry` under its tag and `seq`.
    pub fn persist(&mut self, seq: SeqNo, entry: &LogEntry) -> Result<(), PersistError> {
        let tag = entry.tag();
        let mut seqs = self.seqs(tag)?;
        if !seqs.contains(&seq) {
            seqs.push(seq);
            seqs.sort();
        }

        let mut wb = K::WriteBatch::new();
        wb.set(&entry_key(tag, seq), &encode(entry)?);
        wb.set(&latest_key(tag), &encode(&seq)?);
        wb.set(&seqs_key(tag), &encode(&seqs)?);
        self.kv_store.write(wb).map_err(PersistError::Write)
    }

    /// Get the entry recorded under `tag` and `seq`.
    pub fn entry(&self, tag: LogTag, seq: SeqNo) -> Result<Option<LogEntry>, PersistError> {
        self.get(&entry_key(tag, seq))
    }

    /// Get the most recently written entry of `tag`.
    pub fn latest(&self, tag: LogTag) -> Result<Option<LogEntry>, PersistError> {
        match self.get::<SeqNo>(&latest_key(tag))? {
            Some(seq) => self.entry(tag, seq),
            None => Ok(None),
        }
    }

    /// Get the sequence numbers of every entry of `tag`, in ascending order.
    pub fn seqs(&self, tag: LogTag) -> Result<Vec<SeqNo>, PersistError> {
        Ok(self.get(&seqs_key(tag))?.unwrap_or_default())
    }

    /// Delete every entry with a sequence number below `seq`, except the newest entry of each tag.
    pub fn prune_below(&mut self, seq: SeqNo) -> Result<(), PersistError> {
        let mut wb = K::WriteBatch::new();
        let mut pruned_any = false;

        for tag in LogTag::ALL {
            let latest = self.get::<SeqNo>(&latest_key(tag))?;
            let seqs = self.seqs(tag)?;
            let (pruned, kept): (Vec<SeqNo>, Vec<SeqNo>) = seqs
                .into_iter()
                .partition(|s| *s < seq && Some(*s) != latest);

            if pruned.is_empty() {
                continue;
            }
            pruned_any = true;
            for s in pruned {
                wb.delete(&entry_key(tag, s));
            }
            wb.set(&seqs_key(tag), &encode(&kept)?);
        }

        if pruned_any {
            self.kv_store.write(wb).map_err(PersistError::Write)?;
        }
        Ok(())
    }

    /// Read the newest entry of every tag.
    pub fn restore(&self) -> Result<RestoredLog, PersistError> {
        let mut restored = RestoredLog::default();
        for tag in LogTag::ALL {
            match self.latest(tag)? {
                Some(LogEntry::Preprepare(preprepare)) => restored.preprepare = Some(preprepare),
                Some(LogEntry::Prepare(subject)) => restored.prepare = Some(subject),
                Some(LogEntry::Commit(subject)) => restored.commit = Some(subject),
                Some(LogEntry::Checkpoint(certificate)) => {
                    restored.checkpoint = Some(certificate)
                }
                Some(LogEntry::ViewChange(svc)) => restored.view_change = Some(svc),
                Some(LogEntry::NewView(new_view)) => restored.new_view = Some(new_view),
                None => (),
            }
        }
        Ok(restored)
    }

    fn get<T: BorshDeserialize>(&self, key: &[u8]) -> Result<Option<T>, PersistError> {
        match self.kv_store.get(key) {
            Some(bytes) => T::deserialize(&mut bytes.as_slice())
                .map(Some)
                .map_err(|err| PersistError::Decode {
                    key: key.to_vec(),
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }
}

fn entry_key(tag: LogTag, seq: SeqNo) -> Vec<u8> {
    concat(&concat(&variables::ENTRIES, &[tag.byte()]), &seq.to_be_bytes())
}

fn latest_key(tag: LogTag) -> Vec<u8> {
    concat(&variables::LATEST, &[tag.byte()])
}

fn seqs_key(tag: LogTag) -> Vec<u8> {
    concat(&variables::SEQS, &[tag.byte()])
}

fn encode<T: BorshSerialize>(value: &T) -> Result<Vec<u8>, PersistError> {
    value.try_to_vec().map_err(|err| PersistError::Encode {
        reason: err.to_string(),
    })
}

/// Error reading from or writing to the [`PersistentLog`].
///
/// Any of these is fatal to the replica: it must not make decisions it cannot durably record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistError {
    Write(KVWriteError),
    Encode { reason: String },
    Decode { key: Vec<u8>, reason: String },
}

impl Display for PersistError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Write(err) => write!(f, "{}", err),
            PersistError::Encode { reason } => write!(f, "failed to encode log entry: {}", reason),
            PersistError::Decode { key, reason } => {
                write!(f, "failed to decode log value at {:?}: {}", key, reason)
            }
        }
    }
}

impl std::error::Error for PersistError {}
