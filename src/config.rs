/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Protocol parameters shared by every replica of a deployment, and the quorum sizes derived from
//! them.

use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::types::data_types::{ReplicaId, ViewNumber};

/// Default number of buffered future messages kept per sender.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 4 * 3;

/// Parameters of the agreement protocol. All replicas of a deployment must use the same values for
/// `n` and `f`.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ProtocolConfig]. On the builder call the following methods to construct a valid [ProtocolConfig].

    Required:
    - `.n(...)`
    - `.f(...)`
    - `.batch_duration_limit(...)`
    - `.batch_size_limit_bytes(...)`
    - `.request_timeout(...)`

    Optional:
    - `.view_change_timeout(...)`
    - `.backlog_capacity(...)`
"))]
pub struct ProtocolConfig {
    #[builder(setter(doc = "Set the number of replicas. Required."))]
    pub n: u64,
    #[builder(setter(doc = "Set the number of Byzantine replicas tolerated. Required."))]
    pub f: u64,
    #[builder(setter(
        doc = "Set how long the primary waits for more requests before proposing a batch that is smaller than the size limit. Required."
    ))]
    pub batch_duration_limit: Duration,
    #[builder(setter(
        doc = "Set the number of payload bytes at which the primary proposes a batch immediately. Required."
    ))]
    pub batch_size_limit_bytes: u64,
    #[builder(setter(
        doc = "Set how long a sequence may stay undecided before the replica asks for a view change. Required."
    ))]
    pub request_timeout: Duration,
    #[builder(default, setter(strip_option,
        doc = "Set the initial time allowed for a view change to complete. Doubles on every failed attempt. Defaults to twice the request timeout."
    ))]
    view_change_timeout: Option<Duration>,
    #[builder(default = DEFAULT_BACKLOG_CAPACITY, setter(
        doc = "Set how many future messages are buffered per sender. Defaults to 12."
    ))]
    pub backlog_capacity: usize,
}

impl ProtocolConfig {
    /// Check the constraints on the replica set size and the batch size limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n == 0 {
            return Err(ConfigError::ZeroReplicas);
        }
        if self.n < 3 * self.f + 1 {
            return Err(ConfigError::TooFewReplicas {
                n: self.n,
                f: self.f,
            });
        }
        if self.batch_size_limit_bytes == 0 {
            return Err(ConfigError::ZeroBatchSizeLimit);
        }
        Ok(())
    }

    /// Check that `id` names a replica in this configuration.
    pub fn validate_id(&self, id: ReplicaId) -> Result<(), ConfigError> {
        if id.int() >= self.n {
            return Err(ConfigError::ReplicaIdOutOfRange { id, n: self.n });
        }
        Ok(())
    }

    /// The initial view change timeout.
    pub fn view_change_timeout(&self) -> Duration {
        self.view_change_timeout.unwrap_or(self.request_timeout * 2)
    }

    /// `2f + 1`: the size of a quorum that contains at least `f + 1` correct replicas.
    pub fn no_faulty_quorum(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// `f + 1`: the size of a quorum that contains at least one correct replica.
    pub fn one_correct_quorum(&self) -> usize {
        (self.f + 1) as usize
    }

    /// The primary of `view`.
    pub fn primary(&self, view: ViewNumber) -> ReplicaId {
        ReplicaId::new(view.int() % self.n)
    }

    /// Iterate over every replica id.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> {
        (0..self.n).map(ReplicaId::new)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    ZeroReplicas,
    TooFewReplicas { n: u64, f: u64 },
    ReplicaIdOutOfRange { id: ReplicaId, n: u64 },
    ZeroBatchSizeLimit,
    /// The number of verifying keys given does not match `n`.
    ReplicaListMismatch { listed: usize, n: u64 },
    /// The local signing key's verifying key is not in the replica list.
    NotAReplica,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroReplicas => write!(f, "the replica set is empty"),
            ConfigError::TooFewReplicas { n, f: faulty } => write!(
                f,
                "{} replicas cannot tolerate {} faults, at least {} are needed",
                n,
                faulty,
                3 * faulty + 1
            ),
            ConfigError::ReplicaIdOutOfRange { id, n } => {
                write!(f, "replica id {} is not below n = {}", id, n)
            }
            ConfigError::ZeroBatchSizeLimit => {
                write!(f, "the batch size limit must be at least one byte")
            }
            ConfigError::ReplicaListMismatch { listed, n } => {
                write!(f, "{} verifying keys listed for n = {} replicas", listed, n)
            }
            ConfigError::NotAReplica => {
                write!(f, "the local verifying key is not in the replica list")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(n: u64, f: u64) -> ProtocolConfig {
        ProtocolConfig::builder()
            .n(n)
            .f(f)
            .batch_duration_limit(Duration::from_secs(2))
            .batch_size_limit_bytes(10)
            .request_timeout(Duration::from_secs(20))
            .build()
    }

    #[test]
    fn replica_set_must_tolerate_f_faults() {
        assert_eq!(config(4, 1).validate(), Ok(()));
        assert_eq!(config(1, 0).validate(), Ok(()));
        assert_eq!(config(7, 2).validate(), Ok(()));
        assert_eq!(
            config(3, 1).validate(),
            Err(ConfigError::TooFewReplicas { n: 3, f: 1 })
        );
        assert_eq!(config(0, 0).validate(), Err(ConfigError::ZeroReplicas));
    }

    #[test]
    fn batch_size_limit_must_be_positive() {
        let mut config = config(4, 1);
        config.batch_size_limit_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSizeLimit));

        config.batch_size_limit_bytes = 1;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn quorums_and_primaries() {
        let config = config(4, 1);
        assert_eq!(config.no_faulty_quorum(), 3);
        assert_eq!(config.one_correct_quorum(), 2);
        assert_eq!(config.primary(ViewNumber::new(0)), ReplicaId::new(0));
        assert_eq!(config.primary(ViewNumber::new(5)), ReplicaId::new(1));
        assert_eq!(config.view_change_timeout(), Duration::from_secs(40));
        assert_eq!(config.backlog_capacity, DEFAULT_BACKLOG_CAPACITY);
        assert!(config.validate_id(ReplicaId::new(4)).is_err());
    }
}
