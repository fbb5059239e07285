//! Identifiers and configuration errors shared by the partitioner, the aggregator and the round
//! driver.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(
    Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From, Into, Serialize, Deserialize,
)]
#[display(fmt = "client-{}", _0)]
/// A client identifier. A client owns the partition with the same index.
pub struct ClientId(usize);

impl ClientId {
    /// Returns the identifier of the client owning the partition at `index`.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the index of the partition owned by this client.
    pub fn index(self) -> usize {
        self.0
    }
}

/// The number of a federated round, starting at `1`. Round `0` denotes the initial model.
pub type RoundId = u64;

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to invalid partitioning or aggregation parameters.
///
/// These are raised before any round starts.
pub enum ConfigurationError {
    #[error("the number of clients must be positive")]
    NoClients,

    #[error("expected {expected} clients, but {actual} partitions were provided")]
    ClientCountMismatch { expected: usize, actual: usize },

    #[error("relative partition sizes must be positive and finite")]
    InvalidSizes,

    #[error("the Dirichlet concentration must be positive and finite, got {0}")]
    InvalidAlpha(f64),

    #[error("the dataset has {indices} indices but {labels} labels")]
    LabelsMismatch { indices: usize, labels: usize },

    #[error("the dataset index {0} appears more than once")]
    DuplicateIndex(usize),

    #[error("{samples} samples cannot give {clients} clients at least {min} samples each")]
    DatasetTooSmall {
        samples: usize,
        clients: usize,
        min: usize,
    },

    #[error("the relative size of {0} is too small to give it a single sample")]
    EmptyPartition(ClientId),

    #[error("the number of Dirichlet draws must be positive")]
    NoRedraws,

    #[error("no allocation with at least {min} samples per client after {attempts} Dirichlet draws")]
    PartitionRedrawsExhausted { attempts: u32, min: usize },

    #[error("invalid aggregation parameter `{name}`: {value}")]
    InvalidAggregationParameter { name: &'static str, value: f64 },
}
